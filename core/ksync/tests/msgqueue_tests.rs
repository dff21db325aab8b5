use std::sync::{Arc, Mutex, Once};

use ksched as thread;
use ksync::{MessageQueue, SyncError, Wait};

static INIT: Once = Once::new();

fn wait_until(mut pred: impl FnMut() -> bool) {
    for _ in 0..5000 {
        if pred() {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    panic!("condition not reached in time");
}

#[test]
fn receive_order_matches_send_order() {
    INIT.call_once(thread::init_scheduler);

    let mq = MessageQueue::new(8, 16);
    mq.send(b"one", Wait::No).unwrap();
    mq.send(b"two", Wait::No).unwrap();
    mq.send(b"three", Wait::No).unwrap();
    assert_eq!(mq.len(), 3);

    assert_eq!(mq.receive(Wait::No).unwrap(), b"one");
    assert_eq!(mq.receive(Wait::No).unwrap(), b"two");
    assert_eq!(mq.receive(Wait::No).unwrap(), b"three");
    assert!(mq.is_empty());
}

#[test]
fn urgent_messages_overtake() {
    INIT.call_once(thread::init_scheduler);

    let mq = MessageQueue::new(8, 16);
    mq.send(b"normal", Wait::No).unwrap();
    mq.urgent(b"urgent", Wait::No).unwrap();

    assert_eq!(mq.receive(Wait::No).unwrap(), b"urgent");
    assert_eq!(mq.receive(Wait::No).unwrap(), b"normal");
}

#[test]
fn oversized_and_empty_edge_cases() {
    INIT.call_once(thread::init_scheduler);

    let mq = MessageQueue::new(2, 4);
    assert_eq!(mq.send(b"too big", Wait::No), Err(SyncError::TooLong));
    assert_eq!(mq.receive(Wait::No), Err(SyncError::WouldBlock));

    mq.send(b"a", Wait::No).unwrap();
    mq.send(b"b", Wait::No).unwrap();
    // Full and not waiting.
    assert_eq!(mq.send(b"c", Wait::No), Err(SyncError::WouldBlock));
}

#[test]
fn blocked_receiver_gets_message_directly() {
    INIT.call_once(thread::init_scheduler);

    let mq = Arc::new(MessageQueue::new(4, 16));
    let got = Arc::new(Mutex::new(None));

    let h = {
        let mq = mq.clone();
        let got = got.clone();
        thread::spawn(move || {
            let msg = mq.receive(Wait::Forever).unwrap();
            *got.lock().unwrap() = Some(msg);
        })
    };

    wait_until(|| mq.waiting() == 1);
    mq.send(b"direct", Wait::No).unwrap();
    h.join();

    assert_eq!(got.lock().unwrap().as_deref(), Some(&b"direct"[..]));
    // Handed over, never buffered.
    assert!(mq.is_empty());
}

#[test]
fn sender_blocks_until_a_buffer_frees() {
    INIT.call_once(thread::init_scheduler);

    let mq = Arc::new(MessageQueue::new(1, 16));
    mq.send(b"first", Wait::No).unwrap();

    let h = {
        let mq = mq.clone();
        thread::spawn(move || {
            mq.send(b"second", Wait::Forever).unwrap();
        })
    };

    wait_until(|| mq.waiting() == 1);
    assert_eq!(mq.receive(Wait::No).unwrap(), b"first");
    h.join();
    // The blocked sender's message landed in the freed buffer.
    assert_eq!(mq.receive(Wait::No).unwrap(), b"second");
}

#[test]
fn flush_waiting_interrupts_receivers() {
    INIT.call_once(thread::init_scheduler);

    let mq = Arc::new(MessageQueue::new(4, 16));
    let result = Arc::new(Mutex::new(None));

    let h = {
        let mq = mq.clone();
        let result = result.clone();
        thread::spawn(move || {
            let r = mq.receive(Wait::Forever);
            *result.lock().unwrap() = Some(r);
        })
    };

    wait_until(|| mq.waiting() == 1);
    assert_eq!(mq.flush_waiting(), 1);
    h.join();

    assert_eq!(*result.lock().unwrap(), Some(Err(SyncError::Flushed)));
}

#[test]
fn flush_pending_drains_buffers() {
    INIT.call_once(thread::init_scheduler);

    let mq = MessageQueue::new(4, 16);
    mq.send(b"a", Wait::No).unwrap();
    mq.send(b"b", Wait::No).unwrap();
    assert_eq!(mq.flush_pending(), 2);
    assert!(mq.is_empty());
}
