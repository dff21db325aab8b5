use std::sync::{
    Arc, Mutex, Once,
    atomic::{AtomicU32, Ordering},
};

use ksched as thread;
use ksync::{Barrier, SyncError, Wait};

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
fn nth_arrival_releases_everyone() {
    INIT.call_once(thread::init_scheduler);

    let barrier = Arc::new(Barrier::new(3));
    let passed = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let barrier = barrier.clone();
        let passed = passed.clone();
        handles.push(thread::spawn(move || {
            assert_eq!(barrier.wait(Wait::Forever), Ok(false));
            passed.fetch_add(1, Ordering::SeqCst);
        }));
    }

    wait_until(|| barrier.waiting() == 2);
    assert_eq!(passed.load(Ordering::SeqCst), 0);

    // The third arrival releases the barrier and does not block.
    assert_eq!(barrier.wait(Wait::Forever), Ok(true));
    for h in handles {
        h.join();
    }
    assert_eq!(passed.load(Ordering::SeqCst), 2);
    assert_eq!(barrier.waiting(), 0);
}

#[test]
fn non_blocking_arrival_only_succeeds_when_completing() {
    INIT.call_once(thread::init_scheduler);

    let barrier = Arc::new(Barrier::new(2));
    assert_eq!(barrier.wait(Wait::No), Err(SyncError::WouldBlock));

    let h = {
        let barrier = barrier.clone();
        thread::spawn(move || {
            assert_eq!(barrier.wait(Wait::Forever), Ok(false));
        })
    };
    wait_until(|| barrier.waiting() == 1);
    assert_eq!(barrier.wait(Wait::No), Ok(true));
    h.join();
}

#[test]
fn flush_interrupts_without_releasing() {
    INIT.call_once(thread::init_scheduler);

    let barrier = Arc::new(Barrier::new(4));
    let result = Arc::new(Mutex::new(None));

    let h = {
        let barrier = barrier.clone();
        let result = result.clone();
        thread::spawn(move || {
            let r = barrier.wait(Wait::Forever);
            *result.lock().unwrap() = Some(r);
        })
    };

    wait_until(|| barrier.waiting() == 1);
    assert_eq!(barrier.flush(), 1);
    h.join();

    assert_eq!(*result.lock().unwrap(), Some(Err(SyncError::Flushed)));
}

#[test]
fn timed_out_arrival_no_longer_counts() {
    INIT.call_once(thread::init_scheduler);

    let barrier = Arc::new(Barrier::new(2));
    let result = Arc::new(Mutex::new(None));

    let h = {
        let barrier = barrier.clone();
        let result = result.clone();
        thread::spawn(move || {
            let r = barrier.wait(Wait::For(2));
            *result.lock().unwrap() = Some(r);
        })
    };

    wait_until(|| barrier.waiting() == 1);
    let kernel = thread::global();
    kernel.tick(0, 2);
    h.join();
    assert_eq!(*result.lock().unwrap(), Some(Err(SyncError::TimedOut)));
    assert_eq!(barrier.waiting(), 0);

    // A fresh pair still needs two arrivals.
    assert_eq!(barrier.wait(Wait::No), Err(SyncError::WouldBlock));
}
