use std::sync::Once;

use ksched as thread;
use ksync::Mutex;

static INIT: Once = Once::new();

fn may_interrupt() {
    // simulate interrupts
    if fastrand::u8(0..3) == 0 {
        thread::yield_now();
    }
}

#[test]
fn lots_and_lots() {
    INIT.call_once(thread::init_scheduler);

    const NUM_TASKS: u32 = 10;
    const NUM_ITERS: u32 = 1_000;
    static M: Mutex<u32> = Mutex::new(0);

    fn inc(delta: u32) {
        for _ in 0..NUM_ITERS {
            let mut val = M.lock();
            *val += delta;
            may_interrupt();
            drop(val);
            may_interrupt();
        }
    }

    let mut handles = Vec::new();
    for _ in 0..NUM_TASKS {
        handles.push(thread::spawn(|| inc(1)));
        handles.push(thread::spawn(|| inc(2)));
    }
    for h in handles {
        h.join();
    }

    assert_eq!(*M.lock(), NUM_ITERS * NUM_TASKS * 3);
}

#[test]
fn try_lock_and_guard_drop() {
    INIT.call_once(thread::init_scheduler);

    let m = Mutex::new(7);
    {
        let g = m.try_lock();
        assert!(g.is_some());
        assert!(m.try_lock().is_none());
        assert!(m.is_locked());
    }
    assert!(!m.is_locked());
    *m.lock() = 9;
    assert_eq!(*m.lock(), 9);
}

#[test]
fn contended_lock_hands_ownership_over() {
    INIT.call_once(thread::init_scheduler);

    static M: Mutex<Vec<u32>> = Mutex::new(Vec::new());

    let guard = M.lock();
    let h = thread::spawn(|| {
        M.lock().push(2);
    });
    // Let the other task reach the queue, then release.
    for _ in 0..50 {
        thread::yield_now();
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    drop(guard);
    h.join();
    assert_eq!(*M.lock(), vec![2]);
}

#[test]
fn recursive_lock_is_fatal() {
    INIT.call_once(thread::init_scheduler);

    static M: Mutex<u32> = Mutex::new(0);
    let caught = std::panic::catch_unwind(|| {
        let _a = M.lock();
        let _b = M.lock();
    });
    assert!(caught.is_err());
    // The outer guard was released during unwinding.
    assert!(!M.is_locked());
}

#[test]
fn foreign_unlock_is_fatal() {
    INIT.call_once(thread::init_scheduler);

    static M: Mutex<u32> = Mutex::new(0);
    let guard = M.lock();
    let h = thread::spawn(|| {
        let caught = std::panic::catch_unwind(|| unsafe { M.force_unlock() });
        assert!(caught.is_err());
    });
    h.join();
    drop(guard);
    assert!(!M.is_locked());
}
