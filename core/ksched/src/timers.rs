//! Per-processor sets of pending time-based expirations.
//!
//! Entries are kept in a chain ordered by delta-from-predecessor, so
//! advancing time by one tick is a decrement of the head delta rather
//! than a tree operation. The sum of the deltas from the head to an entry
//! is always that entry's ticks-until-fire.
//!
//! Entries live in a generation-checked slab: a [`TimerHandle`] is an
//! index plus a generation, so use of a destroyed entry is detected
//! instead of corrupting the chain.
//!
//! The insert walk may be long, so it periodically flashes the set's lock
//! to let a pending tick or a competing insert through. While the lock is
//! flashed the walker's position is published as a cursor inside the
//! locked state; any mutation that unlinks or splices around the recorded
//! position rewrites the cursor before completing.

use alloc::sync::Arc;
use core::fmt;

use kspin::SpinNoIrq;
use slab::Slab;

use crate::task::WeakKtaskRef;

/// Monotonic tick count.
pub type Tick = u64;

/// Nodes examined per lock hold during an insert walk.
const INSERT_FLASH_STRIDE: usize = 4;

/// Identity of a timer entry: slab index plus generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    index: usize,
    generation: u64,
}

/// What to do when an entry fires.
pub enum TimerAction {
    /// Wake or time out the owning task (the TCB's embedded entry).
    TaskTimeout(WeakKtaskRef),
    /// Invoke a callback with the set's tick count at fire time.
    Callback(Arc<dyn Fn(Tick) + Send + Sync>),
}

impl Clone for TimerAction {
    fn clone(&self) -> Self {
        match self {
            Self::TaskTimeout(w) => Self::TaskTimeout(w.clone()),
            Self::Callback(f) => Self::Callback(f.clone()),
        }
    }
}

impl fmt::Debug for TimerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskTimeout(_) => f.write_str("TaskTimeout"),
            Self::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Errors from [`TimerSet::arm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    /// The entry is already pending; cancel it first.
    AlreadyArmed,
    /// The handle does not name a live entry.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Not pending.
    Idle,
    /// An insert walk is placing this entry.
    Inserting,
    /// Cancelled (or destroyed) while the walk was in flight; the walker
    /// cleans it up.
    Abandoned,
    /// Linked into the chain.
    Pending,
}

struct TimerSlot {
    /// 0 marks a slot destroyed while its insert walk was in flight.
    generation: u64,
    action: TimerAction,
    state: SlotState,
    delta: Tick,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Position of an in-flight insert walk.
#[derive(Clone, Copy)]
struct InsertCursor {
    /// Slot being inserted.
    slot: usize,
    /// Node the entry would be placed after (`None` = head position).
    prev: Option<usize>,
    /// Node under examination.
    next: Option<usize>,
    /// Delta still to place, relative to the position after `prev`.
    remaining: Tick,
}

struct TimerInner {
    now: Tick,
    head: Option<usize>,
    slots: Slab<TimerSlot>,
    cursors: Slab<InsertCursor>,
    next_generation: u64,
}

impl TimerInner {
    fn valid(&self, handle: TimerHandle) -> bool {
        self.slots
            .get(handle.index)
            .is_some_and(|s| s.generation == handle.generation)
    }

    /// Unlinks a pending node, merging its delta into its successor, and
    /// rewrites any cursor anchored on it.
    fn unlink(&mut self, index: usize) {
        let (prev, next, delta) = {
            let s = &self.slots[index];
            (s.prev, s.next, s.delta)
        };
        match prev {
            None => self.head = next,
            Some(p) => self.slots[p].next = next,
        }
        if let Some(n) = next {
            self.slots[n].prev = prev;
            self.slots[n].delta += delta;
        }
        for (_, c) in self.cursors.iter_mut() {
            if c.next == Some(index) {
                c.next = next;
            }
            if c.prev == Some(index) {
                c.prev = prev;
                c.remaining += delta;
            }
        }
        let s = &mut self.slots[index];
        s.prev = None;
        s.next = None;
        s.delta = 0;
    }

    /// Links `index` after `prev` with delta `remaining`, and rewrites any
    /// cursor parked in the same gap.
    fn splice(&mut self, index: usize, prev: Option<usize>, next: Option<usize>, remaining: Tick) {
        {
            let s = &mut self.slots[index];
            s.delta = remaining;
            s.prev = prev;
            s.next = next;
        }
        match prev {
            None => self.head = Some(index),
            Some(p) => self.slots[p].next = Some(index),
        }
        if let Some(n) = next {
            self.slots[n].prev = Some(index);
            self.slots[n].delta -= remaining;
        }
        for (_, c) in self.cursors.iter_mut() {
            if c.slot != index && c.prev == prev {
                if c.remaining >= remaining {
                    c.prev = Some(index);
                    c.remaining -= remaining;
                } else {
                    c.next = Some(index);
                }
            }
        }
    }

    /// Ticks elapsed: cursors still at the head position lose that much of
    /// their remaining delta.
    fn consume_base(&mut self, elapsed: Tick) {
        for (_, c) in self.cursors.iter_mut() {
            if c.prev.is_none() {
                c.remaining = c.remaining.saturating_sub(elapsed);
            }
        }
    }
}

/// One processor's ordered set of pending timer entries.
pub struct TimerSet {
    cpu: usize,
    inner: SpinNoIrq<TimerInner>,
}

impl TimerSet {
    pub(crate) fn new(cpu: usize) -> Self {
        Self {
            cpu,
            inner: SpinNoIrq::new(TimerInner {
                now: 0,
                head: None,
                slots: Slab::new(),
                cursors: Slab::new(),
                next_generation: 1,
            }),
        }
    }

    /// The processor owning this set.
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Current tick count (sum of all advances).
    pub fn now(&self) -> Tick {
        self.inner.lock().now
    }

    /// Ticks until the next entry fires, if any is pending.
    pub fn next_deadline(&self) -> Option<Tick> {
        let inner = self.inner.lock();
        inner.head.map(|h| inner.slots[h].delta)
    }

    /// Allocates an inactive entry.
    pub fn create(&self, action: TimerAction) -> TimerHandle {
        let mut inner = self.inner.lock();
        let generation = inner.next_generation;
        inner.next_generation += 1;
        let index = inner.slots.insert(TimerSlot {
            generation,
            action,
            state: SlotState::Idle,
            delta: 0,
            prev: None,
            next: None,
        });
        TimerHandle { index, generation }
    }

    /// Frees an entry, cancelling it first if pending. Returns `false` for
    /// a stale handle.
    pub fn destroy(&self, handle: TimerHandle) -> bool {
        let mut inner = self.inner.lock();
        if !inner.valid(handle) {
            return false;
        }
        match inner.slots[handle.index].state {
            SlotState::Pending => {
                inner.unlink(handle.index);
                inner.slots.remove(handle.index);
            }
            SlotState::Idle => {
                inner.slots.remove(handle.index);
            }
            SlotState::Inserting | SlotState::Abandoned => {
                // The walker frees the slot when it notices.
                let s = &mut inner.slots[handle.index];
                s.state = SlotState::Abandoned;
                s.generation = 0;
            }
        }
        true
    }

    /// Removes an entry from the pending set.
    ///
    /// Returns whether it was pending; cancelling a non-pending entry is
    /// the common case when a wait is satisfied before its timeout.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut inner = self.inner.lock();
        if !inner.valid(handle) {
            return false;
        }
        match inner.slots[handle.index].state {
            SlotState::Pending => {
                inner.unlink(handle.index);
                inner.slots[handle.index].state = SlotState::Idle;
                true
            }
            SlotState::Inserting => {
                inner.slots[handle.index].state = SlotState::Abandoned;
                true
            }
            SlotState::Idle | SlotState::Abandoned => false,
        }
    }

    /// Arms an entry to fire `ticks` from now. An entry armed with zero
    /// ticks fires on the very next advance.
    pub fn arm(&self, handle: TimerHandle, ticks: Tick) -> Result<(), TimerError> {
        self.arm_inner(handle, ticks, &mut || {})
    }

    #[cfg(test)]
    pub(crate) fn arm_hooked(
        &self,
        handle: TimerHandle,
        ticks: Tick,
        flash: &mut dyn FnMut(),
    ) -> Result<(), TimerError> {
        self.arm_inner(handle, ticks, flash)
    }

    fn arm_inner(
        &self,
        handle: TimerHandle,
        ticks: Tick,
        flash: &mut dyn FnMut(),
    ) -> Result<(), TimerError> {
        let mut inner = self.inner.lock();
        if !inner.valid(handle) {
            return Err(TimerError::Stale);
        }
        match inner.slots[handle.index].state {
            SlotState::Idle => {}
            _ => return Err(TimerError::AlreadyArmed),
        }
        inner.slots[handle.index].state = SlotState::Inserting;
        let head = inner.head;
        let cursor = inner.cursors.insert(InsertCursor {
            slot: handle.index,
            prev: None,
            next: head,
            remaining: ticks,
        });

        let mut steps = 0;
        loop {
            // The cursor may have been rewritten while the lock was
            // flashed; always work from its current value.
            let c = inner.cursors[cursor];
            match inner.slots.get(c.slot).map(|s| (s.state, s.generation)) {
                Some((SlotState::Inserting, _)) => {}
                Some((_, generation)) => {
                    // Cancelled mid-walk.
                    inner.cursors.remove(cursor);
                    if generation == 0 {
                        inner.slots.remove(c.slot);
                    } else {
                        inner.slots[c.slot].state = SlotState::Idle;
                    }
                    return Ok(());
                }
                None => {
                    inner.cursors.remove(cursor);
                    return Ok(());
                }
            }
            let Some(n) = c.next else { break };
            let nd = inner.slots[n].delta;
            if c.remaining < nd {
                break;
            }
            let n_next = inner.slots[n].next;
            {
                let cm = &mut inner.cursors[cursor];
                cm.remaining -= nd;
                cm.prev = Some(n);
                cm.next = n_next;
            }
            steps += 1;
            if steps >= INSERT_FLASH_STRIDE {
                steps = 0;
                drop(inner);
                flash();
                inner = self.inner.lock();
            }
        }

        let c = inner.cursors.remove(cursor);
        inner.splice(c.slot, c.prev, c.next, c.remaining);
        inner.slots[c.slot].state = SlotState::Pending;
        Ok(())
    }

    /// Advances time by `elapsed` ticks and fires every entry that comes
    /// due, in expiration order.
    ///
    /// Each action is invoked with the lock released, so an action may
    /// arm or cancel entries of this set, including its own.
    pub fn advance(&self, elapsed: Tick, mut fire: impl FnMut(TimerAction, Tick)) {
        let mut inner = self.inner.lock();
        inner.now += elapsed;
        inner.consume_base(elapsed);

        // Burn the elapsed ticks into the chain: the maximal due prefix
        // ends up with zero deltas.
        let mut left = elapsed;
        let mut at = inner.head;
        while left > 0 {
            let Some(i) = at else { break };
            let d = inner.slots[i].delta;
            if d > left {
                inner.slots[i].delta = d - left;
                break;
            }
            inner.slots[i].delta = 0;
            left -= d;
            at = inner.slots[i].next;
        }

        // Fire the due prefix, one entry per lock hold.
        loop {
            let Some(h) = inner.head else { break };
            if inner.slots[h].delta != 0 {
                break;
            }
            let action = inner.slots[h].action.clone();
            inner.unlink(h);
            inner.slots[h].state = SlotState::Idle;
            let fired_at = inner.now;
            drop(inner);
            fire(action, fired_at);
            inner = self.inner.lock();
        }
    }

    /// Ticks until `handle` fires (the cumulative delta from the head),
    /// or `None` if it is not pending.
    pub fn remaining(&self, handle: TimerHandle) -> Option<Tick> {
        let inner = self.inner.lock();
        if !inner.valid(handle) || inner.slots[handle.index].state != SlotState::Pending {
            return None;
        }
        let mut acc = 0;
        let mut at = inner.head;
        while let Some(i) = at {
            acc += inner.slots[i].delta;
            if i == handle.index {
                return Some(acc);
            }
            at = inner.slots[i].next;
        }
        None
    }

    /// Number of pending entries.
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock();
        let mut n = 0;
        let mut at = inner.head;
        while let Some(i) = at {
            n += 1;
            at = inner.slots[i].next;
        }
        n
    }

    #[cfg(test)]
    pub(crate) fn deltas(&self) -> alloc::vec::Vec<(usize, Tick)> {
        let inner = self.inner.lock();
        let mut v = alloc::vec::Vec::new();
        let mut at = inner.head;
        while let Some(i) = at {
            v.push((i, inner.slots[i].delta));
            at = inner.slots[i].next;
        }
        v
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    fn record(log: &Arc<Mutex<Vec<u32>>>, tag: u32) -> TimerAction {
        let log = log.clone();
        TimerAction::Callback(Arc::new(move |_| log.lock().unwrap().push(tag)))
    }

    fn counter(n: &Arc<AtomicUsize>) -> TimerAction {
        let n = n.clone();
        TimerAction::Callback(Arc::new(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn fires_in_expiration_order() {
        let ts = TimerSet::new(0);
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = ts.create(record(&log, 5));
        let b = ts.create(record(&log, 1));
        let c = ts.create(record(&log, 3));
        ts.arm(a, 5).unwrap();
        ts.arm(b, 1).unwrap();
        ts.arm(c, 3).unwrap();

        for _ in 0..5 {
            ts.advance(1, |action, at| match action {
                TimerAction::Callback(f) => f(at),
                _ => unreachable!(),
            });
        }
        assert_eq!(*log.lock().unwrap(), vec![1, 3, 5]);
        assert_eq!(ts.pending(), 0);
    }

    #[test]
    fn cumulative_deltas_match_remaining() {
        let ts = TimerSet::new(0);
        let n = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = [7u64, 2, 11, 2, 5]
            .iter()
            .map(|&t| {
                let h = ts.create(counter(&n));
                ts.arm(h, t).unwrap();
                (h, t)
            })
            .collect();
        for &(h, t) in &handles {
            assert_eq!(ts.remaining(h), Some(t));
        }
        ts.advance(1, |_, _| {});
        for &(h, t) in &handles {
            assert_eq!(ts.remaining(h), Some(t - 1));
        }
    }

    #[test]
    fn equal_expirations_fire_in_arm_order() {
        let ts = TimerSet::new(0);
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in [10, 20, 30] {
            let h = ts.create(record(&log, tag));
            ts.arm(h, 4).unwrap();
        }
        ts.advance(4, |action, at| match action {
            TimerAction::Callback(f) => f(at),
            _ => unreachable!(),
        });
        assert_eq!(*log.lock().unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn zero_ticks_fires_on_next_advance() {
        let ts = TimerSet::new(0);
        let n = Arc::new(AtomicUsize::new(0));
        let h = ts.create(counter(&n));
        ts.arm(h, 0).unwrap();
        ts.advance(0, |action, at| match action {
            TimerAction::Callback(f) => f(at),
            _ => unreachable!(),
        });
        assert_eq!(n.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arm_twice_fails_cancel_then_rearm_works() {
        let ts = TimerSet::new(0);
        let n = Arc::new(AtomicUsize::new(0));
        let h = ts.create(counter(&n));
        ts.arm(h, 10).unwrap();
        assert_eq!(ts.arm(h, 3), Err(TimerError::AlreadyArmed));

        assert!(ts.cancel(h));
        assert!(!ts.cancel(h));
        ts.arm(h, 3).unwrap();
        assert_eq!(ts.remaining(h), Some(3));

        ts.advance(3, |action, at| match action {
            TimerAction::Callback(f) => f(at),
            _ => unreachable!(),
        });
        assert_eq!(n.load(Ordering::SeqCst), 1);
        assert_eq!(ts.remaining(h), None);
    }

    #[test]
    fn stale_handle_is_detected() {
        let ts = TimerSet::new(0);
        let n = Arc::new(AtomicUsize::new(0));
        let h = ts.create(counter(&n));
        assert!(ts.destroy(h));
        assert!(!ts.cancel(h));
        assert!(!ts.destroy(h));
        assert_eq!(ts.arm(h, 1), Err(TimerError::Stale));

        // A new entry may reuse the slot; the old handle stays dead.
        let h2 = ts.create(counter(&n));
        assert_eq!(ts.arm(h, 1), Err(TimerError::Stale));
        ts.arm(h2, 1).unwrap();
        assert_eq!(ts.remaining(h2), Some(1));
    }

    #[test]
    fn rearm_from_own_callback() {
        let ts = Arc::new(TimerSet::new(0));
        let n = Arc::new(AtomicUsize::new(0));
        // Periodic: re-arms itself every 2 ticks.
        let h_cell = Arc::new(Mutex::new(None::<TimerHandle>));
        let action = {
            let ts = ts.clone();
            let n = n.clone();
            let h_cell = h_cell.clone();
            TimerAction::Callback(Arc::new(move |_| {
                n.fetch_add(1, Ordering::SeqCst);
                let h = h_cell.lock().unwrap().unwrap();
                ts.arm(h, 2).unwrap();
            }))
        };
        let h = ts.create(action);
        *h_cell.lock().unwrap() = Some(h);
        ts.arm(h, 2).unwrap();

        for _ in 0..8 {
            ts.advance(1, |action, at| match action {
                TimerAction::Callback(f) => f(at),
                _ => unreachable!(),
            });
        }
        assert_eq!(n.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn insert_walk_survives_concurrent_fire() {
        let ts = TimerSet::new(0);
        let n = Arc::new(AtomicUsize::new(0));
        // Long chain so the walk flashes its lock.
        let mut chain = Vec::new();
        for i in 1..=10u64 {
            let h = ts.create(counter(&n));
            ts.arm(h, i * 2).unwrap();
            chain.push(h);
        }
        let late = ts.create(counter(&n));
        // While the walk is parked mid-chain, fire the first entries out
        // from under it.
        let mut flashed = false;
        ts.arm_hooked(late, 15, &mut || {
            if !flashed {
                flashed = true;
                ts.advance(5, |action, at| match action {
                    TimerAction::Callback(f) => f(at),
                    _ => unreachable!(),
                });
            }
        })
        .unwrap();
        // Entries at 2 and 4 fired during the walk.
        assert_eq!(n.load(Ordering::SeqCst), 2);
        // The new entry still fires at its original absolute time: 15
        // ticks after arming began, i.e. 10 more from now.
        assert_eq!(ts.remaining(late), Some(10));

        // Cumulative invariant holds for the whole chain.
        for (i, h) in chain.iter().enumerate().skip(2) {
            assert_eq!(ts.remaining(*h), Some((i as u64 + 1) * 2 - 5));
        }
    }

    #[test]
    fn cancel_during_insert_walk() {
        let ts = TimerSet::new(0);
        let n = Arc::new(AtomicUsize::new(0));
        for i in 1..=10u64 {
            let h = ts.create(counter(&n));
            ts.arm(h, i).unwrap();
        }
        let victim = ts.create(counter(&n));
        let mut cancelled = false;
        ts.arm_hooked(victim, 20, &mut || {
            if !cancelled {
                cancelled = true;
                assert!(ts.cancel(victim));
            }
        })
        .unwrap();
        assert_eq!(ts.remaining(victim), None);
        // Reusable afterwards.
        ts.arm(victim, 1).unwrap();
        assert_eq!(ts.remaining(victim), Some(1));
    }

    #[test]
    fn chain_shape_after_mixed_inserts() {
        let ts = TimerSet::new(0);
        let n = Arc::new(AtomicUsize::new(0));
        let mk = |t: u64| {
            let h = ts.create(counter(&n));
            ts.arm(h, t).unwrap();
            h
        };
        let _a = mk(10);
        let _b = mk(4);
        let _c = mk(7);
        // Deltas head-to-tail: 4, 3, 3.
        let d: Vec<Tick> = ts.deltas().iter().map(|&(_, d)| d).collect();
        assert_eq!(d, vec![4, 3, 3]);
    }
}
