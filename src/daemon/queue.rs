//! Keyed work queue with per-key coalescing.
//!
//! A key is in at most one of `ready` or `in_flight` at a time. Adding a key
//! that is already waiting is a no-op; adding a key that a worker holds marks
//! it dirty, and it is queued again when the worker calls [`WorkQueue::done`].
//! Delayed adds sit in a timer heap until due and then coalesce the same way.
//! A key waits on at most one due time: a later `add_after` never displaces
//! an earlier one, and superseded heap entries are dropped when they surface.

#![allow(missing_docs)]

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<String>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
    dirty: HashSet<String>,
    /// (due, insertion order, key)
    delayed: BinaryHeap<Reverse<(Instant, u64, String)>>,
    /// Earliest pending due time per key; heap entries that disagree are stale.
    due: HashMap<String, Instant>,
    seq: u64,
    shutdown: bool,
}

impl QueueState {
    fn enqueue(&mut self, key: &str) -> bool {
        if self.queued.contains(key) {
            return false;
        }
        if self.in_flight.contains(key) {
            self.dirty.insert(key.to_string());
            return false;
        }
        self.queued.insert(key.to_string());
        self.ready.push_back(key.to_string());
        true
    }

    fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while let Some(Reverse((due, _, _))) = self.delayed.peek() {
            if *due > now {
                break;
            }
            if let Some(Reverse((due, _, key))) = self.delayed.pop() {
                if self.due.get(&key) != Some(&due) {
                    continue;
                }
                self.due.remove(&key);
                if self.enqueue(&key) {
                    promoted += 1;
                }
            }
        }
        promoted
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse((due, _, _))| *due)
    }
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    wake: Condvar,
}

impl WorkQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `key` now.
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        if state.enqueue(key) {
            self.wake.notify_one();
        }
    }

    /// Queue `key` once `delay` has passed. Ignored when the key is already
    /// waiting on an earlier or equal due time.
    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        let due = Instant::now() + delay;
        if state.due.get(key).is_some_and(|pending| *pending <= due) {
            return;
        }
        state.due.insert(key.to_string(), due);
        state.seq += 1;
        let seq = state.seq;
        state.delayed.push(Reverse((due, seq, key.to_string())));
        // A sleeping worker may need to shorten its wait.
        self.wake.notify_one();
    }

    /// Take the next ready key, waiting up to `timeout`. `None` on timeout or
    /// shutdown. The caller must hand the key back with [`WorkQueue::done`].
    pub fn get(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            let now = Instant::now();
            if state.promote_due(now) > 1 {
                self.wake.notify_all();
            }
            if let Some(key) = state.ready.pop_front() {
                state.queued.remove(&key);
                state.in_flight.insert(key.clone());
                return Some(key);
            }
            if now >= deadline {
                return None;
            }
            let wake_at = state.next_due().map_or(deadline, |due| due.min(deadline));
            let _ = self.wake.wait_until(&mut state, wake_at);
        }
    }

    /// Release `key`. A key re-added while held is queued again.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.in_flight.remove(key);
        if state.dirty.remove(key) && !state.shutdown && state.enqueue(key) {
            self.wake.notify_one();
        }
    }

    /// Wake every waiter and refuse new work.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        state.ready.clear();
        state.queued.clear();
        state.delayed.clear();
        state.due.clear();
        self.wake.notify_all();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Keys ready to be taken now.
    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Keys waiting on a due time.
    #[must_use]
    pub fn delayed_len(&self) -> usize {
        self.state.lock().due.len()
    }

    #[must_use]
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.state.lock().in_flight.contains(key)
    }
}
