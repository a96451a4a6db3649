//! Cancellation tokens for the bounded waits (restore completion, probes, TTL).
//!
//! A token can be waited on with a timeout and wakes immediately when
//! cancelled. Child tokens are cancelled with their parent but can also be
//! cancelled on their own, which is how the health engine stops its workers at
//! the overall deadline without cancelling the caller.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<TokenState>,
    wake: Condvar,
}

#[derive(Debug, Default)]
struct TokenState {
    cancelled: bool,
    children: Vec<Weak<Inner>>,
}

/// Cheaply cloneable cancellation token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// A fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A token cancelled whenever `self` is.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::new();
        let mut state = self.inner.state.lock();
        if state.cancelled {
            child.inner.state.lock().cancelled = true;
        } else {
            state.children.retain(|weak| weak.strong_count() > 0);
            state.children.push(Arc::downgrade(&child.inner));
        }
        child
    }

    /// Cancel this token and every live child.
    pub fn cancel(&self) {
        cancel_inner(&self.inner);
    }

    /// Whether the token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    /// Block for up to `timeout`. Returns `true` if cancelled before or during the wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.cancelled {
            if self.inner.wake.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.cancelled
    }
}

fn cancel_inner(inner: &Arc<Inner>) {
    let children = {
        let mut state = inner.state.lock();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        std::mem::take(&mut state.children)
    };
    inner.wake.notify_all();
    for child in children.iter().filter_map(Weak::upgrade) {
        cancel_inner(&child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_times_out_when_not_cancelled() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert!(!token.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn cancel_wakes_waiter_early() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let cancelled = waiter.wait_timeout(Duration::from_secs(10));
            (cancelled, start.elapsed())
        });
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        let (cancelled, waited) = handle.join().expect("waiter thread");
        assert!(cancelled);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn parent_cancels_children_but_not_reverse() {
        let parent = CancelToken::new();
        let child = parent.child();
        let sibling = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(!sibling.is_cancelled());
        parent.cancel();
        assert!(sibling.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_parent_starts_cancelled() {
        let parent = CancelToken::new();
        parent.cancel();
        assert!(parent.child().is_cancelled());
    }
}
