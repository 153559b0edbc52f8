// Trailing-edge debounce on top of a Scheduler.
// Bursts collapse into one call carrying the last arguments; intermediate calls are dropped.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::scheduler::{SharedScheduler, TimerId};

/// Debounced wrapper around a function. Clones share the same pending call.
///
/// The pending call is cancelled when the last clone is dropped, so an owner
/// going away never leaves a trailing call behind.
pub struct Debounced<A: 'static> {
    inner: Rc<DebounceInner<A>>,
}

struct DebounceInner<A> {
    scheduler: SharedScheduler,
    wait_ms: u64,
    func: Box<dyn Fn(A)>,
    pending: RefCell<Option<Pending<A>>>,
}

struct Pending<A> {
    timer: TimerId,
    args: A,
}

/// Wrap `func` so that it runs `wait_ms` after the most recent call.
pub fn debounce<A, F>(scheduler: SharedScheduler, wait_ms: u64, func: F) -> Debounced<A>
where
    A: 'static,
    F: Fn(A) + 'static,
{
    Debounced {
        inner: Rc::new(DebounceInner {
            scheduler,
            wait_ms,
            func: Box::new(func),
            pending: RefCell::new(None),
        }),
    }
}

impl<A: 'static> Debounced<A> {
    /// Schedule a call with `args`, replacing any call still waiting.
    pub fn call(&self, args: A) {
        let previous = self.inner.pending.borrow_mut().take();
        if let Some(previous) = previous {
            self.inner.scheduler.clear_timeout(previous.timer);
        }

        let weak: Weak<DebounceInner<A>> = Rc::downgrade(&self.inner);
        let timer = self.inner.scheduler.set_timeout(
            self.inner.wait_ms,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.fire();
                }
            }),
        );
        *self.inner.pending.borrow_mut() = Some(Pending { timer, args });
    }

    /// Drop the pending call, if any. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    /// Run the pending call now instead of waiting. Returns whether one ran.
    pub fn flush(&self) -> bool {
        let pending = self.inner.pending.borrow_mut().take();
        match pending {
            Some(pending) => {
                self.inner.scheduler.clear_timeout(pending.timer);
                (self.inner.func)(pending.args);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.inner.pending.borrow().is_some()
    }

    pub fn wait_ms(&self) -> u64 {
        self.inner.wait_ms
    }
}

impl<A: 'static> Clone for Debounced<A> {
    fn clone(&self) -> Self {
        Debounced {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<A> DebounceInner<A> {
    fn fire(&self) {
        let pending = self.pending.borrow_mut().take();
        if let Some(pending) = pending {
            (self.func)(pending.args);
        }
    }

    fn cancel(&self) -> bool {
        let pending = self.pending.borrow_mut().take();
        match pending {
            Some(pending) => {
                self.scheduler.clear_timeout(pending.timer);
                true
            }
            None => false,
        }
    }
}

impl<A> Drop for DebounceInner<A> {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Scheduler, VirtualScheduler};
    use crate::types::Timestamp;
    use proptest::prelude::*;

    type Calls = Rc<RefCell<Vec<(u32, u64)>>>;

    fn setup(wait_ms: u64) -> (Rc<VirtualScheduler>, Debounced<u32>, Calls) {
        let scheduler = Rc::new(VirtualScheduler::new());
        let calls: Calls = Rc::new(RefCell::new(Vec::new()));
        let sink = calls.clone();
        let clock = scheduler.clone();
        let debounced = debounce(scheduler.clone(), wait_ms, move |value: u32| {
            sink.borrow_mut().push((value, clock.now().as_millis()));
        });
        (scheduler, debounced, calls)
    }

    #[test]
    fn burst_collapses_to_last_call() {
        let (scheduler, debounced, calls) = setup(100);
        debounced.call(1);
        scheduler.advance_by(50);
        debounced.call(2);
        scheduler.advance_by(50);
        debounced.call(3);
        assert!(calls.borrow().is_empty());

        scheduler.advance_by(100);
        assert_eq!(*calls.borrow(), vec![(3, 200)]);
        assert!(!debounced.is_pending());
    }

    #[test]
    fn cancel_prevents_trailing_call() {
        let (scheduler, debounced, calls) = setup(100);
        debounced.call(7);
        assert!(debounced.cancel());
        assert!(!debounced.cancel());
        scheduler.advance_by(500);
        assert!(calls.borrow().is_empty());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn dropping_last_handle_cancels() {
        let (scheduler, debounced, calls) = setup(100);
        let clone = debounced.clone();
        debounced.call(1);
        drop(debounced);
        assert!(clone.is_pending());
        drop(clone);
        scheduler.advance_by(500);
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn flush_runs_immediately() {
        let (scheduler, debounced, calls) = setup(100);
        debounced.call(9);
        assert!(debounced.flush());
        assert_eq!(*calls.borrow(), vec![(9, 0)]);
        scheduler.advance_by(500);
        assert_eq!(calls.borrow().len(), 1);
    }

    #[test]
    fn separate_bursts_each_fire() {
        let (scheduler, debounced, calls) = setup(100);
        debounced.call(1);
        scheduler.advance_to(Timestamp::from_millis(150));
        debounced.call(2);
        scheduler.advance_to(Timestamp::from_millis(400));
        assert_eq!(*calls.borrow(), vec![(1, 100), (2, 250)]);
    }

    proptest! {
        #[test]
        fn calls_within_wait_execute_once_with_last_args(
            gaps in prop::collection::vec(0u64..100, 1..20),
        ) {
            let (scheduler, debounced, calls) = setup(100);
            let mut last = 0;
            for (i, gap) in gaps.iter().enumerate() {
                scheduler.advance_by(*gap);
                debounced.call(i as u32);
                last = i as u32;
            }
            let last_call_at = scheduler.now().as_millis();
            scheduler.advance_by(1_000);

            prop_assert_eq!(calls.borrow().len(), 1);
            prop_assert_eq!(calls.borrow()[0], (last, last_call_at + 100));
        }
    }
}
