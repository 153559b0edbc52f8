// Timer capability. Everything that waits goes through a Scheduler so that the
// detector and debouncer run the same way on a virtual clock and in the browser.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use crate::types::Timestamp;

/// Deferred unit of work.
pub type Task = Box<dyn FnOnce()>;

/// Handle to a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl TimerId {
    pub fn new(id: u64) -> Self {
        TimerId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Single-threaded timer source.
pub trait Scheduler {
    /// Current time on this scheduler's clock.
    fn now(&self) -> Timestamp;

    /// Run `task` once after `delay_ms`.
    fn set_timeout(&self, delay_ms: u64, task: Task) -> TimerId;

    /// Drop a pending task. Unknown or already-fired ids are ignored.
    fn clear_timeout(&self, id: TimerId);
}

pub type SharedScheduler = Rc<dyn Scheduler>;

/// Deterministic scheduler driven by explicit clock advances.
///
/// Used by tests and by hosts that pump time themselves (e.g. from a frame loop).
/// Due tasks run in (due time, scheduling order) and the clock reads each task's
/// due time while it runs. Tasks execute outside the internal borrow, so they
/// may schedule or clear other timers.
#[derive(Default)]
pub struct VirtualScheduler {
    state: RefCell<VirtualState>,
}

#[derive(Default)]
struct VirtualState {
    now: Timestamp,
    next_id: u64,
    queue: BTreeMap<(Timestamp, u64), Task>,
    due_by_id: HashMap<u64, Timestamp>,
}

impl VirtualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(now: Timestamp) -> Self {
        let scheduler = Self::default();
        scheduler.state.borrow_mut().now = now;
        scheduler
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.state.borrow().queue.len()
    }

    /// Due time of the earliest pending task.
    pub fn next_due(&self) -> Option<Timestamp> {
        self.state.borrow().queue.keys().next().map(|(due, _)| *due)
    }

    /// Advance the clock to `target`, running every task due on the way.
    /// Returns how many tasks ran. Moving backwards only runs already-due tasks.
    pub fn advance_to(&self, target: Timestamp) -> usize {
        let mut ran = 0;
        loop {
            let next = {
                let mut state = self.state.borrow_mut();
                let key = match state.queue.keys().next() {
                    Some(&(due, id)) if due <= target => (due, id),
                    _ => break,
                };
                state.due_by_id.remove(&key.1);
                if key.0 > state.now {
                    state.now = key.0;
                }
                state.queue.remove(&key)
            };
            if let Some(task) = next {
                task();
                ran += 1;
            }
        }

        let mut state = self.state.borrow_mut();
        if target > state.now {
            state.now = target;
        }
        ran
    }

    pub fn advance_by(&self, ms: u64) -> usize {
        let target = self.now().after(ms);
        self.advance_to(target)
    }
}

impl Scheduler for VirtualScheduler {
    fn now(&self) -> Timestamp {
        self.state.borrow().now
    }

    fn set_timeout(&self, delay_ms: u64, task: Task) -> TimerId {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        let due = state.now.after(delay_ms);
        state.queue.insert((due, id), task);
        state.due_by_id.insert(id, due);
        TimerId(id)
    }

    fn clear_timeout(&self, id: TimerId) {
        let task = {
            let mut state = self.state.borrow_mut();
            state
                .due_by_id
                .remove(&id.0)
                .and_then(|due| state.queue.remove(&(due, id.0)))
        };
        // Dropped outside the borrow: captured values may clear timers of their own.
        drop(task);
    }
}
