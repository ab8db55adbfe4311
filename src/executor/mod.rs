//! The cooperative executor.
//!
//! One executor owns the whole core: a priority queue of runnable flows, a
//! list of active timers and a monotonic clock. Flows run one at a time; a
//! flow keeps the CPU between two suspension points, which is the
//! concurrency contract everything above (dispatchers, the datagram
//! engine's pending map) relies on.
//!
//! The clock is virtual and driven by the host: `run_until_idle()` drains
//! all runnable flows, `advance()` steps time and fires due timers in
//! deadline order. Firmware mains step it from their tick source; tests
//! step it directly, which is what makes timeout behaviour deterministic.

pub mod flow;
pub mod pool;
pub mod queue;
pub mod timer;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

pub use flow::{Action, FlowCore, FlowRef, Inbox, Mailbox, MsgFlow, Notifiable, State, StateFlow, spawn};
pub use pool::{Buf, Pool};
pub use queue::{LOWEST_PRIORITY, PrioQueue, Priority};
pub use timer::Timer;

/// Nanoseconds on the executor's monotonic clock.
pub type Nanos = u64;

pub const MSEC: Nanos = 1_000_000;
pub const SEC: Nanos = 1_000_000_000;

/// Single-threaded run loop. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Executor {
    inner: Rc<ExecInner>,
}

struct ExecInner {
    runnable: RefCell<PrioQueue<FlowRef>>,
    timers: RefCell<Vec<Timer>>,
    now: Cell<Nanos>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(ExecInner {
                runnable: RefCell::new(PrioQueue::new()),
                timers: RefCell::new(Vec::new()),
                now: Cell::new(0),
            }),
        }
    }

    /// Current monotonic time.
    pub fn now(&self) -> Nanos {
        self.inner.now.get()
    }

    pub(crate) fn schedule(&self, flow: FlowRef, priority: Priority) {
        self.inner.runnable.borrow_mut().insert(flow, priority);
    }

    pub(crate) fn watch_timer(&self, timer: Timer) {
        let mut timers = self.inner.timers.borrow_mut();
        if !timers.iter().any(|t| t.same_as(&timer)) {
            timers.push(timer);
        }
    }

    /// Run flows in priority order until nothing is runnable.
    pub fn run_until_idle(&self) {
        loop {
            let next = self.inner.runnable.borrow_mut().next();
            match next {
                Some((flow, _priority)) => flow.run_once(),
                None => break,
            }
        }
    }

    /// Earliest armed timer deadline, if any.
    pub fn next_deadline(&self) -> Option<Nanos> {
        self.inner.timers.borrow().iter().filter(|t| t.is_armed()).map(|t| t.deadline()).min()
    }

    /// Step the clock by `delta`, firing due timers in deadline order and
    /// draining runnable flows between firings.
    pub fn advance(&self, delta: Nanos) {
        let target = self.now().saturating_add(delta);
        loop {
            self.run_until_idle();
            match self.next_deadline() {
                Some(deadline) if deadline <= target => {
                    self.inner.now.set(deadline.max(self.now()));
                    self.fire_due();
                }
                _ => break,
            }
        }
        self.inner.now.set(target);
        self.run_until_idle();
    }

    fn fire_due(&self) {
        let now = self.now();
        let due: Vec<Timer> = {
            self.inner
                .timers
                .borrow()
                .iter()
                .filter(|t| t.is_armed() && t.deadline() <= now)
                .cloned()
                .collect()
        };
        for timer in due {
            timer.fire();
        }
        // Fired, triggered and cancelled timers fall off the watch list.
        self.inner.timers.borrow_mut().retain(timer::Timer::is_armed);
    }
}
