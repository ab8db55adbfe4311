//! Deadline timers delivered through `notify()`.
//!
//! A [`Timer`] belongs to one flow. `start()` arms it against the executor
//! clock; expiry (or an early `trigger()`) wakes the owner, which resumes
//! in whatever state it parked in and inspects its own flags to tell the
//! two apart. That single resumption point is what the datagram client's
//! response handling relies on.

use std::cell::Cell;
use std::rc::Rc;

use super::flow::FlowRef;
use super::{Executor, Nanos};

/// A one-shot deadline timer owned by a flow.
pub struct Timer {
    inner: Rc<TimerInner>,
}

struct TimerInner {
    owner: FlowRef,
    exec: Executor,
    deadline: Cell<Nanos>,
    armed: Cell<bool>,
}

impl Clone for Timer {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl Timer {
    pub fn new(exec: &Executor, owner: FlowRef) -> Self {
        Self {
            inner: Rc::new(TimerInner {
                owner,
                exec: exec.clone(),
                deadline: Cell::new(0),
                armed: Cell::new(false),
            }),
        }
    }

    /// Arm (or re-arm) the timer `duration` from now.
    pub fn start(&self, duration: Nanos) {
        self.inner.deadline.set(self.inner.exec.now().saturating_add(duration));
        self.inner.armed.set(true);
        self.inner.exec.watch_timer(self.clone());
    }

    /// Disarm without waking the owner.
    pub fn cancel(&self) {
        self.inner.armed.set(false);
    }

    /// Fire early: disarm and wake the owner now. Calling this on an idle
    /// timer still notifies — owners treat that as a spurious wakeup.
    pub fn trigger(&self) {
        self.inner.armed.set(false);
        self.inner.owner.notify();
    }

    pub fn is_armed(&self) -> bool {
        self.inner.armed.get()
    }

    pub(crate) fn deadline(&self) -> Nanos {
        self.inner.deadline.get()
    }

    /// Expiry path, driven by the executor sweep.
    pub(crate) fn fire(&self) {
        if self.inner.armed.replace(false) {
            self.inner.owner.notify();
        }
    }

    pub(crate) fn same_as(&self, other: &Timer) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}
