//! Refcounted, pool-recycled payload buffers.
//!
//! A [`Pool`] hands out [`Buf`] handles. A `Buf` behaves like a shared
//! reference to a pooled slot: cloning it is the "ref" operation, dropping
//! the last clone returns the slot to the pool's free list (never to the
//! allocator) after firing the optional done-notification and resetting the
//! payload to its default value.
//!
//! Allocation comes in two shapes:
//!
//! - [`Pool::alloc`] — synchronous; pools are sized so this returns
//!   immediately. A bounded pool that runs dry grows past its target with a
//!   warning rather than stalling the executor thread.
//! - [`Pool::alloc_async`] — the caller flow is queued as a waiter and
//!   resumed with the buffer once one frees up. An exhausted pool makes the
//!   waiter wait indefinitely; there is no failure path.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use log::warn;

use crate::executor::flow::FlowRef;

/// A source of [`Buf`] handles for payload type `T`.
pub struct Pool<T: Default + 'static> {
    shared: Rc<PoolShared<T>>,
}

struct PoolShared<T: Default + 'static> {
    name: &'static str,
    /// Target slot count; 0 means unbounded.
    capacity: usize,
    /// Slots created so far (free or in flight).
    outstanding: Cell<usize>,
    free: RefCell<Vec<Rc<BufSlot<T>>>>,
    waiters: RefCell<VecDeque<FlowRef>>,
}

struct BufSlot<T: Default + 'static> {
    data: RefCell<T>,
    done: RefCell<Option<Box<dyn FnOnce()>>>,
    home: Weak<PoolShared<T>>,
}

impl<T: Default + 'static> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<T: Default + 'static> Pool<T> {
    /// A pool targeting `capacity` slots (0 = unbounded).
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            shared: Rc::new(PoolShared {
                name,
                capacity,
                outstanding: Cell::new(0),
                free: RefCell::new(Vec::new()),
                waiters: RefCell::new(VecDeque::new()),
            }),
        }
    }

    fn new_slot(shared: &Rc<PoolShared<T>>) -> Rc<BufSlot<T>> {
        shared.outstanding.set(shared.outstanding.get() + 1);
        Rc::new(BufSlot {
            data: RefCell::new(T::default()),
            done: RefCell::new(None),
            home: Rc::downgrade(shared),
        })
    }

    /// Synchronous allocation. Refcount of the returned buffer is 1.
    pub fn alloc(&self) -> Buf<T> {
        let slot = self.shared.free.borrow_mut().pop();
        let slot = slot.unwrap_or_else(|| {
            if self.shared.capacity != 0 && self.shared.outstanding.get() >= self.shared.capacity {
                warn!("pool {}: growing past target of {} slots", self.shared.name, self.shared.capacity);
            }
            Self::new_slot(&self.shared)
        });
        Buf { slot: Some(slot) }
    }

    /// Queue `waiter` for the next free buffer. When one is available the
    /// waiter's allocation slot is filled and the flow is notified.
    pub fn alloc_async(&self, waiter: FlowRef) {
        self.shared.waiters.borrow_mut().push_back(waiter);
        Self::serve_waiters(&self.shared);
    }

    fn serve_waiters(shared: &Rc<PoolShared<T>>) {
        loop {
            if shared.waiters.borrow().is_empty() {
                return;
            }
            let slot = shared.free.borrow_mut().pop();
            let slot = match slot {
                Some(s) => s,
                None if shared.capacity == 0 || shared.outstanding.get() < shared.capacity => {
                    Self::new_slot(shared)
                }
                // Exhausted: waiters stay queued until a buffer frees up.
                None => return,
            };
            let waiter = shared.waiters.borrow_mut().pop_front();
            if let Some(w) = waiter {
                w.deliver_allocation(Box::new(Buf { slot: Some(slot) }));
            }
        }
    }

    fn recycle(shared: &Rc<PoolShared<T>>, slot: Rc<BufSlot<T>>) {
        let done = slot.done.borrow_mut().take();
        if let Some(done) = done {
            done();
        }
        *slot.data.borrow_mut() = T::default();
        shared.free.borrow_mut().push(slot);
        Self::serve_waiters(shared);
    }

    /// Buffers currently sitting on the free list.
    pub fn free_count(&self) -> usize {
        self.shared.free.borrow().len()
    }

    /// Slots created over the pool's lifetime.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.get()
    }

    /// Flows parked waiting for a buffer.
    pub fn waiter_count(&self) -> usize {
        self.shared.waiters.borrow().len()
    }
}

/// Shared handle to a pooled buffer. Clone = ref, drop of the last clone
/// = return to pool.
pub struct Buf<T: Default + 'static> {
    slot: Option<Rc<BufSlot<T>>>,
}

impl<T: Default + 'static> Buf<T> {
    fn slot(&self) -> &Rc<BufSlot<T>> {
        // The Option is only vacated inside drop().
        self.slot.as_ref().expect("buffer already released")
    }

    pub fn data(&self) -> Ref<'_, T> {
        self.slot().data.borrow()
    }

    pub fn data_mut(&self) -> RefMut<'_, T> {
        self.slot().data.borrow_mut()
    }

    /// Attach a notification fired once, when the last reference drops and
    /// the buffer returns to its pool.
    pub fn set_done(&self, done: impl FnOnce() + 'static) {
        *self.slot().done.borrow_mut() = Some(Box::new(done));
    }

    /// Current reference count (queued-in plus held-by-flows).
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(self.slot())
    }
}

impl<T: Default + 'static> Clone for Buf<T> {
    fn clone(&self) -> Self {
        Self { slot: Some(self.slot().clone()) }
    }
}

impl<T: Default + 'static> Drop for Buf<T> {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else { return };
        if Rc::strong_count(&slot) == 1 {
            if let Some(home) = slot.home.upgrade() {
                Pool::recycle(&home, slot);
            }
            // Pool already gone: the slot frees with this last handle.
        }
    }
}
