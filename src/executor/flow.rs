//! The state-flow runtime.
//!
//! A flow is a finite state machine whose states are plain `fn` pointers
//! over the concrete flow type. Each state returns an [`Action`] token; the
//! pump applies actions until the flow asks to wait:
//!
//! ```text
//!   executor ──run──▶ pump ──▶ state fn ──▶ Action
//!        ▲                                   │
//!        └── notify() ◀── mailbox / timer / pool / driver
//! ```
//!
//! This is the classic function-pointer state machine pattern; states are
//! written as inherent methods and referenced as `Self::state_name`, which
//! coerces to the `State<F>` function pointer type. No `dyn` in the state
//! table, no heap per transition.
//!
//! Flows with an inbox implement [`MsgFlow`] on top of [`StateFlow`]: the
//! built-in `wait_for_message` state pops the next message in (priority,
//! insertion) order and transitions to `entry`. Producers use the flow's
//! [`Mailbox`] handle, which wakes the flow when it is parked.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::pool::{Buf, Pool};
use super::queue::{LOWEST_PRIORITY, PrioQueue, Priority};
use super::timer::Timer;
use super::{Executor, Nanos};

/// A state: a function from the flow to its next action.
pub type State<F> = fn(&mut F) -> Action<F>;

/// What a state tells the pump to do next.
pub enum Action<F> {
    /// Re-enter the current state without yielding.
    Again,
    /// Transition and keep running in the same executor slot.
    Call(State<F>),
    /// Park; a `notify()` resumes the current state.
    Wait,
    /// Transition, then park until notified.
    WaitFor(State<F>),
    /// Transition, reschedule at the current priority, return to the executor.
    Yield(State<F>),
    /// Sink state; an external `start()` is needed to run again.
    Exit,
    /// Terminate and drop the flow object after this run.
    Detach,
}

/// One-shot wakeup receiver, as consumed by driver notification hooks.
pub trait Notifiable {
    fn notify(&self);
}

// ---------------------------------------------------------------------------
// Flow nodes and references
// ---------------------------------------------------------------------------

/// Shared, clonable reference to a spawned flow.
///
/// This is what queues, pools, timers and drivers hold. `notify()` is
/// idempotent: notifying an already-scheduled flow is a no-op.
pub struct FlowRef {
    node: Rc<FlowNode>,
}

struct FlowNode {
    name: &'static str,
    exec: Executor,
    /// True while the flow sits on the executor's runnable queue.
    scheduled: Cell<bool>,
    /// Set by `Action::Detach`; the executor drops the body after the run.
    defunct: Cell<bool>,
    priority: Cell<Priority>,
    /// Rendezvous slot for asynchronous pool allocations.
    allocation: RefCell<Option<Box<dyn Any>>>,
    body: RefCell<Option<Box<dyn RunOnce>>>,
}

pub(crate) trait RunOnce {
    fn run_once(&mut self);
}

impl<F: StateFlow> RunOnce for F {
    fn run_once(&mut self) {
        pump(self);
    }
}

impl Clone for FlowRef {
    fn clone(&self) -> Self {
        Self { node: self.node.clone() }
    }
}

impl FlowRef {
    /// Schedule the flow at its current priority. No-op if already queued.
    pub fn notify(&self) {
        self.notify_with(self.node.priority.get());
    }

    /// Schedule the flow at `priority`.
    pub fn notify_with(&self, priority: Priority) {
        self.node.priority.set(priority);
        if !self.node.scheduled.replace(true) {
            self.node.exec.schedule(self.clone(), priority);
        }
    }

    pub fn name(&self) -> &'static str {
        self.node.name
    }

    pub(crate) fn set_priority(&self, priority: Priority) {
        self.node.priority.set(priority);
    }

    /// Executor entry point: clear the queued flag and pump states.
    pub(crate) fn run_once(&self) {
        self.node.scheduled.set(false);
        {
            let mut body = self.node.body.borrow_mut();
            if let Some(flow) = body.as_mut() {
                flow.run_once();
            }
        }
        if self.node.defunct.get() {
            self.node.body.borrow_mut().take();
        }
    }

    pub(crate) fn deliver_allocation(&self, buf: Box<dyn Any>) {
        *self.node.allocation.borrow_mut() = Some(buf);
        self.notify();
    }

    pub(crate) fn take_allocation_any(&self) -> Option<Box<dyn Any>> {
        self.node.allocation.borrow_mut().take()
    }

    fn mark_defunct(&self) {
        self.node.defunct.set(true);
    }
}

impl Notifiable for FlowRef {
    fn notify(&self) {
        FlowRef::notify(self);
    }
}

// ---------------------------------------------------------------------------
// Flow core and the pump
// ---------------------------------------------------------------------------

/// Per-flow bookkeeping embedded in every concrete flow struct.
pub struct FlowCore<F> {
    state: Cell<Option<State<F>>>,
    me: FlowRef,
}

impl<F> FlowCore<F> {
    /// A shareable reference to this flow.
    pub fn flow_ref(&self) -> FlowRef {
        self.me.clone()
    }

    /// Restart a terminated flow in `state`.
    pub fn start(&self, state: State<F>) {
        self.state.set(Some(state));
        self.me.notify();
    }

    pub fn is_terminated(&self) -> bool {
        self.state.get().is_none()
    }
}

/// Construct a flow and hand it to the executor.
///
/// The builder receives the flow's [`FlowCore`] so the concrete type can
/// embed it; `initial` is the state the first `notify()` lands in.
pub fn spawn<F, B>(exec: &Executor, name: &'static str, initial: State<F>, build: B) -> FlowRef
where
    F: StateFlow,
    B: FnOnce(FlowCore<F>) -> F,
{
    let node = Rc::new(FlowNode {
        name,
        exec: exec.clone(),
        scheduled: Cell::new(false),
        defunct: Cell::new(false),
        priority: Cell::new(LOWEST_PRIORITY),
        allocation: RefCell::new(None),
        body: RefCell::new(None),
    });
    let me = FlowRef { node };
    let core = FlowCore { state: Cell::new(Some(initial)), me: me.clone() };
    let flow = build(core);
    *me.node.body.borrow_mut() = Some(Box::new(flow));
    me
}

/// Apply actions until the flow waits, exits or detaches.
fn pump<F: StateFlow>(flow: &mut F) {
    loop {
        let Some(state) = flow.core().state.get() else { return };
        match state(flow) {
            Action::Again => {}
            Action::Call(next) => flow.core().state.set(Some(next)),
            Action::Wait => return,
            Action::WaitFor(next) => {
                flow.core().state.set(Some(next));
                return;
            }
            Action::Yield(next) => {
                flow.core().state.set(Some(next));
                flow.core().me.notify();
                return;
            }
            Action::Exit => {
                flow.core().state.set(None);
                return;
            }
            Action::Detach => {
                flow.core().state.set(None);
                flow.core().me.mark_defunct();
                return;
            }
        }
    }
}

/// Base capability of every flow: expose the core, and the action-builder
/// vocabulary states are written in.
pub trait StateFlow: Sized + 'static {
    fn core(&self) -> &FlowCore<Self>;

    fn again(&self) -> Action<Self> {
        Action::Again
    }

    fn call_immediately(&self, next: State<Self>) -> Action<Self> {
        Action::Call(next)
    }

    fn wait(&self) -> Action<Self> {
        Action::Wait
    }

    fn wait_and_call(&self, next: State<Self>) -> Action<Self> {
        Action::WaitFor(next)
    }

    fn yield_and_call(&self, next: State<Self>) -> Action<Self> {
        Action::Yield(next)
    }

    /// Arm `timer` and park; the timer (or its `trigger()`) resumes the
    /// flow in `next`.
    fn sleep_and_call(&self, timer: &Timer, duration: Nanos, next: State<Self>) -> Action<Self> {
        timer.start(duration);
        Action::WaitFor(next)
    }

    /// Start an asynchronous pool allocation and park; the flow resumes in
    /// `next` with the buffer retrievable via [`StateFlow::take_allocation`].
    fn allocate_and_call<T: Default + 'static>(&self, pool: &Pool<T>, next: State<Self>) -> Action<Self> {
        let me = self.core().flow_ref();
        me.take_allocation_any();
        pool.alloc_async(me);
        Action::WaitFor(next)
    }

    /// Collect the buffer delivered by an asynchronous allocation.
    ///
    /// Returns `None` on a spurious wakeup (e.g. a racing timer trigger);
    /// the state should park again and re-check on the next wakeup.
    fn take_allocation<T: Default + 'static>(&self) -> Option<Buf<T>> {
        self.core().me.take_allocation_any().map(|any| match any.downcast::<Buf<T>>() {
            Ok(buf) => *buf,
            Err(_) => unreachable!("allocation result does not match the awaited pool type"),
        })
    }

    fn exit(&self) -> Action<Self> {
        Action::Exit
    }

    fn delete_this(&self) -> Action<Self> {
        Action::Detach
    }
}

// ---------------------------------------------------------------------------
// Inboxes: queue-bearing flows
// ---------------------------------------------------------------------------

/// Producer-side handle to a flow's inbox.
pub struct Mailbox<M> {
    shared: Rc<MailboxShared<M>>,
}

struct MailboxShared<M> {
    queue: RefCell<PrioQueue<M>>,
    /// True while the owning flow is parked waiting for work.
    waiting: Cell<bool>,
    flow: RefCell<Option<FlowRef>>,
}

impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<M> Default for Mailbox<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Mailbox<M> {
    pub fn new() -> Self {
        Self {
            shared: Rc::new(MailboxShared {
                queue: RefCell::new(PrioQueue::new()),
                waiting: Cell::new(true),
                flow: RefCell::new(None),
            }),
        }
    }

    /// Attach the consuming flow. Called once, at wiring time.
    pub fn bind(&self, flow: FlowRef) {
        *self.shared.flow.borrow_mut() = Some(flow);
    }

    /// Enqueue a message. Never blocks; wakes the consumer if it is parked.
    pub fn send(&self, msg: M, priority: Priority) {
        self.shared.queue.borrow_mut().insert(msg, priority);
        if self.shared.waiting.get() {
            if let Some(flow) = &*self.shared.flow.borrow() {
                self.shared.waiting.set(false);
                flow.notify_with(priority);
            }
        }
    }

    /// Pop without a consuming flow — the drain side of an unbound seam
    /// mailbox (e.g. the addressed-message writer attachment point).
    pub fn try_recv(&self) -> Option<(M, Priority)> {
        self.shared.queue.borrow_mut().next()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.borrow().is_empty()
    }

    pub fn len(&self) -> usize {
        self.shared.queue.borrow().len()
    }
}

/// Inbox state embedded in every queue-bearing flow.
pub struct Inbox<M> {
    mailbox: Mailbox<M>,
    current: Option<M>,
    current_priority: Priority,
}

impl<M> Inbox<M> {
    pub fn new(mailbox: Mailbox<M>) -> Self {
        Self { mailbox, current: None, current_priority: LOWEST_PRIORITY }
    }

    pub fn mailbox(&self) -> &Mailbox<M> {
        &self.mailbox
    }

    /// The message being processed, if any.
    pub fn current(&self) -> Option<&M> {
        self.current.as_ref()
    }

    /// Take exclusive ownership of the current message.
    pub fn take_current(&mut self) -> Option<M> {
        self.current.take()
    }

    pub fn current_priority(&self) -> Priority {
        self.current_priority
    }
}

/// A flow fed by an inbox. Messages are processed strictly in (priority,
/// insertion) order, one at a time, `entry` to `release_and_exit`.
pub trait MsgFlow: StateFlow {
    type Msg: 'static;

    fn inbox(&mut self) -> &mut Inbox<Self::Msg>;

    /// First state for each dequeued message.
    fn entry(&mut self) -> Action<Self>;

    /// Built-in idle state: pop the next message or park.
    fn wait_for_message(&mut self) -> Action<Self> {
        let popped = {
            let inbox = self.inbox();
            let next = inbox.mailbox.shared.queue.borrow_mut().next();
            if next.is_none() {
                inbox.mailbox.shared.waiting.set(true);
            }
            next
        };
        match popped {
            Some((msg, priority)) => {
                let inbox = self.inbox();
                inbox.current = Some(msg);
                inbox.current_priority = priority;
                self.core().me.set_priority(priority);
                Action::Call(<Self as MsgFlow>::entry)
            }
            None => Action::Wait,
        }
    }

    /// Drop the current message (its queue reference moves with it).
    fn release(&mut self) {
        self.inbox().current = None;
    }

    /// Return to the inbox without touching the current message.
    fn exit_flow(&mut self) -> Action<Self> {
        Action::Call(<Self as MsgFlow>::wait_for_message)
    }

    /// Release the current message, then return to the inbox.
    fn release_and_exit(&mut self) -> Action<Self> {
        self.release();
        self.exit_flow()
    }
}
