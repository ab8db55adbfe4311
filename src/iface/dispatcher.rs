//! Keyed message demultiplexers.
//!
//! A [`Dispatcher`] is a queue-bearing flow in front of a handler registry:
//! producers `send()` into its inbox, and for each message every
//! registered handler whose filter matches receives its own reference, in
//! registration order. Registration changes made while a message is in
//! flight affect the *next* message, never the current one — the dispatch
//! loop works off a snapshot of the matching handlers.
//!
//! The MTI-keyed instance used by the protocol layer is
//! [`MessageDispatcher`]; the CAN-ID-keyed twin lives with the frame flows.

use std::cell::RefCell;
use std::rc::Rc;

use crate::executor::{
    Action, Buf, Executor, FlowCore, Inbox, Mailbox, MsgFlow, Priority, StateFlow, spawn,
};

use super::message::Message;

/// Receiver of dispatched messages. Each delivery hands over one reference.
pub trait Handler<M> {
    fn send(&self, msg: M, priority: Priority);
}

impl<M: 'static> Handler<M> for Mailbox<M> {
    fn send(&self, msg: M, priority: Priority) {
        Mailbox::send(self, msg, priority);
    }
}

/// Match predicate a dispatcher is keyed by.
pub trait Filter<M>: Copy + PartialEq + 'static {
    fn matches(&self, msg: &M) -> bool;
}

struct Binding<M, F> {
    filter: F,
    handler: Rc<dyn Handler<M>>,
}

/// Handle to a dispatch flow plus its registry.
pub struct Dispatcher<M: Clone + 'static, F: Filter<M>> {
    registry: Rc<RefCell<Vec<Binding<M, F>>>>,
    mailbox: Mailbox<M>,
}

impl<M: Clone + 'static, F: Filter<M>> Clone for Dispatcher<M, F> {
    fn clone(&self) -> Self {
        Self { registry: self.registry.clone(), mailbox: self.mailbox.clone() }
    }
}

fn same_handler<M>(a: &Rc<dyn Handler<M>>, b: &Rc<dyn Handler<M>>) -> bool {
    std::ptr::eq(Rc::as_ptr(a).cast::<()>(), Rc::as_ptr(b).cast::<()>())
}

impl<M: Clone + 'static, F: Filter<M>> Dispatcher<M, F> {
    pub fn new(exec: &Executor, name: &'static str) -> Self {
        let registry: Rc<RefCell<Vec<Binding<M, F>>>> = Rc::new(RefCell::new(Vec::new()));
        let mailbox = Mailbox::new();
        let mb = mailbox.clone();
        let reg = registry.clone();
        let flow = spawn(exec, name, DispatchFlow::<M, F>::wait_for_message, move |core| {
            DispatchFlow { core, inbox: Inbox::new(mb), registry: reg }
        });
        mailbox.bind(flow);
        Self { registry, mailbox }
    }

    /// Queue a message for dispatch.
    pub fn send(&self, msg: M, priority: Priority) {
        self.mailbox.send(msg, priority);
    }

    pub fn mailbox(&self) -> &Mailbox<M> {
        &self.mailbox
    }

    /// Add a binding. Idempotent: an identical (filter, handler) pair is
    /// registered once.
    pub fn register(&self, filter: F, handler: Rc<dyn Handler<M>>) {
        let mut registry = self.registry.borrow_mut();
        if registry.iter().any(|b| b.filter == filter && same_handler(&b.handler, &handler)) {
            return;
        }
        registry.push(Binding { filter, handler });
    }

    /// Remove a binding. Idempotent; the current in-flight message (if any)
    /// still reaches the handler, later ones do not.
    pub fn unregister(&self, filter: F, handler: &Rc<dyn Handler<M>>) {
        self.registry
            .borrow_mut()
            .retain(|b| !(b.filter == filter && same_handler(&b.handler, handler)));
    }

    pub fn handler_count(&self) -> usize {
        self.registry.borrow().len()
    }
}

struct DispatchFlow<M: Clone + 'static, F: Filter<M>> {
    core: FlowCore<Self>,
    inbox: Inbox<M>,
    registry: Rc<RefCell<Vec<Binding<M, F>>>>,
}

impl<M: Clone + 'static, F: Filter<M>> StateFlow for DispatchFlow<M, F> {
    fn core(&self) -> &FlowCore<Self> {
        &self.core
    }
}

impl<M: Clone + 'static, F: Filter<M>> MsgFlow for DispatchFlow<M, F> {
    type Msg = M;

    fn inbox(&mut self) -> &mut Inbox<M> {
        &mut self.inbox
    }

    fn entry(&mut self) -> Action<Self> {
        let Some(msg) = self.inbox.take_current() else {
            return self.release_and_exit();
        };
        let priority = self.inbox.current_priority();
        // Snapshot so handlers may (un)register without affecting this
        // delivery round.
        let matching: Vec<Rc<dyn Handler<M>>> = self
            .registry
            .borrow()
            .iter()
            .filter(|b| b.filter.matches(&msg))
            .map(|b| b.handler.clone())
            .collect();
        for handler in &matching {
            handler.send(msg.clone(), priority);
        }
        drop(msg);
        self.exit_flow()
    }
}

// ── MTI-keyed dispatcher ──────────────────────────────────────

/// `(mti, mask)` match key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtiFilter {
    pub mti: u16,
    pub mask: u16,
}

impl MtiFilter {
    pub const fn exact(mti: u16) -> Self {
        Self { mti, mask: super::defs::MTI_EXACT }
    }

    pub const fn masked(mti: u16, mask: u16) -> Self {
        Self { mti, mask }
    }
}

impl Filter<Buf<Message>> for MtiFilter {
    fn matches(&self, msg: &Buf<Message>) -> bool {
        msg.data().mti & self.mask == self.mti & self.mask
    }
}

/// The protocol-message demultiplexer.
pub type MessageDispatcher = Dispatcher<Buf<Message>, MtiFilter>;

/// Filters covering the MTI pair {a, b}: the folded `!(a ^ b)` mask when
/// the two differ in exactly one bit (where it matches precisely those
/// two), two exact entries otherwise.
pub fn mti_pair_filters(a: u16, b: u16) -> heapless::Vec<MtiFilter, 2> {
    let mut filters = heapless::Vec::new();
    let diff = a ^ b;
    if diff.count_ones() == 1 {
        let _ = filters.push(MtiFilter::masked(a, !diff));
    } else {
        let _ = filters.push(MtiFilter::exact(a));
        let _ = filters.push(MtiFilter::exact(b));
    }
    filters
}

impl MessageDispatcher {
    /// Register `handler` for both MTIs of a response pair.
    pub fn register_mti_pair(&self, a: u16, b: u16, handler: Rc<dyn Handler<Buf<Message>>>) {
        for filter in mti_pair_filters(a, b) {
            self.register(filter, handler.clone());
        }
    }

    pub fn unregister_mti_pair(&self, a: u16, b: u16, handler: &Rc<dyn Handler<Buf<Message>>>) {
        for filter in mti_pair_filters(a, b) {
            self.unregister(filter, handler);
        }
    }
}
