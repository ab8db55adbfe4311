//! Outbound datagram client flow.
//!
//! One client carries one datagram at a time through the whole exchange:
//!
//! ```text
//! idle ─▶ resolve_dst ─▶ register_listener ─▶ get_frame_buffer ─▶ fill_and_send ─┐
//!   ▲                                              ▲      (more frames)          │
//!   │                                              └──────────────────────────────┘
//!   │                                                         (all sent)
//!   └── finalize ◀── response_or_timeout ◀── send_finished
//! ```
//!
//! The response listener is a thin collaborator registered on the message
//! dispatcher. It runs in the dispatcher's context, only reads and ORs the
//! shared result word, and wakes the main flow through the response timer's
//! `trigger()` — never by re-entering the flow itself. The flow resumes at
//! its single resumption point and decides the outcome from the result
//! word alone.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::{debug, info, trace, warn};

use crate::can::CanFrame;
use crate::config::NodeConfig;
use crate::executor::{
    Action, Buf, FlowCore, FlowRef, Nanos, Priority, StateFlow, Timer, spawn,
};
use crate::iface::defs::{
    DatagramFrameType, MTI_DATAGRAM, MTI_DATAGRAM_OK, MTI_DATAGRAM_REJECTED,
    MTI_INITIALIZATION_COMPLETE, MTI_OPTIONAL_INTERACTION_REJECTED, MTI_TERMINATE_DUE_TO_ERROR,
    datagram_frame_id,
};
use crate::iface::dispatcher::{Handler, MtiFilter};
use crate::iface::message::{Message, NodeHandle, node_id_from_bytes};
use crate::iface::{CanInterface, NodeAlias};

use super::{
    DST_NOT_FOUND, DST_REBOOT, OPERATION_PENDING, OPERATION_SUCCESS, PERMANENT_ERROR,
    RESEND_OK, RESPONSE_CODE_MASK, RESPONSE_FLAGS_SHIFT, TIMEOUT, response_recorded,
};

/// Caller-facing handle to one client flow.
#[derive(Clone)]
pub struct DatagramClientHandle {
    shared: Rc<ClientShared>,
    flow: FlowRef,
}

impl DatagramClientHandle {
    /// Start transmitting `buf`. The buffer's MTI must be unset or
    /// `MTI_DATAGRAM`; its destination handle must be known. Completion is
    /// reported through the result word and the buffer's done-notification.
    pub fn write_datagram(&self, buf: Buf<Message>, priority: Priority) {
        {
            let mut m = buf.data_mut();
            if m.mti == 0 {
                m.mti = MTI_DATAGRAM;
            }
            assert!(m.mti == MTI_DATAGRAM, "datagram client only carries MTI_DATAGRAM");
        }
        assert!(
            !self.shared.busy.replace(true),
            "datagram client already has an operation in flight"
        );
        self.shared.result.set(OPERATION_PENDING);
        *self.shared.request.borrow_mut() = Some((buf, priority));
        self.flow.notify_with(priority);
    }

    /// The result word of the last (or in-flight) operation.
    pub fn result(&self) -> u32 {
        self.shared.result.get()
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.get()
    }

    /// There is no cancellation path in this protocol engine.
    pub fn cancel(&self) {
        panic!("cancelling an in-flight datagram write is not supported");
    }
}

// ── Shared state between flow, handle and listener ────────────

struct ClientShared {
    result: Cell<u32>,
    busy: Cell<bool>,
    request: RefCell<Option<(Buf<Message>, Priority)>>,
    /// Source and destination of the in-flight datagram, as resolved.
    src: Cell<NodeHandle>,
    dst: Cell<NodeHandle>,
    src_alias: Cell<NodeAlias>,
    dst_alias: Cell<NodeAlias>,
    /// The flow's response timer; `trigger()` is the listener's only way
    /// of waking the flow.
    timer: RefCell<Option<Timer>>,
}

impl ClientShared {
    fn new() -> Self {
        Self {
            result: Cell::new(0),
            busy: Cell::new(false),
            request: RefCell::new(None),
            src: Cell::new(NodeHandle::default()),
            dst: Cell::new(NodeHandle::default()),
            src_alias: Cell::new(0),
            dst_alias: Cell::new(0),
            timer: RefCell::new(None),
        }
    }

    fn or_result(&self, bits: u32) {
        self.result.set(self.result.get() | bits);
    }

    fn record_rejection(&self, code: u16) {
        let mut r = self.result.get() & !RESPONSE_CODE_MASK;
        r |= u32::from(code);
        // An error response must be visible in the flags even when the
        // code itself carries neither bit.
        if r & (PERMANENT_ERROR | RESEND_OK) == 0 {
            r |= PERMANENT_ERROR;
        }
        self.result.set(r);
    }

    fn wake(&self) {
        if let Some(timer) = &*self.timer.borrow() {
            timer.trigger();
        }
    }

    /// Response matching, run under the dispatcher's delivery.
    fn handle_response(&self, m: &Message) {
        if self.result.get() & OPERATION_PENDING == 0 {
            return;
        }

        // Reboot detection rides on an unaddressed message.
        if m.mti == MTI_INITIALIZATION_COMPLETE {
            if m.payload.len() != 6 {
                return;
            }
            let dst = self.dst.get();
            if dst.id != 0 && node_id_from_bytes(&m.payload) == dst.id {
                self.or_result(DST_REBOOT);
                self.wake();
            }
            return;
        }

        // The response must be addressed to our source node...
        if m.dst.id != 0 {
            if m.dst.id != self.src.get().id {
                trace!("response for a different destination id");
                return;
            }
        } else if m.dst.alias != self.src_alias.get() {
            // Hoping our alias was not released while the reply was in flight.
            trace!("response for a different destination alias");
            return;
        }

        // ...and originate from our destination node. Alias reassignment
        // between send and reply is not detected here.
        if m.src.id != 0 && self.dst.get().id != 0 {
            if m.src.id != self.dst.get().id {
                trace!("response from a different source id");
                return;
            }
        } else if m.src.alias != 0 {
            if m.src.alias != self.dst_alias.get() {
                trace!("response from alias {:03x}, expected {:03x}", m.src.alias, self.dst_alias.get());
                return;
            }
        } else {
            debug!("datagram response carries no usable source identity");
            return;
        }

        let payload = &m.payload;
        let error_code =
            if payload.len() >= 2 { u16::from_be_bytes([payload[0], payload[1]]) } else { 0 };

        match m.mti {
            MTI_TERMINATE_DUE_TO_ERROR | MTI_OPTIONAL_INTERACTION_REJECTED => {
                if payload.len() >= 4 {
                    let rejected_mti = u16::from_be_bytes([payload[2], payload[3]]);
                    if rejected_mti != MTI_DATAGRAM {
                        trace!("rejection of a different interaction");
                        return;
                    }
                }
                self.record_rejection(error_code);
            }
            MTI_DATAGRAM_REJECTED => self.record_rejection(error_code),
            MTI_DATAGRAM_OK => {
                let mut r = self.result.get();
                if let Some(flags) = payload.first() {
                    r &= !(0xFF << RESPONSE_FLAGS_SHIFT);
                    r |= u32::from(*flags) << RESPONSE_FLAGS_SHIFT;
                }
                self.result.set(r | OPERATION_SUCCESS);
            }
            _ => {
                trace!("unhandled response mti {:04x}", m.mti);
                return;
            }
        }
        self.wake();
    }
}

/// Non-owning dispatcher registration forwarding into the client.
struct ReplyListener {
    shared: Rc<ClientShared>,
}

impl Handler<Buf<Message>> for ReplyListener {
    fn send(&self, buf: Buf<Message>, _priority: Priority) {
        self.shared.handle_response(&buf.data());
    }
}

// ── The client flow ───────────────────────────────────────────

pub(crate) fn spawn_client(iface: &CanInterface, cfg: &NodeConfig) -> DatagramClientHandle {
    let shared = Rc::new(ClientShared::new());
    let sh = shared.clone();
    let ifc = iface.clone();
    let response_timeout = cfg.response_timeout();
    let lookup_timeout = cfg.alias_lookup_timeout();
    let flow = spawn(&iface.exec, "dg-client", ClientFlow::idle, move |core| {
        let timer = Timer::new(&ifc.exec, core.flow_ref());
        *sh.timer.borrow_mut() = Some(timer.clone());
        let listener = Rc::new(ReplyListener { shared: sh.clone() });
        ClientFlow {
            core,
            iface: ifc,
            shared: sh,
            listener,
            timer,
            response_timeout,
            lookup_timeout,
            msg: None,
            priority: 0,
            offset: 0,
            lookup_retried: false,
        }
    });
    DatagramClientHandle { shared, flow }
}

struct ClientFlow {
    core: FlowCore<Self>,
    iface: CanInterface,
    shared: Rc<ClientShared>,
    listener: Rc<ReplyListener>,
    timer: Timer,
    response_timeout: Nanos,
    lookup_timeout: Nanos,
    /// The datagram being transmitted; held across every wait.
    msg: Option<Buf<Message>>,
    priority: Priority,
    /// Next payload byte to render.
    offset: usize,
    lookup_retried: bool,
}

impl StateFlow for ClientFlow {
    fn core(&self) -> &FlowCore<Self> {
        &self.core
    }
}

impl ClientFlow {
    fn idle(&mut self) -> Action<Self> {
        let Some((msg, priority)) = self.shared.request.borrow_mut().take() else {
            return self.wait();
        };
        self.msg = Some(msg);
        self.priority = priority;
        self.offset = 0;
        self.lookup_retried = false;
        self.call_immediately(Self::resolve_dst)
    }

    fn resolve_dst(&mut self) -> Action<Self> {
        let (src, dst) = {
            let Some(msg) = self.msg.as_ref() else {
                return self.call_immediately(Self::finalize);
            };
            let m = msg.data();
            (m.src, m.dst)
        };

        let src_alias = if src.alias != 0 {
            Some(src.alias)
        } else {
            self.iface.local_aliases.lookup_alias(src.id)
        };
        let Some(src_alias) = src_alias else {
            warn!("datagram source {:012x} has no local alias", src.id);
            self.shared.or_result(PERMANENT_ERROR);
            return self.call_immediately(Self::finalize);
        };

        let dst_alias = if dst.alias != 0 {
            Some(dst.alias)
        } else {
            self.iface.remote_aliases.lookup_alias(dst.id)
        };
        match dst_alias {
            Some(alias) => {
                self.shared.src.set(src);
                self.shared.dst.set(dst);
                self.shared.src_alias.set(src_alias);
                self.shared.dst_alias.set(alias);
                self.call_immediately(Self::register_listener)
            }
            None if !self.lookup_retried => {
                // Give discovery one window to surface the alias.
                self.lookup_retried = true;
                debug!("destination {:012x} not yet resolved, waiting", dst.id);
                let timer = self.timer.clone();
                self.sleep_and_call(&timer, self.lookup_timeout, Self::resolve_dst)
            }
            None => {
                self.shared.or_result(PERMANENT_ERROR | DST_NOT_FOUND);
                self.call_immediately(Self::finalize)
            }
        }
    }

    fn register_listener(&mut self) -> Action<Self> {
        let handler: Rc<dyn Handler<Buf<Message>>> = self.listener.clone();
        let dispatcher = &self.iface.dispatcher;
        dispatcher.register_mti_pair(
            MTI_TERMINATE_DUE_TO_ERROR,
            MTI_OPTIONAL_INTERACTION_REJECTED,
            handler.clone(),
        );
        dispatcher.register_mti_pair(MTI_DATAGRAM_OK, MTI_DATAGRAM_REJECTED, handler.clone());
        dispatcher.register(MtiFilter::exact(MTI_INITIALIZATION_COMPLETE), handler);
        self.call_immediately(Self::get_frame_buffer)
    }

    fn get_frame_buffer(&mut self) -> Action<Self> {
        // A response or reboot recorded mid-render aborts the remainder.
        if response_recorded(self.shared.result.get()) {
            return self.call_immediately(Self::finalize);
        }
        self.allocate_and_call(&self.iface.frame_pool.clone(), Self::fill_and_send)
    }

    fn fill_and_send(&mut self) -> Action<Self> {
        let Some(buf) = self.take_allocation::<CanFrame>() else {
            // Spurious wakeup (listener trigger racing the allocation).
            return self.wait();
        };
        if response_recorded(self.shared.result.get()) {
            drop(buf);
            return self.call_immediately(Self::finalize);
        }

        let (len, more) = {
            let Some(msg) = self.msg.as_ref() else {
                return self.call_immediately(Self::finalize);
            };
            let m = msg.data();
            let remaining = m.payload.len() - self.offset;
            let len = remaining.min(8);
            let frame_type = DatagramFrameType::for_fill(self.offset, remaining);
            let id = datagram_frame_id(
                frame_type,
                self.shared.dst_alias.get(),
                self.shared.src_alias.get(),
            );
            *buf.data_mut() =
                CanFrame::extended(id, &m.payload[self.offset..self.offset + len]);
            (len, remaining > 8)
        };
        self.offset += len;
        self.iface.frames_out.send(buf, self.priority);

        if more {
            self.call_immediately(Self::get_frame_buffer)
        } else {
            self.call_immediately(Self::send_finished)
        }
    }

    fn send_finished(&mut self) -> Action<Self> {
        if response_recorded(self.shared.result.get()) {
            return self.call_immediately(Self::finalize);
        }
        let timer = self.timer.clone();
        self.sleep_and_call(&timer, self.response_timeout, Self::response_or_timeout)
    }

    /// Single resumption point after the send: entered on true expiry and
    /// on the listener's trigger alike.
    fn response_or_timeout(&mut self) -> Action<Self> {
        if !response_recorded(self.shared.result.get()) {
            info!("no datagram response from {:012x}", self.shared.dst.get().id);
            self.shared.or_result(PERMANENT_ERROR | TIMEOUT);
        }
        self.call_immediately(Self::finalize)
    }

    fn finalize(&mut self) -> Action<Self> {
        let handler: Rc<dyn Handler<Buf<Message>>> = self.listener.clone();
        let dispatcher = &self.iface.dispatcher;
        dispatcher.unregister_mti_pair(
            MTI_TERMINATE_DUE_TO_ERROR,
            MTI_OPTIONAL_INTERACTION_REJECTED,
            &handler,
        );
        dispatcher.unregister_mti_pair(MTI_DATAGRAM_OK, MTI_DATAGRAM_REJECTED, &handler);
        dispatcher.unregister(MtiFilter::exact(MTI_INITIALIZATION_COMPLETE), &handler);
        self.timer.cancel();

        let result = self.shared.result.get();
        debug_assert!(result & OPERATION_PENDING != 0);
        self.shared.result.set(result & !OPERATION_PENDING);
        self.shared.busy.set(false);
        // Dropping the last reference fires the caller's done-notification.
        self.msg = None;
        self.call_immediately(Self::idle)
    }
}
