//! Inbound datagram reassembly flow.
//!
//! Registered on the frame dispatcher for protocol-message frames at
//! normal priority; everything that is not datagram framing (subtypes
//! 2..5) is dropped here. Fragments accumulate in a pending table keyed by
//! the (dst, src) alias pair packed in the CAN identifier — at most one
//! in-flight datagram per pair. Completed payloads are published to the
//! message dispatcher for the destination node; malformed sequences earn
//! the sender a `DATAGRAM_REJECTED` through the addressed-message writer.
//!
//! A reaper timer drops pending entries whose first frame is older than
//! the configured reassembly timeout, so a sender that dies mid-datagram
//! cannot pin a buffer forever.

use std::rc::Rc;

use heapless::FnvIndexMap;
use log::{debug, warn};

use crate::can::{CanFrame, FrameFilter};
use crate::config::NodeConfig;
use crate::executor::{
    Action, Buf, FlowCore, Inbox, LOWEST_PRIORITY, Mailbox, MsgFlow, Nanos, StateFlow, Timer,
    spawn,
};
use crate::iface::defs::{
    DatagramFrameType, FRAME_TYPE_MASK, MTI_DATAGRAM, MTI_DATAGRAM_REJECTED, PRIORITY_MASK,
    PROTOCOL_BASE_ID, dst_alias, reassembly_key, src_alias,
};
use crate::iface::message::{Message, NodeHandle, Payload, error_code_payload};
use crate::iface::{CanInterface, NodeAlias};

use super::{REJECT_OUT_OF_ORDER, REJECT_PERMANENT_ERROR, REJECT_RESEND_OK};

/// Concurrent (dst, src) reassemblies supported. Overflow is rejected as
/// transient so the sender can retry.
const PENDING_CAPACITY: usize = 16;

struct PendingEntry {
    payload: Payload,
    deadline: Option<Nanos>,
}

enum Target {
    Local,
    Pending,
}

pub(crate) fn spawn_parser(iface: &CanInterface, cfg: &NodeConfig) {
    let mailbox: Mailbox<Buf<CanFrame>> = Mailbox::new();
    let mb = mailbox.clone();
    let ifc = iface.clone();
    let reap_after = cfg.reassembly_timeout();
    let flow = spawn(&iface.exec, "dg-parser", ParserFlow::wait_for_frame, move |core| {
        let reap_timer = Timer::new(&ifc.exec, core.flow_ref());
        ParserFlow {
            core,
            inbox: Inbox::new(mb),
            iface: ifc,
            reap_timer,
            reap_after,
            pending: FnvIndexMap::new(),
            local_buf: Payload::new(),
            dst: NodeHandle::default(),
            src_alias: 0,
            error_code: 0,
        }
    });
    mailbox.bind(flow);
    iface.frames_in.register(
        FrameFilter::extended_match(PROTOCOL_BASE_ID, PRIORITY_MASK | FRAME_TYPE_MASK),
        Rc::new(mailbox),
    );
}

struct ParserFlow {
    core: FlowCore<Self>,
    inbox: Inbox<Buf<CanFrame>>,
    iface: CanInterface,
    reap_timer: Timer,
    reap_after: Option<Nanos>,
    /// Partially assembled inbound datagrams, keyed by (dst, src) aliases.
    pending: FnvIndexMap<u32, PendingEntry, PENDING_CAPACITY>,
    /// Owns a completed payload between final frame and publication.
    local_buf: Payload,
    // Scratch for the frame being classified.
    dst: NodeHandle,
    src_alias: NodeAlias,
    error_code: u16,
}

impl StateFlow for ParserFlow {
    fn core(&self) -> &FlowCore<Self> {
        &self.core
    }
}

impl MsgFlow for ParserFlow {
    type Msg = Buf<CanFrame>;

    fn inbox(&mut self) -> &mut Inbox<Buf<CanFrame>> {
        &mut self.inbox
    }

    fn entry(&mut self) -> Action<Self> {
        self.classify_frame()
    }
}

impl ParserFlow {
    /// Idle state: sweep stale reassemblies, then pend on the inbox.
    fn wait_for_frame(&mut self) -> Action<Self> {
        self.reap_stale();
        self.wait_for_message()
    }

    fn done_with_frame(&mut self) -> Action<Self> {
        self.release();
        self.call_immediately(Self::wait_for_frame)
    }

    fn classify_frame(&mut self) -> Action<Self> {
        self.error_code = 0;
        let Some(frame) = self.inbox.current().map(|b| *b.data()) else {
            return self.release_and_exit();
        };

        let Some(frame_type) = DatagramFrameType::from_id(frame.id) else {
            // Addressed-message or stream framing; not ours.
            return self.done_with_frame();
        };

        self.src_alias = src_alias(frame.id);
        let key = reassembly_key(frame.id);
        let to_alias = dst_alias(frame.id);

        // Only datagrams addressed to a node hosted here are assembled.
        let dst_id = self
            .iface
            .local_aliases
            .lookup_id(to_alias)
            .filter(|id| self.iface.local_nodes.contains(*id));
        let Some(dst_id) = dst_id else {
            debug!("datagram for non-local alias {to_alias:03x} dropped");
            return self.done_with_frame();
        };
        self.dst = NodeHandle { id: dst_id, alias: to_alias };

        let now = self.iface.exec.now();
        let (target, last) = match frame_type {
            DatagramFrameType::One => {
                self.local_buf.clear();
                (Some(Target::Local), true)
            }
            DatagramFrameType::First => {
                if self.pending.remove(&key).is_some() {
                    // A fresh start while one is open: frames came out of
                    // order, or two datagrams overlap on this pair.
                    self.error_code = REJECT_RESEND_OK | REJECT_OUT_OF_ORDER;
                    (None, false)
                } else {
                    let entry = PendingEntry {
                        payload: Payload::new(),
                        deadline: self.reap_after.map(|after| now.saturating_add(after)),
                    };
                    match self.pending.insert(key, entry) {
                        Ok(_) => {
                            self.arm_reaper();
                            (Some(Target::Pending), false)
                        }
                        Err(_) => {
                            warn!("reassembly table full, rejecting datagram from {:03x}", self.src_alias);
                            self.error_code = REJECT_RESEND_OK | REJECT_OUT_OF_ORDER;
                            (None, false)
                        }
                    }
                }
            }
            DatagramFrameType::Middle => {
                if self.pending.contains_key(&key) {
                    (Some(Target::Pending), false)
                } else {
                    self.error_code = REJECT_RESEND_OK | REJECT_OUT_OF_ORDER;
                    (None, false)
                }
            }
            DatagramFrameType::Final => match self.pending.remove(&key) {
                Some(entry) => {
                    self.local_buf = entry.payload;
                    (Some(Target::Local), true)
                }
                None => {
                    self.error_code = REJECT_RESEND_OK | REJECT_OUT_OF_ORDER;
                    (None, true)
                }
            },
        };

        if self.error_code == 0 {
            if let Some(target) = target {
                let appended = match target {
                    Target::Local => self.local_buf.extend_from_slice(frame.payload()),
                    Target::Pending => match self.pending.get_mut(&key) {
                        Some(entry) => entry.payload.extend_from_slice(frame.payload()),
                        None => Err(()),
                    },
                };
                if appended.is_err() {
                    warn!("over-long datagram from alias {:03x} rejected", self.src_alias);
                    self.error_code = REJECT_PERMANENT_ERROR;
                    self.pending.remove(&key);
                }
            }
        }

        self.release();
        if self.error_code != 0 {
            return self.allocate_and_call(&self.iface.message_pool.clone(), Self::send_rejection);
        }
        if last {
            self.allocate_and_call(&self.iface.message_pool.clone(), Self::publish_datagram)
        } else {
            self.call_immediately(Self::wait_for_frame)
        }
    }

    /// Tell the sender why its datagram was not taken.
    fn send_rejection(&mut self) -> Action<Self> {
        let Some(buf) = self.take_allocation::<Message>() else {
            return self.wait();
        };
        debug_assert!(self.error_code != 0);
        {
            let mut m = buf.data_mut();
            m.reset(
                MTI_DATAGRAM_REJECTED,
                self.dst.id,
                NodeHandle::from_alias(self.src_alias),
                error_code_payload(self.error_code),
            );
        }
        self.iface.addressed_out.send(buf, LOWEST_PRIORITY);
        self.call_immediately(Self::wait_for_frame)
    }

    /// Hand the assembled datagram to the protocol layer.
    fn publish_datagram(&mut self) -> Action<Self> {
        let Some(buf) = self.take_allocation::<Message>() else {
            return self.wait();
        };
        {
            let mut m = buf.data_mut();
            m.mti = MTI_DATAGRAM;
            m.payload = core::mem::take(&mut self.local_buf);
            m.dst = self.dst;
            m.dst_node = Some(self.dst.id);
            // Zero when the alias is unknown. A datagram framed onto CAN
            // from a local alias is unusual but still resolved.
            let src_id = self
                .iface
                .remote_aliases
                .lookup_id(self.src_alias)
                .or_else(|| self.iface.local_aliases.lookup_id(self.src_alias))
                .unwrap_or(0);
            m.src = NodeHandle { id: src_id, alias: self.src_alias };
        }
        self.iface.dispatcher.send(buf, self.inbox.current_priority());
        self.call_immediately(Self::wait_for_frame)
    }

    fn reap_stale(&mut self) {
        if self.reap_after.is_none() {
            return;
        }
        let now = self.iface.exec.now();
        let mut stale: heapless::Vec<u32, PENDING_CAPACITY> = heapless::Vec::new();
        for (key, entry) in &self.pending {
            if entry.deadline.is_some_and(|deadline| deadline <= now) {
                let _ = stale.push(*key);
            }
        }
        for key in &stale {
            warn!("dropping stale reassembly for pair {key:06x}");
            self.pending.remove(key);
        }
        if !self.pending.is_empty() {
            self.arm_reaper();
        }
    }

    fn arm_reaper(&mut self) {
        if let Some(period) = self.reap_after {
            if !self.reap_timer.is_armed() {
                self.reap_timer.start(period);
            }
        }
    }
}
