//! CAN frame transport flows.
//!
//! The write flow serialises outbound frame buffers onto the device,
//! parking on the writable watch when the device is full. The read flow
//! pulls inbound frames, wraps each in a pool buffer and hands it to the
//! CAN-ID-keyed [`FrameDispatcher`], where the datagram parser (and any
//! other frame consumer) is registered.

use std::rc::Rc;

use crate::executor::{
    Action, Buf, Executor, FlowCore, FlowRef, Inbox, Mailbox, MsgFlow, Pool, Priority, StateFlow,
    spawn,
};
use crate::iface::dispatcher::{Dispatcher, Filter};

use super::driver::CanDriver;
use super::frame::CanFrame;

/// Priority band inbound frames are dispatched at.
pub const RX_FRAME_PRIORITY: Priority = 2;

// ── Frame dispatcher ──────────────────────────────────────────

/// `(id & mask)` match key over extended/standard frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFilter {
    pub id: u32,
    pub mask: u32,
    pub extended: bool,
}

impl FrameFilter {
    pub const fn extended_match(id: u32, mask: u32) -> Self {
        Self { id, mask, extended: true }
    }
}

impl Filter<Buf<CanFrame>> for FrameFilter {
    fn matches(&self, frame: &Buf<CanFrame>) -> bool {
        let f = frame.data();
        f.extended == self.extended && (f.id & self.mask) == (self.id & self.mask)
    }
}

/// The inbound-frame demultiplexer.
pub type FrameDispatcher = Dispatcher<Buf<CanFrame>, FrameFilter>;

// ── Write flow ────────────────────────────────────────────────

/// Handle to the outbound frame flow.
#[derive(Clone)]
pub struct CanFrameWriter {
    mailbox: Mailbox<Buf<CanFrame>>,
}

impl CanFrameWriter {
    pub fn new(exec: &Executor, driver: Rc<dyn CanDriver>) -> Self {
        let mailbox = Mailbox::new();
        let mb = mailbox.clone();
        let flow = spawn(exec, "can-write", WriteFlow::wait_for_message, move |core| WriteFlow {
            core,
            inbox: Inbox::new(mb),
            driver,
        });
        mailbox.bind(flow);
        Self { mailbox }
    }

    /// Queue a frame buffer for transmit.
    pub fn send(&self, frame: Buf<CanFrame>, priority: Priority) {
        self.mailbox.send(frame, priority);
    }

    pub fn mailbox(&self) -> &Mailbox<Buf<CanFrame>> {
        &self.mailbox
    }
}

struct WriteFlow {
    core: FlowCore<Self>,
    inbox: Inbox<Buf<CanFrame>>,
    driver: Rc<dyn CanDriver>,
}

impl StateFlow for WriteFlow {
    fn core(&self) -> &FlowCore<Self> {
        &self.core
    }
}

impl MsgFlow for WriteFlow {
    type Msg = Buf<CanFrame>;

    fn inbox(&mut self) -> &mut Inbox<Buf<CanFrame>> {
        &mut self.inbox
    }

    fn entry(&mut self) -> Action<Self> {
        self.push_to_device()
    }
}

impl WriteFlow {
    fn push_to_device(&mut self) -> Action<Self> {
        let accepted = {
            let Some(buf) = self.inbox.current() else {
                return self.release_and_exit();
            };
            let frame = *buf.data();
            self.driver.try_write(&frame)
        };
        if accepted {
            self.release_and_exit()
        } else {
            // Device full: hold the frame, resume here on writable.
            self.driver.watch_writable(Box::new(self.core.flow_ref()));
            self.wait_and_call(Self::push_to_device)
        }
    }
}

// ── Read flow ─────────────────────────────────────────────────

/// Spawn the inbound frame pump feeding `out`.
pub fn spawn_frame_reader(
    exec: &Executor,
    driver: Rc<dyn CanDriver>,
    pool: Pool<CanFrame>,
    out: FrameDispatcher,
) -> FlowRef {
    let flow = spawn(exec, "can-read", ReadFlow::read_frames, move |core| ReadFlow {
        core,
        driver,
        pool,
        out,
    });
    // Prime the first read/watch cycle.
    flow.notify();
    flow
}

struct ReadFlow {
    core: FlowCore<Self>,
    driver: Rc<dyn CanDriver>,
    pool: Pool<CanFrame>,
    out: FrameDispatcher,
}

impl StateFlow for ReadFlow {
    fn core(&self) -> &FlowCore<Self> {
        &self.core
    }
}

impl ReadFlow {
    fn read_frames(&mut self) -> Action<Self> {
        while let Some(frame) = self.driver.try_read() {
            let buf = self.pool.alloc();
            *buf.data_mut() = frame;
            self.out.send(buf, RX_FRAME_PRIORITY);
        }
        self.driver.watch_readable(Box::new(self.core.flow_ref()));
        self.wait()
    }
}
