//! The CAN character-device port.
//!
//! The concrete driver (FlexCAN, bxCAN, SocketCAN bridge, …) lives outside
//! this crate. The core consumes exactly this contract: non-blocking frame
//! exchange plus one-shot "direction became ready" notifications, which is
//! the ioctl surface the device drivers expose.
//!
//! [`LoopbackCan`] is the host adapter: a software bus with a bounded
//! transmit queue, used by the demo binary and the test suite. Its
//! injection/drain hooks play the role of the far side of the bus.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use log::trace;

use crate::executor::Notifiable;

use super::frame::CanFrame;

/// Non-blocking CAN device contract.
///
/// `watch_*` registrations are one-shot: the notifiable fires once, the
/// next wait requires a new registration. A registration made while the
/// direction is already ready fires immediately.
pub trait CanDriver {
    /// Queue a frame for transmit. `false` means the device is full; the
    /// caller should register a writable watch and retry on wakeup.
    fn try_write(&self, frame: &CanFrame) -> bool;

    /// Pull the next received frame, if any.
    fn try_read(&self) -> Option<CanFrame>;

    fn watch_readable(&self, notifiable: Box<dyn Notifiable>);

    fn watch_writable(&self, notifiable: Box<dyn Notifiable>);
}

// ── Loopback adapter ──────────────────────────────────────────

/// Software CAN bus endpoint for hosts and tests.
#[derive(Clone)]
pub struct LoopbackCan {
    inner: Rc<RefCell<LoopInner>>,
}

struct LoopInner {
    rx: VecDeque<CanFrame>,
    tx: VecDeque<CanFrame>,
    /// Transmit queue depth; writes beyond this report "full".
    tx_depth: usize,
    /// When set, transmitted frames are also looped onto rx, like a bus
    /// with only this node listening to itself.
    echo: bool,
    readable: Option<Box<dyn Notifiable>>,
    writable: Option<Box<dyn Notifiable>>,
}

impl Default for LoopbackCan {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackCan {
    pub fn new() -> Self {
        Self::with_tx_depth(8)
    }

    pub fn with_tx_depth(tx_depth: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(LoopInner {
                rx: VecDeque::new(),
                tx: VecDeque::new(),
                tx_depth,
                echo: false,
                readable: None,
                writable: None,
            })),
        }
    }

    /// Loop transmitted frames back onto the receive side.
    pub fn set_echo(&self, echo: bool) {
        self.inner.borrow_mut().echo = echo;
    }

    /// Deliver a frame from the far side of the bus.
    pub fn inject(&self, frame: CanFrame) {
        let readable = {
            let mut inner = self.inner.borrow_mut();
            inner.rx.push_back(frame);
            inner.readable.take()
        };
        if let Some(n) = readable {
            n.notify();
        }
    }

    /// Drain everything this node has transmitted. Freeing transmit space
    /// fires a pending writable watch, like the device's tx-complete path.
    pub fn take_tx(&self) -> Vec<CanFrame> {
        let (frames, writable) = {
            let mut inner = self.inner.borrow_mut();
            let frames: Vec<CanFrame> = inner.tx.drain(..).collect();
            let writable = if frames.is_empty() { None } else { inner.writable.take() };
            (frames, writable)
        };
        if let Some(n) = writable {
            n.notify();
        }
        frames
    }

    pub fn tx_level(&self) -> usize {
        self.inner.borrow().tx.len()
    }
}

impl CanDriver for LoopbackCan {
    fn try_write(&self, frame: &CanFrame) -> bool {
        let (accepted, readable) = {
            let mut inner = self.inner.borrow_mut();
            if inner.tx.len() >= inner.tx_depth {
                trace!("loopback tx full (depth {})", inner.tx_depth);
                (false, None)
            } else {
                inner.tx.push_back(*frame);
                if inner.echo {
                    inner.rx.push_back(*frame);
                    (true, inner.readable.take())
                } else {
                    (true, None)
                }
            }
        };
        if let Some(n) = readable {
            n.notify();
        }
        accepted
    }

    fn try_read(&self) -> Option<CanFrame> {
        self.inner.borrow_mut().rx.pop_front()
    }

    fn watch_readable(&self, notifiable: Box<dyn Notifiable>) {
        let ready = {
            let mut inner = self.inner.borrow_mut();
            if inner.rx.is_empty() {
                inner.readable = Some(notifiable);
                None
            } else {
                Some(notifiable)
            }
        };
        if let Some(n) = ready {
            n.notify();
        }
    }

    fn watch_writable(&self, notifiable: Box<dyn Notifiable>) {
        let ready = {
            let mut inner = self.inner.borrow_mut();
            if inner.tx.len() >= inner.tx_depth {
                inner.writable = Some(notifiable);
                None
            } else {
                Some(notifiable)
            }
        };
        if let Some(n) = ready {
            n.notify();
        }
    }
}
