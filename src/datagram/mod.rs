//! The CAN datagram engine.
//!
//! Two flows implement the protocol: [`client`] renders outbound datagrams
//! into tagged CAN frames and correlates the asynchronous ack/nack, while
//! [`parser`] reassembles inbound fragments for locally hosted nodes.
//!
//! ## Result word
//!
//! A client operation finishes by composing a `u32` bit-set:
//!
//! | Bits  | Meaning                                   |
//! |-------|-------------------------------------------|
//! | 0-15  | Protocol error code from the response     |
//! | 16    | `OPERATION_SUCCESS`                       |
//! | 17    | `OPERATION_PENDING` (cleared at finalise) |
//! | 18    | `DST_NOT_FOUND`                           |
//! | 19    | `TIMEOUT`                                 |
//! | 20    | `DST_REBOOT`                              |
//! | 24-31 | Response flags byte from `DATAGRAM_OK`    |

pub mod client;
pub mod parser;

use crate::config::NodeConfig;
use crate::iface::CanInterface;

pub use client::DatagramClientHandle;

// ── Result word flags ─────────────────────────────────────────

pub const OPERATION_SUCCESS: u32 = 0x0001_0000;
pub const OPERATION_PENDING: u32 = 0x0002_0000;
pub const DST_NOT_FOUND: u32 = 0x0004_0000;
pub const TIMEOUT: u32 = 0x0008_0000;
pub const DST_REBOOT: u32 = 0x0010_0000;

/// Low half of the result word: the protocol error code.
pub const RESPONSE_CODE_MASK: u32 = 0x0000_FFFF;
/// Optional flags byte reported by `DATAGRAM_OK`.
pub const RESPONSE_FLAGS_SHIFT: u32 = 24;

// ── Protocol rejection codes (wire values, low 16 bits) ───────

pub const REJECT_PERMANENT_ERROR: u16 = 0x1000;
pub const REJECT_RESEND_OK: u16 = 0x2000;
pub const REJECT_OUT_OF_ORDER: u16 = 0x0040;

/// Result-word views of the wire codes.
pub const PERMANENT_ERROR: u32 = REJECT_PERMANENT_ERROR as u32;
pub const RESEND_OK: u32 = REJECT_RESEND_OK as u32;

/// True once any terminal response (ack, rejection, reboot) is recorded.
/// The post-send wait state uses this to tell a triggered wakeup from a
/// true expiry; `TIMEOUT` is only set when it is false.
pub(crate) fn response_recorded(result: u32) -> bool {
    result & (OPERATION_SUCCESS | DST_REBOOT | PERMANENT_ERROR | RESEND_OK) != 0
}

/// Datagram support for one interface: the inbound parser plus a small
/// set of outbound client flows.
pub struct DatagramService {
    clients: Vec<DatagramClientHandle>,
}

impl DatagramService {
    pub fn new(iface: &CanInterface, cfg: &NodeConfig) -> Self {
        parser::spawn_parser(iface, cfg);
        let clients = (0..cfg.datagram_clients).map(|_| client::spawn_client(iface, cfg)).collect();
        Self { clients }
    }

    /// An idle client, if any. Callers hold the handle for the duration of
    /// one `write_datagram` operation.
    pub fn try_acquire(&self) -> Option<&DatagramClientHandle> {
        self.clients.iter().find(|c| !c.is_busy())
    }

    pub fn clients(&self) -> &[DatagramClientHandle] {
        &self.clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_line_up_with_result_word_bits() {
        assert_eq!(PERMANENT_ERROR, u32::from(REJECT_PERMANENT_ERROR));
        assert_eq!(RESEND_OK, u32::from(REJECT_RESEND_OK));
        assert_eq!(PERMANENT_ERROR & RESPONSE_CODE_MASK, PERMANENT_ERROR);
    }

    #[test]
    fn response_recorded_tracks_terminal_bits_only() {
        assert!(!response_recorded(0));
        assert!(!response_recorded(OPERATION_PENDING));
        assert!(!response_recorded(TIMEOUT | DST_NOT_FOUND));
        assert!(response_recorded(OPERATION_SUCCESS));
        assert!(response_recorded(DST_REBOOT));
        assert!(response_recorded(PERMANENT_ERROR));
        assert!(response_recorded(u32::from(REJECT_RESEND_OK | REJECT_OUT_OF_ORDER)));
    }
}
