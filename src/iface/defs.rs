//! Protocol wire constants.
//!
//! 29-bit extended CAN identifier layout for protocol traffic:
//!
//! ```text
//! ┌────┬────┬───────────┬─────────────┬─────────────┐
//! │ 28 │ 27 │ 26 ── 24  │ 23 ──── 12  │ 11 ───── 0  │
//! │ pri│ msg│ subtype   │ dst alias   │ src alias   │
//! └────┴────┴───────────┴─────────────┴─────────────┘
//! ```
//!
//! Bit 28 is the priority field (1 = normal), bit 27 distinguishes
//! protocol messages from link-control traffic, and for datagram traffic
//! bits 26..24 carry the framing subtype. Outbound datagram identifiers
//! therefore all start from [`DATAGRAM_BASE_ID`].

use super::NodeAlias;

// ── MTI opcodes (16-bit message-type identifiers) ─────────────

pub const MTI_INITIALIZATION_COMPLETE: u16 = 0x0100;
pub const MTI_OPTIONAL_INTERACTION_REJECTED: u16 = 0x0068;
pub const MTI_TERMINATE_DUE_TO_ERROR: u16 = 0x00A8;
pub const MTI_DATAGRAM: u16 = 0x1C48;
pub const MTI_DATAGRAM_OK: u16 = 0x0A28;
pub const MTI_DATAGRAM_REJECTED: u16 = 0x0A48;

/// Mask for an exact-match MTI registration.
pub const MTI_EXACT: u16 = 0xFFFF;

// ── CAN identifier fields ─────────────────────────────────────

pub const SRC_MASK: u32 = 0x0000_0FFF;
pub const SRC_SHIFT: u32 = 0;
pub const DST_MASK: u32 = 0x00FF_F000;
pub const DST_SHIFT: u32 = 12;
pub const SUBTYPE_MASK: u32 = 0x0700_0000;
pub const SUBTYPE_SHIFT: u32 = 24;
/// Bit 27: set on protocol messages (clear on link-control frames).
pub const FRAME_TYPE_PROTOCOL: u32 = 0x0800_0000;
pub const FRAME_TYPE_MASK: u32 = 0x0800_0000;
/// Bit 28: set for normal-priority traffic.
pub const PRIORITY_NORMAL: u32 = 0x1000_0000;
pub const PRIORITY_MASK: u32 = 0x1000_0000;

/// Normal-priority protocol message, subtype zero.
pub const PROTOCOL_BASE_ID: u32 = PRIORITY_NORMAL | FRAME_TYPE_PROTOCOL;

/// Base identifier of every outbound datagram frame (subtype ONE).
pub const DATAGRAM_BASE_ID: u32 = 0x1A00_0000;

/// Datagram framing subtype, bits 26..24 of the identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DatagramFrameType {
    /// Entire payload in a single frame.
    One = 2,
    /// First of a multi-frame sequence.
    First = 3,
    /// Neither first nor last.
    Middle = 4,
    /// Last of a multi-frame sequence.
    Final = 5,
}

impl DatagramFrameType {
    /// Decode the subtype field; `None` for non-datagram subtypes.
    pub fn from_id(id: u32) -> Option<Self> {
        match (id & SUBTYPE_MASK) >> SUBTYPE_SHIFT {
            2 => Some(Self::One),
            3 => Some(Self::First),
            4 => Some(Self::Middle),
            5 => Some(Self::Final),
            _ => None,
        }
    }

    /// Pick the subtype for a fill at `offset` with `remaining` bytes left.
    pub fn for_fill(offset: usize, remaining: usize) -> Self {
        match (offset == 0, remaining <= 8) {
            (true, true) => Self::One,
            (true, false) => Self::First,
            (false, false) => Self::Middle,
            (false, true) => Self::Final,
        }
    }
}

/// Build a datagram frame identifier.
pub fn datagram_frame_id(frame_type: DatagramFrameType, dst: NodeAlias, src: NodeAlias) -> u32 {
    PROTOCOL_BASE_ID
        | (u32::from(frame_type as u8) << SUBTYPE_SHIFT)
        | ((u32::from(dst) << DST_SHIFT) & DST_MASK)
        | (u32::from(src) & SRC_MASK)
}

pub fn src_alias(id: u32) -> NodeAlias {
    (id & SRC_MASK) as NodeAlias
}

pub fn dst_alias(id: u32) -> NodeAlias {
    ((id & DST_MASK) >> DST_SHIFT) as NodeAlias
}

/// Reassembly key: the (dst, src) alias pair as packed in the identifier.
pub fn reassembly_key(id: u32) -> u32 {
    id & (DST_MASK | SRC_MASK)
}
