//! Classic CAN frame value type.

use embedded_can::{ExtendedId, Id, StandardId};

/// One classic CAN frame: 11- or 29-bit identifier, 0..8 data bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CanFrame {
    /// Raw identifier (right-aligned, 11 or 29 bits valid).
    pub id: u32,
    pub extended: bool,
    pub remote: bool,
    pub dlc: u8,
    pub data: [u8; 8],
}

impl CanFrame {
    /// An extended-identifier data frame. Panics in debug builds on more
    /// than 8 payload bytes; release truncates.
    pub fn extended(id: u32, payload: &[u8]) -> Self {
        debug_assert!(payload.len() <= 8, "CAN payload limited to 8 bytes");
        debug_assert!(id <= 0x1FFF_FFFF, "extended id limited to 29 bits");
        let mut data = [0u8; 8];
        let dlc = payload.len().min(8);
        data[..dlc].copy_from_slice(&payload[..dlc]);
        Self { id, extended: true, remote: false, dlc: dlc as u8, data }
    }

    /// A standard-identifier data frame.
    pub fn standard(id: u16, payload: &[u8]) -> Self {
        debug_assert!(id <= 0x7FF, "standard id limited to 11 bits");
        let mut frame = Self::extended(u32::from(id), payload);
        frame.extended = false;
        frame
    }

    /// The valid slice of the data field.
    pub fn payload(&self) -> &[u8] {
        &self.data[..usize::from(self.dlc.min(8))]
    }
}

impl embedded_can::Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }
        Some(match id.into() {
            Id::Standard(sid) => Self::standard(sid.as_raw(), data),
            Id::Extended(eid) => Self::extended(eid.as_raw(), data),
        })
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > 8 {
            return None;
        }
        let mut frame = Self::new(id, &[])?;
        frame.remote = true;
        frame.dlc = dlc as u8;
        Some(frame)
    }

    fn is_extended(&self) -> bool {
        self.extended
    }

    fn is_remote_frame(&self) -> bool {
        self.remote
    }

    fn id(&self) -> Id {
        if self.extended {
            ExtendedId::new(self.id).map_or(Id::Extended(ExtendedId::ZERO), Id::Extended)
        } else {
            StandardId::new(self.id as u16).map_or(Id::Standard(StandardId::ZERO), Id::Standard)
        }
    }

    fn dlc(&self) -> usize {
        usize::from(self.dlc)
    }

    fn data(&self) -> &[u8] {
        self.payload()
    }
}
