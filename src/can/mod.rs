//! CAN transport: frame type, device port, transport flows.

pub mod driver;
pub mod flows;
pub mod frame;

pub use driver::{CanDriver, LoopbackCan};
pub use flows::{CanFrameWriter, FrameDispatcher, FrameFilter, RX_FRAME_PRIORITY, spawn_frame_reader};
pub use frame::CanFrame;
