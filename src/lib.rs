//! RailNet messaging core.
//!
//! The cooperative state-flow executor and the CAN datagram engine for
//! RailNet layout-control nodes. Board bring-up, DCC waveform generation
//! and the concrete CAN character device stay outside this crate and are
//! reached through the [`can::CanDriver`] port.
//!
//! ```text
//!  CAN driver ──▶ read flow ──▶ frame dispatcher ──▶ datagram parser
//!                                                         │
//!                                     message dispatcher ◀┘
//!                                      │            ▲
//!                            node handlers   datagram clients
//!                                                   │
//!  CAN driver ◀── write flow ◀──────────────────────┘
//! ```
//!
//! Every box above is a state flow scheduled by [`executor::Executor`];
//! every arrow is a refcounted buffer moving through a priority queue.

#![deny(unused_must_use)]

pub mod can;
pub mod config;
pub mod datagram;
pub mod error;
pub mod executor;
pub mod iface;
