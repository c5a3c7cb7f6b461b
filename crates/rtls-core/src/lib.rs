//! RTLS Core - Core types shared by the RTLS node crates
//!
//! This crate provides the foundational types for the node:
//! - Anchor/tag identifiers and anchor positions
//! - Decoded packets as produced by a protocol adapter
//! - The fault taxonomy surfaced by the task coordinator

pub mod device;
pub mod fault;
pub mod packet;

pub use device::{AnchorId, AnchorPositions, Position, TagId};
pub use fault::{Fault, SharedError};
pub use packet::{Packet, PacketHeader, Payload, TofReport, TOF_REPORT};
