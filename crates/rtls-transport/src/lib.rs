//! RTLS Transport - UDP network channel
//!
//! Pure transport: binds a UDP endpoint, surfaces received datagrams,
//! faults and the bound address as events, and sends frames on request.

pub mod channel;

pub use channel::{ChannelEvent, NetworkChannel, DEFAULT_MAX_DATAGRAM_SIZE};
