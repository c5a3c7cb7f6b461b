//! RTLS Daemon - Reference collaborators for the task coordinator
//!
//! - [`protocol`]: one JSON packet per datagram, with optional acks
//! - [`anchors`]: anchor cluster backed by surveyed positions
//! - [`tags`]: latest range per tag and anchor
//! - [`config`]: TOML configuration

pub mod anchors;
pub mod config;
pub mod protocol;
pub mod tags;
