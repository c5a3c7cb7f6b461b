//! Coordinator configuration

use rtls_transport::DEFAULT_MAX_DATAGRAM_SIZE;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_datagram_size must be at least 1 byte")]
    ZeroDatagramSize,
}

/// Network side of the task, read-only once the coordinator is built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// UDP listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Local address to bind
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Receive buffer size, larger datagrams are truncated
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
    /// Buffer of the outward event broadcast
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            max_datagram_size: default_max_datagram_size(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl TaskConfig {
    /// Config listening on `port` with every other field defaulted
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Reject values the network channel cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_datagram_size == 0 {
            return Err(ConfigError::ZeroDatagramSize);
        }
        Ok(())
    }
}

fn default_port() -> u16 {
    4000
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_max_datagram_size() -> usize {
    DEFAULT_MAX_DATAGRAM_SIZE
}

fn default_event_capacity() -> usize {
    256
}
