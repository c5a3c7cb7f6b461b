//! Fault taxonomy surfaced by the task coordinator
//!
//! Faults are classified only by where they came from. The originating
//! error is carried as-is so observers see exactly what the collaborator
//! reported.

use std::sync::Arc;
use thiserror::Error;

/// Shared, clonable error reported by a collaborator
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug, Clone)]
pub enum Fault {
    /// Socket bind/send/receive failure; the network side has been stopped
    #[error("network fault: {0}")]
    Network(Arc<std::io::Error>),
    /// Decode/encode failure in the protocol adapter
    #[error("protocol fault: {0}")]
    Protocol(SharedError),
    /// Failure reported by the anchor cluster
    #[error("anchor cluster fault: {0}")]
    Anchor(SharedError),
}

impl Fault {
    /// True for faults that stopped the network side
    pub fn is_network(&self) -> bool {
        matches!(self, Fault::Network(_))
    }
}

impl From<std::io::Error> for Fault {
    fn from(err: std::io::Error) -> Self {
        Fault::Network(Arc::new(err))
    }
}
