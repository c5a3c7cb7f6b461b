//! RTLS Task - Coordinator for an RTLS node
//!
//! Owns the UDP network channel and the protocol pipeline, and routes
//! decoded reports to the anchor and tag clusters:
//! - [`collaborator`] defines the interfaces of the protocol adapter and clusters
//! - [`task`] is the single-threaded state machine and its dispatch policy
//! - [`coordinator`] drives the state machine on a tokio task behind a handle

pub mod collaborator;
pub mod config;
pub mod coordinator;
pub mod task;

pub use collaborator::{
    AnchorCluster, AnchorEvent, ClusterFactory, ProtocolAdapter, ProtocolEvent, RunOptions,
    TagCluster, TagRunOptions,
};
pub use config::{ConfigError, TaskConfig};
pub use coordinator::{RunOutcome, TaskCoordinator, TaskError};
pub use task::{TaskEvent, TaskState};

#[cfg(test)]
mod mock;
