//! Interfaces of the collaborators wired together by the coordinator
//!
//! The protocol codec and the positioning clusters live outside this
//! crate. The coordinator only needs the surface below: commands it
//! calls, and event streams it subscribes to. Event streams are unbounded
//! so a burst (a resumed protocol replaying its queue) never loses events.

use rtls_core::{AnchorId, AnchorPositions, Packet, SharedError, TofReport};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Event produced by a [`ProtocolAdapter`]
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// Encoded frame to transmit to `to`
    Data { frame: Vec<u8>, to: SocketAddr },
    /// Decoded packet
    Packet(Packet),
    /// Decode/encode failure
    Error(SharedError),
}

/// Byte-level protocol codec
pub trait ProtocolAdapter: Send + 'static {
    /// Subscribe to decoded packets, outbound frames and faults
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ProtocolEvent>;

    /// Feed one inbound datagram
    fn write(&mut self, bytes: &[u8], from: SocketAddr);

    fn run(&mut self);

    fn stop(&mut self);

    fn pause(&mut self);

    fn resume(&mut self);

    /// The network side failed; release any buffered or partial state
    fn handle_network_error(&mut self, err: &std::io::Error);
}

/// Event produced by an [`AnchorCluster`]
#[derive(Debug, Clone)]
pub enum AnchorEvent {
    /// Anchor positions were (re)computed
    Position(AnchorPositions),
    Error(SharedError),
}

/// Tracks anchors and computes their positions
///
/// Shared between the coordinator and whoever received the handle from
/// [`run`](crate::TaskCoordinator::run), so methods take `&self`.
pub trait AnchorCluster: Send + Sync + 'static {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<AnchorEvent>;

    fn is_positioned(&self, anchor: &AnchorId) -> bool;
}

/// Options passed to [`TagCluster::run`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagRunOptions {
    /// Forget previously tracked tags when (re)starting
    #[serde(default)]
    pub reset_tracks: bool,
}

/// Options for [`TaskCoordinator::run`](crate::TaskCoordinator::run)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default)]
    pub tag_cluster: TagRunOptions,
}

/// Locates tags from time-of-flight reports
pub trait TagCluster: Send + 'static {
    fn run(&mut self, options: &TagRunOptions);

    /// `anchor` is always positioned when this is called
    fn process_tof_report(&mut self, anchor: &AnchorId, report: &TofReport);
}

/// Builds the clusters a coordinator is handed
///
/// The tag cluster gets the anchor cluster handle so it can look up
/// anchor positions itself.
pub trait ClusterFactory {
    type Anchors: AnchorCluster;
    type Tags: TagCluster;
    type AnchorOptions;
    type TagOptions;

    fn anchor_cluster(&self, options: &Self::AnchorOptions) -> Arc<Self::Anchors>;

    fn tag_cluster(&self, options: &Self::TagOptions, anchors: Arc<Self::Anchors>) -> Self::Tags;
}
