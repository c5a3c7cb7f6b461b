//! Anchor cluster backed by surveyed positions
//!
//! Anchors listed in the configuration with a position are positioned
//! from the start. Positions can be set or withdrawn at runtime; every
//! change republishes the full position set.

use rtls_core::{AnchorId, AnchorPositions, Position};
use rtls_task::{AnchorCluster, AnchorEvent, ClusterFactory};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{AnchorConfig, TagsConfig};
use crate::tags::TagTracker;

#[derive(Error, Debug)]
pub enum AnchorError {
    #[error("Anchor {0} has a non-finite position")]
    InvalidPosition(AnchorId),
}

pub struct StaticAnchorCluster {
    anchors: RwLock<BTreeMap<AnchorId, Option<Position>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AnchorEvent>>>,
}

impl StaticAnchorCluster {
    pub fn from_config(anchors: &[AnchorConfig]) -> Self {
        let anchors = anchors
            .iter()
            .map(|a| (AnchorId::new(a.id.as_str()), a.position.map(Position::from_array)))
            .collect();
        Self {
            anchors: RwLock::new(anchors),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Current positions of positioned anchors
    pub fn positions(&self) -> AnchorPositions {
        self.read()
            .iter()
            .filter_map(|(id, position)| position.map(|p| (id.clone(), p)))
            .collect()
    }

    pub fn position(&self, anchor: &AnchorId) -> Option<Position> {
        self.read().get(anchor).copied().flatten()
    }

    /// Set one anchor's position and republish
    ///
    /// A non-finite coordinate is reported as an [`AnchorEvent::Error`]
    /// and leaves the anchor unchanged.
    pub fn set_position(&self, anchor: AnchorId, position: Position) {
        if !position.to_array().iter().all(|c| c.is_finite()) {
            warn!(anchor = %anchor, "Rejecting non-finite anchor position");
            self.emit(AnchorEvent::Error(Arc::new(AnchorError::InvalidPosition(anchor))));
            return;
        }
        debug!(anchor = %anchor, x = position.x, y = position.y, z = position.z, "Anchor positioned");
        self.write().insert(anchor, Some(position));
        self.publish();
    }

    /// Mark an anchor as not positioned and republish
    pub fn remove_position(&self, anchor: &AnchorId) {
        let removed = match self.write().get_mut(anchor) {
            Some(position) => position.take().is_some(),
            None => false,
        };
        if removed {
            debug!(anchor = %anchor, "Anchor position withdrawn");
            self.publish();
        }
    }

    /// Broadcast the current position set
    pub fn publish(&self) {
        let positions = self.positions();
        info!(positioned = positions.len(), "Publishing anchor positions");
        self.emit(AnchorEvent::Position(positions));
    }

    fn emit(&self, event: AnchorEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<AnchorId, Option<Position>>> {
        self.anchors.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<AnchorId, Option<Position>>> {
        self.anchors.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl AnchorCluster for StaticAnchorCluster {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<AnchorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    fn is_positioned(&self, anchor: &AnchorId) -> bool {
        self.position(anchor).is_some()
    }
}

/// Builds the daemon's anchor cluster and tag tracker
pub struct NodeClusters;

impl ClusterFactory for NodeClusters {
    type Anchors = StaticAnchorCluster;
    type Tags = TagTracker;
    type AnchorOptions = Vec<AnchorConfig>;
    type TagOptions = TagsConfig;

    fn anchor_cluster(&self, options: &Self::AnchorOptions) -> Arc<Self::Anchors> {
        Arc::new(StaticAnchorCluster::from_config(options))
    }

    fn tag_cluster(&self, options: &Self::TagOptions, anchors: Arc<Self::Anchors>) -> Self::Tags {
        TagTracker::new(options, anchors)
    }
}
