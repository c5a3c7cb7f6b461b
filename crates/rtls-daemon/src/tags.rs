//! Tag range tracking
//!
//! Keeps the latest range between each tag and each positioned anchor,
//! together with that anchor's position at the time of the report. Solving
//! for the tag position is left to a downstream consumer.

use chrono::{DateTime, Duration, TimeDelta, Utc};
use rtls_core::{AnchorId, Position, TagId, TofReport};
use rtls_task::{TagCluster, TagRunOptions};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::anchors::StaticAnchorCluster;
use crate::config::TagsConfig;

/// Latest range from one anchor to a tag
#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub distance_m: f64,
    pub sequence: u32,
    pub anchor_position: Option<Position>,
    pub updated: DateTime<Utc>,
}

pub struct TagTracker {
    anchors: Arc<StaticAnchorCluster>,
    stale_after: Duration,
    ranges: HashMap<TagId, BTreeMap<AnchorId, Range>>,
}

impl TagTracker {
    pub fn new(config: &TagsConfig, anchors: Arc<StaticAnchorCluster>) -> Self {
        Self {
            anchors,
            stale_after: stale_window(config.stale_after_secs),
            ranges: HashMap::new(),
        }
    }

    /// Fresh ranges for a tag, keyed by anchor
    pub fn ranges(&self, tag: &TagId) -> Option<&BTreeMap<AnchorId, Range>> {
        self.ranges.get(tag)
    }

    pub fn tag_count(&self) -> usize {
        self.ranges.len()
    }

    fn record(&mut self, anchor: &AnchorId, report: &TofReport, now: DateTime<Utc>) {
        let range = Range {
            distance_m: report.distance_m(),
            sequence: report.sequence,
            anchor_position: self.anchors.position(anchor),
            updated: now,
        };

        let stale_after = self.stale_after;
        let ranges = self.ranges.entry(report.tag_id.clone()).or_default();
        ranges.insert(anchor.clone(), range);
        ranges.retain(|_, r| now - r.updated <= stale_after);

        debug!(
            tag = %report.tag_id,
            anchor = %anchor,
            distance_m = report.distance_m(),
            anchors_in_range = ranges.len(),
            "Tag range updated"
        );
    }
}

/// Staleness window; values beyond chrono's range mean ranges never go stale
fn stale_window(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

impl TagCluster for TagTracker {
    fn run(&mut self, options: &TagRunOptions) {
        if options.reset_tracks {
            self.ranges.clear();
        }
        info!(tracked = self.ranges.len(), "Tag tracker running");
    }

    fn process_tof_report(&mut self, anchor: &AnchorId, report: &TofReport) {
        self.record(anchor, report, Utc::now());
    }
}
