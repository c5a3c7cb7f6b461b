//! Configuration loading and validation

use anyhow::Result;
use rtls_task::TaskConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub task: TaskConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub tags: TagsConfig,
    #[serde(default, rename = "anchor")]
    pub anchors: Vec<AnchorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Answer packets that carry a header sequence with an ack frame
    #[serde(default = "default_true")]
    pub ack_reports: bool,
    /// Datagrams kept while paused; the oldest are dropped beyond this
    #[serde(default = "default_max_paused")]
    pub max_paused_datagrams: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            ack_reports: true,
            max_paused_datagrams: default_max_paused(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_paused() -> usize {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagsConfig {
    /// Ranges older than this are forgotten
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
        }
    }
}

fn default_stale_after() -> u64 {
    5
}

/// Anchor known to the node; anchors without a position are not positioned yet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorConfig {
    pub id: String,
    /// Surveyed position `[x, y, z]` in meters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<[f64; 3]>,
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.task.validate()?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let config = Config {
        anchors: vec![
            AnchorConfig {
                id: "anchor-01".to_string(),
                position: Some([0.0, 0.0, 2.5]),
            },
            AnchorConfig {
                id: "anchor-02".to_string(),
                position: Some([8.0, 0.0, 2.5]),
            },
            AnchorConfig {
                id: "anchor-03".to_string(),
                position: None,
            },
        ],
        ..Config::default()
    };

    let content = toml::to_string_pretty(&config)?;
    std::fs::write(path, content)?;
    Ok(())
}
