//! Configuration types for the flow core
//!
//! Layout spacing, poll cadence and history depth are tuning values, not
//! structural contracts, so they live here instead of in the algorithms.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{FlowError, Result};

/// Name of the config file inside a config directory
pub const CONFIG_FILE_NAME: &str = "flow.json";

/// Main layout axis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutDirection {
    /// Tasks flow top to bottom, lanes spread left to right
    #[default]
    Vertical,
    /// Tasks flow left to right, lanes spread top to bottom
    Horizontal,
}

/// Spacing used by the graph builder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub direction: LayoutDirection,
    /// Node box width
    pub node_width: f64,
    /// Node box height
    pub node_height: f64,
    /// Gap between consecutive nodes along the main axis
    pub main_gap: f64,
    /// Gap between neighbouring lanes along the cross axis
    pub lane_gap: f64,
    /// Radius of the rounded corner where an edge turns
    pub bend_radius: f64,
    /// Distance from the node's exit to its "+" controller
    pub controller_offset: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            direction: LayoutDirection::Vertical,
            node_width: 80.0,
            node_height: 80.0,
            main_gap: 80.0,
            lane_gap: 40.0,
            bend_radius: 10.0,
            controller_offset: 40.0,
        }
    }
}

impl LayoutConfig {
    /// The main axis runs left to right
    pub fn is_horizontal(&self) -> bool {
        self.direction == LayoutDirection::Horizontal
    }

    /// Node extent along the main axis
    pub fn main_extent(&self) -> f64 {
        if self.is_horizontal() {
            self.node_width
        } else {
            self.node_height
        }
    }

    /// Node extent along the cross axis
    pub fn cross_extent(&self) -> f64 {
        if self.is_horizontal() {
            self.node_height
        } else {
            self.node_width
        }
    }
}

/// Execution polling and request retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Interval between execution polls in milliseconds
    pub interval_ms: u64,
    /// Retries after a failed poll. Polling gives up once `max_retries + 1`
    /// consecutive fetches have failed, so `0` means a single attempt
    pub max_retries: u32,
    /// First retry delay in milliseconds, doubled per attempt
    pub backoff_base_ms: u64,
    /// Upper bound for a single retry delay in milliseconds
    pub backoff_max_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            max_retries: 3,
            backoff_base_ms: 200,
            backoff_max_ms: 2_000,
        }
    }
}

impl PollConfig {
    /// Delay between polls
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

/// Undo history settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Maximum number of task-list snapshots kept
    pub max_snapshots: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_snapshots: 100 }
    }
}

/// Full flow core configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

impl FlowConfig {
    /// Load configuration from `dir`, falling back to defaults when absent
    pub async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        if !fs::try_exists(&path).await? {
            log::debug!("No flow config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path).await?;
        serde_json::from_str(&contents)
            .map_err(|e| FlowError::Config(format!("failed to parse {:?}: {}", path, e)))
    }

    /// Save configuration into `dir`, creating it if needed
    pub async fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).await?;

        let path = dir.join(CONFIG_FILE_NAME);
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(&path, contents).await?;

        log::info!("Flow configuration saved to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_bounded() {
        let poll = PollConfig::default();
        assert_eq!(poll.backoff(1), Duration::from_millis(200));
        assert_eq!(poll.backoff(2), Duration::from_millis(400));
        assert_eq!(poll.backoff(3), Duration::from_millis(800));
        assert_eq!(poll.backoff(10), Duration::from_millis(2_000));
        assert_eq!(poll.backoff(u32::MAX), Duration::from_millis(2_000));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: FlowConfig =
            serde_json::from_str(r#"{"layout": {"direction": "horizontal"}}"#).unwrap();
        assert!(config.layout.is_horizontal());
        assert_eq!(config.layout.node_width, 80.0);
        assert_eq!(config.poll, PollConfig::default());
    }

    #[tokio::test]
    async fn test_load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = FlowConfig::load(dir.path()).await.unwrap();
        assert_eq!(config, FlowConfig::default());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("settings");

        let mut config = FlowConfig::default();
        config.poll.interval_ms = 250;
        config.layout.lane_gap = 64.0;
        config.save(&nested).await.unwrap();

        let loaded = FlowConfig::load(&nested).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{not json").unwrap();

        let err = FlowConfig::load(dir.path()).await.unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
    }
}
