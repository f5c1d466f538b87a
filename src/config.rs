//! Control-plane configuration.
//!
//! Loaded from `refbrowse.yaml` when present, otherwise defaults apply.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub snapshot: SnapshotConfig,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    #[serde(default)]
    pub browser: BrowserConfig,
}

/// Session lifecycle and timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds of inactivity before an idle session is reclaimed.
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,

    /// Seconds between reclamation sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Upper bound on any single engine-bound call, in milliseconds.
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,

    #[serde(default = "default_launch_timeout_ms")]
    pub launch_timeout_ms: u64,
}

/// Snapshot construction limits and diff behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Hard cap on rendered snapshot size; deeper levels are shed to fit.
    #[serde(default = "default_max_snapshot_bytes")]
    pub max_snapshot_bytes: usize,

    #[serde(default = "default_true")]
    pub compact: bool,

    /// Include clickable elements that lack ARIA roles.
    #[serde(default = "default_true")]
    pub cursor_interactive: bool,

    /// Attributes whose change marks a matched node as `changed` in the diff.
    #[serde(default = "default_tracked_attributes")]
    pub tracked_attributes: Vec<String>,
}

/// Per-domain admission limits, actions per minute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit")]
    pub default: u32,

    /// Domain pattern (substring match) to limit overrides.
    #[serde(default = "default_domain_limits")]
    pub per_domain: HashMap<String, u32>,
}

/// Launch settings for the concrete CDP engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    #[serde(default = "default_true")]
    pub headless: bool,

    #[serde(default = "default_window_width")]
    pub window_width: u32,

    #[serde(default = "default_window_height")]
    pub window_height: u32,
}

fn default_idle_ttl_secs() -> u64 {
    3600
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_max_sessions() -> usize {
    10
}
fn default_action_timeout_ms() -> u64 {
    30_000
}
fn default_launch_timeout_ms() -> u64 {
    60_000
}
fn default_max_depth() -> usize {
    10
}
fn default_max_snapshot_bytes() -> usize {
    100_000
}
fn default_true() -> bool {
    true
}
fn default_tracked_attributes() -> Vec<String> {
    ["pressed", "checked", "expanded", "selected", "disabled", "level", "value"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_rate_limit() -> u32 {
    8
}
fn default_domain_limits() -> HashMap<String, u32> {
    let mut limits = HashMap::new();
    limits.insert("linkedin.com".to_string(), 4);
    limits.insert("facebook.com".to_string(), 5);
    limits.insert("twitter.com".to_string(), 6);
    limits.insert("x.com".to_string(), 6);
    limits.insert("instagram.com".to_string(), 4);
    limits
}
fn default_window_width() -> u32 {
    1280
}
fn default_window_height() -> u32 {
    720
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_sessions: default_max_sessions(),
            action_timeout_ms: default_action_timeout_ms(),
            launch_timeout_ms: default_launch_timeout_ms(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_snapshot_bytes: default_max_snapshot_bytes(),
            compact: default_true(),
            cursor_interactive: default_true(),
            tracked_attributes: default_tracked_attributes(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default: default_rate_limit(),
            per_domain: default_domain_limits(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: default_true(),
            window_width: default_window_width(),
            window_height: default_window_height(),
        }
    }
}

impl Config {
    /// Load config from a YAML file, falling back to defaults when absent.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let contents = fs::read_to_string(path)?;
            let config: Config = serde_yaml::from_str(&contents)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn action_timeout(&self) -> Duration {
        self.session.action_timeout()
    }

    pub fn launch_timeout(&self) -> Duration {
        self.session.launch_timeout()
    }
}

impl SessionConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_expected_limits() {
        let config = Config::default();
        assert_eq!(config.session.idle_ttl_secs, 3600);
        assert_eq!(config.session.max_sessions, 10);
        assert_eq!(config.snapshot.max_depth, 10);
        assert_eq!(config.rate_limits.default, 8);
        assert_eq!(config.rate_limits.per_domain.get("linkedin.com"), Some(&4));
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let yaml = "session:\n  idle_ttl_secs: 120\nsnapshot:\n  max_depth: 4\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.session.idle_ttl_secs, 120);
        assert_eq!(config.session.sweep_interval_secs, 60);
        assert_eq!(config.snapshot.max_depth, 4);
        assert!(config.snapshot.compact);
    }
}
