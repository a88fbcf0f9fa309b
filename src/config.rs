//! Core configuration.
//!
//! Every empirically-tuned constant in the system lives here rather than at
//! its use site: eviction scoring weights, lifecycle throttle spacing,
//! device-class timeouts and thresholds, watchdog bounds. The defaults are
//! starting points, not load-bearing requirements.
//!
//! Configuration is stored at `~/.config/spotcache/config.json`.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "spotcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Coarse device category used to select timing profiles.
///
/// Constrained devices get longer network timeouts (slower radios), longer
/// cold-restart thresholds (the OS backgrounds apps more aggressively), and
/// throttled state-update propagation to bound re-render work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Constrained,
    #[default]
    Rich,
}

/// Eviction scoring weights.
///
/// `score = priority * priority_weight - age_since_access / recency_scale_ms
/// + access_count`; the minimum-score entry is evicted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTuning {
    pub priority_weight: f64,
    pub recency_scale_ms: f64,
}

impl Default for CacheTuning {
    fn default() -> Self {
        Self {
            priority_weight: 10.0,
            recency_scale_ms: 60_000.0,
        }
    }
}

/// Timing profile for one device class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Remote fetch timeout in milliseconds
    pub fetch_timeout_ms: i64,
    /// Visibility consistency-poll interval in milliseconds
    pub consistency_poll_ms: i64,
    /// Minimum spacing between lifecycle signal emissions in milliseconds.
    /// Zero disables throttling.
    pub notify_throttle_ms: i64,
    /// Hidden duration beyond which resumption is treated as a cold restart
    pub cold_restart_threshold_ms: i64,
}

impl DeviceProfile {
    fn rich() -> Self {
        Self {
            fetch_timeout_ms: 10_000,
            consistency_poll_ms: 15_000,
            notify_throttle_ms: 0,
            cold_restart_threshold_ms: 5 * 60 * 1000,
        }
    }

    fn constrained() -> Self {
        Self {
            fetch_timeout_ms: 30_000,
            consistency_poll_ms: 60_000,
            notify_throttle_ms: 2_000,
            cold_restart_threshold_ms: 15 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub device_class: DeviceClass,
    pub cache_tuning: CacheTuning,
    pub rich: DeviceProfile,
    pub constrained: DeviceProfile,

    /// Fail-open bound: initialization completes after this even if the
    /// auth collaborator never settles
    pub init_timeout_ms: i64,
    /// Data considered due for refresh after this much elapsed time
    pub data_refresh_threshold_ms: i64,

    /// Watchdog scan interval
    pub watchdog_scan_interval_ms: i64,
    /// A loading snapshot older than this with nothing newer is stuck
    pub stuck_loading_bound_ms: i64,
    /// Window for the rapid-state-change check
    pub rapid_change_window_ms: i64,
    /// Snapshot count within the window that indicates a transition loop
    pub rapid_change_count: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            device_class: DeviceClass::default(),
            cache_tuning: CacheTuning::default(),
            rich: DeviceProfile::rich(),
            constrained: DeviceProfile::constrained(),
            init_timeout_ms: 10_000,
            data_refresh_threshold_ms: 5 * 60 * 1000,
            watchdog_scan_interval_ms: 30_000,
            stuck_loading_bound_ms: 30_000,
            rapid_change_window_ms: 10_000,
            rapid_change_count: 5,
        }
    }
}

impl CoreConfig {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn data_dir() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// The timing profile for the configured device class
    pub fn profile(&self) -> &DeviceProfile {
        match self.device_class {
            DeviceClass::Rich => &self.rich,
            DeviceClass::Constrained => &self.constrained,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profiles() {
        let config = CoreConfig::default();
        assert_eq!(config.device_class, DeviceClass::Rich);
        assert_eq!(config.profile().fetch_timeout_ms, 10_000);

        let constrained = CoreConfig {
            device_class: DeviceClass::Constrained,
            ..CoreConfig::default()
        };
        // Constrained devices tolerate slower networks and background longer
        assert!(constrained.profile().fetch_timeout_ms > config.profile().fetch_timeout_ms);
        assert!(
            constrained.profile().cold_restart_threshold_ms
                > config.profile().cold_restart_threshold_ms
        );
    }

    #[test]
    fn test_config_round_trip() {
        let config = CoreConfig {
            device_class: DeviceClass::Constrained,
            init_timeout_ms: 7_500,
            ..CoreConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: CoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.device_class, DeviceClass::Constrained);
        assert_eq!(parsed.init_timeout_ms, 7_500);
    }
}
