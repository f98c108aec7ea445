//! Engine configuration
//!
//! Static tunables in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists. User-editable settings
//! (bucket list, sort time) live in the host's key-value store instead; the
//! values here are only their defaults.

use crate::schedule::DailyTime;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tabage_core::BucketDefinition;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub persistence: PersistenceConfig,
    pub schedule: ScheduleConfig,
    pub sorting: SortingConfig,
    /// Bucket definitions used when none are stored or the stored ones are invalid.
    pub buckets: Vec<BucketDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Quiet period after the last entry mutation before the entry map is written.
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Name of the daily one-shot alarm.
    pub alarm_name: String,
    /// Default local hour of the daily pass.
    pub hour: u32,
    /// Default local minute of the daily pass.
    pub minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SortingConfig {
    /// Default for the stored sort-on-startup flag.
    pub sort_on_startup: bool,
    /// Collapse containers created for empty buckets.
    pub collapse_new_containers: bool,
    /// Create a container for every bucket on first install.
    pub ensure_containers_on_install: bool,
}

// ============================================================
// Defaults
// ============================================================

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            persistence: PersistenceConfig::default(),
            schedule: ScheduleConfig::default(),
            sorting: SortingConfig::default(),
            buckets: default_buckets(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { debounce_ms: 5_000 }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            alarm_name: "age-sort".into(),
            hour: 4,
            minute: 0,
        }
    }
}

impl Default for SortingConfig {
    fn default() -> Self {
        Self {
            sort_on_startup: false,
            collapse_new_containers: true,
            ensure_containers_on_install: true,
        }
    }
}

pub fn default_buckets() -> Vec<BucketDefinition> {
    vec![
        BucketDefinition::new("Today", 0),
        BucketDefinition::new("Yesterday", 1),
        BucketDefinition::new("Last Week", 7),
        BucketDefinition::new("Older", 14),
    ]
}

// ============================================================
// Loading
// ============================================================

impl EngineConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {} - using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {} - using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.persistence.debounce_ms)
    }

    /// Configured default sort time; out-of-range values fall back to 04:00.
    pub fn default_time(&self) -> DailyTime {
        DailyTime::new(self.schedule.hour, self.schedule.minute).unwrap_or_else(|e| {
            tracing::warn!("{} - using {}", e, DailyTime::default());
            DailyTime::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_shipped_buckets() {
        let config = EngineConfig::default();
        let names: Vec<&str> = config.buckets.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["Today", "Yesterday", "Last Week", "Older"]);
        assert_eq!(config.debounce(), Duration::from_secs(5));
        assert_eq!(config.default_time(), DailyTime { hour: 4, minute: 0 });
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: EngineConfig = toml::from_str(
            "[persistence]\ndebounce_ms = 250\n\n[schedule]\nhour = 6\n",
        )
        .unwrap();
        assert_eq!(config.persistence.debounce_ms, 250);
        assert_eq!(config.schedule.hour, 6);
        assert_eq!(config.schedule.minute, 0);
        assert_eq!(config.schedule.alarm_name, "age-sort");
        assert_eq!(config.buckets.len(), 4);
    }

    #[test]
    fn dumped_toml_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tabage.toml");
        let mut config = EngineConfig::default();
        config.sorting.sort_on_startup = true;
        std::fs::write(&path, config.to_toml()).unwrap();

        let loaded = EngineConfig::load(&path);
        assert!(loaded.sorting.sort_on_startup);
        assert_eq!(loaded.buckets, config.buckets);
    }

    #[test]
    fn missing_or_broken_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = EngineConfig::load(&dir.path().join("absent.toml"));
        assert_eq!(missing.persistence.debounce_ms, 5_000);

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[persistence\n").unwrap();
        assert_eq!(EngineConfig::load(&broken).persistence.debounce_ms, 5_000);
    }

    #[test]
    fn out_of_range_default_time_falls_back() {
        let mut config = EngineConfig::default();
        config.schedule.hour = 30;
        assert_eq!(config.default_time(), DailyTime::default());
    }
}
