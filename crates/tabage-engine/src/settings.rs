//! User settings persisted in the host's key-value store.
//!
//! Bucket rows are accepted in three shapes and rewritten to the canonical
//! `{name, min_days}` form:
//! - `{name, min_days}`
//! - `{name, days}` (first settings page layout)
//! - `{name, min_days | minDays, max_days | maxDays}` (range form, `max_days` dropped)

use crate::config::EngineConfig;
use crate::schedule::DailyTime;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use tabage_core::{BucketDefinition, Error, KeyValueStore, Result};
use tracing::{info, warn};

pub mod keys {
    pub const ENTRIES: &str = "entries";
    pub const LEGACY_ENTRIES: &str = "tabData";
    pub const BUCKETS: &str = "buckets";
    pub const SCHEDULE_HOUR: &str = "schedule_hour";
    pub const SCHEDULE_MINUTE: &str = "schedule_minute";
    pub const SORT_ON_STARTUP: &str = "sort_on_startup";
}

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub buckets: Vec<BucketDefinition>,
    pub schedule: DailyTime,
    pub sort_on_startup: bool,
    /// Problems found while loading; the affected values fell back to defaults.
    pub problems: Vec<String>,
}

#[derive(Deserialize)]
struct StoredBucket {
    name: String,
    #[serde(default, alias = "minDays")]
    min_days: Option<i64>,
    #[serde(default)]
    days: Option<i64>,
}

impl Settings {
    pub fn defaults(config: &EngineConfig) -> Self {
        Self {
            buckets: config.buckets.clone(),
            schedule: config.default_time(),
            sort_on_startup: config.sorting.sort_on_startup,
            problems: Vec::new(),
        }
    }

    /// Read every settings key. Storage failures are returned; bad values are
    /// replaced by defaults and listed in `problems`.
    pub async fn load(kv: &dyn KeyValueStore, config: &EngineConfig) -> Result<Self> {
        let mut settings = Self::defaults(config);

        if let Some(raw) = kv.get(keys::BUCKETS).await? {
            match migrate_buckets(raw) {
                Ok((buckets, migrated)) => match validate_buckets(&buckets) {
                    Ok(()) => {
                        if migrated {
                            info!(count = buckets.len(), "Bucket definitions migrated to threshold form");
                            kv.set(keys::BUCKETS, serde_json::to_value(&buckets)?).await?;
                        }
                        settings.buckets = buckets;
                    }
                    Err(e) => settings.reject(e),
                },
                Err(e) => settings.reject(e),
            }
        }

        let fallback = settings.schedule;
        let hour = kv.get(keys::SCHEDULE_HOUR).await?;
        let minute = kv.get(keys::SCHEDULE_MINUTE).await?;
        let hour = settings.number_or(keys::SCHEDULE_HOUR, hour, fallback.hour);
        let minute = settings.number_or(keys::SCHEDULE_MINUTE, minute, fallback.minute);
        match DailyTime::new(hour, minute) {
            Ok(time) => settings.schedule = time,
            Err(e) => settings.reject(e),
        }

        match kv.get(keys::SORT_ON_STARTUP).await? {
            Some(Value::Bool(flag)) => settings.sort_on_startup = flag,
            Some(Value::Null) | None => {}
            Some(other) => settings.reject(Error::config_invalid(format!(
                "{} must be a boolean, got {}",
                keys::SORT_ON_STARTUP,
                other
            ))),
        }

        Ok(settings)
    }

    pub async fn save(&self, kv: &dyn KeyValueStore) -> Result<()> {
        validate_buckets(&self.buckets)?;
        kv.set(keys::BUCKETS, serde_json::to_value(&self.buckets)?).await?;
        kv.set(keys::SCHEDULE_HOUR, Value::from(self.schedule.hour)).await?;
        kv.set(keys::SCHEDULE_MINUTE, Value::from(self.schedule.minute)).await?;
        kv.set(keys::SORT_ON_STARTUP, Value::Bool(self.sort_on_startup)).await?;
        Ok(())
    }

    fn reject(&mut self, error: Error) {
        warn!("{} - using default", error);
        self.problems.push(error.to_string());
    }

    /// Numbers and numeric strings are accepted; null or absent means default.
    fn number_or(&mut self, key: &str, value: Option<Value>, default: u32) -> u32 {
        let parsed = match &value {
            None | Some(Value::Null) => return default,
            Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Some(Value::String(s)) => s.trim().parse::<u32>().ok(),
            Some(_) => None,
        };
        parsed.unwrap_or_else(|| {
            self.reject(Error::config_invalid(format!(
                "{key} is not a valid number: {}",
                value.unwrap_or(Value::Null)
            )));
            default
        })
    }
}

/// Convert stored rows to threshold form. The flag reports whether any row
/// was in a non-canonical shape.
pub fn migrate_buckets(raw: Value) -> Result<(Vec<BucketDefinition>, bool)> {
    let rows = match &raw {
        Value::Array(rows) => rows,
        other => {
            return Err(Error::config_invalid(format!("buckets must be a list, got {other}")));
        }
    };
    let migrated = rows.iter().any(|row| match row.as_object() {
        Some(obj) => obj.keys().any(|k| k != "name" && k != "min_days"),
        None => false,
    });

    let stored: Vec<StoredBucket> = serde_json::from_value(raw)
        .map_err(|e| Error::config_invalid(format!("unreadable bucket list: {e}")))?;

    let buckets = stored
        .into_iter()
        .map(|row| {
            let threshold = row.min_days.or(row.days).ok_or_else(|| {
                Error::config_invalid(format!("bucket {:?} has no day threshold", row.name))
            })?;
            let min_days = u32::try_from(threshold).map_err(|_| {
                Error::config_invalid(format!("bucket {:?} has invalid threshold {}", row.name, threshold))
            })?;
            Ok(BucketDefinition::new(row.name.trim(), min_days))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok((buckets, migrated))
}

/// Names must be present and unique, thresholds unique, and the list non-empty.
pub fn validate_buckets(buckets: &[BucketDefinition]) -> Result<()> {
    if buckets.is_empty() {
        return Err(Error::config_invalid("no bucket definitions"));
    }
    let mut names = HashSet::new();
    let mut thresholds = HashSet::new();
    for bucket in buckets {
        if bucket.name.trim().is_empty() {
            return Err(Error::config_invalid("bucket with an empty name"));
        }
        if !names.insert(bucket.name.as_str()) {
            return Err(Error::config_invalid(format!("duplicate bucket name {:?}", bucket.name)));
        }
        if !thresholds.insert(bucket.min_days) {
            return Err(Error::config_invalid(format!(
                "duplicate threshold {} days ({:?})",
                bucket.min_days, bucket.name
            )));
        }
    }
    Ok(())
}
