use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::booking::HoldSettings;

/// Process configuration, read once from `RENTD_*` environment variables.
/// Unset or unparsable values fall back to their defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub hold_ttl: Duration,
    pub max_hold_units: i64,
    pub max_hold_days: i64,
    pub sweep_interval: Duration,
    pub compact_threshold: u64,
    /// Storefront hold requests per shop and client per minute.
    pub rate_limit_per_min: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            hold_ttl: Duration::from_secs(20 * 60),
            max_hold_units: 50,
            max_hold_days: 90,
            sweep_interval: Duration::from_secs(120),
            compact_threshold: 1000,
            rate_limit_per_min: 30,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("ignoring unparsable {key}={raw:?}");
            None
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            bind: lookup("RENTD_BIND").unwrap_or(d.bind),
            port: parsed(&lookup, "RENTD_PORT").unwrap_or(d.port),
            data_dir: lookup("RENTD_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            metrics_port: parsed(&lookup, "RENTD_METRICS_PORT"),
            hold_ttl: parsed(&lookup, "RENTD_HOLD_TTL_SECS")
                .filter(|&secs: &u64| secs > 0)
                .map_or(d.hold_ttl, Duration::from_secs),
            max_hold_units: parsed(&lookup, "RENTD_MAX_HOLD_UNITS")
                .filter(|&n: &i64| n > 0)
                .unwrap_or(d.max_hold_units),
            max_hold_days: parsed(&lookup, "RENTD_MAX_HOLD_DAYS")
                .filter(|&n: &i64| n > 0)
                .unwrap_or(d.max_hold_days),
            sweep_interval: parsed(&lookup, "RENTD_SWEEP_INTERVAL_SECS")
                .filter(|&secs: &u64| secs > 0)
                .map_or(d.sweep_interval, Duration::from_secs),
            compact_threshold: parsed(&lookup, "RENTD_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            rate_limit_per_min: parsed(&lookup, "RENTD_RATE_LIMIT_PER_MIN").unwrap_or(d.rate_limit_per_min),
        }
    }

    pub fn hold_settings(&self) -> HoldSettings {
        HoldSettings {
            ttl_ms: self.hold_ttl.as_millis() as i64,
            max_units: self.max_hold_units,
            max_days: self.max_hold_days,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("rentd.wal")
    }
}
