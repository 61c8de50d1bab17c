use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::MIN_SLOT_WIDTH_MS;
use crate::model::{Ms, HOUR_MS};
use crate::pricing::PricingPolicy;
use crate::retry::RetryPolicy;

/// Tunables the engine consults on every operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Width of an enumerated slot.
    pub slot_width_ms: Ms,
    /// How long past its end an unfinished active booking lingers before it
    /// is expired.
    pub active_grace_ms: Ms,
    /// Retry budget for the conflict-check + write commit of create/extend.
    pub commit_retry: RetryPolicy,
    pub pricing: PricingPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slot_width_ms: HOUR_MS,
            active_grace_ms: 12 * HOUR_MS,
            commit_retry: RetryPolicy::default(),
            pricing: PricingPolicy::default(),
        }
    }
}

/// Daemon configuration, read from `PARKSLOT_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// Commits since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    /// Optional JSON file with a list of locations to create on first start.
    pub seed_file: Option<PathBuf>,
    pub engine: EngineConfig,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    parse_or(key, default, |k| std::env::var(k).ok())
}

fn parse_or<T: FromStr>(key: &str, default: T, lookup: impl Fn(&str) -> Option<String>) -> T {
    lookup(key).and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let slot_minutes: i64 = env_or("PARKSLOT_SLOT_MINUTES", 60);
        let grace_hours: i64 = env_or("PARKSLOT_ACTIVE_GRACE_HOURS", 12);
        let attempts: u32 = env_or("PARKSLOT_COMMIT_ATTEMPTS", 3);
        let overstay_pct: u32 = env_or("PARKSLOT_OVERSTAY_MULTIPLIER_PCT", 150);

        Self {
            data_dir: PathBuf::from(env_or("PARKSLOT_DATA_DIR", "./data".to_string())),
            metrics_port: std::env::var("PARKSLOT_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            compact_threshold: env_or("PARKSLOT_COMPACT_THRESHOLD", 1000),
            sweep_interval: Duration::from_secs(env_or("PARKSLOT_SWEEP_INTERVAL_SECS", 30).max(1)),
            seed_file: std::env::var("PARKSLOT_SEED_FILE").ok().map(PathBuf::from),
            engine: EngineConfig {
                slot_width_ms: (slot_minutes * 60_000).max(MIN_SLOT_WIDTH_MS),
                active_grace_ms: grace_hours.max(0) * HOUR_MS,
                commit_retry: RetryPolicy::new(attempts),
                pricing: PricingPolicy {
                    overstay_pct,
                    ..PricingPolicy::default()
                },
            },
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("parkslot.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.slot_width_ms, HOUR_MS);
        assert_eq!(cfg.active_grace_ms, 12 * HOUR_MS);
        assert_eq!(cfg.commit_retry.max_attempts, 3);
        assert_eq!(cfg.pricing.overstay_pct, 150);
    }

    #[test]
    fn parse_or_falls_back_on_garbage() {
        let vars = |k: &str| match k {
            "PARKSLOT_GARBAGE" => Some("not-a-number".to_string()),
            "PARKSLOT_SET" => Some("19".to_string()),
            _ => None,
        };
        assert_eq!(parse_or("PARKSLOT_UNSET", 42u32, vars), 42);
        assert_eq!(parse_or("PARKSLOT_GARBAGE", 7u64, vars), 7);
        assert_eq!(parse_or("PARKSLOT_SET", 7u64, vars), 19);
    }
}
