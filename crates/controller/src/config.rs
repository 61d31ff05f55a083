use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_core::{BackoffPolicy, ResourceKey};
use warden_queue::{controller_limiter, MaxOfLimiter};
use warden_store::CacheConfig;

/// Tunables shared by every resource controller of a process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    pub workers: usize,
    /// Failed reconciliations are retried this many times before the key is dropped.
    pub max_retries: u32,
    pub resync_period: Option<Duration>,
    pub sync_timeout: Duration,
    pub retry_backoff: BackoffPolicy,
    pub queue_qps: f64,
    pub queue_burst: u32,
    pub watch_backoff: BackoffPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_retries: 5,
            resync_period: Some(Duration::from_secs(30)),
            sync_timeout: Duration::from_secs(120),
            retry_backoff: BackoffPolicy::new(Duration::from_millis(5), Duration::from_secs(1000)),
            queue_qps: 10.0,
            queue_burst: 100,
            watch_backoff: BackoffPolicy::new(Duration::from_millis(800), Duration::from_secs(30)),
        }
    }
}

/// Rejected `WARDEN_*` settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Parse { key: &'static str, value: String },
    #[error("{field} must be {expected}, got {value}")]
    Invalid { field: &'static str, expected: &'static str, value: String },
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().parse() {
            Ok(v) => Ok(Some(v)),
            Err(_) => Err(ConfigError::Parse { key, value: raw }),
        },
    }
}

impl ControllerConfig {
    /// Defaults overridden by `WARDEN_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> { Self::from_lookup(|key| std::env::var(key).ok()) }

    /// Defaults overridden by whatever `lookup` returns for each `WARDEN_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut c = Self::default();
        if let Some(v) = parse(&lookup, "WARDEN_WORKERS")? {
            c.workers = v;
        }
        if let Some(v) = parse(&lookup, "WARDEN_MAX_RETRIES")? {
            c.max_retries = v;
        }
        if let Some(v) = parse::<u64, _>(&lookup, "WARDEN_RESYNC_SECS")? {
            c.resync_period = if v == 0 { None } else { Some(Duration::from_secs(v)) };
        }
        if let Some(v) = parse(&lookup, "WARDEN_SYNC_TIMEOUT_SECS")? {
            c.sync_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse(&lookup, "WARDEN_RETRY_BASE_MS")? {
            c.retry_backoff.base = Duration::from_millis(v);
        }
        if let Some(v) = parse(&lookup, "WARDEN_RETRY_MAX_SECS")? {
            c.retry_backoff.max = Duration::from_secs(v);
        }
        if let Some(v) = parse(&lookup, "WARDEN_QUEUE_QPS")? {
            c.queue_qps = v;
        }
        if let Some(v) = parse(&lookup, "WARDEN_QUEUE_BURST")? {
            c.queue_burst = v;
        }
        if let Some(v) = parse(&lookup, "WARDEN_WATCH_BACKOFF_MAX_SECS")? {
            c.watch_backoff.max = Duration::from_secs(v);
        }
        c.validate()?;
        Ok(c)
    }

    /// Reject settings the queue's rate limiter cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.queue_qps.is_finite() && self.queue_qps > 0.0) {
            return Err(ConfigError::Invalid { field: "queue_qps", expected: "a positive finite number", value: self.queue_qps.to_string() });
        }
        if self.queue_burst == 0 {
            return Err(ConfigError::Invalid { field: "queue_burst", expected: "at least 1", value: "0".to_string() });
        }
        Ok(())
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig { resync_period: self.resync_period, backoff: self.watch_backoff }
    }

    pub fn limiter(&self) -> MaxOfLimiter<ResourceKey> {
        controller_limiter(self.retry_backoff, self.queue_qps, self.queue_burst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = ControllerConfig::default();
        assert_eq!(c.workers, 2);
        assert_eq!(c.max_retries, 5);
        assert_eq!(c.resync_period, Some(Duration::from_secs(30)));
        assert_eq!(c.retry_backoff.delay(0), Duration::from_millis(5));
        assert_eq!(c.cache_config().backoff.delay(0), Duration::from_millis(800));
    }

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| vars.iter().find(|(k, _)| *k == key).map(|(_, v)| v.to_string())
    }

    #[test]
    fn environment_overrides_defaults() {
        let c = ControllerConfig::from_lookup(lookup(&[("WARDEN_WORKERS", "8"), ("WARDEN_RESYNC_SECS", "0"), ("WARDEN_QUEUE_QPS", "2.5")]))
            .expect("valid");
        assert_eq!(c.workers, 8);
        assert_eq!(c.resync_period, None);
        assert_eq!(c.queue_qps, 2.5);
        assert_eq!(c.max_retries, 5);
    }

    #[test]
    fn unusable_queue_rates_are_rejected() {
        for qps in ["0", "-3", "NaN", "inf"] {
            let err = ControllerConfig::from_lookup(lookup(&[("WARDEN_QUEUE_QPS", qps)])).expect_err(qps);
            assert!(matches!(err, ConfigError::Invalid { field: "queue_qps", .. }), "{qps}: {err}");
        }
        let err = ControllerConfig::from_lookup(lookup(&[("WARDEN_QUEUE_BURST", "0")])).expect_err("burst");
        assert!(matches!(err, ConfigError::Invalid { field: "queue_burst", .. }));
    }

    #[test]
    fn unparseable_values_are_reported() {
        let err = ControllerConfig::from_lookup(lookup(&[("WARDEN_WORKERS", "many")])).expect_err("workers");
        assert!(matches!(err, ConfigError::Parse { key: "WARDEN_WORKERS", .. }));
        assert_eq!(err.to_string(), "WARDEN_WORKERS: cannot parse \"many\"");
    }

    #[test]
    fn serializes_for_print_config() {
        let v = serde_json::to_value(ControllerConfig::default()).expect("json");
        assert_eq!(v["workers"], 2);
        assert_eq!(v["queue_burst"], 100);
    }
}
