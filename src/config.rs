/// Configuration for the access layer.
///
/// Every knob has a default, so `RowGateConfig::default()` is usable against
/// the in-memory store. Values can be layered from a JSON file or from
/// `ROWGATE_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, RowGateError};

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_MAX_DELAY_MS: u64 = 8_000;
pub const DEFAULT_RATE_WINDOW_MS: u64 = 60_000;
pub const DEFAULT_RATE_CEILING: u32 = 60;
pub const DEFAULT_CACHE_TTL_MS: u64 = 30_000;
pub const DEFAULT_HEADER_TTL_MS: u64 = 300_000;
pub const DEFAULT_METADATA_TTL_MS: u64 = 600_000;
pub const DEFAULT_BASE_URL: &str = "https://sheets.googleapis.com";

/// Quota backoff uses a larger base and cap than transient backoff.
const QUOTA_BASE_FACTOR: u64 = 3;
const QUOTA_CAP_FACTOR: u64 = 2;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffSettings {
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl BackoffSettings {
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn cap(&self) -> Duration {
        Duration::from_millis(self.cap_ms)
    }

    /// Parameters used for quota failures, derived from the transient ones.
    pub fn scaled_for_quota(&self) -> Self {
        Self {
            base_ms: self.base_ms.saturating_mul(QUOTA_BASE_FACTOR),
            cap_ms: self.cap_ms.saturating_mul(QUOTA_CAP_FACTOR),
        }
    }
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_ms: DEFAULT_BASE_DELAY_MS,
            cap_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateSettings {
    pub window_ms: u64,
    pub ceiling: u32,
}

impl RateSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_RATE_WINDOW_MS,
            ceiling: DEFAULT_RATE_CEILING,
        }
    }
}

/// Volatility class of cached data; each class carries its own TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
    Header,
    Rows,
    Metadata,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheSettings {
    pub default_ttl_ms: u64,
    pub header_ttl_ms: u64,
    pub rows_ttl_ms: u64,
    pub metadata_ttl_ms: u64,
}

impl CacheSettings {
    pub fn ttl_for(&self, class: ResourceClass) -> Duration {
        let ms = match class {
            ResourceClass::Header => self.header_ttl_ms,
            ResourceClass::Rows => self.rows_ttl_ms,
            ResourceClass::Metadata => self.metadata_ttl_ms,
        };
        Duration::from_millis(ms)
    }

    /// For ranges outside the resource classes, such as raw reads.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_ms: DEFAULT_CACHE_TTL_MS,
            header_ttl_ms: DEFAULT_HEADER_TTL_MS,
            rows_ttl_ms: DEFAULT_CACHE_TTL_MS,
            metadata_ttl_ms: DEFAULT_METADATA_TTL_MS,
        }
    }
}

/// Where the HTTP transport points.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreSettings {
    pub base_url: String,
    pub spreadsheet_id: String,
    pub access_token: Option<String>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            spreadsheet_id: String::new(),
            access_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RowGateConfig {
    pub request_timeout_ms: u64,
    pub max_attempts: u32,
    pub transient: BackoffSettings,
    /// When unset, derived from `transient` (3x base, 2x cap).
    pub quota: Option<BackoffSettings>,
    pub rate: RateSettings,
    pub cache: CacheSettings,
    pub store: StoreSettings,
}

impl Default for RowGateConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            transient: BackoffSettings::default(),
            quota: None,
            rate: RateSettings::default(),
            cache: CacheSettings::default(),
            store: StoreSettings::default(),
        }
    }
}

impl RowGateConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn quota_backoff(&self) -> BackoffSettings {
        self.quota
            .unwrap_or_else(|| self.transient.scaled_for_quota())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RowGateError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by any `ROWGATE_*` variables present.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var::<u64, _>(&lookup, "ROWGATE_REQUEST_TIMEOUT_MS")? {
            config.request_timeout_ms = v;
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "ROWGATE_MAX_ATTEMPTS")? {
            config.max_attempts = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "ROWGATE_BACKOFF_BASE_MS")? {
            config.transient.base_ms = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "ROWGATE_BACKOFF_CAP_MS")? {
            config.transient.cap_ms = v;
        }
        let quota_base = parse_var::<u64, _>(&lookup, "ROWGATE_QUOTA_BASE_MS")?;
        let quota_cap = parse_var::<u64, _>(&lookup, "ROWGATE_QUOTA_CAP_MS")?;
        if quota_base.is_some() || quota_cap.is_some() {
            let derived = config.transient.scaled_for_quota();
            config.quota = Some(BackoffSettings {
                base_ms: quota_base.unwrap_or(derived.base_ms),
                cap_ms: quota_cap.unwrap_or(derived.cap_ms),
            });
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "ROWGATE_RATE_WINDOW_MS")? {
            config.rate.window_ms = v;
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "ROWGATE_RATE_CEILING")? {
            config.rate.ceiling = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "ROWGATE_CACHE_TTL_MS")? {
            config.cache.default_ttl_ms = v;
            config.cache.rows_ttl_ms = v;
        }
        if let Some(v) = lookup("ROWGATE_BASE_URL") {
            config.store.base_url = v;
        }
        if let Some(v) = lookup("ROWGATE_SPREADSHEET_ID") {
            config.store.spreadsheet_id = v;
        }
        config.store.access_token = lookup("ROWGATE_ACCESS_TOKEN");

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(RowGateError::Config("max_attempts must be at least 1".into()));
        }
        if self.rate.ceiling == 0 {
            return Err(RowGateError::Config("rate ceiling must be at least 1".into()));
        }
        if self.rate.window_ms == 0 {
            return Err(RowGateError::Config("rate window must be non-zero".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(RowGateError::Config("request timeout must be non-zero".into()));
        }
        let quota = self.quota_backoff();
        if self.transient.base_ms > self.transient.cap_ms || quota.base_ms > quota.cap_ms {
            return Err(RowGateError::Config("backoff base exceeds its cap".into()));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| RowGateError::Config(format!("{}={:?}: {}", name, raw, e))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_quota_backoff_derived_from_transient() {
        let config = RowGateConfig::default();
        let quota = config.quota_backoff();
        assert_eq!(quota.base_ms, DEFAULT_BASE_DELAY_MS * 3);
        assert_eq!(quota.cap_ms, DEFAULT_MAX_DELAY_MS * 2);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ROWGATE_MAX_ATTEMPTS", "5"),
            ("ROWGATE_RATE_CEILING", "10"),
            ("ROWGATE_QUOTA_BASE_MS", "4000"),
            ("ROWGATE_SPREADSHEET_ID", "sheet-123"),
        ]
        .into_iter()
        .collect();

        let config =
            RowGateConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.rate.ceiling, 10);
        assert_eq!(config.quota_backoff().base_ms, 4000);
        assert_eq!(config.quota_backoff().cap_ms, DEFAULT_MAX_DELAY_MS * 2);
        assert_eq!(config.store.spreadsheet_id, "sheet-123");
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = RowGateConfig::from_lookup(|k| {
            (k == "ROWGATE_MAX_ATTEMPTS").then(|| "lots".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, RowGateError::Config(_)));

        let config = RowGateConfig {
            rate: RateSettings { window_ms: 1000, ceiling: 0 },
            ..RowGateConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json() {
        let config: RowGateConfig =
            serde_json::from_str(r#"{ "max_attempts": 4, "rate": { "ceiling": 100 } }"#).unwrap();
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.rate.ceiling, 100);
        assert_eq!(config.rate.window_ms, DEFAULT_RATE_WINDOW_MS);
        assert_eq!(config.cache, CacheSettings::default());
    }
}
