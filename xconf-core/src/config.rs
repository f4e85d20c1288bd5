//! Process-wide cache settings.
//!
//! Settings are read from a flat key/value configuration using the service's
//! historical key names (`cache_tickDuration`, ...). The same keys can come
//! from a TOML document or from `XCONF_`-prefixed environment variables.
//! Anything missing falls back to the defaults in [`crate::constants`].
//! Invalid values (including unknown time units) fail at load time.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::{ConfigError, XconfResult};

pub const KEY_TICK_DURATION: &str = "cache_tickDuration";
pub const KEY_RETRY_COUNT_UNTIL_FULL_REFRESH: &str = "cache_retryCountUntilFullRefresh";
pub const KEY_CHANGED_KEYS_TIME_WINDOW_SIZE: &str = "cache_changedKeysTimeWindowSize";
pub const KEY_RELOAD_CACHE_ENTRIES: &str = "cache_reloadCacheEntries";
pub const KEY_RELOAD_CACHE_ENTRIES_TIMEOUT: &str = "cache_reloadCacheEntriesTimeout";
pub const KEY_RELOAD_CACHE_ENTRIES_TIME_UNIT: &str = "cache_reloadCacheEntriesTimeUnit";
pub const KEY_CLONE_DATA_ENABLED: &str = "cache_clone_data_enabled";
pub const KEY_APPLICATION_CACHE_ENABLED: &str = "application_cache_enabled";
pub const KEY_AUDIT_LOG_QUEUE_SIZE: &str = "cache_auditLogQueueSize";
pub const KEY_AUDIT_LOG_WORKERS: &str = "cache_auditLogWorkers";
pub const KEY_AUDIT_USER_NAME: &str = "cache_auditUserName";

/// Unit of the passive-expiry timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Duration of `amount` units, saturating on overflow.
    pub fn to_duration(&self, amount: u64) -> Duration {
        match self {
            Self::Nanoseconds => Duration::from_nanos(amount),
            Self::Microseconds => Duration::from_micros(amount),
            Self::Milliseconds => Duration::from_millis(amount),
            Self::Seconds => Duration::from_secs(amount),
            Self::Minutes => Duration::from_secs(amount.saturating_mul(60)),
            Self::Hours => Duration::from_secs(amount.saturating_mul(3_600)),
            Self::Days => Duration::from_secs(amount.saturating_mul(86_400)),
        }
    }
}

impl FromStr for TimeUnit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NANOSECONDS" => Ok(Self::Nanoseconds),
            "MICROSECONDS" => Ok(Self::Microseconds),
            "MILLISECONDS" => Ok(Self::Milliseconds),
            "SECONDS" => Ok(Self::Seconds),
            "MINUTES" => Ok(Self::Minutes),
            "HOURS" => Ok(Self::Hours),
            "DAYS" => Ok(Self::Days),
            _ => Err(ConfigError::InvalidTimeUnit {
                value: s.to_string(),
            }),
        }
    }
}

/// Cache settings shared by every table cache and the refresh task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Interval between refresh-task ticks.
    pub tick_duration: Duration,
    /// Failed incremental syncs tolerated before a forced full refresh.
    pub retry_count_until_full_refresh: u32,
    /// Width of one changed-keys bucket, in milliseconds.
    pub changed_keys_time_window_ms: i64,
    /// Whether entries are reloaded after `reload_cache_entries_timeout`.
    pub reload_cache_entries: bool,
    pub reload_cache_entries_timeout: u64,
    pub reload_cache_entries_time_unit: TimeUnit,
    /// Deep-copy every value handed out by the cached DAOs.
    pub clone_data_enabled: bool,
    pub application_cache_enabled: bool,
    /// Capacity of the audit-log write queue.
    pub audit_log_queue_size: usize,
    /// Number of audit-log writer tasks.
    pub audit_log_workers: usize,
    /// Recorded as `userName` on every audit row.
    pub audit_user_name: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            tick_duration: Duration::from_millis(DEFAULT_TICK_DURATION_MS),
            retry_count_until_full_refresh: DEFAULT_RETRY_COUNT_UNTIL_FULL_REFRESH,
            changed_keys_time_window_ms: DEFAULT_CHANGED_KEYS_TIME_WINDOW_MS,
            reload_cache_entries: DEFAULT_RELOAD_CACHE_ENTRIES,
            reload_cache_entries_timeout: DEFAULT_RELOAD_CACHE_ENTRIES_TIMEOUT,
            reload_cache_entries_time_unit: TimeUnit::Days,
            clone_data_enabled: DEFAULT_CLONE_DATA_ENABLED,
            application_cache_enabled: DEFAULT_APPLICATION_CACHE_ENABLED,
            audit_log_queue_size: DEFAULT_AUDIT_LOG_QUEUE_SIZE,
            audit_log_workers: DEFAULT_AUDIT_LOG_WORKERS,
            audit_user_name: default_user_name(),
        }
    }
}

fn default_user_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_AUDIT_USER_NAME.to_string())
}

impl CacheSettings {
    /// Create settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build settings from an arbitrary key lookup.
    ///
    /// Absent keys take their defaults; present but unparsable keys are errors.
    pub fn from_lookup<F>(lookup: F) -> XconfResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let time_unit = match lookup(KEY_RELOAD_CACHE_ENTRIES_TIME_UNIT) {
            Some(raw) => raw.parse::<TimeUnit>()?,
            None => defaults.reload_cache_entries_time_unit,
        };

        let settings = Self {
            tick_duration: Duration::from_millis(parse_or(
                &lookup,
                KEY_TICK_DURATION,
                DEFAULT_TICK_DURATION_MS,
            )?),
            retry_count_until_full_refresh: parse_or(
                &lookup,
                KEY_RETRY_COUNT_UNTIL_FULL_REFRESH,
                defaults.retry_count_until_full_refresh,
            )?,
            changed_keys_time_window_ms: parse_or(
                &lookup,
                KEY_CHANGED_KEYS_TIME_WINDOW_SIZE,
                defaults.changed_keys_time_window_ms,
            )?,
            reload_cache_entries: parse_or(
                &lookup,
                KEY_RELOAD_CACHE_ENTRIES,
                defaults.reload_cache_entries,
            )?,
            reload_cache_entries_timeout: parse_or(
                &lookup,
                KEY_RELOAD_CACHE_ENTRIES_TIMEOUT,
                defaults.reload_cache_entries_timeout,
            )?,
            reload_cache_entries_time_unit: time_unit,
            clone_data_enabled: parse_or(
                &lookup,
                KEY_CLONE_DATA_ENABLED,
                defaults.clone_data_enabled,
            )?,
            application_cache_enabled: parse_or(
                &lookup,
                KEY_APPLICATION_CACHE_ENABLED,
                defaults.application_cache_enabled,
            )?,
            audit_log_queue_size: parse_or(
                &lookup,
                KEY_AUDIT_LOG_QUEUE_SIZE,
                defaults.audit_log_queue_size,
            )?,
            audit_log_workers: parse_or(
                &lookup,
                KEY_AUDIT_LOG_WORKERS,
                defaults.audit_log_workers,
            )?,
            audit_user_name: lookup(KEY_AUDIT_USER_NAME)
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.audit_user_name),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML document.
    ///
    /// Only the cache keys are read; other keys in the document are ignored so
    /// the cache settings can live inside a larger service configuration.
    pub fn from_toml_str(contents: &str) -> XconfResult<Self> {
        let table: toml::Table = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        Self::from_lookup(|key| table.get(key).and_then(toml_scalar))
    }

    /// Load settings from a TOML file.
    pub fn from_path(path: &Path) -> XconfResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Load settings from environment variables.
    ///
    /// Each key maps to `XCONF_` plus its upper snake case form, e.g.
    /// `cache_tickDuration` is read from `XCONF_CACHE_TICK_DURATION`.
    pub fn from_env() -> XconfResult<Self> {
        Self::from_lookup(|key| std::env::var(env_var_name(key)).ok())
    }

    /// Validate the settings.
    ///
    /// Validates:
    /// - tick_duration is positive
    /// - changed_keys_time_window_ms is positive
    /// - the audit queue has capacity and at least one worker
    pub fn validate(&self) -> XconfResult<()> {
        if self.tick_duration.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: KEY_TICK_DURATION.to_string(),
                value: format!("{:?}", self.tick_duration),
                reason: "tick duration must be positive".to_string(),
            }
            .into());
        }

        if self.changed_keys_time_window_ms <= 0 {
            return Err(ConfigError::InvalidValue {
                field: KEY_CHANGED_KEYS_TIME_WINDOW_SIZE.to_string(),
                value: self.changed_keys_time_window_ms.to_string(),
                reason: "window size must be positive".to_string(),
            }
            .into());
        }

        if self.audit_log_queue_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: KEY_AUDIT_LOG_QUEUE_SIZE.to_string(),
                value: "0".to_string(),
                reason: "audit queue needs capacity".to_string(),
            }
            .into());
        }

        if self.audit_log_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: KEY_AUDIT_LOG_WORKERS.to_string(),
                value: "0".to_string(),
                reason: "at least one audit worker is required".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Refresh-after-write duration, when passive expiry is enabled.
    pub fn refresh_after_write(&self) -> Option<Duration> {
        if self.reload_cache_entries {
            Some(
                self.reload_cache_entries_time_unit
                    .to_duration(self.reload_cache_entries_timeout),
            )
        } else {
            None
        }
    }

    /// Upper bound on staleness before a forced full reconciliation.
    pub fn max_staleness(&self) -> Duration {
        self.tick_duration
            .saturating_mul(self.retry_count_until_full_refresh.max(1))
    }

    pub fn with_tick_duration(mut self, duration: Duration) -> Self {
        self.tick_duration = duration;
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count_until_full_refresh = retries;
        self
    }

    pub fn with_time_window_ms(mut self, window_ms: i64) -> Self {
        self.changed_keys_time_window_ms = window_ms;
        self
    }

    pub fn with_reload(mut self, timeout: u64, unit: TimeUnit) -> Self {
        self.reload_cache_entries = true;
        self.reload_cache_entries_timeout = timeout;
        self.reload_cache_entries_time_unit = unit;
        self
    }

    pub fn with_clone_data(mut self, enabled: bool) -> Self {
        self.clone_data_enabled = enabled;
        self
    }

    pub fn with_application_cache(mut self, enabled: bool) -> Self {
        self.application_cache_enabled = enabled;
        self
    }

    pub fn with_audit_queue(mut self, queue_size: usize, workers: usize) -> Self {
        self.audit_log_queue_size = queue_size;
        self.audit_log_workers = workers;
        self
    }

    pub fn with_user_name(mut self, user_name: impl Into<String>) -> Self {
        self.audit_user_name = user_name.into();
        self
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> XconfResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse::<T>().map_err(|e| {
            ConfigError::InvalidValue {
                field: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }
            .into()
        }),
        None => Ok(default),
    }
}

fn toml_scalar(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        _ => None,
    }
}

/// Environment variable holding a configuration key.
pub fn env_var_name(key: &str) -> String {
    let mut name = String::from(ENV_PREFIX);
    for ch in key.chars() {
        if ch.is_ascii_uppercase() {
            name.push('_');
        }
        name.push(ch.to_ascii_uppercase());
    }
    name
}
