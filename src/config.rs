//! Throttle configuration.
//!
//! Built once at startup, either explicitly (struct literal or
//! [`ThrottleConfig::builder`]) or from the environment with
//! [`ThrottleConfig::from_env`]. Explicit construction is validated and
//! returns [`ConfigError`]; environment loading never fails and falls back to
//! the default for any value it cannot use, logging a warning.

use crate::error::ConfigError;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const DEFAULT_BUCKET_SIZE: u32 = 100;
const DEFAULT_REFILL_RATE: f64 = 10.0;
const DEFAULT_CPU_THRESHOLD: f64 = 90.0;
const DEFAULT_MEMORY_THRESHOLD: f64 = 90.0;
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SYSTEM_LOAD_WAIT_SECS: f64 = 5.0;
const DEFAULT_LOAD_SAMPLE_INTERVAL_MILLIS: u64 = 1_000;
const DEFAULT_MAX_TRACKED_KEYS: usize = 10_000;
const DEFAULT_KEY_IDLE_TTL_SECS: u64 = 3_600;

/// Endpoint limits are budgets per this many seconds, spendable as a burst.
pub const ENDPOINT_LIMIT_WINDOW_SECS: f64 = 60.0;

/// Environment variable names read by [`ThrottleConfig::from_env`].
pub mod env_keys {
    /// Global bucket capacity.
    pub const BUCKET_SIZE: &str = "THROTTLE_BUCKET_SIZE";
    /// Global refill rate, tokens per second.
    pub const REFILL_RATE: &str = "THROTTLE_REFILL_RATE";
    /// Per-user bucket capacity.
    pub const USER_BUCKET_SIZE: &str = "THROTTLE_USER_BUCKET_SIZE";
    /// Per-user refill rate.
    pub const USER_REFILL_RATE: &str = "THROTTLE_USER_REFILL_RATE";
    /// CPU percentage above which requests are shed.
    pub const CPU_THRESHOLD: &str = "THROTTLE_CPU_THRESHOLD";
    /// Memory percentage above which requests are shed.
    pub const MEMORY_THRESHOLD: &str = "THROTTLE_MEMORY_THRESHOLD";
    /// Failures that open a breaker.
    pub const FAILURE_THRESHOLD: &str = "THROTTLE_FAILURE_THRESHOLD";
    /// Seconds a breaker stays open.
    pub const TIMEOUT_SECONDS: &str = "THROTTLE_TIMEOUT_SECONDS";
    /// JSON object of endpoint → limit.
    pub const ENDPOINT_LIMITS: &str = "THROTTLE_ENDPOINT_LIMITS";
    /// Verbosity tier name.
    pub const LOG_LEVEL: &str = "THROTTLE_LOG_LEVEL";
    /// Master switch for decision logging.
    pub const LOGGING_ENABLED: &str = "THROTTLE_LOGGING_ENABLED";
    /// Suppress records for admitted requests.
    pub const LOG_BLOCKED_ONLY: &str = "THROTTLE_LOG_BLOCKED_ONLY";
    /// Retry hint for load shedding, seconds.
    pub const SYSTEM_LOAD_WAIT_SECONDS: &str = "THROTTLE_SYSTEM_LOAD_WAIT_SECONDS";
    /// Upper bound on tracked keys per registry.
    pub const MAX_TRACKED_KEYS: &str = "THROTTLE_MAX_TRACKED_KEYS";
    /// Seconds after which an untouched key may be evicted.
    pub const KEY_IDLE_TTL_SECONDS: &str = "THROTTLE_KEY_IDLE_TTL_SECONDS";
}

/// How much request context accompanies each decision record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Decision, reason, wait time, endpoint and user.
    Minimal,
    /// Adds remote address and method.
    #[default]
    Standard,
    /// Adds path and user agent.
    Detailed,
    /// Adds request headers, with credentials redacted.
    Verbose,
    /// Adds the fill level of every bucket consulted and the breaker state.
    Trace,
}

impl LogLevel {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Minimal => "minimal",
            LogLevel::Standard => "standard",
            LogLevel::Detailed => "detailed",
            LogLevel::Verbose => "verbose",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minimal" => Ok(LogLevel::Minimal),
            "standard" => Ok(LogLevel::Standard),
            "detailed" => Ok(LogLevel::Detailed),
            "verbose" => Ok(LogLevel::Verbose),
            "trace" => Ok(LogLevel::Trace),
            other => Err(ConfigError::UnknownLogLevel(other.to_string())),
        }
    }
}

/// Throttle configuration, read-only once the throttler is built.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleConfig {
    /// Capacity of the global bucket.
    pub bucket_size: u32,
    /// Refill rate of the global bucket, tokens per second.
    pub refill_rate: f64,
    /// Capacity of each per-user bucket.
    pub user_bucket_size: u32,
    /// Refill rate of each per-user bucket.
    pub user_refill_rate: f64,
    /// CPU percentage above which requests are shed.
    pub cpu_threshold: f64,
    /// Memory percentage above which requests are shed.
    pub memory_threshold: f64,
    /// Consecutive failures that open an endpoint's breaker.
    pub failure_threshold: u32,
    /// Seconds a breaker stays open after its last failure.
    pub timeout_seconds: u64,
    /// Per-endpoint request budgets per [`ENDPOINT_LIMIT_WINDOW_SECS`].
    pub endpoint_limits: HashMap<String, u32>,
    /// Decision record verbosity.
    pub log_level: LogLevel,
    /// Master switch for decision records.
    pub logging_enabled: bool,
    /// Only record denials.
    pub log_blocked_only: bool,
    /// Retry hint returned with `system_load` denials.
    pub system_load_wait: Duration,
    /// Minimum time between two host load probes.
    pub load_sample_interval: Duration,
    /// Upper bound on keys held by each registry.
    pub max_tracked_keys: usize,
    /// Keys untouched for this long are evicted first when a registry is full.
    pub key_idle_ttl: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            refill_rate: DEFAULT_REFILL_RATE,
            user_bucket_size: DEFAULT_BUCKET_SIZE,
            user_refill_rate: DEFAULT_REFILL_RATE,
            cpu_threshold: DEFAULT_CPU_THRESHOLD,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            endpoint_limits: HashMap::new(),
            log_level: LogLevel::default(),
            logging_enabled: true,
            log_blocked_only: false,
            system_load_wait: Duration::from_secs_f64(DEFAULT_SYSTEM_LOAD_WAIT_SECS),
            load_sample_interval: Duration::from_millis(DEFAULT_LOAD_SAMPLE_INTERVAL_MILLIS),
            max_tracked_keys: DEFAULT_MAX_TRACKED_KEYS,
            key_idle_ttl: Duration::from_secs(DEFAULT_KEY_IDLE_TTL_SECS),
        }
    }
}

impl ThrottleConfig {
    /// Start a validated builder from the defaults.
    pub fn builder() -> ThrottleConfigBuilder {
        ThrottleConfigBuilder { config: Self::default() }
    }

    /// Check every field; used by the builder and by the throttler constructor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_bucket(self.bucket_size, self.refill_rate)?;
        check_bucket(self.user_bucket_size, self.user_refill_rate)?;
        check_percentage("cpu_threshold", self.cpu_threshold)?;
        check_percentage("memory_threshold", self.memory_threshold)?;
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold { provided: 0 });
        }
        if self.timeout_seconds == 0 {
            return Err(ConfigError::InvalidTimeout { provided: 0 });
        }
        if let Some((endpoint, _)) = self.endpoint_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(ConfigError::InvalidEndpointLimit { endpoint: endpoint.clone() });
        }
        if self.max_tracked_keys == 0 {
            return Err(ConfigError::InvalidRegistryCapacity);
        }
        Ok(())
    }

    /// Configured limit for `endpoint`, if any.
    pub fn endpoint_limit(&self, endpoint: &str) -> Option<u32> {
        self.endpoint_limits.get(endpoint).copied()
    }

    /// Refill rate used for an endpoint bucket with the given limit.
    pub fn endpoint_refill_rate(limit: u32) -> f64 {
        f64::from(limit) / ENDPOINT_LIMIT_WINDOW_SECS
    }

    /// Load from process environment variables (see [`env_keys`]).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unset keys keep their defaults;
    /// unusable values keep their defaults and log a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let positive = |v: &f64| v.is_finite() && *v > 0.0;
        let percentage = |v: &f64| v.is_finite() && (0.0..=100.0).contains(v);

        let config = Self {
            bucket_size: parse_or(&lookup, env_keys::BUCKET_SIZE, d.bucket_size, |v| *v >= 1),
            refill_rate: parse_or(&lookup, env_keys::REFILL_RATE, d.refill_rate, positive),
            user_bucket_size: 0,
            user_refill_rate: 0.0,
            cpu_threshold: parse_or(&lookup, env_keys::CPU_THRESHOLD, d.cpu_threshold, percentage),
            memory_threshold: parse_or(
                &lookup,
                env_keys::MEMORY_THRESHOLD,
                d.memory_threshold,
                percentage,
            ),
            failure_threshold: parse_or(
                &lookup,
                env_keys::FAILURE_THRESHOLD,
                d.failure_threshold,
                |v| *v >= 1,
            ),
            timeout_seconds: parse_or(&lookup, env_keys::TIMEOUT_SECONDS, d.timeout_seconds, |v| {
                *v >= 1
            }),
            endpoint_limits: lookup(env_keys::ENDPOINT_LIMITS)
                .map(|raw| parse_endpoint_limits(&raw))
                .unwrap_or_default(),
            log_level: lookup(env_keys::LOG_LEVEL)
                .and_then(|raw| match raw.parse() {
                    Ok(level) => Some(level),
                    Err(e) => {
                        warn!(target: "turnstile::config", error = %e, "ignoring {}", env_keys::LOG_LEVEL);
                        None
                    }
                })
                .unwrap_or(d.log_level),
            logging_enabled: parse_flag(&lookup, env_keys::LOGGING_ENABLED, d.logging_enabled),
            log_blocked_only: parse_flag(&lookup, env_keys::LOG_BLOCKED_ONLY, d.log_blocked_only),
            system_load_wait: Duration::from_secs_f64(parse_or(
                &lookup,
                env_keys::SYSTEM_LOAD_WAIT_SECONDS,
                d.system_load_wait.as_secs_f64(),
                |v: &f64| v.is_finite() && *v >= 0.0 && *v <= 86_400.0,
            )),
            load_sample_interval: d.load_sample_interval,
            max_tracked_keys: parse_or(&lookup, env_keys::MAX_TRACKED_KEYS, d.max_tracked_keys, |v| {
                *v >= 1
            }),
            key_idle_ttl: Duration::from_secs(parse_or(
                &lookup,
                env_keys::KEY_IDLE_TTL_SECONDS,
                d.key_idle_ttl.as_secs(),
                |v| *v >= 1,
            )),
        };

        // User buckets default to the (possibly overridden) global parameters.
        Self {
            user_bucket_size: parse_or(
                &lookup,
                env_keys::USER_BUCKET_SIZE,
                config.bucket_size,
                |v| *v >= 1,
            ),
            user_refill_rate: parse_or(
                &lookup,
                env_keys::USER_REFILL_RATE,
                config.refill_rate,
                positive,
            ),
            ..config
        }
    }
}

/// Builder producing a validated [`ThrottleConfig`].
#[derive(Debug, Clone)]
pub struct ThrottleConfigBuilder {
    config: ThrottleConfig,
}

impl ThrottleConfigBuilder {
    /// Global bucket capacity and refill rate. User buckets follow unless set separately.
    pub fn global_bucket(mut self, bucket_size: u32, refill_rate: f64) -> Self {
        self.config.bucket_size = bucket_size;
        self.config.refill_rate = refill_rate;
        self.config.user_bucket_size = bucket_size;
        self.config.user_refill_rate = refill_rate;
        self
    }

    /// Per-user bucket capacity and refill rate.
    pub fn user_bucket(mut self, bucket_size: u32, refill_rate: f64) -> Self {
        self.config.user_bucket_size = bucket_size;
        self.config.user_refill_rate = refill_rate;
        self
    }

    /// Host load thresholds, in percent.
    pub fn load_thresholds(mut self, cpu: f64, memory: f64) -> Self {
        self.config.cpu_threshold = cpu;
        self.config.memory_threshold = memory;
        self
    }

    /// Breaker failure threshold and open timeout.
    pub fn circuit_breaker(mut self, failure_threshold: u32, timeout_seconds: u64) -> Self {
        self.config.failure_threshold = failure_threshold;
        self.config.timeout_seconds = timeout_seconds;
        self
    }

    /// Add a per-endpoint limit.
    pub fn endpoint_limit(mut self, endpoint: impl Into<String>, limit: u32) -> Self {
        self.config.endpoint_limits.insert(endpoint.into(), limit);
        self
    }

    /// Decision record verbosity.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// Decision logging toggles.
    pub fn logging(mut self, enabled: bool, blocked_only: bool) -> Self {
        self.config.logging_enabled = enabled;
        self.config.log_blocked_only = blocked_only;
        self
    }

    /// Retry hint returned with load-shedding denials.
    pub fn system_load_wait(mut self, wait: Duration) -> Self {
        self.config.system_load_wait = wait;
        self
    }

    /// Minimum time between two host load probes.
    pub fn load_sample_interval(mut self, interval: Duration) -> Self {
        self.config.load_sample_interval = interval;
        self
    }

    /// Registry bounds.
    pub fn key_eviction(mut self, max_tracked_keys: usize, idle_ttl: Duration) -> Self {
        self.config.max_tracked_keys = max_tracked_keys;
        self.config.key_idle_ttl = idle_ttl;
        self
    }

    /// Validate and return the config.
    pub fn build(self) -> Result<ThrottleConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn check_bucket(bucket_size: u32, refill_rate: f64) -> Result<(), ConfigError> {
    if bucket_size == 0 {
        return Err(ConfigError::InvalidBucketSize { provided: bucket_size });
    }
    if !refill_rate.is_finite() || refill_rate <= 0.0 {
        return Err(ConfigError::InvalidRefillRate { provided: refill_rate });
    }
    Ok(())
}

fn check_percentage(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return Err(ConfigError::InvalidThreshold { name, provided: value });
    }
    Ok(())
}

fn parse_or<T, F, V>(lookup: &F, key: &str, default: T, valid: V) -> T
where
    T: FromStr + fmt::Debug,
    F: Fn(&str) -> Option<String>,
    V: Fn(&T) -> bool,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        Ok(value) => {
            warn!(target: "turnstile::config", key, value = ?value, default = ?default, "out-of-range value; using default");
            default
        }
        Err(_) => {
            warn!(target: "turnstile::config", key, raw = %raw, default = ?default, "unparsable value; using default");
            default
        }
    }
}

fn parse_flag<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            warn!(target: "turnstile::config", key, raw = %raw, default, "unparsable flag; using default");
            default
        }
    }
}

/// Parse a JSON object of endpoint → limit. Never fails: malformed input
/// yields an empty map, unusable entries are skipped, each with a warning.
pub fn parse_endpoint_limits(raw: &str) -> HashMap<String, u32> {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(target: "turnstile::config", error = %e, "malformed {}; no endpoint limits applied", env_keys::ENDPOINT_LIMITS);
            return HashMap::new();
        }
    };
    let Some(object) = value.as_object() else {
        warn!(target: "turnstile::config", "{} must be a JSON object; no endpoint limits applied", env_keys::ENDPOINT_LIMITS);
        return HashMap::new();
    };
    object
        .iter()
        .filter_map(|(endpoint, limit)| {
            match limit.as_u64().and_then(|l| u32::try_from(l).ok()).filter(|l| *l >= 1) {
                Some(l) => Some((endpoint.clone(), l)),
                None => {
                    warn!(target: "turnstile::config", endpoint = %endpoint, limit = %limit, "skipping endpoint limit; expected a positive integer");
                    None
                }
            }
        })
        .collect()
}
