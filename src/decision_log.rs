//! Verbosity-tiered decision records.
//!
//! One [`DecisionRecord`] per admission decision. The field names never change
//! between tiers; lower tiers simply leave the optional context fields out.
//!
//! | tier     | adds                                  |
//! |----------|---------------------------------------|
//! | minimal  | allowed, reason, wait_time, endpoint, user_id |
//! | standard | remote_addr, method                   |
//! | detailed | path, user_agent                      |
//! | verbose  | headers (credentials redacted)        |
//! | trace    | bucket fill levels, breaker state     |

use crate::circuit_breaker::CircuitState;
use crate::config::{LogLevel, ThrottleConfig};
use crate::decision::{RequestContext, ThrottleDecision, ThrottleReason};
use crate::telemetry::{KeyScope, SharedObserver, ThrottleEvent};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

const REDACTED: &str = "[redacted]";
const SENSITIVE_HEADERS: [&str; 5] =
    ["authorization", "proxy-authorization", "cookie", "set-cookie", "x-api-key"];

/// Fill level of one bucket consulted for a decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketLevel {
    /// Registry the bucket lives in.
    pub scope: KeyScope,
    /// Bucket key.
    pub key: String,
    /// Tokens left after the decision.
    pub tokens: f64,
    /// Bucket capacity.
    pub capacity: f64,
}

/// Extra state captured only at the `trace` tier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceDetail {
    /// Buckets consulted, in evaluation order.
    pub buckets: Vec<BucketLevel>,
    /// Endpoint breaker state after the decision, if one was consulted.
    pub circuit_state: Option<CircuitState>,
}

/// One structured, JSON-serialisable decision record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecisionRecord {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Whether the request was admitted.
    pub allowed: bool,
    /// Denial reason; `null` for admissions.
    pub reason: Option<ThrottleReason>,
    /// Suggested retry delay in seconds.
    pub wait_time: f64,
    /// Endpoint, if known.
    pub endpoint: Option<String>,
    /// User id, if known.
    pub user_id: Option<String>,
    /// Client address (standard+).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    /// Request method (standard+).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Request path (detailed+).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// User agent (detailed+).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Request headers, credentials redacted (verbose+).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    /// Buckets consulted (trace).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buckets: Option<Vec<BucketLevel>>,
    /// Breaker state (trace).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_state: Option<CircuitState>,
}

impl DecisionRecord {
    /// Build the record for `decision`, including only what `level` allows.
    pub fn build(
        level: LogLevel,
        ctx: &RequestContext,
        decision: &ThrottleDecision,
        trace: Option<TraceDetail>,
    ) -> Self {
        let mut record = Self {
            timestamp_ms: now_millis(),
            allowed: decision.allowed,
            reason: decision.reason,
            wait_time: decision.wait_time,
            endpoint: ctx.endpoint.clone(),
            user_id: ctx.user_id.clone(),
            ..Self::default()
        };
        if level >= LogLevel::Standard {
            record.remote_addr = ctx.remote_addr.clone();
            record.method = ctx.method.clone();
        }
        if level >= LogLevel::Detailed {
            record.path = ctx.path.clone();
            record.user_agent = ctx.user_agent.clone();
        }
        if level >= LogLevel::Verbose {
            record.headers = Some(redact(&ctx.headers));
        }
        if level >= LogLevel::Trace {
            if let Some(trace) = trace {
                record.buckets = Some(trace.buckets);
                record.circuit_state = trace.circuit_state;
            }
        }
        record
    }
}

fn redact(headers: &[(String, String)]) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let name = name.to_ascii_lowercase();
            let value =
                if SENSITIVE_HEADERS.contains(&name.as_str()) { REDACTED.to_string() } else { value.clone() };
            (name, value)
        })
        .collect()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Emits decision records to `tracing` and the configured observer.
#[derive(Debug, Clone)]
pub struct DecisionLog {
    level: LogLevel,
    enabled: bool,
    blocked_only: bool,
    observer: SharedObserver,
}

impl DecisionLog {
    /// Build from the throttle config's logging settings.
    pub fn from_config(config: &ThrottleConfig, observer: SharedObserver) -> Self {
        Self {
            level: config.log_level,
            enabled: config.logging_enabled,
            blocked_only: config.log_blocked_only,
            observer,
        }
    }

    /// Configured verbosity tier.
    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// Whether a record will be produced for this decision.
    pub fn wants(&self, decision: &ThrottleDecision) -> bool {
        self.enabled && (decision.is_throttled() || !self.blocked_only)
    }

    /// Whether any decision could carry [`TraceDetail`].
    pub fn traces(&self) -> bool {
        self.enabled && self.level >= LogLevel::Trace
    }

    /// Whether callers should gather [`TraceDetail`] for this decision.
    pub fn wants_trace(&self, decision: &ThrottleDecision) -> bool {
        self.level >= LogLevel::Trace && self.wants(decision)
    }

    /// Record one decision. Never fails and never alters the decision.
    pub fn record(
        &self,
        ctx: &RequestContext,
        decision: &ThrottleDecision,
        trace: Option<TraceDetail>,
    ) {
        if !self.wants(decision) {
            return;
        }
        let record = DecisionRecord::build(self.level, ctx, decision, trace);
        let endpoint = record.endpoint.as_deref().unwrap_or("-");
        match serde_json::to_string(&record) {
            Ok(json) => match record.reason {
                Some(reason) => tracing::warn!(
                    target: "turnstile::decision",
                    allowed = false,
                    reason = %reason,
                    endpoint,
                    wait_time = record.wait_time,
                    record = %json,
                    "request throttled"
                ),
                None => tracing::info!(
                    target: "turnstile::decision",
                    allowed = true,
                    endpoint,
                    record = %json,
                    "request allowed"
                ),
            },
            Err(e) => tracing::debug!(
                target: "turnstile::decision",
                error = %e,
                allowed = record.allowed,
                endpoint,
                "decision record could not be serialised"
            ),
        }
        if self.observer.is_enabled() {
            self.observer.observe(&ThrottleEvent::Decision(record));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemorySink;
    use std::sync::Arc;

    fn ctx() -> RequestContext {
        RequestContext::new(Some("/search"), Some("u1"))
            .with_remote_addr("10.0.0.7")
            .with_method("GET")
            .with_path("/search?q=rust")
            .with_user_agent("curl/8.0")
            .with_header("Authorization", "Bearer secret")
            .with_header("Accept", "application/json")
    }

    fn trace() -> TraceDetail {
        TraceDetail {
            buckets: vec![BucketLevel {
                scope: KeyScope::Global,
                key: "global".into(),
                tokens: 4.0,
                capacity: 5.0,
            }],
            circuit_state: Some(CircuitState::Closed),
        }
    }

    fn denied() -> ThrottleDecision {
        ThrottleDecision::deny(ThrottleReason::BurstLimit, 1.0)
    }

    #[test]
    fn minimal_tier_keeps_only_core_fields() {
        let record = DecisionRecord::build(LogLevel::Minimal, &ctx(), &denied(), Some(trace()));
        let v = serde_json::to_value(&record).unwrap();
        let keys: Vec<&str> = v.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["allowed", "endpoint", "reason", "timestamp_ms", "user_id", "wait_time"]
        );
        assert_eq!(v["reason"], "burst_limit");
    }

    #[test]
    fn tiers_are_cumulative_and_names_stable() {
        let standard = DecisionRecord::build(LogLevel::Standard, &ctx(), &denied(), None);
        assert_eq!(standard.method.as_deref(), Some("GET"));
        assert!(standard.path.is_none());

        let detailed = DecisionRecord::build(LogLevel::Detailed, &ctx(), &denied(), None);
        assert_eq!(detailed.user_agent.as_deref(), Some("curl/8.0"));
        assert!(detailed.headers.is_none());

        let verbose = DecisionRecord::build(LogLevel::Verbose, &ctx(), &denied(), Some(trace()));
        let headers = verbose.headers.as_ref().unwrap();
        assert_eq!(headers.get("authorization").map(String::as_str), Some(REDACTED));
        assert_eq!(headers.get("accept").map(String::as_str), Some("application/json"));
        assert!(verbose.buckets.is_none());

        let traced = DecisionRecord::build(LogLevel::Trace, &ctx(), &denied(), Some(trace()));
        assert_eq!(traced.circuit_state, Some(CircuitState::Closed));
        assert_eq!(traced.buckets.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn allowed_record_serialises_null_reason() {
        let record = DecisionRecord::build(LogLevel::Minimal, &ctx(), &ThrottleDecision::allow(), None);
        let v = serde_json::to_value(&record).unwrap();
        assert!(v["reason"].is_null());
        assert_eq!(v["allowed"], true);
    }

    fn log(config: ThrottleConfig) -> (DecisionLog, MemorySink) {
        let sink = MemorySink::new();
        (DecisionLog::from_config(&config, Arc::new(sink.clone())), sink)
    }

    #[test]
    fn blocked_only_suppresses_admissions() {
        let config = ThrottleConfig { log_blocked_only: true, ..ThrottleConfig::default() };
        let (log, sink) = log(config);
        log.record(&ctx(), &ThrottleDecision::allow(), None);
        assert!(sink.is_empty());
        log.record(&ctx(), &denied(), None);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn disabled_logging_records_nothing() {
        let config = ThrottleConfig { logging_enabled: false, ..ThrottleConfig::default() };
        let (log, sink) = log(config);
        log.record(&ctx(), &denied(), None);
        assert!(sink.is_empty());
        assert!(!log.wants_trace(&denied()));
    }

    #[test]
    fn trace_detail_requested_only_at_trace_tier() {
        let (standard, _) = log(ThrottleConfig::default());
        assert!(!standard.wants_trace(&denied()));
        let config = ThrottleConfig { log_level: LogLevel::Trace, ..ThrottleConfig::default() };
        let (trace_log, _) = log(config);
        assert!(trace_log.wants_trace(&denied()));
    }
}
