//! Events reported by buckets, breakers, registries and the decision log.

use crate::decision_log::DecisionRecord;
use serde_json::json;
use std::fmt;

/// Which registry a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScope {
    /// The single process-wide bucket.
    Global,
    /// A per-endpoint bucket.
    Endpoint,
    /// A per-user bucket.
    User,
    /// A per-endpoint circuit breaker.
    CircuitBreaker,
}

impl KeyScope {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            KeyScope::Global => "global",
            KeyScope::Endpoint => "endpoint",
            KeyScope::User => "user",
            KeyScope::CircuitBreaker => "circuit_breaker",
        }
    }
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by circuit breakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    /// Circuit transitioned to open state.
    Opened {
        /// Failure count at the moment the breaker opened
        failure_count: u32,
    },
    /// Circuit transitioned to half-open state.
    HalfOpen,
    /// Circuit transitioned to closed state.
    Closed,
}

/// Everything the throttle layer reports to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum ThrottleEvent {
    /// One admission decision.
    Decision(DecisionRecord),
    /// A breaker changed state.
    CircuitBreaker {
        /// Endpoint the breaker protects
        endpoint: String,
        /// The transition
        event: CircuitBreakerEvent,
    },
    /// Fill level of a bucket right after a consume attempt.
    BucketLevel {
        /// Registry the bucket lives in
        scope: KeyScope,
        /// Bucket key (endpoint name or user id; `"global"` for the global bucket)
        key: String,
        /// Tokens left
        tokens: f64,
        /// Bucket capacity
        capacity: f64,
    },
    /// A key was dropped from a registry to bound memory.
    KeyEvicted {
        /// Registry the key was dropped from
        scope: KeyScope,
        /// The evicted key
        key: String,
    },
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { failure_count } => {
                write!(f, "Opened(failures={})", failure_count)
            }
            CircuitBreakerEvent::HalfOpen => write!(f, "HalfOpen"),
            CircuitBreakerEvent::Closed => write!(f, "Closed"),
        }
    }
}

impl fmt::Display for ThrottleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleEvent::Decision(record) => match record.reason {
                Some(reason) => write!(
                    f,
                    "Decision::Denied(endpoint={}, reason={}, wait={:.3}s)",
                    record.endpoint.as_deref().unwrap_or("-"),
                    reason,
                    record.wait_time
                ),
                None => write!(
                    f,
                    "Decision::Allowed(endpoint={})",
                    record.endpoint.as_deref().unwrap_or("-")
                ),
            },
            ThrottleEvent::CircuitBreaker { endpoint, event } => {
                write!(f, "CircuitBreaker[{}]::{}", endpoint, event)
            }
            ThrottleEvent::BucketLevel { scope, key, tokens, capacity } => {
                write!(f, "Bucket[{}:{}]({:.2}/{:.0})", scope, key, tokens, capacity)
            }
            ThrottleEvent::KeyEvicted { scope, key } => write!(f, "Evicted[{}:{}]", scope, key),
        }
    }
}

/// Convert a ThrottleEvent into a JSON value for sinks.
pub fn event_to_json(event: &ThrottleEvent) -> serde_json::Value {
    match event {
        ThrottleEvent::Decision(record) => {
            let mut value = serde_json::to_value(record).unwrap_or_else(|e| {
                json!({ "serialization_error": e.to_string() })
            });
            if let Some(obj) = value.as_object_mut() {
                obj.insert("kind".into(), json!("decision"));
            }
            value
        }
        ThrottleEvent::CircuitBreaker { endpoint, event } => match event {
            CircuitBreakerEvent::Opened { failure_count } => json!({
                "kind": "circuit_opened",
                "endpoint": endpoint,
                "failures": *failure_count,
            }),
            CircuitBreakerEvent::HalfOpen => {
                json!({ "kind": "circuit_half_open", "endpoint": endpoint })
            }
            CircuitBreakerEvent::Closed => {
                json!({ "kind": "circuit_closed", "endpoint": endpoint })
            }
        },
        ThrottleEvent::BucketLevel { scope, key, tokens, capacity } => json!({
            "kind": "bucket_level",
            "scope": scope.as_str(),
            "key": key,
            "tokens": *tokens,
            "capacity": *capacity,
        }),
        ThrottleEvent::KeyEvicted { scope, key } => json!({
            "kind": "key_evicted",
            "scope": scope.as_str(),
            "key": key,
        }),
    }
}
