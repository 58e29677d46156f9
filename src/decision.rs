//! Admission decisions and the request identity they are made for.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Why a request was denied. Exactly one reason is reported per denial: the
/// first check that failed, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleReason {
    /// Host CPU or memory is above its threshold.
    SystemLoad,
    /// The process-wide bucket is empty.
    BurstLimit,
    /// The endpoint's own bucket is empty.
    EndpointOverload,
    /// The user's bucket is empty.
    UserAbuse,
    /// The endpoint's circuit breaker is open.
    CircuitBreaker,
}

impl ThrottleReason {
    /// All reasons, in evaluation order.
    pub const ALL: [ThrottleReason; 5] = [
        ThrottleReason::SystemLoad,
        ThrottleReason::BurstLimit,
        ThrottleReason::EndpointOverload,
        ThrottleReason::UserAbuse,
        ThrottleReason::CircuitBreaker,
    ];

    /// Stable snake_case name, as used on the wire and in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ThrottleReason::SystemLoad => "system_load",
            ThrottleReason::BurstLimit => "burst_limit",
            ThrottleReason::EndpointOverload => "endpoint_overload",
            ThrottleReason::UserAbuse => "user_abuse",
            ThrottleReason::CircuitBreaker => "circuit_breaker",
        }
    }

    /// Human-readable explanation for rejection bodies.
    pub fn message(self) -> &'static str {
        match self {
            ThrottleReason::SystemLoad => {
                "The server is under heavy load. Please retry after the suggested delay."
            }
            ThrottleReason::BurstLimit => {
                "Too many requests are being processed right now. Please slow down."
            }
            ThrottleReason::EndpointOverload => {
                "This endpoint is receiving too many requests. Please retry later."
            }
            ThrottleReason::UserAbuse => "You are sending requests too quickly. Please slow down.",
            ThrottleReason::CircuitBreaker => {
                "This endpoint is temporarily unavailable due to upstream failures."
            }
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            ThrottleReason::SystemLoad => 0,
            ThrottleReason::BurstLimit => 1,
            ThrottleReason::EndpointOverload => 2,
            ThrottleReason::UserAbuse => 3,
            ThrottleReason::CircuitBreaker => 4,
        }
    }
}

impl fmt::Display for ThrottleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThrottleDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Set exactly when `allowed` is false.
    pub reason: Option<ThrottleReason>,
    /// Suggested seconds to wait before retrying; zero when allowed.
    pub wait_time: f64,
}

impl ThrottleDecision {
    /// An admission.
    pub fn allow() -> Self {
        Self { allowed: true, reason: None, wait_time: 0.0 }
    }

    /// A denial with a retry hint. Negative or non-finite hints are clamped to zero.
    pub fn deny(reason: ThrottleReason, wait_time: f64) -> Self {
        let wait_time = if wait_time.is_finite() { wait_time.max(0.0) } else { 0.0 };
        Self { allowed: false, reason: Some(reason), wait_time }
    }

    /// Inverse of `allowed`, matching the "should throttle" phrasing.
    pub fn is_throttled(&self) -> bool {
        !self.allowed
    }

    /// Retry hint as a `Duration`, saturating at `Duration::MAX` for hints
    /// too large to represent (a near-zero refill rate).
    pub fn wait_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.wait_time).unwrap_or(Duration::MAX)
    }
}

/// Identity and descriptive context for one inbound request.
///
/// Only `endpoint` and `user_id` influence the decision; the rest is carried
/// into decision logs depending on the configured verbosity tier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Endpoint name keying the endpoint bucket and circuit breaker.
    pub endpoint: Option<String>,
    /// User id keying the per-user bucket.
    pub user_id: Option<String>,
    /// Client address.
    pub remote_addr: Option<String>,
    /// Request method.
    pub method: Option<String>,
    /// Full request path.
    pub path: Option<String>,
    /// Client user agent.
    pub user_agent: Option<String>,
    /// Request headers as name/value pairs.
    pub headers: Vec<(String, String)>,
}

impl RequestContext {
    /// Context carrying only the identity used for the decision.
    pub fn new(endpoint: Option<&str>, user_id: Option<&str>) -> Self {
        Self {
            endpoint: endpoint.map(str::to_owned),
            user_id: user_id.map(str::to_owned),
            ..Self::default()
        }
    }

    /// Set the client address.
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Set the request method.
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Set the request path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set the user agent.
    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Append a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}
