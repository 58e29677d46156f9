//! Error types for the throttle layer.
//!
//! Denials are not errors: they come back as a [`ThrottleDecision`](crate::ThrottleDecision).
//! The types here cover invalid explicit configuration, administrative misuse,
//! and the middleware's rejection path.

use crate::middleware::Rejection;
use thiserror::Error;

/// Validation failures for explicitly constructed configuration.
///
/// Environment loading never returns these; it falls back to defaults instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Bucket capacity must be at least one token.
    #[error("bucket_size must be >= 1 (got {provided})")]
    InvalidBucketSize {
        /// Value provided by caller.
        provided: u32,
    },
    /// Refill rate must be finite and strictly positive.
    #[error("refill_rate must be finite and > 0 (got {provided})")]
    InvalidRefillRate {
        /// Value provided by caller.
        provided: f64,
    },
    /// Load thresholds are percentages.
    #[error("{name} must be within 0..=100 (got {provided})")]
    InvalidThreshold {
        /// Which threshold was rejected.
        name: &'static str,
        /// Value provided by caller.
        provided: f64,
    },
    /// Breakers need at least one failure to trip.
    #[error("failure_threshold must be >= 1 (got {provided})")]
    InvalidFailureThreshold {
        /// Value provided by caller.
        provided: u32,
    },
    /// Breakers need a non-zero cool-down.
    #[error("timeout_seconds must be >= 1 (got {provided})")]
    InvalidTimeout {
        /// Value provided by caller.
        provided: u64,
    },
    /// A per-endpoint limit of zero would deny every request.
    #[error("endpoint limit for '{endpoint}' must be >= 1")]
    InvalidEndpointLimit {
        /// Endpoint carrying the bad limit.
        endpoint: String,
    },
    /// Registries must be able to hold at least one key.
    #[error("max_tracked_keys must be >= 1")]
    InvalidRegistryCapacity,
    /// Unknown verbosity tier name.
    #[error("unknown log level '{0}' (expected minimal, standard, detailed, verbose or trace)")]
    UnknownLogLevel(String),
}

/// Runtime misuse of the throttler's administrative surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThrottleError {
    /// No breaker has been created for this endpoint.
    #[error("no circuit breaker tracked for endpoint '{endpoint}'")]
    UnknownCircuit {
        /// Endpoint that was looked up.
        endpoint: String,
    },
}

/// Error returned by [`ThrottleService`](crate::middleware::ThrottleService).
#[derive(Debug, Clone, Error)]
pub enum AdmissionError<E> {
    /// The request was not admitted; the inner service never ran.
    #[error("request throttled ({}), retry after {}s", .0.reason(), .0.retry_after())]
    Throttled(Rejection),
    /// The inner service ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> AdmissionError<E> {
    /// Check if the request was throttled.
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled(_))
    }

    /// Borrow the rejection if the request was throttled.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Throttled(r) => Some(r),
            Self::Inner(_) => None,
        }
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Throttled(_) => None,
        }
    }
}
