#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Turnstile
//!
//! Synchronous admission control for request-serving backends: token buckets
//! at global, endpoint and user scope, per-endpoint circuit breakers, and
//! host-load shedding, composed into one admit/deny decision with a retry hint.
//!
//! ## Features
//!
//! - **Token buckets** with lazy refill and no background timers
//! - **Circuit breakers** with half-open recovery, one per endpoint
//! - **Load shedding** on CPU or memory pressure (`system-load` feature)
//! - **Deterministic reasons**: load, burst, endpoint, user, breaker, in that order
//! - **Tiered decision records** through `tracing` and pluggable observers
//! - **Tower middleware** returning a 429-style [`Rejection`]
//!
//! ## Quick Start
//!
//! ```rust
//! use turnstile::{RequestThrottler, ThrottleConfig, ThrottleReason};
//! use turnstile::load::StaticProbe;
//! use std::sync::Arc;
//!
//! let config = ThrottleConfig::builder()
//!     .global_bucket(100, 10.0)
//!     .endpoint_limit("/expensive", 2)
//!     .build()
//!     .unwrap();
//! let throttler = RequestThrottler::builder(config)
//!     .probe(Arc::new(StaticProbe::new(20.0, 40.0)))
//!     .build()
//!     .unwrap();
//!
//! for _ in 0..2 {
//!     let decision = throttler.should_throttle_request(Some("/expensive"), Some("alice"));
//!     assert!(decision.allowed);
//!     throttler.record_request_result("/expensive", true);
//! }
//! let third = throttler.should_throttle_request(Some("/expensive"), Some("alice"));
//! assert_eq!(third.reason, Some(ThrottleReason::EndpointOverload));
//! ```

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod decision;
pub mod decision_log;
pub mod error;
pub mod load;
pub mod middleware;
pub mod prelude;
pub mod registry;
pub mod stats;
pub mod telemetry;
pub mod throttler;
pub mod token_bucket;

// Re-exports
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock};
pub use config::{LogLevel, ThrottleConfig, ThrottleConfigBuilder};
pub use decision::{RequestContext, ThrottleDecision, ThrottleReason};
pub use decision_log::{DecisionLog, DecisionRecord};
pub use error::{AdmissionError, ConfigError, ThrottleError};
pub use middleware::{IdentifyRequest, Rejection, RejectionBody, ThrottleLayer, ThrottleService};
pub use stats::{BucketSnapshot, DecisionCounts, ThrottleStats};
pub use throttler::{RequestThrottler, ThrottlerBuilder};
pub use token_bucket::TokenBucket;
