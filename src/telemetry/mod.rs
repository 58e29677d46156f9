//! Telemetry and observability for the throttle layer.
//!
//! Every admission decision, breaker transition, bucket fill level and registry
//! eviction is reported as a [`ThrottleEvent`] to a [`ThrottleObserver`].
//! Observers are for visibility only (logs, dashboards, mirroring state into an
//! external store); nothing they do feeds back into a decision.
//!
//! # Sinks
//!
//! - [`NullSink`]: discard everything (the default)
//! - [`LogSink`] / [`JsonLogSink`]: forward to `tracing`
//! - [`MemorySink`]: bounded in-memory buffer, handy in tests
//! - [`MulticastSink`]: fan out to two observers
//! - [`NonBlockingSink`]: hand events to an async `tower::Service` over a bounded channel

pub mod events;
pub mod sinks;

pub use events::{event_to_json, CircuitBreakerEvent, KeyScope, ThrottleEvent};
pub use sinks::{
    JsonLogSink, LogSink, MemorySink, MulticastSink, NonBlockingSink, NullSink, SharedObserver,
    ThrottleObserver,
};
