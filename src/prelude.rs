//! Convenient re-exports for common Turnstile types.
pub use crate::{
    load::{LoadProbe, StaticProbe, SystemProbe},
    telemetry::{MemorySink, SharedObserver, ThrottleEvent, ThrottleObserver},
    AdmissionError, CircuitState, ConfigError, IdentifyRequest, LogLevel, Rejection,
    RequestContext, RequestThrottler, ThrottleConfig, ThrottleDecision, ThrottleLayer,
    ThrottleReason, ThrottleStats,
};
