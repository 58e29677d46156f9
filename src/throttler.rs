//! Request admission: load, global bucket, endpoint bucket, user bucket and
//! circuit breaker, evaluated in that order.
//!
//! The first failing check decides the reason; later checks are skipped.
//! Tokens taken by checks that passed before a later denial are not returned.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::clock::{default_clock, SharedClock};
use crate::config::ThrottleConfig;
use crate::decision::{RequestContext, ThrottleDecision, ThrottleReason};
use crate::decision_log::{BucketLevel, DecisionLog, TraceDetail};
use crate::error::{ConfigError, ThrottleError};
use crate::load::{LoadMonitor, LoadProbe, SystemProbe};
use crate::registry::{KeyedRegistry, Reclaim};
use crate::stats::{BucketSnapshot, DecisionCounters, ThrottleStats};
use crate::telemetry::{KeyScope, NullSink, SharedObserver, ThrottleEvent};
use crate::token_bucket::TokenBucket;
use std::sync::Arc;

const GLOBAL_KEY: &str = "global";

/// Shared admission controller. Build once, wrap in `Arc`, call from any thread.
///
/// # Examples
/// ```
/// use turnstile::{RequestThrottler, ThrottleConfig, ThrottleReason};
/// use turnstile::load::StaticProbe;
/// use std::sync::Arc;
///
/// let config = ThrottleConfig::builder().global_bucket(2, 1.0).build().unwrap();
/// let throttler = RequestThrottler::builder(config)
///     .probe(Arc::new(StaticProbe::unavailable()))
///     .build()
///     .unwrap();
///
/// assert!(throttler.should_throttle_request(Some("/search"), None).allowed);
/// assert!(throttler.should_throttle_request(Some("/search"), None).allowed);
/// let third = throttler.should_throttle_request(Some("/search"), None);
/// assert_eq!(third.reason, Some(ThrottleReason::BurstLimit));
/// ```
#[derive(Debug)]
pub struct RequestThrottler {
    config: ThrottleConfig,
    breaker_config: CircuitBreakerConfig,
    clock: SharedClock,
    observer: SharedObserver,
    global: TokenBucket,
    endpoint_buckets: KeyedRegistry<TokenBucket>,
    user_buckets: KeyedRegistry<TokenBucket>,
    breakers: KeyedRegistry<CircuitBreaker>,
    load: LoadMonitor,
    log: DecisionLog,
    counters: DecisionCounters,
}

/// Builder for [`RequestThrottler`] with optional clock, probe and observer.
#[derive(Debug)]
pub struct ThrottlerBuilder {
    config: ThrottleConfig,
    clock: Option<SharedClock>,
    probe: Option<Arc<dyn LoadProbe>>,
    observer: Option<SharedObserver>,
}

impl ThrottlerBuilder {
    /// Time source for buckets, breakers and load caching.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Host load source. Defaults to [`SystemProbe`].
    pub fn probe(mut self, probe: Arc<dyn LoadProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Receiver of decisions, breaker transitions, bucket levels and evictions.
    pub fn observer(mut self, observer: SharedObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Validate the config and assemble the throttler.
    pub fn build(self) -> Result<RequestThrottler, ConfigError> {
        let config = self.config;
        config.validate()?;
        let breaker_config =
            CircuitBreakerConfig::new(config.failure_threshold, config.timeout_seconds)?;
        let clock = self.clock.unwrap_or_else(default_clock);
        let observer = self.observer.unwrap_or_else(|| Arc::new(NullSink));
        let probe = self.probe.unwrap_or_else(|| Arc::new(SystemProbe::new()));

        let global = TokenBucket::with_clock(config.bucket_size, config.refill_rate, clock.clone())?;
        let endpoint_buckets = registry(KeyScope::Endpoint, &config, &clock, &observer);
        let user_buckets = registry(KeyScope::User, &config, &clock, &observer);
        let breakers = registry(KeyScope::CircuitBreaker, &config, &clock, &observer);
        let load = LoadMonitor::new(
            probe,
            config.cpu_threshold,
            config.memory_threshold,
            config.load_sample_interval,
            clock.clone(),
        );
        let log = DecisionLog::from_config(&config, observer.clone());

        tracing::debug!(
            target: "turnstile::config",
            bucket_size = config.bucket_size,
            refill_rate = config.refill_rate,
            endpoints = config.endpoint_limits.len(),
            log_level = %config.log_level,
            "request throttler initialised"
        );

        Ok(RequestThrottler {
            config,
            breaker_config,
            clock,
            observer,
            global,
            endpoint_buckets,
            user_buckets,
            breakers,
            load,
            log,
            counters: DecisionCounters::default(),
        })
    }
}

fn registry<T: Reclaim>(
    scope: KeyScope,
    config: &ThrottleConfig,
    clock: &SharedClock,
    observer: &SharedObserver,
) -> KeyedRegistry<T> {
    KeyedRegistry::new(
        scope,
        config.max_tracked_keys,
        config.key_idle_ttl,
        clock.clone(),
        observer.clone(),
    )
}

impl RequestThrottler {
    /// Throttler with the system clock, the host load probe and no observer.
    pub fn new(config: ThrottleConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    /// Start a builder for `config`.
    pub fn builder(config: ThrottleConfig) -> ThrottlerBuilder {
        ThrottlerBuilder { config, clock: None, probe: None, observer: None }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Decide whether a request for `endpoint` from `user_id` should be throttled.
    pub fn should_throttle_request(
        &self,
        endpoint: Option<&str>,
        user_id: Option<&str>,
    ) -> ThrottleDecision {
        self.check(&RequestContext::new(endpoint, user_id))
    }

    /// Decide for a full request context. Only `endpoint` and `user_id` affect
    /// the outcome; the rest feeds the decision record.
    pub fn check(&self, ctx: &RequestContext) -> ThrottleDecision {
        let mut levels = Vec::new();
        let decision = self.evaluate(ctx.endpoint.as_deref(), ctx.user_id.as_deref(), &mut levels);
        self.counters.record(&decision);

        let trace = self.log.wants_trace(&decision).then(|| TraceDetail {
            buckets: levels,
            circuit_state: ctx.endpoint.as_deref().and_then(|e| self.circuit_state(e)),
        });
        self.log.record(ctx, &decision, trace);
        decision
    }

    /// Report the outcome of an admitted request to the endpoint's breaker.
    pub fn record_request_result(&self, endpoint: &str, success: bool) {
        let breaker = self.breaker(endpoint);
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
    }

    /// Read-only snapshot of buckets, breakers, load and counters.
    pub fn get_throttle_stats(&self) -> ThrottleStats {
        ThrottleStats {
            global_bucket: BucketSnapshot::of(&self.global),
            endpoint_buckets: self.endpoint_buckets.snapshot(BucketSnapshot::of),
            tracked_users: self.user_buckets.len(),
            user_buckets: self.user_buckets.snapshot(BucketSnapshot::of),
            circuit_breakers: self.breakers.snapshot(CircuitBreaker::snapshot),
            system_load: self.load.last_sample(),
            decisions: self.counters.snapshot(),
        }
    }

    /// Force an endpoint's breaker closed.
    pub fn reset_circuit_breaker(&self, endpoint: &str) -> Result<(), ThrottleError> {
        let breaker = self
            .breakers
            .get(endpoint)
            .ok_or_else(|| ThrottleError::UnknownCircuit { endpoint: endpoint.to_string() })?;
        breaker.reset();
        Ok(())
    }

    /// Current breaker state for `endpoint`, if a breaker exists.
    pub fn circuit_state(&self, endpoint: &str) -> Option<CircuitState> {
        self.breakers.get(endpoint).map(|b| b.state())
    }

    fn evaluate(
        &self,
        endpoint: Option<&str>,
        user_id: Option<&str>,
        levels: &mut Vec<BucketLevel>,
    ) -> ThrottleDecision {
        if let Some(reason) = self.load.system_overloaded() {
            return ThrottleDecision::deny(reason, self.config.system_load_wait.as_secs_f64());
        }

        if !self.take(KeyScope::Global, GLOBAL_KEY, &self.global, levels) {
            return ThrottleDecision::deny(ThrottleReason::BurstLimit, self.global.get_wait_time(1));
        }

        if let Some(endpoint) = endpoint {
            if let Some(limit) = self.config.endpoint_limit(endpoint) {
                let bucket = self.endpoint_buckets.get_or_insert_with(endpoint, || {
                    TokenBucket::from_validated(
                        limit,
                        ThrottleConfig::endpoint_refill_rate(limit),
                        self.clock.clone(),
                    )
                });
                if !self.take(KeyScope::Endpoint, endpoint, &bucket, levels) {
                    return ThrottleDecision::deny(
                        ThrottleReason::EndpointOverload,
                        bucket.get_wait_time(1),
                    );
                }
            }
        }

        if let Some(user_id) = user_id {
            let bucket = self.user_buckets.get_or_insert_with(user_id, || {
                TokenBucket::from_validated(
                    self.config.user_bucket_size,
                    self.config.user_refill_rate,
                    self.clock.clone(),
                )
            });
            if !self.take(KeyScope::User, user_id, &bucket, levels) {
                return ThrottleDecision::deny(ThrottleReason::UserAbuse, bucket.get_wait_time(1));
            }
        }

        if let Some(endpoint) = endpoint {
            let breaker = self.breaker(endpoint);
            if !breaker.should_allow_request() {
                return ThrottleDecision::deny(
                    ThrottleReason::CircuitBreaker,
                    breaker.remaining_open_time(),
                );
            }
        }

        ThrottleDecision::allow()
    }

    fn take(
        &self,
        scope: KeyScope,
        key: &str,
        bucket: &TokenBucket,
        levels: &mut Vec<BucketLevel>,
    ) -> bool {
        let admitted = bucket.consume(1);
        let observed = self.observer.is_enabled();
        let traced = self.log.traces();
        if !observed && !traced {
            return admitted;
        }
        let level = BucketLevel {
            scope,
            key: key.to_string(),
            tokens: bucket.available_tokens(),
            capacity: bucket.capacity(),
        };
        if observed {
            self.observer.observe(&ThrottleEvent::BucketLevel {
                scope,
                key: level.key.clone(),
                tokens: level.tokens,
                capacity: level.capacity,
            });
        }
        if traced {
            levels.push(level);
        }
        admitted
    }

    fn breaker(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        self.breakers.get_or_insert_with(endpoint, || {
            CircuitBreaker::with_parts(
                endpoint,
                self.breaker_config,
                self.clock.clone(),
                self.observer.clone(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::load::StaticProbe;
    use crate::telemetry::MemorySink;
    use std::time::Duration;

    struct Harness {
        throttler: RequestThrottler,
        clock: ManualClock,
        probe: StaticProbe,
        sink: MemorySink,
    }

    fn harness(config: ThrottleConfig) -> Harness {
        let clock = ManualClock::new();
        let probe = StaticProbe::new(10.0, 10.0);
        let sink = MemorySink::with_capacity(10_000);
        let throttler = RequestThrottler::builder(config)
            .clock(Arc::new(clock.clone()))
            .probe(Arc::new(probe.clone()))
            .observer(Arc::new(sink.clone()))
            .build()
            .unwrap();
        Harness { throttler, clock, probe, sink }
    }

    fn config() -> crate::config::ThrottleConfigBuilder {
        ThrottleConfig::builder().load_sample_interval(Duration::ZERO)
    }

    #[test]
    fn rejects_invalid_config() {
        let config = ThrottleConfig { bucket_size: 0, ..ThrottleConfig::default() };
        assert_eq!(
            RequestThrottler::new(config).unwrap_err(),
            ConfigError::InvalidBucketSize { provided: 0 }
        );
    }

    #[test]
    fn sixth_request_hits_burst_limit() {
        let h = harness(config().global_bucket(5, 1.0).build().unwrap());
        for _ in 0..5 {
            assert!(h.throttler.should_throttle_request(Some("ep"), Some("u1")).allowed);
        }
        let denied = h.throttler.should_throttle_request(Some("ep"), Some("u1"));
        assert_eq!(denied.reason, Some(ThrottleReason::BurstLimit));
        assert!((denied.wait_time - 1.0).abs() < 1e-9);
    }

    #[test]
    fn overload_wins_over_everything() {
        let h = harness(config().global_bucket(1, 1.0).build().unwrap());
        h.probe.set(Some(crate::load::LoadSample { cpu_percent: 99.0, memory_percent: 10.0 }));
        let d = h.throttler.should_throttle_request(Some("ep"), None);
        assert_eq!(d.reason, Some(ThrottleReason::SystemLoad));
        assert_eq!(d.wait_time, 5.0);
        // No token was spent while shedding.
        assert_eq!(h.throttler.get_throttle_stats().global_bucket.tokens, 1.0);
    }

    #[test]
    fn breaker_denial_reports_remaining_open_time() {
        let h = harness(config().circuit_breaker(1, 10).build().unwrap());
        h.throttler.record_request_result("/flaky", false);
        h.clock.advance(Duration::from_secs(4));
        let d = h.throttler.should_throttle_request(Some("/flaky"), None);
        assert_eq!(d.reason, Some(ThrottleReason::CircuitBreaker));
        assert!((d.wait_time - 6.0).abs() < 1e-6);
    }

    #[test]
    fn no_endpoint_skips_endpoint_checks() {
        let h = harness(config().endpoint_limit("/x", 1).build().unwrap());
        for _ in 0..3 {
            assert!(h.throttler.should_throttle_request(None, None).allowed);
        }
        let stats = h.throttler.get_throttle_stats();
        assert!(stats.endpoint_buckets.is_empty());
        assert!(stats.circuit_breakers.is_empty());
    }

    #[test]
    fn counters_and_events_follow_decisions() {
        let h = harness(config().global_bucket(1, 1.0).build().unwrap());
        h.throttler.should_throttle_request(Some("ep"), None);
        h.throttler.should_throttle_request(Some("ep"), None);

        let counts = h.throttler.get_throttle_stats().decisions;
        assert_eq!(counts.admitted, 1);
        assert_eq!(counts.burst_limit, 1);

        let decisions: Vec<_> = h
            .sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ThrottleEvent::Decision(record) => Some(record.allowed),
                _ => None,
            })
            .collect();
        assert_eq!(decisions, vec![true, false]);
    }

    #[test]
    fn reset_unknown_breaker_is_an_error() {
        let h = harness(config().build().unwrap());
        assert_eq!(
            h.throttler.reset_circuit_breaker("/nope"),
            Err(ThrottleError::UnknownCircuit { endpoint: "/nope".into() })
        );
        assert_eq!(h.throttler.circuit_state("/nope"), None);
    }

    #[derive(Debug, Default)]
    struct Muted {
        seen: std::sync::atomic::AtomicUsize,
    }

    impl crate::telemetry::ThrottleObserver for Muted {
        fn observe(&self, _event: &ThrottleEvent) {
            self.seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }

        fn is_enabled(&self) -> bool {
            false
        }
    }

    #[test]
    fn disabled_observer_receives_nothing() {
        let muted = Arc::new(Muted::default());
        let throttler = RequestThrottler::builder(config().global_bucket(1, 1.0).build().unwrap())
            .clock(Arc::new(ManualClock::new()))
            .probe(Arc::new(StaticProbe::unavailable()))
            .observer(muted.clone())
            .build()
            .unwrap();
        assert!(throttler.should_throttle_request(Some("ep"), Some("u1")).allowed);
        assert!(!throttler.should_throttle_request(Some("ep"), Some("u1")).allowed);
        assert_eq!(muted.seen.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(throttler.get_throttle_stats().decisions.admitted, 1);
    }

    #[test]
    fn trace_tier_records_bucket_levels() {
        let h = harness(config().log_level(crate::config::LogLevel::Trace).build().unwrap());
        h.throttler.should_throttle_request(Some("ep"), Some("u1"));
        let record = h
            .sink
            .events()
            .into_iter()
            .find_map(|e| match e {
                ThrottleEvent::Decision(record) => Some(record),
                _ => None,
            })
            .unwrap();
        let scopes: Vec<_> = record.buckets.unwrap().iter().map(|b| b.scope).collect();
        assert_eq!(scopes, vec![KeyScope::Global, KeyScope::User]);
        assert_eq!(record.circuit_state, Some(CircuitState::Closed));
    }
}
