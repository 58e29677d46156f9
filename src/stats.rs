//! Read-only statistics snapshots.

use crate::circuit_breaker::CircuitSnapshot;
use crate::decision::{ThrottleDecision, ThrottleReason};
use crate::load::LoadSample;
use crate::token_bucket::TokenBucket;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BucketSnapshot {
    /// Tokens available now (projected, not stored).
    pub tokens: f64,
    /// Bucket capacity.
    pub capacity: f64,
    /// Tokens per second.
    pub refill_rate: f64,
}

impl BucketSnapshot {
    pub(crate) fn of(bucket: &TokenBucket) -> Self {
        Self {
            tokens: bucket.available_tokens(),
            capacity: bucket.capacity(),
            refill_rate: bucket.refill_rate(),
        }
    }
}

/// Decision totals since the throttler was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecisionCounts {
    /// Admitted requests.
    pub admitted: u64,
    /// Denials with `system_load`.
    pub system_load: u64,
    /// Denials with `burst_limit`.
    pub burst_limit: u64,
    /// Denials with `endpoint_overload`.
    pub endpoint_overload: u64,
    /// Denials with `user_abuse`.
    pub user_abuse: u64,
    /// Denials with `circuit_breaker`.
    pub circuit_breaker: u64,
}

impl DecisionCounts {
    /// Denials for one reason.
    pub fn denied(&self, reason: ThrottleReason) -> u64 {
        match reason {
            ThrottleReason::SystemLoad => self.system_load,
            ThrottleReason::BurstLimit => self.burst_limit,
            ThrottleReason::EndpointOverload => self.endpoint_overload,
            ThrottleReason::UserAbuse => self.user_abuse,
            ThrottleReason::CircuitBreaker => self.circuit_breaker,
        }
    }

    /// Denials across all reasons.
    pub fn total_denied(&self) -> u64 {
        ThrottleReason::ALL.iter().map(|r| self.denied(*r)).sum()
    }
}

#[derive(Debug, Default)]
pub(crate) struct DecisionCounters {
    admitted: AtomicU64,
    denied: [AtomicU64; 5],
}

impl DecisionCounters {
    pub(crate) fn record(&self, decision: &ThrottleDecision) {
        match decision.reason {
            Some(reason) => self.denied[reason.index()].fetch_add(1, Ordering::Relaxed),
            None => self.admitted.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn snapshot(&self) -> DecisionCounts {
        let denied = |reason: ThrottleReason| self.denied[reason.index()].load(Ordering::Relaxed);
        DecisionCounts {
            admitted: self.admitted.load(Ordering::Relaxed),
            system_load: denied(ThrottleReason::SystemLoad),
            burst_limit: denied(ThrottleReason::BurstLimit),
            endpoint_overload: denied(ThrottleReason::EndpointOverload),
            user_abuse: denied(ThrottleReason::UserAbuse),
            circuit_breaker: denied(ThrottleReason::CircuitBreaker),
        }
    }
}

/// Snapshot returned by `RequestThrottler::get_throttle_stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThrottleStats {
    /// The process-wide bucket.
    pub global_bucket: BucketSnapshot,
    /// Endpoint buckets by endpoint.
    pub endpoint_buckets: BTreeMap<String, BucketSnapshot>,
    /// Number of user buckets currently tracked.
    pub tracked_users: usize,
    /// User buckets by user id.
    pub user_buckets: BTreeMap<String, BucketSnapshot>,
    /// Circuit breakers by endpoint.
    pub circuit_breakers: BTreeMap<String, CircuitSnapshot>,
    /// Last cached load reading; `None` if never sampled or unavailable.
    pub system_load: Option<LoadSample>,
    /// Decision totals.
    pub decisions: DecisionCounts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_split_by_reason() {
        let counters = DecisionCounters::default();
        counters.record(&ThrottleDecision::allow());
        counters.record(&ThrottleDecision::allow());
        counters.record(&ThrottleDecision::deny(ThrottleReason::UserAbuse, 1.0));
        counters.record(&ThrottleDecision::deny(ThrottleReason::CircuitBreaker, 3.0));

        let counts = counters.snapshot();
        assert_eq!(counts.admitted, 2);
        assert_eq!(counts.denied(ThrottleReason::UserAbuse), 1);
        assert_eq!(counts.denied(ThrottleReason::BurstLimit), 0);
        assert_eq!(counts.total_denied(), 2);
    }

    #[test]
    fn counts_serialize_flat() {
        let v = serde_json::to_value(DecisionCounts { admitted: 3, ..Default::default() }).unwrap();
        assert_eq!(v["admitted"], 3);
        assert_eq!(v["endpoint_overload"], 0);
    }
}
