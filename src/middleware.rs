//! Tower integration: admit or reject before the inner service runs, then
//! report the inner service's outcome to the endpoint's circuit breaker.

use crate::decision::{RequestContext, ThrottleDecision, ThrottleReason};
use crate::error::AdmissionError;
use crate::throttler::RequestThrottler;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// Retryable rejection surfaced to the caller as HTTP 429.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rejection {
    reason: ThrottleReason,
    wait_time: Duration,
}

/// Response body for a rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectionBody {
    /// Always `"Too Many Requests"`.
    pub error: &'static str,
    /// Snake_case throttle reason.
    pub reason: ThrottleReason,
    /// Whole seconds to wait before retrying.
    pub retry_after: u64,
    /// Human-readable explanation.
    pub message: &'static str,
}

impl Rejection {
    /// HTTP status code for rejections.
    pub const STATUS: u16 = 429;

    /// Create a rejection.
    pub fn new(reason: ThrottleReason, wait_time: Duration) -> Self {
        Self { reason, wait_time }
    }

    /// Rejection for a denied decision; `None` if it was admitted.
    pub fn from_decision(decision: &ThrottleDecision) -> Option<Self> {
        decision.reason.map(|reason| Self::new(reason, decision.wait_duration()))
    }

    /// Why the request was rejected.
    pub fn reason(&self) -> ThrottleReason {
        self.reason
    }

    /// Exact suggested wait.
    pub fn wait_time(&self) -> Duration {
        self.wait_time
    }

    /// Wait rounded up to whole seconds, never less than one.
    pub fn retry_after(&self) -> u64 {
        let secs = self.wait_time.as_secs();
        let rounded = if self.wait_time.subsec_nanos() > 0 { secs.saturating_add(1) } else { secs };
        rounded.max(1)
    }

    /// `Retry-After` header name and value.
    pub fn retry_after_header(&self) -> (&'static str, String) {
        ("Retry-After", self.retry_after().to_string())
    }

    /// JSON-serialisable response body.
    pub fn body(&self) -> RejectionBody {
        RejectionBody {
            error: "Too Many Requests",
            reason: self.reason,
            retry_after: self.retry_after(),
            message: self.reason.message(),
        }
    }
}

/// Extracts the throttling identity from a request.
pub trait IdentifyRequest<Req> {
    /// Build the context for `req`. Only `endpoint` and `user_id` are required.
    fn identify(&self, req: &Req) -> RequestContext;
}

impl<Req, F> IdentifyRequest<Req> for F
where
    F: Fn(&Req) -> RequestContext,
{
    fn identify(&self, req: &Req) -> RequestContext {
        self(req)
    }
}

/// A layer that throttles requests using a shared [`RequestThrottler`].
#[derive(Debug)]
pub struct ThrottleLayer<I> {
    throttler: Arc<RequestThrottler>,
    identify: Arc<I>,
}

impl<I> Clone for ThrottleLayer<I> {
    fn clone(&self) -> Self {
        Self { throttler: self.throttler.clone(), identify: self.identify.clone() }
    }
}

impl<I> ThrottleLayer<I> {
    /// Create a layer; `identify` maps each request to its context.
    pub fn new(throttler: Arc<RequestThrottler>, identify: I) -> Self {
        Self { throttler, identify: Arc::new(identify) }
    }
}

impl<S, I> Layer<S> for ThrottleLayer<I> {
    type Service = ThrottleService<S, I>;

    fn layer(&self, service: S) -> Self::Service {
        ThrottleService {
            inner: service,
            throttler: self.throttler.clone(),
            identify: self.identify.clone(),
        }
    }
}

/// Middleware service produced by [`ThrottleLayer`].
#[derive(Debug)]
pub struct ThrottleService<S, I> {
    inner: S,
    throttler: Arc<RequestThrottler>,
    identify: Arc<I>,
}

impl<S: Clone, I> Clone for ThrottleService<S, I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            throttler: self.throttler.clone(),
            identify: self.identify.clone(),
        }
    }
}

impl<S, I, Req> Service<Req> for ThrottleService<S, I>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    I: IdentifyRequest<Req>,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let ctx = self.identify.identify(&req);
        let decision = self.throttler.check(&ctx);
        if let Some(rejection) = Rejection::from_decision(&decision) {
            return Box::pin(async move { Err(AdmissionError::Throttled(rejection)) });
        }

        // Take the service that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let throttler = self.throttler.clone();
        Box::pin(async move {
            let result = inner.call(req).await;
            if let Some(endpoint) = ctx.endpoint.as_deref() {
                throttler.record_request_result(endpoint, result.is_ok());
            }
            result.map_err(AdmissionError::Inner)
        })
    }
}
