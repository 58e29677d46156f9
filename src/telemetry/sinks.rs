//! Observer trait and the built-in sinks.

use super::events::{event_to_json, ThrottleEvent};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Receives throttle events.
///
/// Called synchronously on the admission path after the decision is fixed, so
/// implementations must not block. Anything slow (files, network, an external
/// store mirroring bucket state) belongs behind a [`NonBlockingSink`].
pub trait ThrottleObserver: Send + Sync + fmt::Debug {
    /// Consume one event. Must not panic and must not block.
    fn observe(&self, event: &ThrottleEvent);

    /// Whether events are wanted at all. Callers skip building events for an
    /// observer that says no.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Shared observer handle held by the throttler and its breakers.
pub type SharedObserver = Arc<dyn ThrottleObserver>;

impl<T: ThrottleObserver + ?Sized> ThrottleObserver for Arc<T> {
    fn observe(&self, event: &ThrottleEvent) {
        (**self).observe(event)
    }

    fn is_enabled(&self) -> bool {
        (**self).is_enabled()
    }
}

/// A no-op sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl ThrottleObserver for NullSink {
    fn observe(&self, _event: &ThrottleEvent) {}

    fn is_enabled(&self) -> bool {
        false
    }
}

/// A sink that logs events using the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl ThrottleObserver for LogSink {
    fn observe(&self, event: &ThrottleEvent) {
        tracing::info!(target: "turnstile::telemetry", event = %event, "throttle_event");
    }
}

/// A sink that stores events in memory.
///
/// Bounded; the oldest events are evicted once capacity is reached.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<ThrottleEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Creates a bounded memory sink with explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns a snapshot of all events received so far.
    pub fn events(&self) -> Vec<ThrottleEvent> {
        self.lock().iter().cloned().collect()
    }

    /// Clears all stored events.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Returns the number of events stored.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no events are stored.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns the number of evicted events.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ThrottleEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl ThrottleObserver for MemorySink {
    fn observe(&self, event: &ThrottleEvent) {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event.clone());
    }
}

/// Fans each event out to two observers.
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    sink_a: A,
    sink_b: B,
}

impl<A, B> MulticastSink<A, B> {
    /// Combine two observers; both see every event, `a` first.
    pub fn new(sink_a: A, sink_b: B) -> Self {
        Self { sink_a, sink_b }
    }
}

impl<A: ThrottleObserver, B: ThrottleObserver> ThrottleObserver for MulticastSink<A, B> {
    fn observe(&self, event: &ThrottleEvent) {
        self.sink_a.observe(event);
        self.sink_b.observe(event);
    }

    fn is_enabled(&self) -> bool {
        self.sink_a.is_enabled() || self.sink_b.is_enabled()
    }
}

/// Bridges the synchronous observer path to any async
/// `tower::Service<ThrottleEvent>` (a file writer, a store mirror).
///
/// Events go through a bounded channel; when it is full the event is dropped
/// and counted, so the admission path never waits on the downstream sink.
#[derive(Debug, Clone)]
pub struct NonBlockingSink {
    tx: tokio::sync::mpsc::Sender<ThrottleEvent>,
    dropped: Arc<AtomicU64>,
}

impl NonBlockingSink {
    /// Spawn the forwarding task on the current tokio runtime.
    ///
    /// Fails when called outside a runtime.
    pub fn with_capacity<S>(sink: S, capacity: usize) -> Result<Self, tokio::runtime::TryCurrentError>
    where
        S: tower::Service<ThrottleEvent, Response = ()> + Send + 'static,
        S::Error: fmt::Display + Send + 'static,
        S::Future: Send + 'static,
    {
        let handle = tokio::runtime::Handle::try_current()?;
        Ok(Self::spawn_on(&handle, sink, capacity))
    }

    /// Spawn the forwarding task on an explicit runtime handle.
    pub fn spawn_on<S>(handle: &tokio::runtime::Handle, mut sink: S, capacity: usize) -> Self
    where
        S: tower::Service<ThrottleEvent, Response = ()> + Send + 'static,
        S::Error: fmt::Display + Send + 'static,
        S::Future: Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity.max(1));
        handle.spawn(async move {
            use tower::ServiceExt;
            while let Some(event) = rx.recv().await {
                match sink.ready().await {
                    Ok(ready) => {
                        if let Err(e) = ready.call(event).await {
                            tracing::debug!(target: "turnstile::telemetry", error = %e, "throttle event sink call failed");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(target: "turnstile::telemetry", error = %e, "throttle event sink unavailable; forwarding stopped");
                        break;
                    }
                }
            }
        });
        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Events dropped because the channel was full or the worker had stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ThrottleObserver for NonBlockingSink {
    fn observe(&self, event: &ThrottleEvent) {
        if self.tx.try_send(event.clone()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A sink that writes each event as a single JSON line through `tracing`.
///
/// Pair it with a JSON `tracing-subscriber` layer to get one parseable record
/// per event without any file handling in the core.
#[derive(Clone, Debug, Default)]
pub struct JsonLogSink;

impl ThrottleObserver for JsonLogSink {
    fn observe(&self, event: &ThrottleEvent) {
        tracing::info!(target: "turnstile::telemetry", json = %event_to_json(event), "throttle_event");
    }
}
