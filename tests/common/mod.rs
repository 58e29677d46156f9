#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;
use turnstile::load::StaticProbe;
use turnstile::telemetry::MemorySink;
use turnstile::{ManualClock, RequestThrottler, ThrottleConfig, ThrottleConfigBuilder};

/// A throttler wired to a manual clock, a settable load probe and a memory sink.
pub struct Harness {
    pub throttler: Arc<RequestThrottler>,
    pub clock: ManualClock,
    pub probe: StaticProbe,
    pub sink: MemorySink,
}

pub fn harness(config: ThrottleConfig) -> Harness {
    let clock = ManualClock::new();
    let probe = StaticProbe::new(10.0, 10.0);
    let sink = MemorySink::with_capacity(100_000);
    let throttler = RequestThrottler::builder(config)
        .clock(Arc::new(clock.clone()))
        .probe(Arc::new(probe.clone()))
        .observer(Arc::new(sink.clone()))
        .build()
        .expect("valid config");
    Harness { throttler: Arc::new(throttler), clock, probe, sink }
}

/// Builder with load sampling on every check, so probe changes apply at once.
pub fn config() -> ThrottleConfigBuilder {
    ThrottleConfig::builder().load_sample_interval(Duration::ZERO)
}

#[derive(Clone)]
pub struct SharedWriter(pub Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

pub struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a JSON subscriber installed and return everything it logged.
pub fn capture_json_logs<F: FnOnce()>(f: F) -> String {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
        .with_target(true)
        .with_max_level(tracing::Level::TRACE)
        .without_time()
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    let bytes = buffer.lock().unwrap().clone();
    String::from_utf8(bytes).unwrap()
}
