//! Load-shedding walkthrough: burst limits, an endpoint budget, a flaky
//! upstream tripping its breaker, and host overload, all behind one tower layer.
//!
//! Run with `RUST_LOG=turnstile=info cargo run --example load_shed`.
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tower::{service_fn, Layer, ServiceExt};
use tracing_subscriber::EnvFilter;
use turnstile::load::{LoadSample, StaticProbe};
use turnstile::telemetry::LogSink;
use turnstile::{AdmissionError, LogLevel, RequestContext, RequestThrottler, ThrottleConfig, ThrottleLayer};

#[derive(Debug, Clone, Copy)]
struct Call {
    endpoint: &'static str,
    user: &'static str,
}

async fn upstream(call: Call) -> Result<&'static str, io::Error> {
    if call.endpoint == "/flaky" {
        return Err(io::Error::new(io::ErrorKind::Other, "upstream timeout"));
    }
    Ok("200 OK")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ThrottleConfig::builder()
        .global_bucket(20, 5.0)
        .user_bucket(8, 1.0)
        .endpoint_limit("/export", 3)
        .circuit_breaker(3, 2)
        .log_level(LogLevel::Detailed)
        .logging(true, true)
        .load_sample_interval(Duration::ZERO)
        .build()?;
    let probe = StaticProbe::new(35.0, 50.0);
    let throttler = Arc::new(
        RequestThrottler::builder(config)
            .probe(Arc::new(probe.clone()))
            .observer(Arc::new(LogSink))
            .build()?,
    );

    let layer = ThrottleLayer::new(throttler.clone(), |call: &Call| {
        RequestContext::new(Some(call.endpoint), Some(call.user)).with_method("GET").with_path(call.endpoint)
    });

    let script = [
        ("export budget", Call { endpoint: "/export", user: "alice" }, 5),
        ("abusive user", Call { endpoint: "/search", user: "mallory" }, 10),
        ("flaky upstream", Call { endpoint: "/flaky", user: "bob" }, 5),
    ];
    for (label, call, count) in script {
        for _ in 0..count {
            report(label, layer.layer(service_fn(upstream)).oneshot(call).await);
        }
    }

    probe.set(Some(LoadSample { cpu_percent: 97.0, memory_percent: 50.0 }));
    let call = Call { endpoint: "/search", user: "carol" };
    report("host overload", layer.layer(service_fn(upstream)).oneshot(call).await);

    println!("{}", serde_json::to_string_pretty(&throttler.get_throttle_stats())?);
    Ok(())
}

fn report(label: &str, result: Result<&'static str, AdmissionError<io::Error>>) {
    match result {
        Ok(body) => println!("{label:>16}: {body}"),
        Err(AdmissionError::Throttled(rejection)) => {
            let (header, value) = rejection.retry_after_header();
            println!(
                "{label:>16}: {} {} ({header}: {value})",
                turnstile::Rejection::STATUS,
                rejection.reason()
            );
        }
        Err(AdmissionError::Inner(e)) => println!("{label:>16}: upstream error: {e}"),
    }
}
