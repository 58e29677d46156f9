use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures::future::Ready;
use std::sync::Arc;
use tower::{Layer, Service};
use turnstile::load::StaticProbe;
use turnstile::{RequestContext, RequestThrottler, ThrottleConfig, ThrottleLayer};

// A service that just returns its input.
#[derive(Clone)]
struct EchoService;

impl Service<&'static str> for EchoService {
    type Response = &'static str;
    type Error = std::io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: &'static str) -> Self::Future {
        futures::future::ready(Ok(req))
    }
}

fn throttler(bucket_size: u32, refill_rate: f64) -> Arc<RequestThrottler> {
    let config = ThrottleConfig::builder()
        .global_bucket(bucket_size, refill_rate)
        .endpoint_limit("/search", u32::MAX)
        .logging(false, false)
        .build()
        .unwrap();
    let throttler = RequestThrottler::builder(config)
        .probe(Arc::new(StaticProbe::new(10.0, 10.0)))
        .build()
        .unwrap();
    Arc::new(throttler)
}

fn admission_hot_path(c: &mut Criterion) {
    let throttler = throttler(1_000_000, 1_000_000.0);
    c.bench_function("should_throttle_request_admit", |b| {
        b.iter(|| black_box(throttler.should_throttle_request(black_box(Some("/search")), black_box(Some("alice")))))
    });
}

fn admission_denied(c: &mut Criterion) {
    let throttler = throttler(1, 0.001);
    throttler.should_throttle_request(None, None);
    c.bench_function("should_throttle_request_burst_denied", |b| {
        b.iter(|| black_box(throttler.should_throttle_request(black_box(Some("/search")), None)))
    });
}

fn admission_many_users(c: &mut Criterion) {
    let throttler = throttler(1_000_000, 1_000_000.0);
    let users: Vec<String> = (0..1024).map(|i| format!("user-{i}")).collect();
    let mut i = 0usize;
    c.bench_function("should_throttle_request_1024_users", |b| {
        b.iter(|| {
            i = (i + 1) % users.len();
            black_box(throttler.should_throttle_request(Some("/search"), Some(&users[i])))
        })
    });
}

fn middleware_overhead(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let layer = ThrottleLayer::new(throttler(1_000_000, 1_000_000.0), |_req: &&'static str| {
        RequestContext::new(Some("/search"), Some("alice"))
    });
    let svc = layer.layer(EchoService);

    c.bench_function("throttle_layer_admit", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let _ = black_box(local_svc.call(black_box("request"))).await;
        });
    });
}

criterion_group!(
    benches,
    admission_hot_path,
    admission_denied,
    admission_many_users,
    middleware_overhead
);
criterion_main!(benches);
