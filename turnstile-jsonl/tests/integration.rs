use std::sync::Arc;
use std::time::Duration;
use tower_service::Service;
use turnstile::telemetry::{CircuitBreakerEvent, KeyScope, NonBlockingSink, ThrottleEvent};
use turnstile::{load::StaticProbe, ManualClock, RequestThrottler, ThrottleConfig};
use turnstile_jsonl::JsonlSink;

fn read_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .expect("file")
        .lines()
        .map(|l| serde_json::from_str(l).expect("one JSON object per line"))
        .collect()
}

#[tokio::test]
async fn writes_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let mut sink = JsonlSink::new(&path);

    sink.call(ThrottleEvent::CircuitBreaker {
        endpoint: "/flaky".into(),
        event: CircuitBreakerEvent::Opened { failure_count: 3 },
    })
    .await
    .unwrap();
    sink.call(ThrottleEvent::KeyEvicted { scope: KeyScope::User, key: "u9".into() })
        .await
        .unwrap();

    let lines = read_lines(&path);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["kind"], "circuit_opened");
    assert_eq!(lines[0]["failures"], 3);
    assert_eq!(lines[1]["kind"], "key_evicted");
}

#[tokio::test]
async fn throttler_decisions_reach_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("decisions.jsonl");
    let sink = NonBlockingSink::with_capacity(JsonlSink::new(&path), 64).unwrap();

    let config = ThrottleConfig::builder().global_bucket(1, 1.0).build().unwrap();
    let throttler = RequestThrottler::builder(config)
        .clock(Arc::new(ManualClock::new()))
        .probe(Arc::new(StaticProbe::unavailable()))
        .observer(Arc::new(sink.clone()))
        .build()
        .unwrap();

    assert!(throttler.should_throttle_request(Some("/a"), None).allowed);
    assert!(!throttler.should_throttle_request(Some("/a"), None).allowed);

    // Give the forwarding task time to drain the channel.
    let mut decisions = Vec::new();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if path.exists() {
            decisions = std::fs::read_to_string(&path)
                .unwrap_or_default()
                .lines()
                .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
                .filter(|v| v["kind"] == "decision")
                .collect();
            if decisions.len() == 2 {
                break;
            }
        }
    }
    assert_eq!(decisions.len(), 2);
    assert_eq!(decisions[0]["allowed"], true);
    assert_eq!(decisions[1]["reason"], "burst_limit");
    assert_eq!(sink.dropped(), 0);
}
