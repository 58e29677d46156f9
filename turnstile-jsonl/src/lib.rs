//! JSONL sink for `turnstile`. Writes one event per line.
//! Always appends; bring your own path.
//!
//! The sink is an async `tower::Service<ThrottleEvent>`, so it plugs into
//! [`NonBlockingSink`](turnstile::telemetry::NonBlockingSink) and never runs
//! on the admission path itself.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use turnstile::telemetry::{event_to_json, ThrottleEvent};

/// Appends each event as a JSON object followed by a newline.
#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    /// Sink appending to `path`; the file is created on first write.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Target file.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl tower_service::Service<ThrottleEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ThrottleEvent) -> Self::Future {
        let path = self.path.clone();
        let line = event_to_json(&event).to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            tracing::trace!(target: "turnstile::jsonl", path = %path.display(), "event appended");
            Ok(())
        })
    }
}
