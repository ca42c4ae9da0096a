//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::trace::{TraceContextExt, TraceId};
use opentelemetry::Context;
use tokio::sync::Notify;

use courier::bus::{HandlerResult, PayloadHandler};

/// Handler that records each payload with the trace id it was handled under.
#[derive(Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<(Vec<u8>, TraceId)>>,
    delay: Option<Duration>,
    notify: Notify,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Handler that sleeps `delay` before recording.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn seen(&self) -> Vec<(Vec<u8>, TraceId)> {
        self.seen.lock().unwrap().clone()
    }

    /// Wait until at least `count` payloads were handled.
    pub async fn wait_for_count(&self, count: usize, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            while self.seen.lock().unwrap().len() < count {
                self.notify.notified().await;
            }
        })
        .await
        .expect("handler was not invoked in time");
    }
}

#[async_trait]
impl PayloadHandler for RecordingHandler {
    async fn handle(&self, cx: &Context, payload: &[u8]) -> HandlerResult {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let trace_id = cx.span().span_context().trace_id();
        self.seen.lock().unwrap().push((payload.to_vec(), trace_id));
        self.notify.notify_one();
        Ok(())
    }
}
