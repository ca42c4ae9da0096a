//! Traced, fire-and-forget event publisher.

use std::sync::Arc;

use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::Tracer;
use tracing::{debug, error};

use super::{HeaderCarrier, MessageChannel, Result, TRACER_NAME};
use crate::telemetry::Telemetry;

/// Publishes one logical event type to a named queue.
///
/// Publishing is at-most-once: no confirmation, no retry, no dead-lettering.
/// Failures are logged and recorded on the producer span, never returned.
pub struct EventPublisher {
    channel: Arc<dyn MessageChannel>,
    telemetry: Arc<Telemetry>,
    tracer: Tracer,
    queue: String,
}

impl EventPublisher {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        telemetry: Arc<Telemetry>,
        queue: impl Into<String>,
    ) -> Self {
        let tracer = telemetry.tracer(TRACER_NAME);
        Self {
            channel,
            telemetry,
            tracer,
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Emit `value` on this publisher's queue.
    pub async fn create(&self, parent: &Context, value: &str) {
        self.publish(parent, &self.queue, value.as_bytes()).await;
    }

    /// Emit `payload` on `queue` under a producer span that is a child of
    /// `parent` (or a new root when `parent` carries no span).
    pub async fn publish(&self, parent: &Context, queue: &str, payload: &[u8]) {
        let span = self
            .tracer
            .span_builder(format!("broker publish {}", queue))
            .with_kind(SpanKind::Producer)
            .with_attributes([
                KeyValue::new("messaging.system", "rabbitmq"),
                KeyValue::new("messaging.destination.name", queue.to_string()),
                KeyValue::new("messaging.message.body.size", payload.len() as i64),
            ])
            .start_with_context(&self.tracer, parent);
        let cx = parent.with_span(span);

        if let Err(e) = self.send(&cx, queue, payload).await {
            error!(queue = %queue, error = %e, "Failed to publish event");
            self.telemetry.log_error(&cx, &e);
        }

        // Ends on every path; dropping `cx` would end it as well.
        cx.span().end();
    }

    async fn send(&self, cx: &Context, queue: &str, payload: &[u8]) -> Result<()> {
        let mut headers = HeaderCarrier::new();
        self.telemetry.inject(cx, &mut headers);

        self.channel.declare_queue(queue).await?;
        self.channel.publish(queue, payload, headers).await?;

        debug!(queue = %queue, bytes = payload.len(), "Published event");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryChannel;
    use opentelemetry::trace::Tracer as _;

    fn publisher(channel: Arc<MemoryChannel>) -> (EventPublisher, Arc<Telemetry>) {
        let telemetry = Arc::new(Telemetry::local("publisher-test"));
        let publisher = EventPublisher::new(channel, telemetry.clone(), "todo.create");
        (publisher, telemetry)
    }

    #[tokio::test]
    async fn test_create_declares_queue_and_enqueues() {
        let channel = Arc::new(MemoryChannel::new());
        let (publisher, _) = publisher(channel.clone());

        publisher.create(&Context::new(), "abc").await;

        let pending = channel.peek("todo.create");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, b"abc");
    }

    #[tokio::test]
    async fn test_headers_carry_parent_trace_id() {
        let channel = Arc::new(MemoryChannel::new());
        let (publisher, telemetry) = publisher(channel.clone());

        let tracer = telemetry.tracer("caller");
        let parent = Context::new().with_span(tracer.start("http request"));
        let trace_id = parent.span().span_context().trace_id();

        publisher.create(&parent, "abc").await;

        let (_, headers) = channel.peek("todo.create").remove(0);
        let extracted = telemetry.extract(&headers);
        assert_eq!(extracted.span().span_context().trace_id(), trace_id);
        // The injected span is the producer span, not the caller's.
        assert_ne!(
            extracted.span().span_context().span_id(),
            parent.span().span_context().span_id()
        );
    }

    #[tokio::test]
    async fn test_publish_without_parent_starts_new_trace() {
        let channel = Arc::new(MemoryChannel::new());
        let (publisher, telemetry) = publisher(channel.clone());

        publisher.create(&Context::new(), "abc").await;

        let (_, headers) = channel.peek("todo.create").remove(0);
        assert!(!headers.get("traceparent").is_empty());
        assert!(telemetry.extract(&headers).span().span_context().is_valid());
    }

    #[tokio::test]
    async fn test_declare_failure_is_swallowed() {
        let channel = Arc::new(MemoryChannel::new());
        channel.fail_declare("todo.create");
        let (publisher, _) = publisher(channel.clone());

        publisher.create(&Context::new(), "abc").await;

        assert_eq!(channel.queue_depth("todo.create"), None);
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let channel = Arc::new(MemoryChannel::new());
        channel.set_fail_on_publish(true);
        let (publisher, _) = publisher(channel.clone());

        publisher.create(&Context::new(), "abc").await;

        assert_eq!(channel.queue_depth("todo.create"), Some(0));
    }

    #[tokio::test]
    async fn test_publish_to_other_queue() {
        let channel = Arc::new(MemoryChannel::new());
        let (publisher, _) = publisher(channel.clone());

        publisher
            .publish(&Context::new(), "send_email", b"user@example.com")
            .await;

        assert_eq!(channel.queue_depth("send_email"), Some(1));
        assert_eq!(channel.queue_depth("todo.create"), None);
    }
}
