//! Traced queue consumer.
//!
//! One `EventConsumer` drains one queue. Each delivery is processed under a
//! consumer span whose parent is rebuilt from the message headers, so the
//! handler's work joins the trace of whoever published the event.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::Tracer;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{AckPolicy, InboundMessage, MessageChannel, Result, TRACER_NAME};
use crate::telemetry::Telemetry;

/// Outcome of handling one payload.
pub type HandlerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Business logic invoked once per delivery.
#[async_trait]
pub trait PayloadHandler: Send + Sync {
    /// Handle one payload. `cx` carries the consumer span; pass it on to
    /// anything that should join the trace.
    async fn handle(&self, cx: &Context, payload: &[u8]) -> HandlerResult;
}

/// Long-running consumer bound to one queue and one handler.
pub struct EventConsumer {
    channel: Arc<dyn MessageChannel>,
    telemetry: Arc<Telemetry>,
    tracer: Tracer,
    queue: String,
    consumer_tag: String,
    ack_policy: AckPolicy,
    handler: Arc<dyn PayloadHandler>,
}

impl EventConsumer {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        telemetry: Arc<Telemetry>,
        queue: impl Into<String>,
        handler: Arc<dyn PayloadHandler>,
    ) -> Self {
        let tracer = telemetry.tracer(TRACER_NAME);
        Self {
            channel,
            telemetry,
            tracer,
            queue: queue.into(),
            consumer_tag: String::new(),
            ack_policy: AckPolicy::default(),
            handler,
        }
    }

    pub fn with_ack_policy(mut self, ack_policy: AckPolicy) -> Self {
        self.ack_policy = ack_policy;
        self
    }

    /// Tag announced to the broker. Empty lets the broker pick one.
    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = consumer_tag.into();
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn ack_policy(&self) -> AckPolicy {
        self.ack_policy
    }

    /// Declare the queue, subscribe and process deliveries until `stop`
    /// flips to `true`, its sender is dropped, or the delivery stream ends.
    ///
    /// Declare and subscribe failures are returned before any message is
    /// processed. Handler failures are recorded and never stop the loop.
    pub async fn register(&self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let mut deliveries = match self.subscribe().await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                error!(queue = %self.queue, error = %e, "Failed to start consumer");
                return Err(e);
            }
        };

        if *stop.borrow() {
            debug!(queue = %self.queue, "Stop requested before first delivery");
            return Ok(());
        }

        info!(queue = %self.queue, ack_policy = ?self.ack_policy, "Consumer started");

        loop {
            tokio::select! {
                // Stop wins over a delivery that is already waiting.
                biased;

                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                delivery = deliveries.next() => match delivery {
                    Some(Ok(message)) => self.process(message).await,
                    Some(Err(e)) => {
                        error!(queue = %self.queue, error = %e, "Delivery stream failed");
                        return Err(e);
                    }
                    None => {
                        warn!(queue = %self.queue, "Delivery stream ended");
                        break;
                    }
                },
            }
        }

        info!(queue = %self.queue, "Consumer stopped");
        Ok(())
    }

    async fn subscribe(&self) -> Result<super::DeliveryStream> {
        self.channel.declare_queue(&self.queue).await?;
        self.channel
            .subscribe(&self.queue, &self.consumer_tag, self.ack_policy)
            .await
    }

    /// Run the handler for one delivery under a consumer span, then settle it.
    async fn process(&self, message: InboundMessage) {
        let parent = self.telemetry.extract(&message.headers);
        let span = self
            .tracer
            .span_builder(format!("broker consume {}", self.queue))
            .with_kind(SpanKind::Consumer)
            .with_attributes([
                KeyValue::new("messaging.system", "rabbitmq"),
                KeyValue::new("messaging.destination.name", self.queue.clone()),
                KeyValue::new("messaging.message.body.size", message.body.len() as i64),
            ])
            .start_with_context(&self.tracer, &parent);
        let cx = parent.with_span(span);

        let outcome = self.handler.handle(&cx, &message.body).await;
        if let Err(e) = &outcome {
            error!(queue = %self.queue, error = %e, "Handler failed");
            self.telemetry.log_error(&cx, &**e);
        }

        let requeued = self.ack_policy == AckPolicy::AfterSuccess && outcome.is_err();
        let settled = if requeued {
            message.nack(true).await
        } else {
            message.ack().await
        };
        if let Err(e) = settled {
            warn!(queue = %self.queue, error = %e, "Failed to settle delivery");
            self.telemetry.log_error(&cx, &e);
        }

        cx.span().end();

        // A requeued delivery is ready again at once; let the stop token and
        // sibling tasks run before it is redelivered.
        if requeued {
            tokio::task::yield_now().await;
        }
    }
}
