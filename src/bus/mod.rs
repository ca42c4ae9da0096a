//! Broker-backed asynchronous dispatch.
//!
//! This module contains:
//! - `MessageChannel` trait: the single broker handle shared by publishers and consumers
//! - `HeaderCarrier`: trace context carrier over message headers
//! - `EventPublisher` / `EventConsumer`: traced publish and consume paths
//! - Implementations: AMQP (RabbitMQ), in-memory

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use futures::stream::BoxStream;
use serde::Deserialize;
use tracing::{info, warn};

pub mod carrier;
pub mod consumer;
pub mod memory;
pub mod publisher;

#[cfg(feature = "amqp")]
pub mod amqp;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpChannel;
pub use carrier::HeaderCarrier;
pub use consumer::{EventConsumer, HandlerResult, PayloadHandler};
pub use memory::MemoryChannel;
pub use publisher::EventPublisher;

/// Tracer name used for broker publish and consume spans.
pub const TRACER_NAME: &str = "broker";

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Failed to declare queue '{queue}': {message}")]
    Declare { queue: String, message: String },

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledge failed: {0}")]
    Ack(String),

    #[error("Broker channel is closed")]
    Closed,
}

/// When a consumed message is acknowledged.
///
/// `Immediate` lets the broker consider the message delivered as soon as it is
/// handed to the consumer, so a failing handler loses it. `AfterSuccess` holds
/// the acknowledgement until the handler returns and requeues on failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    #[default]
    Immediate,
    AfterSuccess,
}

impl AckPolicy {
    /// Whether the subscription runs in broker auto-acknowledge mode.
    pub fn auto_ack(self) -> bool {
        matches!(self, AckPolicy::Immediate)
    }
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message pulled from a queue.
pub struct InboundMessage {
    /// Opaque payload.
    pub body: Vec<u8>,
    /// Message headers, carrying propagated trace context.
    pub headers: HeaderCarrier,
    acker: Box<dyn Acknowledger>,
}

impl InboundMessage {
    pub fn new(body: Vec<u8>, headers: HeaderCarrier, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            body,
            headers,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("body_len", &self.body.len())
            .field("headers", &self.headers)
            .finish()
    }
}

/// Lazy, unbounded, non-restartable sequence of deliveries from one queue.
pub type DeliveryStream = BoxStream<'static, Result<InboundMessage>>;

/// Handle to one broker connection and channel.
///
/// One instance exists per process and is shared read-only by every publisher
/// and consumer. `close` must only be called after all users have stopped.
///
/// Implementations:
/// - `AmqpChannel`: RabbitMQ via AMQP
/// - `MemoryChannel`: in-process queues
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Idempotently declare a durable, non-exclusive, non-auto-delete queue.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Publish a payload to a queue through the default exchange.
    ///
    /// No delivery confirmation is awaited.
    async fn publish(&self, queue: &str, payload: &[u8], headers: HeaderCarrier) -> Result<()>;

    /// Open a streaming subscription to a declared queue.
    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
        ack_policy: AckPolicy,
    ) -> Result<DeliveryStream>;

    /// Release the connection. Calls after the first are no-ops.
    async fn close(&self) -> Result<()>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Broker type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    /// AMQP/RabbitMQ broker.
    #[default]
    Amqp,
    /// In-process queues, for local development.
    Memory,
}

/// Broker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker type discriminator.
    #[serde(rename = "type")]
    pub broker_type: BrokerType,
    /// AMQP connection URL.
    pub url: String,
    /// Connection attempts after the first one fails. Zero fails fast.
    pub connect_retries: usize,
    /// Consumer tag announced to the broker.
    pub consumer_tag: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_type: BrokerType::Amqp,
            url: "amqp://localhost:5672".to_string(),
            connect_retries: 0,
            consumer_tag: "courier".to_string(),
        }
    }
}

/// Open the process-wide broker handle.
///
/// Never retries; see [`connect_with_retry`] for a caller-side policy.
pub async fn connect(config: &BrokerConfig) -> Result<Arc<dyn MessageChannel>> {
    match config.broker_type {
        #[cfg(feature = "amqp")]
        BrokerType::Amqp => Ok(Arc::new(AmqpChannel::connect(&config.url).await?)),
        #[cfg(not(feature = "amqp"))]
        BrokerType::Amqp => Err(BusError::Connection(
            "AMQP support not compiled in (enable the `amqp` feature)".to_string(),
        )),
        BrokerType::Memory => {
            info!("Using in-memory broker");
            Ok(Arc::new(MemoryChannel::new()))
        }
    }
}

/// Backoff for broker connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Jitter enabled
pub fn connection_backoff(max_times: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(max_times)
        .with_jitter()
}

/// Open the broker handle, retrying `connect_retries` times with backoff.
pub async fn connect_with_retry(config: &BrokerConfig) -> Result<Arc<dyn MessageChannel>> {
    if config.connect_retries == 0 {
        return connect(config).await;
    }

    (|| connect(config))
        .retry(connection_backoff(config.connect_retries))
        .notify(|err: &BusError, dur: Duration| {
            warn!(error = %err, delay = ?dur, "Broker connection failed, retrying");
        })
        .await
}
