//! AMQP (RabbitMQ) broker channel.
//!
//! One connection and one channel per process. Events go through the default
//! exchange straight to a durable queue named after the event type.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info};

use super::{
    AckPolicy, Acknowledger, BusError, DeliveryStream, HeaderCarrier, InboundMessage,
    MessageChannel, Result,
};

/// Default exchange: routing key is the queue name.
const DEFAULT_EXCHANGE: &str = "";

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Persistent delivery mode.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Broker handle owning one AMQP connection and one channel.
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    closed: AtomicBool,
}

impl AmqpChannel {
    /// Connect and open a channel. Fails immediately if the broker is
    /// unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        info!(channel_id = channel.id(), "Connected to AMQP");

        Ok(Self {
            connection,
            channel,
            closed: AtomicBool::new(false),
        })
    }

    /// The underlying channel.
    pub fn get(&self) -> &Channel {
        &self.channel
    }
}

#[async_trait]
impl MessageChannel for AmqpChannel {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Declare {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;

        debug!(queue = %queue, "Declared queue");
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8], headers: HeaderCarrier) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type("text/plain".into())
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT);

        let properties = if headers.is_empty() {
            properties
        } else {
            properties.with_headers(to_field_table(headers))
        };

        // The returned confirm is dropped: the channel is not in confirm mode.
        self.channel
            .basic_publish(
                DEFAULT_EXCHANGE,
                queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish to '{}': {}", queue, e)))?;

        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
        ack_policy: AckPolicy,
    ) -> Result<DeliveryStream> {
        let auto_ack = ack_policy.auto_ack();

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        info!(queue = %queue, consumer_tag = %consumer_tag, auto_ack, "AMQP consumer started");

        let deliveries = consumer.map(move |delivery| match delivery {
            Ok(delivery) => {
                let headers = from_field_table(delivery.properties.headers().as_ref());
                Ok(InboundMessage::new(
                    delivery.data,
                    headers,
                    Box::new(AmqpAcker {
                        acker: delivery.acker,
                        auto_ack,
                    }),
                ))
            }
            Err(e) => Err(BusError::Subscribe(format!("Delivery error: {}", e))),
        });

        Ok(Box::pin(deliveries))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("AMQP channel already closed");
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BusError::Connection(format!("Failed to close channel: {}", e)))?;
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BusError::Connection(format!("Failed to close connection: {}", e)))?;

        info!("AMQP connection closed");
        Ok(())
    }
}

/// Settles one AMQP delivery. In auto-ack mode the broker already considers
/// the message delivered, so settling is a no-op.
struct AmqpAcker {
    acker: Acker,
    auto_ack: bool,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        if self.auto_ack {
            return Ok(());
        }
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BusError::Ack(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        if self.auto_ack {
            return Ok(());
        }
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| BusError::Ack(e.to_string()))
    }
}

/// Outbound headers as AMQP long strings.
fn to_field_table(headers: HeaderCarrier) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers.into_inner() {
        table.insert(key.into(), AMQPValue::LongString(value.into()));
    }
    table
}

/// Inbound headers. Non-string values are skipped.
fn from_field_table(table: Option<&FieldTable>) -> HeaderCarrier {
    table
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    let value = match value {
                        AMQPValue::LongString(s) => {
                            std::str::from_utf8(s.as_bytes()).ok()?.to_string()
                        }
                        AMQPValue::ShortString(s) => s.as_str().to_string(),
                        _ => return None,
                    };
                    Some((key.as_str().to_string(), value))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_conversion_round_trip() {
        let mut carrier = HeaderCarrier::new();
        carrier.set(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        );
        carrier.set("baggage", "tenant=alpha");

        let table = to_field_table(carrier.clone());
        assert_eq!(table.inner().len(), 2);

        let back = from_field_table(Some(&table));
        assert_eq!(back, carrier);
    }

    #[test]
    fn test_non_string_headers_are_skipped() {
        let mut table = FieldTable::default();
        table.insert("x-retries".into(), AMQPValue::LongUInt(3));
        table.insert("x-origin".into(), AMQPValue::ShortString("api".into()));

        let carrier = from_field_table(Some(&table));
        assert_eq!(carrier.get("x-retries"), "");
        assert_eq!(carrier.get("x-origin"), "api");
        assert_eq!(carrier.len(), 1);
    }

    #[test]
    fn test_missing_header_table_is_empty_carrier() {
        assert!(from_field_table(None).is_empty());
    }
}
