//! In-memory broker channel for standalone mode.
//!
//! Queues live in process memory and behave like durable AMQP queues routed
//! through the default exchange: messages published to an undeclared queue
//! are dropped, messages published before a consumer attaches wait in the
//! queue. Each queue accepts a single consumer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::{
    AckPolicy, Acknowledger, BusError, DeliveryStream, HeaderCarrier, InboundMessage,
    MessageChannel, Result,
};

#[derive(Clone)]
struct Envelope {
    body: Vec<u8>,
    headers: HeaderCarrier,
}

#[derive(Default)]
struct Queue {
    messages: VecDeque<Envelope>,
    notify: Arc<Notify>,
    consumer: Option<String>,
    acked: usize,
    requeued: usize,
}

#[derive(Default)]
struct Shared {
    queues: Mutex<HashMap<String, Queue>>,
    failing_declares: Mutex<HashSet<String>>,
    fail_on_publish: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    fn queues(&self) -> MutexGuard<'_, HashMap<String, Queue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self, queue: &str) -> Option<Envelope> {
        self.queues()
            .get_mut(queue)
            .and_then(|q| q.messages.pop_front())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

/// In-process broker handle.
#[derive(Default)]
pub struct MemoryChannel {
    shared: Arc<Shared>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        info!("In-memory broker initialized");
        Self::default()
    }

    /// Make every future declaration of `queue` fail.
    pub fn fail_declare(&self, queue: impl Into<String>) {
        self.shared
            .failing_declares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue.into());
    }

    pub fn set_fail_on_publish(&self, fail: bool) {
        self.shared.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Messages waiting in `queue`, or `None` if it was never declared.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.shared.queues().get(queue).map(|q| q.messages.len())
    }

    /// Waiting messages as (body, headers), oldest first.
    pub fn peek(&self, queue: &str) -> Vec<(Vec<u8>, HeaderCarrier)> {
        self.shared
            .queues()
            .get(queue)
            .map(|q| {
                q.messages
                    .iter()
                    .map(|e| (e.body.clone(), e.headers.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Explicit acknowledgements received on `queue`.
    pub fn acked_count(&self, queue: &str) -> usize {
        self.shared.queues().get(queue).map_or(0, |q| q.acked)
    }

    /// Deliveries returned to `queue` by a requeueing nack.
    pub fn requeued_count(&self, queue: &str) -> usize {
        self.shared.queues().get(queue).map_or(0, |q| q.requeued)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.shared.ensure_open()?;

        let failing = self
            .shared
            .failing_declares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(queue);
        if failing {
            return Err(BusError::Declare {
                queue: queue.to_string(),
                message: "declaration refused".to_string(),
            });
        }

        self.shared.queues().entry(queue.to_string()).or_default();
        debug!(queue = %queue, "Declared queue");
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8], headers: HeaderCarrier) -> Result<()> {
        self.shared.ensure_open()?;

        if self.shared.fail_on_publish.load(Ordering::SeqCst) {
            return Err(BusError::Publish(format!(
                "Failed to publish to '{}': publish refused",
                queue
            )));
        }

        let mut queues = self.shared.queues();
        match queues.get_mut(queue) {
            Some(q) => {
                q.messages.push_back(Envelope {
                    body: payload.to_vec(),
                    headers,
                });
                q.notify.notify_one();
            }
            None => debug!(queue = %queue, "No such queue, message dropped"),
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
        ack_policy: AckPolicy,
    ) -> Result<DeliveryStream> {
        self.shared.ensure_open()?;

        let notify = {
            let mut queues = self.shared.queues();
            let q = queues
                .get_mut(queue)
                .ok_or_else(|| BusError::Subscribe(format!("Queue '{}' not declared", queue)))?;
            if let Some(existing) = &q.consumer {
                return Err(BusError::Subscribe(format!(
                    "Queue '{}' already consumed by '{}'",
                    queue, existing
                )));
            }
            q.consumer = Some(consumer_tag.to_string());
            q.notify.clone()
        };

        let cursor = Cursor {
            shared: self.shared.clone(),
            queue: queue.to_string(),
            notify,
            auto_ack: ack_policy.auto_ack(),
        };

        let deliveries = futures::stream::unfold(cursor, |cursor| async move {
            let message = cursor.next().await?;
            Some((Ok(message), cursor))
        });

        Ok(Box::pin(deliveries))
    }

    async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Wake every consumer so its stream observes the close.
        for q in self.shared.queues().values() {
            q.notify.notify_one();
        }
        info!("In-memory broker closed");
        Ok(())
    }
}

/// Read position of one subscription.
struct Cursor {
    shared: Arc<Shared>,
    queue: String,
    notify: Arc<Notify>,
    auto_ack: bool,
}

impl Cursor {
    async fn next(&self) -> Option<InboundMessage> {
        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(envelope) = self.shared.pop(&self.queue) {
                let acker = MemoryAcker {
                    shared: self.shared.clone(),
                    queue: self.queue.clone(),
                    envelope: envelope.clone(),
                    auto_ack: self.auto_ack,
                    settled: AtomicBool::new(false),
                };
                return Some(InboundMessage::new(
                    envelope.body,
                    envelope.headers,
                    Box::new(acker),
                ));
            }
            self.notify.notified().await;
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Some(q) = self.shared.queues().get_mut(&self.queue) {
            q.consumer = None;
        }
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    envelope: Envelope,
    auto_ack: bool,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BusError::Ack("delivery already settled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        if self.auto_ack {
            return Ok(());
        }
        self.settle()?;
        if let Some(q) = self.shared.queues().get_mut(&self.queue) {
            q.acked += 1;
        }
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        if self.auto_ack {
            return Ok(());
        }
        self.settle()?;
        if !requeue {
            debug!(queue = %self.queue, "Delivery rejected without requeue");
            return Ok(());
        }
        if let Some(q) = self.shared.queues().get_mut(&self.queue) {
            q.messages.push_front(self.envelope.clone());
            q.requeued += 1;
            q.notify.notify_one();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
