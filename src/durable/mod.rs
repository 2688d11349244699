//! Durable broker over AMQP.
//!
//! Messages are published persistently to a topic exchange and consumed from
//! durable queues with bounded prefetch. Every declared queue carries
//! dead-letter wiring: a rejected delivery is routed through the
//! `{exchange}_dlx` exchange into a per-topic `dlq_{topic}` queue instead of
//! being lost.

pub mod amqp;

#[cfg(test)]
pub mod testing;

#[cfg(test)]
mod tests;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DurableSettings;
use crate::message::{Envelope, Message, MessageFilter, MessageHandler};
use crate::utils::{BusError, ensure_topic};

pub use amqp::{AmqpDelivery, AmqpTransport, LapinTransport, PublishProps, QueueSpec};

/// Highest AMQP priority the broker declares on its queues; message
/// priorities map into 1..=4 within this range.
const QUEUE_MAX_PRIORITY: u8 = 10;

struct ConsumerHandle {
    topic: String,
    queue: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct DurableBroker {
    settings: DurableSettings,
    transport: Arc<dyn AmqpTransport>,
    consumers: RwLock<HashMap<Uuid, ConsumerHandle>>,
    /// Queues this broker has declared, for `list_queues`. AMQP has no
    /// portable queue enumeration, so the broker tracks its own.
    queues: RwLock<BTreeSet<String>>,
}

impl DurableBroker {
    pub fn new(settings: DurableSettings) -> Self {
        Self::with_transport(settings, Arc::new(LapinTransport::new()))
    }

    /// Build against an explicit transport. Tests use this to substitute an
    /// in-memory double for the wire.
    pub fn with_transport(settings: DurableSettings, transport: Arc<dyn AmqpTransport>) -> Self {
        Self {
            settings,
            transport,
            consumers: RwLock::new(HashMap::new()),
            queues: RwLock::new(BTreeSet::new()),
        }
    }

    fn dead_letter_exchange(&self) -> String {
        format!("{}_dlx", self.settings.exchange)
    }

    /// Open the connection and declare the exchange pair. Idempotent.
    pub async fn connect(&self) -> Result<(), BusError> {
        if self.transport.is_open().await {
            return Ok(());
        }
        self.transport
            .open(&self.settings.url, self.settings.prefetch)
            .await?;
        self.transport
            .declare_exchange(&self.settings.exchange)
            .await?;
        self.transport
            .declare_exchange(&self.dead_letter_exchange())
            .await?;
        info!(exchange = %self.settings.exchange, "durable broker connected");
        Ok(())
    }

    /// Stop every consumer, then close the connection. Safe to call
    /// repeatedly.
    pub async fn disconnect(&self) {
        let handles: Vec<ConsumerHandle> = {
            let mut consumers = self.consumers.write().await;
            consumers.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            stop_consumer(handle).await;
        }
        if let Err(e) = self.transport.close().await {
            warn!("amqp close failed: {e}");
        }
        info!("durable broker disconnected");
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.is_open().await
    }

    /// Publish a message persistently. The routing key defaults to the
    /// topic unless the message overrides it.
    pub async fn publish_message(&self, message: &Message) -> Result<Uuid, BusError> {
        if !self.transport.is_open().await {
            return Err(BusError::BrokerUnavailable(
                "durable broker is not connected".into(),
            ));
        }
        ensure_topic(&message.topic)?;
        if message.is_expired() {
            return Err(BusError::MessageExpired { id: message.id });
        }

        let body = Envelope::encode(message)?;
        let props = PublishProps {
            persistent: true,
            priority: Some(message.priority.as_amqp()),
            message_id: Some(message.id.to_string()),
            correlation_id: message.correlation_id.clone(),
            reply_to: message.reply_to.clone(),
            expiration_ms: message.ttl.map(|ttl| ttl.as_millis() as u64),
        };
        self.transport
            .publish(
                &self.settings.exchange,
                message.effective_routing_key(),
                body,
                props,
            )
            .await?;
        debug!(id = %message.id, topic = %message.topic, "published durable message");
        Ok(message.id)
    }

    /// Consume a topic through a durable queue. A fresh queue named
    /// `queue_{topic}_{id}` is declared unless `queue` names an existing
    /// one to share. Returns the subscription id.
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
        filters: Vec<MessageFilter>,
        queue: Option<String>,
    ) -> Result<Uuid, BusError> {
        if !self.transport.is_open().await {
            return Err(BusError::BrokerUnavailable(
                "durable broker is not connected".into(),
            ));
        }
        ensure_topic(topic)?;

        let id = Uuid::new_v4();
        let queue_name = queue.unwrap_or_else(|| format!("queue_{topic}_{}", id.simple()));
        let dlq_routing_key = format!("dlq.{topic}");

        let spec = QueueSpec {
            dead_letter_exchange: Some(self.dead_letter_exchange()),
            dead_letter_routing_key: Some(dlq_routing_key.clone()),
            max_priority: Some(QUEUE_MAX_PRIORITY),
            message_ttl_ms: self
                .settings
                .message_ttl_secs
                .map(|secs| (secs * 1000) as u32),
            ..QueueSpec::durable(queue_name.clone())
        };
        self.transport.declare_queue(&spec).await?;
        self.transport
            .bind_queue(&queue_name, &self.settings.exchange, topic)
            .await?;

        // Per-topic dead-letter queue, fed by the DLX.
        let dlq_name = format!("dlq_{topic}");
        self.transport
            .declare_queue(&QueueSpec::durable(dlq_name.clone()))
            .await?;
        self.transport
            .bind_queue(&dlq_name, &self.dead_letter_exchange(), &dlq_routing_key)
            .await?;
        {
            let mut queues = self.queues.write().await;
            queues.insert(queue_name.clone());
            queues.insert(dlq_name);
        }

        let deliveries = self
            .transport
            .consume(&queue_name, &format!("consumer_{}", id.simple()))
            .await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(consumer_loop(deliveries, handler, filters, shutdown_rx));
        self.consumers.write().await.insert(
            id,
            ConsumerHandle {
                topic: topic.to_string(),
                queue: queue_name.clone(),
                shutdown,
                task,
            },
        );
        info!(topic, queue = %queue_name, subscription = %id, "durable consumer started");
        Ok(id)
    }

    /// Cancel a consumer. The durable queue stays behind so messages keep
    /// accumulating for the next subscriber.
    pub async fn unsubscribe(&self, subscription: &Uuid) -> bool {
        let Some(handle) = self.consumers.write().await.remove(subscription) else {
            return false;
        };
        info!(topic = %handle.topic, queue = %handle.queue, "durable consumer stopping");
        stop_consumer(handle).await;
        true
    }

    pub async fn consumer_count(&self) -> usize {
        self.consumers.read().await.len()
    }

    /// Declare a standalone durable queue bound to a topic, without
    /// attaching a consumer.
    pub async fn create_queue(&self, name: &str, topic: &str) -> Result<(), BusError> {
        ensure_topic(topic)?;
        let spec = QueueSpec {
            dead_letter_exchange: Some(self.dead_letter_exchange()),
            dead_letter_routing_key: Some(format!("dlq.{topic}")),
            max_priority: Some(QUEUE_MAX_PRIORITY),
            ..QueueSpec::durable(name)
        };
        self.transport.declare_queue(&spec).await?;
        self.transport
            .bind_queue(name, &self.settings.exchange, topic)
            .await?;
        self.queues.write().await.insert(name.to_string());
        Ok(())
    }

    pub async fn delete_queue(&self, name: &str) -> Result<(), BusError> {
        self.transport.delete_queue(name).await?;
        self.queues.write().await.remove(name);
        Ok(())
    }

    pub async fn purge_queue(&self, name: &str) -> Result<(), BusError> {
        self.transport.purge_queue(name).await
    }

    /// Queue names this broker has declared over its lifetime.
    pub async fn list_queues(&self) -> Vec<String> {
        self.queues.read().await.iter().cloned().collect()
    }

    /// Liveness: the connection must be open and the channel usable.
    pub async fn health_check(&self) -> Result<(), BusError> {
        if !self.transport.is_open().await {
            return Err(BusError::BrokerUnavailable(
                "durable broker is not connected".into(),
            ));
        }
        self.transport.probe().await
    }
}

impl std::fmt::Debug for DurableBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableBroker")
            .field("exchange", &self.settings.exchange)
            .finish()
    }
}

async fn stop_consumer(handle: ConsumerHandle) {
    let _ = handle.shutdown.send(true);
    if let Err(e) = handle.task.await {
        error!("consumer task join failed: {e}");
    }
}

/// Settles each delivery exactly once: ack on success or filtered-out,
/// reject (to the DLX) on undecodable bodies and handler failures. Requeue
/// is never requested; redelivery policy lives in the queue's dead-letter
/// wiring.
async fn consumer_loop(
    mut deliveries: tokio::sync::mpsc::Receiver<AmqpDelivery>,
    handler: MessageHandler,
    filters: Vec<MessageFilter>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let delivery = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            received = deliveries.recv() => {
                match received {
                    Some(d) => d,
                    None => break,
                }
            }
        };

        let mut message = match Envelope::decode(&delivery.body) {
            Ok(m) => m,
            Err(e) => {
                warn!("rejecting undecodable delivery: {e}");
                if let Err(e) = delivery.ack.reject().await {
                    error!("reject failed: {e}");
                }
                continue;
            }
        };

        if !filters.iter().all(|f| f(&message)) {
            debug!(id = %message.id, "filtered out, acknowledging");
            if let Err(e) = delivery.ack.ack().await {
                error!("ack failed: {e}");
            }
            continue;
        }

        if let Err(e) = message.mark_processing() {
            warn!(id = %message.id, "rejecting delivery: {e}");
            if let Err(e) = delivery.ack.reject().await {
                error!("reject failed: {e}");
            }
            continue;
        }

        match (handler)(message.clone()).await {
            Ok(()) => {
                let _ = message.mark_completed();
                if let Err(e) = delivery.ack.ack().await {
                    error!("ack failed: {e}");
                }
            }
            Err(e) => {
                warn!(id = %message.id, topic = %message.topic, "handler failed: {e}");
                let _ = message.mark_failed(e.to_string());
                if let Err(e) = delivery.ack.reject().await {
                    error!("reject failed: {e}");
                }
            }
        }
    }
}
