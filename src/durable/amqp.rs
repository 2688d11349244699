//! AMQP transport abstraction for production and testing.
//!
//! The broker talks to the wire through [`AmqpTransport`], so tests can swap
//! the real `lapin` connection for an in-memory double.

use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
    },
};
use futures_util::StreamExt;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

use crate::utils::BusError;

/// Queue declaration parameters, including the dead-letter wiring carried as
/// `x-` arguments on the declare.
#[derive(Debug, Clone, Default)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub max_priority: Option<u8>,
    pub message_ttl_ms: Option<u32>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            ..Self::default()
        }
    }
}

/// Per-message publish properties, mapped onto AMQP basic properties.
#[derive(Debug, Clone, Default)]
pub struct PublishProps {
    /// Delivery mode 2 (survive a broker restart).
    pub persistent: bool,
    pub priority: Option<u8>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Per-message TTL in milliseconds.
    pub expiration_ms: Option<u64>,
}

/// Acknowledgement handle for one delivery. Consuming the handle settles the
/// message exactly once.
#[async_trait]
pub trait DeliveryAck: Send {
    async fn ack(self: Box<Self>) -> Result<(), BusError>;
    /// Reject without requeue routes the message to the queue's DLX.
    async fn reject(self: Box<Self>) -> Result<(), BusError>;
}

/// One consumed message: the raw body plus its settlement handle.
pub struct AmqpDelivery {
    pub body: Vec<u8>,
    pub ack: Box<dyn DeliveryAck>,
}

/// Wire operations the durable broker needs. Implemented by
/// [`LapinTransport`] in production and by a recording double in tests.
#[async_trait]
pub trait AmqpTransport: Send + Sync {
    async fn open(&self, url: &str, prefetch: u16) -> Result<(), BusError>;
    async fn close(&self) -> Result<(), BusError>;
    async fn is_open(&self) -> bool;

    /// Declare a durable topic exchange.
    async fn declare_exchange(&self, name: &str) -> Result<(), BusError>;
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BusError>;
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BusError>;
    async fn delete_queue(&self, name: &str) -> Result<(), BusError>;
    async fn purge_queue(&self, name: &str) -> Result<(), BusError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        props: PublishProps,
    ) -> Result<(), BusError>;

    /// Start a consumer on a queue. Deliveries arrive on the returned
    /// channel; dropping the receiver cancels the consumer.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::Receiver<AmqpDelivery>, BusError>;

    /// Round-trip liveness probe against the broker.
    async fn probe(&self) -> Result<(), BusError>;
}

struct LapinState {
    connection: Connection,
    channel: Channel,
}

/// Production transport over a single `lapin` connection and channel.
#[derive(Default)]
pub struct LapinTransport {
    state: RwLock<Option<LapinState>>,
}

impl LapinTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clones the channel out of the lock so callers can await wire
    /// operations without holding the guard.
    async fn channel(&self) -> Result<Channel, BusError> {
        let state = self.state.read().await;
        match state.as_ref() {
            Some(s) => Ok(s.channel.clone()),
            None => Err(BusError::BrokerUnavailable(
                "amqp connection is not open".into(),
            )),
        }
    }
}

#[async_trait]
impl AmqpTransport for LapinTransport {
    async fn open(&self, url: &str, prefetch: u16) -> Result<(), BusError> {
        let mut state = self.state.write().await;
        if state.is_some() {
            return Ok(());
        }
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        *state = Some(LapinState {
            connection,
            channel,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        if let Some(state) = self.state.write().await.take() {
            state.channel.close(200, "bye").await?;
            state.connection.close(200, "bye").await?;
        }
        Ok(())
    }

    async fn is_open(&self) -> bool {
        match self.state.read().await.as_ref() {
            Some(state) => state.connection.status().connected(),
            None => false,
        }
    }

    async fn declare_exchange(&self, name: &str) -> Result<(), BusError> {
        self.channel()
            .await?
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BusError> {
        let mut args = FieldTable::default();
        if let Some(dlx) = &spec.dead_letter_exchange {
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(dlx.clone().into()),
            );
        }
        if let Some(key) = &spec.dead_letter_routing_key {
            args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(key.clone().into()),
            );
        }
        if let Some(max) = spec.max_priority {
            args.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(max));
        }
        if let Some(ttl) = spec.message_ttl_ms {
            args.insert("x-message-ttl".into(), AMQPValue::LongUInt(ttl));
        }

        self.channel()
            .await?
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                args,
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BusError> {
        self.channel()
            .await?
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BusError> {
        self.channel()
            .await?
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn purge_queue(&self, name: &str) -> Result<(), BusError> {
        self.channel()
            .await?
            .queue_purge(name, QueuePurgeOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        props: PublishProps,
    ) -> Result<(), BusError> {
        let mut properties =
            BasicProperties::default().with_content_type("application/json".into());
        if props.persistent {
            properties = properties.with_delivery_mode(2);
        }
        if let Some(priority) = props.priority {
            properties = properties.with_priority(priority);
        }
        if let Some(id) = props.message_id {
            properties = properties.with_message_id(id.into());
        }
        if let Some(correlation_id) = props.correlation_id {
            properties = properties.with_correlation_id(correlation_id.into());
        }
        if let Some(reply_to) = props.reply_to {
            properties = properties.with_reply_to(reply_to.into());
        }
        if let Some(ms) = props.expiration_ms {
            properties = properties.with_expiration(ms.to_string().into());
        }

        let confirm = self
            .channel()
            .await?
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?;
        // Second await resolves the publisher confirm.
        confirm.await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::Receiver<AmqpDelivery>, BusError> {
        let mut consumer = self
            .channel()
            .await?
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("amqp consumer stream error: {e}");
                        break;
                    }
                };
                let item = AmqpDelivery {
                    body: delivery.data.clone(),
                    ack: Box::new(LapinAck { delivery }),
                };
                if tx.send(item).await.is_err() {
                    debug!("consumer receiver dropped, stopping stream");
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn probe(&self) -> Result<(), BusError> {
        // Declare-and-delete of a throwaway queue proves the channel is
        // usable end to end.
        let spec = QueueSpec {
            name: format!("probe_{}", uuid::Uuid::new_v4()),
            durable: false,
            exclusive: true,
            auto_delete: true,
            ..QueueSpec::default()
        };
        self.declare_queue(&spec).await?;
        self.delete_queue(&spec.name).await
    }
}

struct LapinAck {
    delivery: lapin::message::Delivery,
}

#[async_trait]
impl DeliveryAck for LapinAck {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        self.delivery.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(self: Box<Self>) -> Result<(), BusError> {
        self.delivery
            .reject(BasicRejectOptions { requeue: false })
            .await?;
        Ok(())
    }
}
