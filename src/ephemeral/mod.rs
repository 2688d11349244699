//! In-process broker for fire-and-forget messaging.
//!
//! Published messages go through a single consumption loop that fans each
//! one out to the topic's subscribers. Failing deliveries are retried
//! inline with a fixed backoff; messages that exhaust their retries are
//! dead-lettered. With persistence enabled every accepted message is also
//! appended to a capped on-disk replay log.

pub mod topic;


use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EphemeralSettings;
use crate::message::{Message, MessageFilter, MessageHandler};
use crate::persistence::ReplayLog;
use crate::utils::{BusError, ensure_topic};

pub use topic::{Subscription, TopicChannel};

/// Delivery counters, updated by the consumption loop.
#[derive(Debug, Default)]
pub struct EphemeralStats {
    pub published: AtomicU64,
    pub delivered: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
}

pub struct EphemeralBroker {
    settings: EphemeralSettings,
    topics: RwLock<HashMap<String, TopicChannel>>,
    replay: RwLock<Option<Arc<ReplayLog>>>,
    inbox_tx: mpsc::UnboundedSender<Message>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    stats: EphemeralStats,
    connected: AtomicBool,
    consuming: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EphemeralBroker {
    pub fn new(settings: EphemeralSettings) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            settings,
            topics: RwLock::new(HashMap::new()),
            replay: RwLock::new(None),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            stats: EphemeralStats::default(),
            connected: AtomicBool::new(false),
            consuming: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bring the broker up. Opens the replay store when persistence is on.
    /// Connecting twice is a no-op.
    pub async fn connect(&self) -> Result<(), BusError> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.settings.persistence {
            let log = ReplayLog::open(
                &self.settings.store_path,
                self.settings.replay_ttl_secs,
                self.settings.replay_capacity,
            )?;
            *self.replay.write().await = Some(Arc::new(log));
        }
        self.connected.store(true, Ordering::Release);
        info!(
            persistence = self.settings.persistence,
            "ephemeral broker connected"
        );
        Ok(())
    }

    /// Stop consuming and flush the replay store. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        self.stop_consuming().await;
        if let Some(log) = self.replay.write().await.take() {
            if let Err(e) = log.flush() {
                warn!("replay store flush on disconnect failed: {e}");
            }
        }
        info!("ephemeral broker disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_consuming(&self) -> bool {
        self.consuming.load(Ordering::Acquire)
    }

    /// Accept a message onto the bus. Delivery happens on the consumption
    /// loop; the call returns as soon as the message is enqueued (and, with
    /// persistence on, logged).
    pub async fn publish_message(&self, message: Message) -> Result<Uuid, BusError> {
        if !self.is_connected() {
            return Err(BusError::BrokerUnavailable(
                "ephemeral broker is not connected".into(),
            ));
        }
        ensure_topic(&message.topic)?;
        if message.is_expired() {
            return Err(BusError::MessageExpired { id: message.id });
        }

        if let Some(log) = self.replay.read().await.as_ref() {
            log.append(&message)?;
        }

        let id = message.id;
        self.inbox_tx
            .send(message)
            .map_err(|_| BusError::BrokerUnavailable("consumption inbox is closed".into()))?;
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Register a handler on a topic. The topic channel is created on the
    /// first subscription and torn down when the last one is removed.
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
        filters: Vec<MessageFilter>,
    ) -> Result<Uuid, BusError> {
        ensure_topic(topic)?;
        let mut topics = self.topics.write().await;
        let opened = !topics.contains_key(topic);
        let channel = topics.entry(topic.to_string()).or_default();
        let id = channel.subscribe(handler, filters);
        if opened {
            info!(topic, "topic channel opened");
        }
        debug!(topic, subscription = %id, subscribers = channel.len(), "subscribed");
        Ok(id)
    }

    /// Remove a subscription. Returns false when the id was not registered
    /// on the topic.
    pub async fn unsubscribe(&self, topic: &str, subscription: &Uuid) -> bool {
        let mut topics = self.topics.write().await;
        let Some(channel) = topics.get_mut(topic) else {
            return false;
        };
        let removed = channel.unsubscribe(subscription);
        if removed && channel.is_empty() {
            topics.remove(topic);
            info!(topic, "topic channel closed");
        }
        removed
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(TopicChannel::len)
            .unwrap_or(0)
    }

    /// Start the consumption loop plus the store maintenance loop.
    /// Idempotent; a second call while running does nothing.
    pub async fn start_consuming(self: &Arc<Self>) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::BrokerUnavailable(
                "ephemeral broker is not connected".into(),
            ));
        }
        if self.consuming.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(inbox) = self.inbox_rx.lock().await.take() else {
            self.consuming.store(false, Ordering::Release);
            return Err(BusError::BrokerUnavailable(
                "consumption loop already owns the inbox".into(),
            ));
        };

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(consumption_loop(
            Arc::clone(self),
            inbox,
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(maintenance_loop(
            Arc::clone(self),
            self.shutdown.subscribe(),
        )));
        info!("ephemeral consumption started");
        Ok(())
    }

    /// Signal the loops and wait for them to finish. Messages still queued
    /// in the inbox survive and are delivered on the next start.
    pub async fn stop_consuming(&self) {
        if !self.consuming.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                error!("ephemeral task join failed: {e}");
            }
        }
        let _ = self.shutdown.send(false);
        info!("ephemeral consumption stopped");
    }

    /// Read back logged messages for a topic, oldest first.
    pub async fn replay(
        &self,
        topic: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, BusError> {
        match self.replay.read().await.as_ref() {
            Some(log) => log.replay(topic, since, limit),
            None => Ok(Vec::new()),
        }
    }

    /// Messages that exhausted their retries on a topic.
    pub async fn dead_letters(&self, topic: &str) -> Result<Vec<Message>, BusError> {
        match self.replay.read().await.as_ref() {
            Some(log) => log.dead_letters(topic),
            None => Ok(Vec::new()),
        }
    }

    pub fn stats(&self) -> &EphemeralStats {
        &self.stats
    }

    pub async fn health_check(&self) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::BrokerUnavailable(
                "ephemeral broker is not connected".into(),
            ));
        }
        // With persistence on, a flush proves the store is writable.
        if let Some(log) = self.replay.read().await.as_ref() {
            log.flush()?;
        }
        Ok(())
    }

    /// Fan a message out to every subscription on its topic.
    async fn dispatch(&self, message: Message) {
        let subscriptions = {
            let topics = self.topics.read().await;
            match topics.get(&message.topic) {
                Some(channel) => channel.snapshot(),
                None => Vec::new(),
            }
        };
        if subscriptions.is_empty() {
            debug!(topic = %message.topic, "no subscribers, message dropped");
            return;
        }
        for subscription in subscriptions {
            self.deliver(&subscription, message.clone()).await;
        }
    }

    /// Drive one message through one subscription, retrying inline until it
    /// completes, exhausts its retries, or expires.
    async fn deliver(&self, subscription: &Subscription, mut message: Message) {
        if !subscription.accepts(&message) {
            debug!(id = %message.id, topic = %message.topic, "filtered out");
            return;
        }
        loop {
            if let Err(e) = message.mark_processing() {
                warn!(id = %message.id, "message rejected before processing: {e}");
                self.dead_letter(message).await;
                return;
            }
            match (subscription.handler)(message.clone()).await {
                Ok(()) => {
                    if message.mark_completed().is_ok() {
                        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    return;
                }
                Err(e) => {
                    let _ = message.mark_failed(e.to_string());
                    if message.can_retry() && message.mark_retry().is_ok() {
                        self.stats.retried.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            id = %message.id,
                            attempt = message.retry_count,
                            "delivery failed, retrying: {e}"
                        );
                        tokio::time::sleep(Duration::from_millis(self.settings.retry_backoff_ms))
                            .await;
                        continue;
                    }
                    warn!(id = %message.id, topic = %message.topic, "retries exhausted: {e}");
                    self.dead_letter(message).await;
                    return;
                }
            }
        }
    }

    async fn dead_letter(&self, mut message: Message) {
        let _ = message.mark_dead_letter();
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        if let Some(log) = self.replay.read().await.as_ref() {
            if let Err(e) = log.append_dead_letter(&message) {
                error!(id = %message.id, "failed to record dead letter: {e}");
            }
        }
    }
}

impl std::fmt::Debug for EphemeralBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralBroker")
            .field("connected", &self.is_connected())
            .field("consuming", &self.is_consuming())
            .finish()
    }
}

/// The single loop that drains the inbox. On shutdown the receiver is put
/// back so a later `start_consuming` picks up where it left off.
async fn consumption_loop(
    broker: Arc<EphemeralBroker>,
    mut inbox: mpsc::UnboundedReceiver<Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            received = inbox.recv() => {
                match received {
                    Some(message) => broker.dispatch(message).await,
                    None => break,
                }
            }
        }
    }
    *broker.inbox_rx.lock().await = Some(inbox);
}

/// Periodically trims expired replay entries.
async fn maintenance_loop(broker: Arc<EphemeralBroker>, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_millis(broker.settings.poll_interval_ms.max(1));
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(interval) => {
                if let Some(log) = broker.replay.read().await.as_ref() {
                    if let Err(e) = log.sweep() {
                        warn!("replay sweep failed: {e}");
                    }
                }
            }
        }
    }
}
