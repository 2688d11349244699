//! Real-time push channel.
//!
//! Unifies room/direct addressing and one-way server-push streaming behind
//! one registry of long-lived client connections. Admission is capped;
//! every connection owns a bounded outbound queue and a slow consumer is
//! dropped-from, never waited-on. Two owned background loops run per
//! channel: a heartbeat loop pinging active connections and a cleanup loop
//! evicting idle ones. Both observe a shutdown signal and are joined on
//! stop.

pub mod connection;
pub mod frame;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PushSettings;
use crate::message::Message;
use crate::utils::BusError;

pub use connection::{Connection, PushOutcome};
pub use frame::{
    EVENT_CONNECTED, EVENT_PING, EVENT_SUBSCRIBED, EVENT_UNSUBSCRIBED, Frame,
};

#[derive(Debug, Default)]
pub struct PushStats {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_dropped: AtomicU64,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<String, Arc<Connection>>,
    topics: HashMap<String, HashSet<String>>,
    rooms: HashMap<String, HashSet<String>>,
}

impl Registry {
    fn forget(&mut self, client_id: &str) {
        self.topics.retain(|_, members| {
            members.remove(client_id);
            !members.is_empty()
        });
        self.rooms.retain(|_, members| {
            members.remove(client_id);
            !members.is_empty()
        });
    }
}

pub struct PushChannel {
    settings: PushSettings,
    registry: RwLock<Registry>,
    stats: PushStats,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl PushChannel {
    pub fn new(settings: PushSettings) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            settings,
            registry: RwLock::new(Registry::default()),
            stats: PushStats::default(),
            running: AtomicBool::new(false),
            shutdown,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Admit a new client. Fails immediately when the channel is at
    /// capacity; an existing connection with the same id is replaced. The
    /// returned receiver is handed to the transport to drain.
    pub async fn connect(
        &self,
        client_id: &str,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<mpsc::Receiver<Frame>, BusError> {
        let mut registry = self.registry.write().await;

        if !registry.connections.contains_key(client_id)
            && registry.connections.len() >= self.settings.max_connections
        {
            warn!(client_id, "push connection rejected: at capacity");
            return Err(BusError::ConnectionCapacityExceeded {
                max: self.settings.max_connections,
            });
        }

        if let Some(previous) = registry.connections.remove(client_id) {
            debug!(client_id, "replacing existing push connection");
            previous.close();
            registry.forget(client_id);
            self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        }

        let (conn, receiver) = Connection::new(client_id.to_string(), metadata, self.settings.queue_size);
        let conn = Arc::new(conn);
        registry.connections.insert(client_id.to_string(), conn.clone());
        drop(registry);

        self.stats.connections_created.fetch_add(1, Ordering::Relaxed);

        let hello = Frame::new(
            EVENT_CONNECTED,
            json!({
                "client_id": client_id,
                "server_time": Utc::now().to_rfc3339(),
                "ping_interval": self.settings.ping_interval_secs,
            }),
        );
        self.push_frame(&conn, hello);

        info!(client_id, "push client connected");
        Ok(receiver)
    }

    /// Tear down a connection and release its topic and room membership.
    /// Idempotent: the close guard fires exactly once per connection.
    pub async fn disconnect(&self, client_id: &str) -> bool {
        let mut registry = self.registry.write().await;
        let Some(conn) = registry.connections.remove(client_id) else {
            return false;
        };
        registry.forget(client_id);
        drop(registry);

        conn.close();
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        info!(client_id, "push client disconnected");
        true
    }

    pub async fn subscribe_client(&self, client_id: &str, topic: &str) -> Result<(), BusError> {
        let mut registry = self.registry.write().await;
        let Some(conn) = registry.connections.get(client_id).cloned() else {
            return Err(BusError::UnknownClient(client_id.to_string()));
        };
        registry
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(client_id.to_string());
        drop(registry);

        conn.add_subscription(topic);
        self.push_frame(
            &conn,
            Frame::new(
                EVENT_SUBSCRIBED,
                json!({ "topic": topic, "timestamp": Utc::now().to_rfc3339() }),
            ),
        );
        debug!(client_id, topic, "push client subscribed");
        Ok(())
    }

    pub async fn unsubscribe_client(&self, client_id: &str, topic: &str) -> Result<(), BusError> {
        let mut registry = self.registry.write().await;
        let Some(conn) = registry.connections.get(client_id).cloned() else {
            return Err(BusError::UnknownClient(client_id.to_string()));
        };
        if let Some(members) = registry.topics.get_mut(topic) {
            members.remove(client_id);
            if members.is_empty() {
                registry.topics.remove(topic);
            }
        }
        drop(registry);

        conn.remove_subscription(topic);
        self.push_frame(
            &conn,
            Frame::new(
                EVENT_UNSUBSCRIBED,
                json!({ "topic": topic, "timestamp": Utc::now().to_rfc3339() }),
            ),
        );
        debug!(client_id, topic, "push client unsubscribed");
        Ok(())
    }

    pub async fn join_room(&self, client_id: &str, room: &str) -> Result<(), BusError> {
        let mut registry = self.registry.write().await;
        if !registry.connections.contains_key(client_id) {
            return Err(BusError::UnknownClient(client_id.to_string()));
        }
        registry
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(client_id.to_string());
        Ok(())
    }

    pub async fn leave_room(&self, client_id: &str, room: &str) -> Result<(), BusError> {
        let mut registry = self.registry.write().await;
        if let Some(members) = registry.rooms.get_mut(room) {
            members.remove(client_id);
            if members.is_empty() {
                registry.rooms.remove(room);
            }
        }
        Ok(())
    }

    /// Fan a message out to every subscriber of its topic with a
    /// non-blocking push per recipient. Zero subscribers is success with no
    /// recipients; a full queue drops the frame and counts it.
    pub async fn publish_message(&self, message: &Message) -> Result<usize, BusError> {
        let frame = Frame::from_message(message)?;

        let targets: Vec<Arc<Connection>> = {
            let registry = self.registry.read().await;
            match registry.topics.get(&message.topic) {
                None => Vec::new(),
                Some(members) => members
                    .iter()
                    .filter_map(|id| registry.connections.get(id).cloned())
                    .collect(),
            }
        };

        if targets.is_empty() {
            debug!(topic = %message.topic, "no push subscribers");
            return Ok(0);
        }

        let mut delivered = 0;
        let mut stale = Vec::new();
        for conn in &targets {
            match self.push_frame(conn, frame.clone()) {
                PushOutcome::Queued => delivered += 1,
                PushOutcome::Dropped => {}
                PushOutcome::Closed => stale.push(conn.client_id.clone()),
            }
        }
        for client_id in stale {
            self.disconnect(&client_id).await;
        }

        debug!(
            topic = %message.topic,
            delivered,
            total = targets.len(),
            "push fan-out complete"
        );
        Ok(delivered)
    }

    /// Direct push to one client.
    pub async fn send_to_client(&self, client_id: &str, frame: Frame) -> Result<PushOutcome, BusError> {
        let conn = {
            let registry = self.registry.read().await;
            registry
                .connections
                .get(client_id)
                .cloned()
                .ok_or_else(|| BusError::UnknownClient(client_id.to_string()))?
        };
        Ok(self.push_frame(&conn, frame))
    }

    /// Broadcast a frame to every connection except the excluded ones.
    /// Returns the number of queues the frame actually reached.
    pub async fn broadcast(&self, frame: Frame, exclude: &[&str]) -> usize {
        let targets: Vec<Arc<Connection>> = {
            let registry = self.registry.read().await;
            registry
                .connections
                .values()
                .filter(|c| !exclude.contains(&c.client_id.as_str()))
                .cloned()
                .collect()
        };
        targets
            .iter()
            .filter(|c| self.push_frame(c, frame.clone()) == PushOutcome::Queued)
            .count()
    }

    /// Broadcast to one room's members.
    pub async fn broadcast_to_room(
        &self,
        room: &str,
        frame: Frame,
        exclude: Option<&str>,
    ) -> usize {
        let targets: Vec<Arc<Connection>> = {
            let registry = self.registry.read().await;
            match registry.rooms.get(room) {
                None => Vec::new(),
                Some(members) => members
                    .iter()
                    .filter(|id| Some(id.as_str()) != exclude)
                    .filter_map(|id| registry.connections.get(id).cloned())
                    .collect(),
            }
        };
        targets
            .iter()
            .filter(|c| self.push_frame(c, frame.clone()) == PushOutcome::Queued)
            .count()
    }

    /// Transport hook: note inbound client activity for idle eviction.
    pub async fn record_activity(&self, client_id: &str) {
        let registry = self.registry.read().await;
        if let Some(conn) = registry.connections.get(client_id) {
            conn.touch();
        }
    }

    fn push_frame(&self, conn: &Connection, frame: Frame) -> PushOutcome {
        let outcome = conn.try_push(frame);
        match outcome {
            PushOutcome::Queued => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Dropped => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(client_id = %conn.client_id, "outbound queue full, frame dropped");
            }
            PushOutcome::Closed => {}
        }
        outcome
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }

    pub async fn topic_subscribers(&self, topic: &str) -> Vec<String> {
        let registry = self.registry.read().await;
        registry
            .topics
            .get(topic)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn connection(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.registry.read().await.connections.get(client_id).cloned()
    }

    pub fn stats(&self) -> &PushStats {
        &self.stats
    }

    pub fn dropped_frames(&self) -> u64 {
        self.stats.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn health_check(&self) -> Result<(), BusError> {
        if !self.is_running() {
            return Err(BusError::BrokerUnavailable(
                "push channel loops not running".to_string(),
            ));
        }
        Ok(())
    }

    /// Start the heartbeat and cleanup loops. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(heartbeat_loop(
            self.clone(),
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(cleanup_loop(
            self.clone(),
            self.shutdown.subscribe(),
        )));
        info!(
            max_connections = self.settings.max_connections,
            "push channel started"
        );
    }

    /// Flip the shutdown signal, join both loops, then release every
    /// connection.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(true);

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        drop(tasks);
        let _ = self.shutdown.send(false);

        let clients: Vec<String> = {
            let registry = self.registry.read().await;
            registry.connections.keys().cloned().collect()
        };
        for client_id in clients {
            self.disconnect(&client_id).await;
        }
        info!("push channel stopped");
    }
}

async fn heartbeat_loop(channel: Arc<PushChannel>, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_secs(channel.settings.ping_interval_secs);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let targets: Vec<Arc<Connection>> = {
            let registry = channel.registry.read().await;
            registry.connections.values().cloned().collect()
        };
        let mut stale = Vec::new();
        for conn in targets {
            if channel.push_frame(&conn, Frame::ping()) == PushOutcome::Closed {
                stale.push(conn.client_id.clone());
            }
        }
        for client_id in stale {
            channel.disconnect(&client_id).await;
        }
    }
    debug!("heartbeat loop exited");
}

async fn cleanup_loop(channel: Arc<PushChannel>, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_secs(channel.settings.cleanup_interval_secs);
    let timeout_ms = channel.settings.connection_timeout_secs as i64 * 1000;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let expired: Vec<String> = {
            let registry = channel.registry.read().await;
            registry
                .connections
                .values()
                .filter(|c| c.is_closed() || c.idle_millis() > timeout_ms)
                .map(|c| c.client_id.clone())
                .collect()
        };
        for client_id in expired {
            info!(client_id, "evicting idle push connection");
            channel.disconnect(&client_id).await;
        }
    }
    debug!("cleanup loop exited");
}
