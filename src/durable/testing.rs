//! In-memory [`AmqpTransport`] double.
//!
//! Records declarations, bindings, and publishes so tests can assert on the
//! wire traffic, and routes published bodies to consumers (or queue buffers)
//! so the consume path runs end to end without a broker. Rejected
//! deliveries are re-routed through the queue's dead-letter wiring, matching
//! what the real broker does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::amqp::{AmqpDelivery, AmqpTransport, DeliveryAck, PublishProps, QueueSpec};
use crate::utils::BusError;

#[derive(Debug, Clone)]
pub struct PublishedRecord {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub props: PublishProps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Rejected,
}

#[derive(Debug, Clone)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Default)]
struct MemoryState {
    open: bool,
    exchanges: Vec<String>,
    queues: HashMap<String, QueueSpec>,
    bindings: Vec<Binding>,
    published: Vec<PublishedRecord>,
    consumers: HashMap<String, mpsc::Sender<AmqpDelivery>>,
    /// Bodies routed to a queue nobody consumes yet.
    buffers: HashMap<String, Vec<Vec<u8>>>,
    settlements: Vec<Settlement>,
}

#[derive(Default)]
struct Core {
    state: Mutex<MemoryState>,
    fail_probe: AtomicBool,
    fail_open: AtomicBool,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Exact-match topic routing; enough for the keys the broker uses.
    fn route(self: &Arc<Self>, exchange: &str, routing_key: &str, body: &[u8]) {
        let targets: Vec<String> = self
            .lock()
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect();
        for queue in targets {
            self.deliver(&queue, body.to_vec());
        }
    }

    fn deliver(self: &Arc<Self>, queue: &str, body: Vec<u8>) {
        let sender = self.lock().consumers.get(queue).cloned();
        match sender {
            Some(tx) => {
                let delivery = AmqpDelivery {
                    body: body.clone(),
                    ack: Box::new(MemoryAck {
                        core: Arc::clone(self),
                        queue: queue.to_string(),
                        body: body.clone(),
                    }),
                };
                if tx.try_send(delivery).is_err() {
                    // Consumer gone or saturated; park the body instead.
                    self.lock()
                        .buffers
                        .entry(queue.to_string())
                        .or_default()
                        .push(body);
                }
            }
            None => {
                self.lock()
                    .buffers
                    .entry(queue.to_string())
                    .or_default()
                    .push(body);
            }
        }
    }
}

#[derive(Default, Clone)]
pub struct MemoryTransport {
    core: Arc<Core>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `probe` fail while the connection stays open.
    pub fn set_probe_failure(&self, fail: bool) {
        self.core.fail_probe.store(fail, Ordering::SeqCst);
    }

    /// Make `open` fail, simulating an unreachable broker.
    pub fn set_connect_failure(&self, fail: bool) {
        self.core.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn declared_exchanges(&self) -> Vec<String> {
        self.core.lock().exchanges.clone()
    }

    pub fn queue_spec(&self, name: &str) -> Option<QueueSpec> {
        self.core.lock().queues.get(name).cloned()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.core.lock().queues.keys().cloned().collect()
    }

    pub fn bindings_for(&self, queue: &str) -> Vec<(String, String)> {
        self.core
            .lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| (b.exchange.clone(), b.routing_key.clone()))
            .collect()
    }

    pub fn published(&self) -> Vec<PublishedRecord> {
        self.core.lock().published.clone()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.core.lock().settlements.clone()
    }

    /// Bodies sitting in a queue with no consumer attached.
    pub fn buffered(&self, queue: &str) -> Vec<Vec<u8>> {
        self.core
            .lock()
            .buffers
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Push a raw body straight at a queue, bypassing exchange routing.
    /// Used to test handling of undecodable deliveries.
    pub fn inject(&self, queue: &str, body: Vec<u8>) {
        self.core.deliver(queue, body);
    }
}

#[async_trait]
impl AmqpTransport for MemoryTransport {
    async fn open(&self, _url: &str, _prefetch: u16) -> Result<(), BusError> {
        if self.core.fail_open.load(Ordering::SeqCst) {
            return Err(BusError::BrokerUnavailable("connection refused".into()));
        }
        self.core.lock().open = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        let mut state = self.core.lock();
        state.open = false;
        state.consumers.clear();
        Ok(())
    }

    async fn is_open(&self) -> bool {
        self.core.lock().open
    }

    async fn declare_exchange(&self, name: &str) -> Result<(), BusError> {
        let mut state = self.core.lock();
        if !state.exchanges.iter().any(|e| e == name) {
            state.exchanges.push(name.to_string());
        }
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BusError> {
        self.core.lock().queues.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BusError> {
        self.core.lock().bindings.push(Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BusError> {
        let mut state = self.core.lock();
        state.queues.remove(name);
        state.buffers.remove(name);
        state.bindings.retain(|b| b.queue != name);
        Ok(())
    }

    async fn purge_queue(&self, name: &str) -> Result<(), BusError> {
        self.core.lock().buffers.remove(name);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        props: PublishProps,
    ) -> Result<(), BusError> {
        if !self.core.lock().open {
            return Err(BusError::BrokerUnavailable("transport closed".into()));
        }
        self.core.lock().published.push(PublishedRecord {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.clone(),
            props,
        });
        self.core.route(exchange, routing_key, &body);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<mpsc::Receiver<AmqpDelivery>, BusError> {
        let (tx, rx) = mpsc::channel(64);
        let backlog = {
            let mut state = self.core.lock();
            state.consumers.insert(queue.to_string(), tx);
            state.buffers.remove(queue).unwrap_or_default()
        };
        for body in backlog {
            self.core.deliver(queue, body);
        }
        Ok(rx)
    }

    async fn probe(&self) -> Result<(), BusError> {
        if self.core.fail_probe.load(Ordering::SeqCst) {
            return Err(BusError::BrokerUnavailable("probe failed".into()));
        }
        if !self.core.lock().open {
            return Err(BusError::BrokerUnavailable("transport closed".into()));
        }
        Ok(())
    }
}

struct MemoryAck {
    core: Arc<Core>,
    queue: String,
    body: Vec<u8>,
}

#[async_trait]
impl DeliveryAck for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        self.core.lock().settlements.push(Settlement::Acked);
        Ok(())
    }

    async fn reject(self: Box<Self>) -> Result<(), BusError> {
        self.core.lock().settlements.push(Settlement::Rejected);
        let wiring = self.core.lock().queues.get(&self.queue).and_then(|spec| {
            Some((
                spec.dead_letter_exchange.clone()?,
                spec.dead_letter_routing_key.clone()?,
            ))
        });
        if let Some((dlx, key)) = wiring {
            self.core.route(&dlx, &key, &self.body);
        }
        Ok(())
    }
}
