//! Unified facade over the three backends.
//!
//! The manager owns whichever backends are enabled in configuration and
//! fans operations out to them. A publish against several backends never
//! short-circuits: every backend gets its attempt and the caller receives a
//! per-backend result map. Shutdown tears the backends down in reverse
//! initialization order.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::durable::DurableBroker;
use crate::ephemeral::EphemeralBroker;
use crate::message::{Message, MessageFilter, MessageHandler};
use crate::push::PushChannel;
use crate::utils::BusError;

pub const BACKEND_DURABLE: &str = "durable";
pub const BACKEND_EPHEMERAL: &str = "ephemeral";
pub const BACKEND_PUSH: &str = "push";

/// Which backend(s) an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendSelector {
    Durable,
    Ephemeral,
    Push,
    /// Every enabled backend.
    All,
}

/// Outcome of one publish call: the message id plus one result per backend
/// that was asked to carry it.
#[derive(Debug)]
pub struct PublishReport {
    pub message_id: Uuid,
    pub results: BTreeMap<&'static str, Result<Uuid, BusError>>,
}

impl PublishReport {
    /// True when at least one backend was addressed and none failed.
    pub fn is_success(&self) -> bool {
        !self.results.is_empty() && self.results.values().all(Result::is_ok)
    }

    pub fn failures(&self) -> Vec<(&'static str, &BusError)> {
        self.results
            .iter()
            .filter_map(|(backend, result)| result.as_ref().err().map(|e| (*backend, e)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub backends: BTreeMap<&'static str, BackendHealth>,
}

pub struct MessagingManager {
    durable: Option<Arc<DurableBroker>>,
    ephemeral: Option<Arc<EphemeralBroker>>,
    push: Option<Arc<PushChannel>>,
    initialized: AtomicBool,
}

impl MessagingManager {
    /// Build the backends named enabled in the settings. Nothing connects
    /// until [`init`](Self::init).
    pub fn new(settings: &Settings) -> Self {
        let durable = settings
            .durable
            .enabled
            .then(|| Arc::new(DurableBroker::new(settings.durable.clone())));
        let ephemeral = settings
            .ephemeral
            .enabled
            .then(|| Arc::new(EphemeralBroker::new(settings.ephemeral.clone())));
        let push = settings
            .push
            .enabled
            .then(|| Arc::new(PushChannel::new(settings.push.clone())));
        Self::with_backends(durable, ephemeral, push)
    }

    /// Assemble from pre-built backends. Tests use this to wire in doubles.
    pub fn with_backends(
        durable: Option<Arc<DurableBroker>>,
        ephemeral: Option<Arc<EphemeralBroker>>,
        push: Option<Arc<PushChannel>>,
    ) -> Self {
        Self {
            durable,
            ephemeral,
            push,
            initialized: AtomicBool::new(false),
        }
    }

    /// Bring the enabled backends up, in order durable, ephemeral, push.
    /// A backend that fails to come up is logged and left degraded; the
    /// others still start.
    pub async fn init(&self) -> Result<(), BusError> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.connect().await {
                warn!("durable backend failed to start: {e}");
            }
        }
        if let Some(ephemeral) = &self.ephemeral {
            match ephemeral.connect().await {
                Ok(()) => {
                    if let Err(e) = ephemeral.start_consuming().await {
                        warn!("ephemeral consumption failed to start: {e}");
                    }
                }
                Err(e) => warn!("ephemeral backend failed to start: {e}"),
            }
        }
        if let Some(push) = &self.push {
            push.start().await;
        }
        info!(
            durable = self.durable.is_some(),
            ephemeral = self.ephemeral.is_some(),
            push = self.push.is_some(),
            "messaging manager initialized"
        );
        Ok(())
    }

    /// Tear down in reverse initialization order: push, ephemeral, durable.
    pub async fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(push) = &self.push {
            push.stop().await;
        }
        if let Some(ephemeral) = &self.ephemeral {
            ephemeral.disconnect().await;
        }
        if let Some(durable) = &self.durable {
            durable.disconnect().await;
        }
        info!("messaging manager shut down");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Publish one message to the selected backend(s). Each backend's
    /// outcome lands in the report; one failing never stops the others.
    pub async fn publish(&self, message: Message, selector: BackendSelector) -> PublishReport {
        let mut results = BTreeMap::new();
        let all = selector == BackendSelector::All;

        if matches!(selector, BackendSelector::Durable) || all {
            match (&self.durable, all) {
                (Some(durable), _) => {
                    results.insert(BACKEND_DURABLE, durable.publish_message(&message).await);
                }
                (None, false) => {
                    results.insert(BACKEND_DURABLE, Err(disabled(BACKEND_DURABLE)));
                }
                (None, true) => {}
            }
        }
        if matches!(selector, BackendSelector::Ephemeral) || all {
            match (&self.ephemeral, all) {
                (Some(ephemeral), _) => {
                    results.insert(
                        BACKEND_EPHEMERAL,
                        ephemeral.publish_message(message.clone()).await,
                    );
                }
                (None, false) => {
                    results.insert(BACKEND_EPHEMERAL, Err(disabled(BACKEND_EPHEMERAL)));
                }
                (None, true) => {}
            }
        }
        if matches!(selector, BackendSelector::Push) || all {
            match (&self.push, all) {
                (Some(push), _) => {
                    let result = push
                        .publish_message(&message)
                        .await
                        .map(|_delivered| message.id);
                    results.insert(BACKEND_PUSH, result);
                }
                (None, false) => {
                    results.insert(BACKEND_PUSH, Err(disabled(BACKEND_PUSH)));
                }
                (None, true) => {}
            }
        }

        let report = PublishReport {
            message_id: message.id,
            results,
        };
        for (backend, error) in report.failures() {
            warn!(backend, id = %report.message_id, "publish failed: {error}");
        }
        report
    }

    /// Probe every enabled backend. Healthy when all pass, degraded when
    /// some fail, unhealthy only when every enabled backend fails.
    pub async fn health_check(&self) -> HealthReport {
        let mut backends = BTreeMap::new();

        if let Some(durable) = &self.durable {
            backends.insert(BACKEND_DURABLE, probe_result(durable.health_check().await));
        }
        if let Some(ephemeral) = &self.ephemeral {
            backends.insert(
                BACKEND_EPHEMERAL,
                probe_result(ephemeral.health_check().await),
            );
        }
        if let Some(push) = &self.push {
            backends.insert(BACKEND_PUSH, probe_result(push.health_check().await));
        }

        let healthy = backends
            .values()
            .filter(|b| b.status == HealthStatus::Healthy)
            .count();
        let status = if backends.is_empty() || healthy == 0 {
            HealthStatus::Unhealthy
        } else if healthy < backends.len() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        HealthReport { status, backends }
    }

    /// Register a handler on one broker backend. Filters run in order and
    /// all must pass before the handler sees a message. `Push` and `All`
    /// are rejected; push clients receive fan-out, not handlers, and a
    /// subscription id identifies exactly one registration. Queue sharing
    /// on the durable backend goes through [`Self::durable_broker`].
    pub async fn subscribe(
        &self,
        backend: BackendSelector,
        topic: &str,
        handler: MessageHandler,
        filters: Vec<MessageFilter>,
    ) -> Result<Uuid, BusError> {
        match backend {
            BackendSelector::Durable => {
                self.durable_broker()?
                    .subscribe(topic, handler, filters, None)
                    .await
            }
            BackendSelector::Ephemeral => {
                self.ephemeral_broker()?
                    .subscribe(topic, handler, filters)
                    .await
            }
            BackendSelector::Push | BackendSelector::All => Err(BusError::SubscriptionError(
                "subscriptions target a single broker backend".into(),
            )),
        }
    }

    /// Remove a subscription from the backend it was registered on.
    pub async fn unsubscribe(
        &self,
        backend: BackendSelector,
        topic: &str,
        subscription: &Uuid,
    ) -> Result<bool, BusError> {
        match backend {
            BackendSelector::Durable => Ok(self.durable_broker()?.unsubscribe(subscription).await),
            BackendSelector::Ephemeral => Ok(self
                .ephemeral_broker()?
                .unsubscribe(topic, subscription)
                .await),
            BackendSelector::Push | BackendSelector::All => Err(BusError::SubscriptionError(
                "subscriptions target a single broker backend".into(),
            )),
        }
    }

    /// Queue a frame for one push client.
    pub async fn send_to_client(
        &self,
        client_id: &str,
        frame: crate::push::Frame,
    ) -> Result<crate::push::PushOutcome, BusError> {
        self.push_channel()?.send_to_client(client_id, frame).await
    }

    /// Broadcast a frame to a room, optionally excluding one client.
    /// Returns the number of clients whose queues accepted the frame.
    pub async fn broadcast_to_room(
        &self,
        room: &str,
        frame: crate::push::Frame,
        exclude: Option<&str>,
    ) -> Result<usize, BusError> {
        Ok(self
            .push_channel()?
            .broadcast_to_room(room, frame, exclude)
            .await)
    }

    /// Direct access to the push channel for the connection-facing
    /// transport layer.
    pub fn push_channel(&self) -> Result<&Arc<PushChannel>, BusError> {
        self.push
            .as_ref()
            .ok_or_else(|| disabled(BACKEND_PUSH))
    }

    pub fn ephemeral_broker(&self) -> Result<&Arc<EphemeralBroker>, BusError> {
        self.ephemeral
            .as_ref()
            .ok_or_else(|| disabled(BACKEND_EPHEMERAL))
    }

    pub fn durable_broker(&self) -> Result<&Arc<DurableBroker>, BusError> {
        self.durable
            .as_ref()
            .ok_or_else(|| disabled(BACKEND_DURABLE))
    }
}

fn disabled(backend: &'static str) -> BusError {
    BusError::PublishFailed {
        backend,
        reason: "backend is not enabled".into(),
    }
}

fn probe_result(result: Result<(), BusError>) -> BackendHealth {
    match result {
        Ok(()) => BackendHealth {
            status: HealthStatus::Healthy,
            error: None,
        },
        Err(e) => BackendHealth {
            status: HealthStatus::Unhealthy,
            error: Some(e.to_string()),
        },
    }
}
