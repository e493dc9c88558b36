//! Bus-backed scaling backend
//!
//! Relays channel traffic between gateway instances through an external
//! publish/subscribe bus. The bus connection is shared by all local
//! sessions; its reconnect loop runs in its own task and never blocks
//! per-session message paths. While the bus is unreachable the gateway
//! keeps serving local fan-out in degraded mode.

use async_trait::async_trait;
use futures_util::StreamExt;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::constants::{
    BUS_TOPIC_PREFIX, RECONNECT_BASE_DELAY_MS, RECONNECT_MAX_DELAY_MS,
};
use crate::core::message::{BroadcastTarget, BusMessage};
use crate::error::{GatewayError, Result};
use crate::scaling::bus::Bus;
use crate::scaling::{BackendHealth, ScalingBackend};

/// Bus connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BusState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
}

impl BusState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            _ => Self::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

fn channel_topic(channel_key: &str) -> String {
    format!("{}:chan:{}", BUS_TOPIC_PREFIX, channel_key)
}

fn scopes_topic() -> String {
    format!("{}:scopes", BUS_TOPIC_PREFIX)
}

/// Bus topic a message travels on. Channel messages get one topic per
/// channel so instances only receive what they have members for; the
/// user/role/tenant scopes share one topic every instance listens to.
fn topic_for(target: &BroadcastTarget) -> Option<String> {
    match target {
        BroadcastTarget::Channel(key) => Some(channel_topic(key)),
        BroadcastTarget::User(_) | BroadcastTarget::Role(_) | BroadcastTarget::Tenant(_) => {
            Some(scopes_topic())
        }
        // Operator-wide messages stay local by default
        BroadcastTarget::All => None,
    }
}

/// Distributed scaling backend over an abstract bus
pub struct DistributedBackend {
    gateway_id: String,
    bus: Arc<dyn Bus>,
    state: Arc<AtomicU8>,
    /// Channel keys with local subscribers, re-registered after reconnect
    interests: Arc<RwLock<HashSet<String>>>,
}

impl DistributedBackend {
    pub fn new(gateway_id: String, bus: Arc<dyn Bus>) -> Self {
        Self {
            gateway_id,
            bus,
            state: Arc::new(AtomicU8::new(BusState::Disconnected as u8)),
            interests: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn state(&self) -> BusState {
        BusState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(state: &AtomicU8, value: BusState) {
        state.store(value as u8, Ordering::Release);
    }

    /// Connection loop: connect, resubscribe, pump messages, back off and
    /// retry on failure. Runs until the relay receiver is dropped.
    async fn run(
        gateway_id: String,
        bus: Arc<dyn Bus>,
        state: Arc<AtomicU8>,
        interests: Arc<RwLock<HashSet<String>>>,
        relay: mpsc::Sender<BusMessage>,
    ) {
        let mut delay_ms = RECONNECT_BASE_DELAY_MS;
        let mut first_attempt = true;

        loop {
            Self::set_state(
                &state,
                if first_attempt {
                    BusState::Connecting
                } else {
                    BusState::Reconnecting
                },
            );
            first_attempt = false;

            if let Err(e) = Self::establish(&bus, &interests).await {
                log::warn!(
                    "Bus connection failed ({}); retrying in {}ms",
                    e,
                    delay_ms
                );
                Self::set_state(&state, BusState::Reconnecting);
                Self::sleep_with_jitter(delay_ms).await;
                delay_ms = (delay_ms * 2).min(RECONNECT_MAX_DELAY_MS);
                continue;
            }

            Self::set_state(&state, BusState::Connected);
            delay_ms = RECONNECT_BASE_DELAY_MS;
            log::info!("Bus connected, gateway {}", gateway_id);

            loop {
                let (topic, payload) = match bus.next_message().await {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Bus stream lost: {}; entering degraded mode", e);
                        break;
                    }
                };

                let message: BusMessage = match serde_json::from_slice(&payload) {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Undecodable bus message on {}: {}", topic, e);
                        continue;
                    }
                };

                // Never re-relay a message this instance originated
                if message.origin == gateway_id {
                    log::trace!("Skipping self-originated bus message {}", message.message_id);
                    continue;
                }

                if relay.send(message).await.is_err() {
                    log::info!("Relay channel closed; stopping bus listener");
                    Self::set_state(&state, BusState::Disconnected);
                    return;
                }
            }

            Self::set_state(&state, BusState::Reconnecting);
            Self::sleep_with_jitter(delay_ms).await;
            delay_ms = (delay_ms * 2).min(RECONNECT_MAX_DELAY_MS);
        }
    }

    async fn establish(bus: &Arc<dyn Bus>, interests: &Arc<RwLock<HashSet<String>>>) -> Result<()> {
        bus.connect().await?;
        bus.subscribe(&scopes_topic()).await?;
        let snapshot: Vec<String> = interests.read().await.iter().cloned().collect();
        for key in snapshot {
            bus.subscribe(&channel_topic(&key)).await?;
        }
        Ok(())
    }

    async fn sleep_with_jitter(delay_ms: u64) {
        let jitter = rand::thread_rng().gen_range(0..=delay_ms / 4);
        tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
    }
}

#[async_trait]
impl ScalingBackend for DistributedBackend {
    async fn start(&self, relay: mpsc::Sender<BusMessage>) -> Result<()> {
        tokio::spawn(Self::run(
            self.gateway_id.clone(),
            Arc::clone(&self.bus),
            Arc::clone(&self.state),
            Arc::clone(&self.interests),
            relay,
        ));
        Ok(())
    }

    async fn register_interest(&self, channel_key: &str) -> Result<()> {
        self.interests.write().await.insert(channel_key.to_string());
        if self.state() == BusState::Connected {
            self.bus.subscribe(&channel_topic(channel_key)).await?;
        }
        // Not connected: the reconnect loop resubscribes from `interests`
        Ok(())
    }

    async fn deregister_interest(&self, channel_key: &str) -> Result<()> {
        self.interests.write().await.remove(channel_key);
        if self.state() == BusState::Connected {
            self.bus.unsubscribe(&channel_topic(channel_key)).await?;
        }
        Ok(())
    }

    async fn publish(&self, message: &BusMessage) -> Result<()> {
        let topic = match topic_for(&message.target) {
            Some(topic) => topic,
            None => return Ok(()),
        };
        if self.state() != BusState::Connected {
            return Err(GatewayError::BackendDegraded(format!(
                "bus is {}",
                self.state().as_str()
            )));
        }
        let payload = serde_json::to_vec(message)
            .map_err(|e| GatewayError::BusError(format!("serialize bus message: {}", e)))?;
        self.bus.publish(&topic, payload).await
    }

    fn health(&self) -> BackendHealth {
        match self.state() {
            BusState::Connected => BackendHealth::Ok,
            _ => BackendHealth::Degraded,
        }
    }

    fn name(&self) -> &'static str {
        "distributed"
    }
}

enum SubCmd {
    Subscribe(String),
    Unsubscribe(String),
}

/// Redis implementation of the bus: a multiplexed connection for PUBLISH
/// and a dedicated pub/sub connection driven by a background task.
pub struct RedisBus {
    url: String,
    publish_conn: Mutex<Option<redis::aio::MultiplexedConnection>>,
    ctrl: Mutex<Option<mpsc::UnboundedSender<SubCmd>>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<(String, Vec<u8>)>>>,
}

impl RedisBus {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            publish_conn: Mutex::new(None),
            ctrl: Mutex::new(None),
            events: Mutex::new(None),
        }
    }

    async fn pubsub_task(
        mut pubsub: redis::aio::PubSub,
        mut ctrl: mpsc::UnboundedReceiver<SubCmd>,
        events: mpsc::UnboundedSender<(String, Vec<u8>)>,
    ) {
        enum Step {
            Inbound(Option<redis::Msg>),
            Control(Option<SubCmd>),
        }

        loop {
            let step = {
                let mut stream = pubsub.on_message();
                tokio::select! {
                    message = stream.next() => Step::Inbound(message),
                    command = ctrl.recv() => Step::Control(command),
                }
            };

            match step {
                Step::Inbound(Some(message)) => {
                    let topic = message.get_channel_name().to_string();
                    match message.get_payload::<Vec<u8>>() {
                        Ok(payload) => {
                            if events.send((topic, payload)).is_err() {
                                return;
                            }
                        }
                        Err(e) => log::warn!("Bad payload on {}: {}", topic, e),
                    }
                }
                // Stream ended: the pub/sub connection is gone
                Step::Inbound(None) => return,
                Step::Control(Some(SubCmd::Subscribe(topic))) => {
                    if let Err(e) = pubsub.subscribe(&topic).await {
                        log::warn!("Redis SUBSCRIBE {} failed: {}", topic, e);
                        return;
                    }
                }
                Step::Control(Some(SubCmd::Unsubscribe(topic))) => {
                    if let Err(e) = pubsub.unsubscribe(&topic).await {
                        log::warn!("Redis UNSUBSCRIBE {} failed: {}", topic, e);
                    }
                }
                // Ctrl sender replaced or dropped: this connection is stale
                Step::Control(None) => return,
            }
        }
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn connect(&self) -> Result<()> {
        let client = redis::Client::open(self.url.as_str())
            .map_err(|e| GatewayError::BusError(format!("Redis connection failed: {}", e)))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| GatewayError::BusError(format!("Redis connection failed: {}", e)))?;

        let pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| GatewayError::BusError(format!("Redis pub/sub failed: {}", e)))?;

        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::pubsub_task(pubsub, ctrl_rx, event_tx));

        *self.publish_conn.lock().await = Some(conn);
        *self.ctrl.lock().await = Some(ctrl_tx);
        *self.events.lock().await = Some(event_rx);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let mut guard = self.publish_conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| GatewayError::BusError("not connected".to_string()))?;
        redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async::<i64>(conn)
            .await
            .map_err(|e| GatewayError::BusError(format!("Redis PUBLISH failed: {}", e)))?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        let guard = self.ctrl.lock().await;
        let ctrl = guard
            .as_ref()
            .ok_or_else(|| GatewayError::BusError("not connected".to_string()))?;
        ctrl.send(SubCmd::Subscribe(topic.to_string()))
            .map_err(|_| GatewayError::TransportError("bus connection lost".to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let guard = self.ctrl.lock().await;
        let ctrl = guard
            .as_ref()
            .ok_or_else(|| GatewayError::BusError("not connected".to_string()))?;
        ctrl.send(SubCmd::Unsubscribe(topic.to_string()))
            .map_err(|_| GatewayError::TransportError("bus connection lost".to_string()))
    }

    async fn next_message(&self) -> Result<(String, Vec<u8>)> {
        let mut guard = self.events.lock().await;
        let rx = guard
            .as_mut()
            .ok_or_else(|| GatewayError::TransportError("bus not connected".to_string()))?;
        match rx.recv().await {
            Some(message) => Ok(message),
            None => {
                *guard = None;
                Err(GatewayError::TransportError("bus connection lost".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::ServerFrame;
    use crate::scaling::bus::InMemoryBusHub;
    use uuid::Uuid;

    fn bus_message(origin: &str, channel: &str) -> BusMessage {
        BusMessage {
            origin: origin.to_string(),
            target: BroadcastTarget::Channel(channel.to_string()),
            message_id: Uuid::new_v4(),
            frame: ServerFrame::message(
                Some(channel.to_string()),
                None,
                serde_json::json!({"n": 1}),
            ),
        }
    }

    #[tokio::test]
    async fn test_scope_targets_share_one_topic() {
        assert_eq!(
            topic_for(&BroadcastTarget::User("u".to_string())),
            topic_for(&BroadcastTarget::Tenant("t".to_string()))
        );
        assert_eq!(topic_for(&BroadcastTarget::All), None);
        assert!(topic_for(&BroadcastTarget::Channel("acme:news".to_string()))
            .unwrap()
            .ends_with("acme:news"));
    }

    #[tokio::test]
    async fn test_relay_skips_self_originated_messages() {
        let hub = InMemoryBusHub::new();
        let backend_a = DistributedBackend::new("gw-a".to_string(), Arc::new(hub.client()));
        let backend_b = DistributedBackend::new("gw-b".to_string(), Arc::new(hub.client()));

        let (relay_a_tx, mut relay_a_rx) = mpsc::channel(16);
        let (relay_b_tx, mut relay_b_rx) = mpsc::channel(16);
        backend_a.start(relay_a_tx).await.unwrap();
        backend_b.start(relay_b_tx).await.unwrap();

        // Wait for both listeners to come up
        for backend in [&backend_a, &backend_b] {
            while backend.state() != BusState::Connected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        backend_a.register_interest("orders").await.unwrap();
        backend_b.register_interest("orders").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        backend_a.publish(&bus_message("gw-a", "orders")).await.unwrap();

        // B receives the relay
        let relayed = tokio::time::timeout(Duration::from_secs(1), relay_b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relayed.origin, "gw-a");

        // A must not relay its own message back into local fan-out
        let self_relay =
            tokio::time::timeout(Duration::from_millis(100), relay_a_rx.recv()).await;
        assert!(self_relay.is_err(), "instance relayed its own message");
    }

    #[tokio::test]
    async fn test_publish_while_degraded_fails_without_panic() {
        let hub = InMemoryBusHub::new();
        let backend = DistributedBackend::new("gw-a".to_string(), Arc::new(hub.client()));
        // Never started: state is Disconnected
        let err = backend.publish(&bus_message("gw-a", "orders")).await.unwrap_err();
        assert!(matches!(err, GatewayError::BackendDegraded(_)));
        assert_eq!(backend.health(), BackendHealth::Degraded);
    }

    #[tokio::test]
    async fn test_reconnect_restores_interests() {
        let hub = InMemoryBusHub::new();
        let backend_a = DistributedBackend::new("gw-a".to_string(), Arc::new(hub.client()));
        let backend_b = DistributedBackend::new("gw-b".to_string(), Arc::new(hub.client()));

        let (relay_a_tx, _relay_a_rx) = mpsc::channel(16);
        let (relay_b_tx, mut relay_b_rx) = mpsc::channel(16);
        backend_a.start(relay_a_tx).await.unwrap();
        backend_b.start(relay_b_tx).await.unwrap();
        for backend in [&backend_a, &backend_b] {
            while backend.state() != BusState::Connected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        backend_b.register_interest("orders").await.unwrap();

        // Sever the bus; both backends degrade
        hub.set_available(false).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend_b.health(), BackendHealth::Degraded);

        // Bring it back; interests are re-registered by the reconnect loop
        hub.set_available(true).await;
        while backend_a.state() != BusState::Connected
            || backend_b.state() != BusState::Connected
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        backend_a.publish(&bus_message("gw-a", "orders")).await.unwrap();
        let relayed = tokio::time::timeout(Duration::from_secs(2), relay_b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relayed.origin, "gw-a");
    }
}
