//! Abstract publish/subscribe bus
//!
//! The distributed backend talks to the bus only through this trait, so the
//! core stays independent of any specific bus technology. `InMemoryBusHub`
//! serves single-node deployments and multi-instance tests; `RedisBus` (in
//! `distributed.rs`) is the networked implementation.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::error::{GatewayError, Result};

/// One gateway instance's client connection to the bus.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Establish (or re-establish) the underlying connection. Subscriptions
    /// do not survive reconnection; the caller re-registers them.
    async fn connect(&self) -> Result<()>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<()>;

    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Next inbound message from any subscribed topic. Fails with
    /// `TransportError` when the connection is lost.
    async fn next_message(&self) -> Result<(String, Vec<u8>)>;
}

struct ClientSlot {
    topics: HashSet<String>,
    sender: Option<mpsc::UnboundedSender<(String, Vec<u8>)>>,
}

struct HubInner {
    clients: RwLock<HashMap<u64, ClientSlot>>,
    next_id: AtomicU64,
    up: AtomicBool,
}

/// In-memory bus hub. Every `client()` is an independent bus connection;
/// two gateway instances sharing one hub see each other's publishes, which
/// is exactly the production topology in miniature.
#[derive(Clone)]
pub struct InMemoryBusHub {
    inner: Arc<HubInner>,
}

impl InMemoryBusHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                clients: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                up: AtomicBool::new(true),
            }),
        }
    }

    /// Hand out a new client connection.
    pub fn client(&self) -> InMemoryBusClient {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        InMemoryBusClient {
            hub: Arc::clone(&self.inner),
            id,
            rx: Mutex::new(None),
        }
    }

    /// Simulate bus availability. Taking the hub down severs every client
    /// connection; clients observe it as a lost transport.
    pub async fn set_available(&self, available: bool) {
        self.inner.up.store(available, Ordering::Release);
        if !available {
            let mut clients = self.inner.clients.write().await;
            for slot in clients.values_mut() {
                slot.sender = None;
            }
        }
    }
}

impl Default for InMemoryBusHub {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InMemoryBusClient {
    hub: Arc<HubInner>,
    id: u64,
    rx: Mutex<Option<mpsc::UnboundedReceiver<(String, Vec<u8>)>>>,
}

impl InMemoryBusClient {
    fn ensure_up(&self) -> Result<()> {
        if self.hub.up.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(GatewayError::BusError("bus unavailable".to_string()))
        }
    }
}

#[async_trait]
impl Bus for InMemoryBusClient {
    async fn connect(&self) -> Result<()> {
        self.ensure_up()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut clients = self.hub.clients.write().await;
        let slot = clients.entry(self.id).or_insert_with(|| ClientSlot {
            topics: HashSet::new(),
            sender: None,
        });
        // Fresh connection: previous subscriptions are gone
        slot.topics.clear();
        slot.sender = Some(tx);
        *self.rx.lock().await = Some(rx);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.ensure_up()?;
        let clients = self.hub.clients.read().await;
        for slot in clients.values() {
            if slot.topics.contains(topic) {
                if let Some(ref sender) = slot.sender {
                    let _ = sender.send((topic.to_string(), payload.clone()));
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.ensure_up()?;
        let mut clients = self.hub.clients.write().await;
        match clients.get_mut(&self.id) {
            Some(slot) if slot.sender.is_some() => {
                slot.topics.insert(topic.to_string());
                Ok(())
            }
            _ => Err(GatewayError::BusError("not connected".to_string())),
        }
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let mut clients = self.hub.clients.write().await;
        if let Some(slot) = clients.get_mut(&self.id) {
            slot.topics.remove(topic);
        }
        Ok(())
    }

    async fn next_message(&self) -> Result<(String, Vec<u8>)> {
        let mut guard = self.rx.lock().await;
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

    #[tokio::test]
    async fn test_publish_reaches_subscribed_clients_only() {
        let hub = InMemoryBusHub::new();
        let a = hub.client();
        let b = hub.client();
        let c = hub.client();
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        c.connect().await.unwrap();

        b.subscribe("orders").await.unwrap();
        c.subscribe("invoices").await.unwrap();

        a.publish("orders", b"payload".to_vec()).await.unwrap();

        let (topic, payload) = b.next_message().await.unwrap();
        assert_eq!(topic, "orders");
        assert_eq!(payload, b"payload");

        // c subscribed to a different topic; nothing pending
        c.publish("invoices", b"own".to_vec()).await.unwrap();
        let (topic, _) = c.next_message().await.unwrap();
        assert_eq!(topic, "invoices");
    }

    #[tokio::test]
    async fn test_publisher_receives_own_message_when_subscribed() {
        // Matches real pub/sub buses: self-delivery happens at the bus
        // level, origin filtering is the backend's job.
        let hub = InMemoryBusHub::new();
        let a = hub.client();
        a.connect().await.unwrap();
        a.subscribe("orders").await.unwrap();
        a.publish("orders", b"x".to_vec()).await.unwrap();
        let (topic, _) = a.next_message().await.unwrap();
        assert_eq!(topic, "orders");
    }

    #[tokio::test]
    async fn test_down_hub_severs_clients() {
        let hub = InMemoryBusHub::new();
        let a = hub.client();
        a.connect().await.unwrap();
        a.subscribe("orders").await.unwrap();

        hub.set_available(false).await;
        assert!(a.publish("orders", b"x".to_vec()).await.is_err());
        assert!(a.next_message().await.is_err());
        assert!(a.connect().await.is_err());

        hub.set_available(true).await;
        a.connect().await.unwrap();
        // Subscriptions were lost with the connection
        a.publish("orders", b"y".to_vec()).await.unwrap();
        a.subscribe("orders").await.unwrap();
        a.publish("orders", b"z".to_vec()).await.unwrap();
        let (_, payload) = a.next_message().await.unwrap();
        assert_eq!(payload, b"z");
    }
}
