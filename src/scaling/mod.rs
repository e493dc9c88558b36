//! Scaling backends: how one gateway instance shares channel delivery
//! with its peers. `LocalBackend` is a no-op for single-instance
//! deployments; `DistributedBackend` relays through an external
//! publish/subscribe bus.

pub mod bus;
pub mod distributed;
pub mod local;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::message::BusMessage;
use crate::error::Result;

/// Coarse backend health surfaced through health/stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendHealth {
    Ok,
    Degraded,
}

/// Interchangeable fan-out coordination across gateway instances.
#[async_trait]
pub trait ScalingBackend: Send + Sync {
    /// Start background work (bus listener, reconnect loop). Messages
    /// received from peer instances are handed to `relay`.
    async fn start(&self, relay: mpsc::Sender<BusMessage>) -> Result<()>;

    /// Called when a channel gains its first local subscriber.
    async fn register_interest(&self, channel_key: &str) -> Result<()>;

    /// Called when a channel loses its last local subscriber.
    async fn deregister_interest(&self, channel_key: &str) -> Result<()>;

    /// Publish a message so peer instances can deliver to their members.
    async fn publish(&self, message: &BusMessage) -> Result<()>;

    fn health(&self) -> BackendHealth;

    fn name(&self) -> &'static str;
}

// Re-export main components
pub use bus::{Bus, InMemoryBusHub};
pub use distributed::{DistributedBackend, RedisBus};
pub use local::LocalBackend;
