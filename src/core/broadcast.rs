//! Broadcast resolution and fan-out
//!
//! Resolves a logical target into concrete deliveries: local members get
//! the frame through their session queues, then the message is published to
//! the scaling backend so peer instances can deliver to theirs. Messages
//! arriving back from the bus go through the same local fan-out, guarded by
//! origin filtering and a dedup cache so nothing is delivered twice.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use uuid::Uuid;

use crate::constants::RELAY_DEDUP_CAPACITY;
use crate::core::channel::ChannelManager;
use crate::core::message::{BroadcastTarget, BusMessage, ServerFrame};
use crate::core::session::SessionManager;
use crate::error::{GatewayError, Result};
use crate::metrics::GatewayMetrics;
use crate::scaling::ScalingBackend;

pub struct BroadcastManager {
    gateway_id: String,
    sessions: Arc<SessionManager>,
    channels: Arc<ChannelManager>,
    backend: Arc<dyn ScalingBackend>,
    metrics: Arc<GatewayMetrics>,
    /// Recently relayed bus message ids
    relayed: std::sync::Mutex<LruCache<Uuid, ()>>,
}

impl BroadcastManager {
    pub fn new(
        gateway_id: String,
        sessions: Arc<SessionManager>,
        channels: Arc<ChannelManager>,
        backend: Arc<dyn ScalingBackend>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            gateway_id,
            sessions,
            channels,
            backend,
            metrics,
            relayed: std::sync::Mutex::new(LruCache::new(
                NonZeroUsize::new(RELAY_DEDUP_CAPACITY).expect("dedup capacity is nonzero"),
            )),
        }
    }

    /// Session ids a target resolves to on this instance
    async fn resolve_local(&self, target: &BroadcastTarget) -> Vec<String> {
        match target {
            BroadcastTarget::Channel(key) => self.channels.local_members(key).await,
            BroadcastTarget::User(user_id) => {
                self.sessions
                    .filter_ids(|s| s.user_id.as_deref() == Some(user_id.as_str()))
                    .await
            }
            BroadcastTarget::Role(role) => self.sessions.filter_ids(|s| s.has_role(role)).await,
            BroadcastTarget::Tenant(tenant) => {
                self.sessions.filter_ids(|s| s.tenant_id == *tenant).await
            }
            BroadcastTarget::All => self.sessions.all_ids().await,
        }
    }

    /// Deliver a frame to every resolved local session. A failed send never
    /// aborts the fan-out; failures are counted. Returns delivered count.
    async fn fanout_local(
        &self,
        target: &BroadcastTarget,
        frame: &ServerFrame,
        exclude: Option<&str>,
    ) -> usize {
        let members = self.resolve_local(target).await;
        let mut delivered = 0u64;
        let mut failed = 0u64;

        for session_id in members {
            if exclude == Some(session_id.as_str()) {
                continue;
            }
            if self.sessions.send(&session_id, frame).await {
                delivered += 1;
            } else {
                failed += 1;
                log::debug!("Delivery to {} failed during fan-out", session_id);
            }
        }

        self.metrics.record_messages_out(delivered);
        self.metrics.record_delivery_failures(failed);
        delivered as usize
    }

    /// Publish to the bus so peer instances can deliver to their members.
    /// Bus trouble degrades silently: logged and counted, never surfaced to
    /// the caller. Returns whether the publish went out.
    async fn publish_remote(
        &self,
        target: &BroadcastTarget,
        frame: &ServerFrame,
        message_id: Uuid,
    ) -> bool {
        let message = BusMessage {
            origin: self.gateway_id.clone(),
            target: target.clone(),
            message_id,
            frame: frame.clone(),
        };
        match self.backend.publish(&message).await {
            Ok(()) => {
                self.metrics.record_bus_published();
                true
            }
            Err(e) => {
                self.metrics.record_bus_publish_failure();
                log::debug!("Bus publish skipped/failed: {}", e);
                false
            }
        }
    }

    fn frame_message_id(frame: &ServerFrame) -> Uuid {
        match frame {
            ServerFrame::Message { message_id, .. } => *message_id,
            _ => Uuid::new_v4(),
        }
    }

    /// Best-effort broadcast: local fan-out plus remote publish. Returns
    /// the number of local deliveries.
    pub async fn broadcast(
        &self,
        target: &BroadcastTarget,
        frame: &ServerFrame,
        exclude: Option<&str>,
    ) -> Result<usize> {
        let delivered = self.fanout_local(target, frame, exclude).await;
        if !matches!(target, BroadcastTarget::All) {
            self.publish_remote(target, frame, Self::frame_message_id(frame))
                .await;
        }
        Ok(delivered)
    }

    /// Confirmed broadcast: fails with `NoEligibleTargets` when nothing was
    /// delivered locally and no remote publish went out either.
    pub async fn broadcast_confirmed(
        &self,
        target: &BroadcastTarget,
        frame: &ServerFrame,
        exclude: Option<&str>,
    ) -> Result<usize> {
        let delivered = self.fanout_local(target, frame, exclude).await;
        let published = if !matches!(target, BroadcastTarget::All) {
            self.publish_remote(target, frame, Self::frame_message_id(frame))
                .await
        } else {
            false
        };

        if delivered == 0 && !published {
            return Err(GatewayError::NoEligibleTargets);
        }
        Ok(delivered)
    }

    /// Local-only fan-out for a message relayed from the bus. The listener
    /// already filtered self-originated messages; this adds id-level dedup
    /// and never republishes, so relay loops cannot form.
    pub async fn handle_bus_message(&self, message: BusMessage) {
        if message.origin == self.gateway_id {
            self.metrics.record_bus_duplicate_skipped();
            return;
        }
        {
            let mut relayed = self.relayed.lock().expect("dedup cache poisoned");
            if relayed.put(message.message_id, ()).is_some() {
                self.metrics.record_bus_duplicate_skipped();
                return;
            }
        }
        self.metrics.record_bus_relayed();
        self.fanout_local(&message.target, &message.frame, None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use crate::scaling::LocalBackend;

    fn make_manager() -> (Arc<SessionManager>, Arc<ChannelManager>, BroadcastManager) {
        let sessions = Arc::new(SessionManager::new(16, OverflowPolicy::DropOldest));
        let backend: Arc<dyn ScalingBackend> = Arc::new(LocalBackend::new());
        let channels = Arc::new(ChannelManager::new(false, Arc::clone(&backend)));
        let broadcasts = BroadcastManager::new(
            "gw-test".to_string(),
            Arc::clone(&sessions),
            Arc::clone(&channels),
            backend,
            Arc::new(GatewayMetrics::new()),
        );
        (sessions, channels, broadcasts)
    }

    #[tokio::test]
    async fn test_channel_broadcast_hits_members_only() {
        let (sessions, channels, broadcasts) = make_manager();
        let member_a = sessions.register("acme".to_string(), None).await;
        let member_b = sessions.register("acme".to_string(), None).await;
        let outsider = sessions.register("acme".to_string(), None).await;

        channels
            .subscribe(&member_a.session_id, "acme", "news")
            .await
            .unwrap();
        channels
            .subscribe(&member_b.session_id, "acme", "news")
            .await
            .unwrap();

        let frame = ServerFrame::message(
            Some("news".to_string()),
            None,
            serde_json::json!({"body": "hi"}),
        );
        let delivered = broadcasts
            .broadcast(&BroadcastTarget::Channel("news".to_string()), &frame, None)
            .await
            .unwrap();

        assert_eq!(delivered, 2);
        assert_eq!(member_a.queue.len(), 1);
        assert_eq!(member_b.queue.len(), 1);
        assert_eq!(outsider.queue.len(), 0);
    }

    #[tokio::test]
    async fn test_confirmed_broadcast_without_targets_fails() {
        let (_sessions, _channels, broadcasts) = make_manager();
        let frame = ServerFrame::message(None, None, serde_json::json!({}));
        let err = broadcasts
            .broadcast_confirmed(&BroadcastTarget::Channel("empty".to_string()), &frame, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoEligibleTargets));
    }

    #[tokio::test]
    async fn test_tenant_scope_filters_sessions() {
        let (sessions, _channels, broadcasts) = make_manager();
        let acme = sessions.register("acme".to_string(), None).await;
        let globex = sessions.register("globex".to_string(), None).await;

        let frame = ServerFrame::message(None, None, serde_json::json!({"note": "maintenance"}));
        let delivered = broadcasts
            .broadcast(&BroadcastTarget::Tenant("acme".to_string()), &frame, None)
            .await
            .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(acme.queue.len(), 1);
        assert_eq!(globex.queue.len(), 0);
    }

    #[tokio::test]
    async fn test_bus_message_dedup_and_origin_skip() {
        let (sessions, channels, broadcasts) = make_manager();
        let member = sessions.register("acme".to_string(), None).await;
        channels
            .subscribe(&member.session_id, "acme", "news")
            .await
            .unwrap();

        let frame = ServerFrame::message(
            Some("news".to_string()),
            None,
            serde_json::json!({"body": "remote"}),
        );
        let id = Uuid::new_v4();
        let from_peer = BusMessage {
            origin: "gw-other".to_string(),
            target: BroadcastTarget::Channel("news".to_string()),
            message_id: id,
            frame: frame.clone(),
        };

        broadcasts.handle_bus_message(from_peer.clone()).await;
        assert_eq!(member.queue.len(), 1);

        // Same message id again: suppressed
        broadcasts.handle_bus_message(from_peer).await;
        assert_eq!(member.queue.len(), 1);

        // Self-originated: suppressed regardless of id
        let own = BusMessage {
            origin: "gw-test".to_string(),
            target: BroadcastTarget::Channel("news".to_string()),
            message_id: Uuid::new_v4(),
            frame,
        };
        broadcasts.handle_bus_message(own).await;
        assert_eq!(member.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_exclude_skips_sender() {
        let (sessions, channels, broadcasts) = make_manager();
        let sender = sessions.register("acme".to_string(), None).await;
        let receiver = sessions.register("acme".to_string(), None).await;
        channels
            .subscribe(&sender.session_id, "acme", "news")
            .await
            .unwrap();
        channels
            .subscribe(&receiver.session_id, "acme", "news")
            .await
            .unwrap();

        let frame = ServerFrame::message(Some("news".to_string()), None, serde_json::json!({}));
        let delivered = broadcasts
            .broadcast(
                &BroadcastTarget::Channel("news".to_string()),
                &frame,
                Some(&sender.session_id),
            )
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(sender.queue.len(), 0);
        assert_eq!(receiver.queue.len(), 1);
    }
}
