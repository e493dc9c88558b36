//! Channel namespace and local subscriber membership
//!
//! Channels are created lazily on first subscribe and torn down when the
//! last local subscriber leaves, unless marked persistent. With tenant
//! isolation enabled every channel key is tenant-prefixed and sessions
//! cannot subscribe outside their own namespace.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{GatewayError, Result};
use crate::scaling::ScalingBackend;

/// A named topic with its local membership
#[derive(Debug, Clone)]
pub struct Channel {
    /// Tenant-qualified key, unique across the gateway
    pub key: String,
    /// Name as the subscriber requested it
    pub name: String,
    /// Session ids of local subscribers
    pub members: HashSet<String>,
    /// Persistent channels survive an empty member set
    pub persistent: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Channel {
    fn new(key: String, name: String) -> Self {
        Self {
            key,
            name,
            members: HashSet::new(),
            persistent: false,
            created_at: chrono::Utc::now(),
        }
    }
}

/// Manages all channels and session membership on this instance
pub struct ChannelManager {
    /// Channel key -> channel
    channels: RwLock<HashMap<String, Channel>>,
    /// Session id -> set of channel keys it subscribes to
    session_channels: RwLock<HashMap<String, HashSet<String>>>,
    tenant_isolation: bool,
    backend: Arc<dyn ScalingBackend>,
}

impl ChannelManager {
    pub fn new(tenant_isolation: bool, backend: Arc<dyn ScalingBackend>) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            session_channels: RwLock::new(HashMap::new()),
            tenant_isolation,
            backend,
        }
    }

    /// Normalize a requested channel name into its storage key.
    /// With isolation on, bare names get the session's tenant prefix and
    /// explicit prefixes must match the session's own tenant.
    pub fn resolve(&self, tenant: &str, name: &str) -> Result<String> {
        if !self.tenant_isolation {
            return Ok(name.to_string());
        }
        match name.split_once(':') {
            Some((prefix, _)) if prefix == tenant => Ok(name.to_string()),
            Some(_) => Err(GatewayError::ChannelNotPermitted(name.to_string())),
            None => Ok(format!("{}:{}", tenant, name)),
        }
    }

    /// Subscribe a session to a channel. Idempotent: re-subscribing an
    /// existing member succeeds. Returns the channel key.
    pub async fn subscribe(&self, session_id: &str, tenant: &str, name: &str) -> Result<String> {
        let key = self.resolve(tenant, name)?;

        // Both locks held together so membership and the per-session index
        // cannot diverge under concurrent subscribe/terminate.
        let first_subscriber = {
            let mut channels = self.channels.write().await;
            let mut session_channels = self.session_channels.write().await;

            let channel = channels
                .entry(key.clone())
                .or_insert_with(|| Channel::new(key.clone(), name.to_string()));
            let was_empty = channel.members.is_empty();
            channel.members.insert(session_id.to_string());

            session_channels
                .entry(session_id.to_string())
                .or_insert_with(HashSet::new)
                .insert(key.clone());

            was_empty
        };

        // Bus interest is registered outside the locks; a bus failure is
        // degraded-mode operation, not a subscribe failure.
        if first_subscriber {
            if let Err(e) = self.backend.register_interest(&key).await {
                log::warn!("Bus interest registration failed for {}: {}", key, e);
            }
        }

        Ok(key)
    }

    /// Unsubscribe a session from a channel. Idempotent: unknown channels
    /// and non-members both succeed, because retries may duplicate calls.
    pub async fn unsubscribe(&self, session_id: &str, tenant: &str, name: &str) -> Result<String> {
        let key = self.resolve(tenant, name)?;
        let deregister = {
            let mut channels = self.channels.write().await;
            let mut session_channels = self.session_channels.write().await;
            Self::remove_membership(&mut channels, &mut session_channels, session_id, &key)
        };

        if deregister {
            if let Err(e) = self.backend.deregister_interest(&key).await {
                log::warn!("Bus interest deregistration failed for {}: {}", key, e);
            }
        }

        Ok(key)
    }

    /// Remove one membership under both locks. Returns true when the
    /// channel lost its last subscriber and bus interest must be dropped.
    fn remove_membership(
        channels: &mut HashMap<String, Channel>,
        session_channels: &mut HashMap<String, HashSet<String>>,
        session_id: &str,
        key: &str,
    ) -> bool {
        if let Some(set) = session_channels.get_mut(session_id) {
            set.remove(key);
            if set.is_empty() {
                session_channels.remove(session_id);
            }
        }

        let Some(channel) = channels.get_mut(key) else {
            return false;
        };
        channel.members.remove(session_id);
        if channel.members.is_empty() && !channel.persistent {
            channels.remove(key);
            true
        } else {
            false
        }
    }

    /// Cascade unsubscription for a terminated session. Idempotent under
    /// concurrent disconnects: the second caller finds nothing to remove.
    pub async fn on_session_terminated(&self, session_id: &str) {
        let emptied: Vec<String> = {
            let mut channels = self.channels.write().await;
            let mut session_channels = self.session_channels.write().await;

            let keys: Vec<String> = session_channels
                .get(session_id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();

            keys.iter()
                .filter(|key| {
                    Self::remove_membership(&mut channels, &mut session_channels, session_id, key)
                })
                .cloned()
                .collect()
        };

        for key in emptied {
            if let Err(e) = self.backend.deregister_interest(&key).await {
                log::warn!("Bus interest deregistration failed for {}: {}", key, e);
            }
        }
    }

    /// Create (or mark) a channel that survives an empty member set
    pub async fn declare_persistent(&self, tenant: &str, name: &str) -> Result<String> {
        let key = self.resolve(tenant, name)?;
        let register = {
            let mut channels = self.channels.write().await;
            let channel = channels
                .entry(key.clone())
                .or_insert_with(|| Channel::new(key.clone(), name.to_string()));
            let first = channel.members.is_empty() && !channel.persistent;
            channel.persistent = true;
            first
        };
        if register {
            if let Err(e) = self.backend.register_interest(&key).await {
                log::warn!("Bus interest registration failed for {}: {}", key, e);
            }
        }
        Ok(key)
    }

    /// Local members of a channel key
    pub async fn local_members(&self, key: &str) -> Vec<String> {
        self.channels
            .read()
            .await
            .get(key)
            .map(|channel| channel.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_member(&self, key: &str, session_id: &str) -> bool {
        self.channels
            .read()
            .await
            .get(key)
            .map(|channel| channel.members.contains(session_id))
            .unwrap_or(false)
    }

    /// Channel keys a session subscribes to
    pub async fn channels_of(&self, session_id: &str) -> Vec<String> {
        self.session_channels
            .read()
            .await
            .get(session_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.channels.read().await.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scaling::LocalBackend;

    fn manager(isolation: bool) -> ChannelManager {
        ChannelManager::new(isolation, Arc::new(LocalBackend::new()))
    }

    #[tokio::test]
    async fn test_lazy_creation_and_teardown() {
        let channels = manager(false);
        assert_eq!(channels.channel_count().await, 0);

        let key = channels.subscribe("s1", "acme", "news").await.unwrap();
        assert_eq!(key, "news");
        assert_eq!(channels.channel_count().await, 1);

        channels.unsubscribe("s1", "acme", "news").await.unwrap();
        assert_eq!(channels.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_tenant_prefix_applied_and_enforced() {
        let channels = manager(true);

        let key = channels.subscribe("s1", "acme", "news").await.unwrap();
        assert_eq!(key, "acme:news");
        assert!(channels.contains("acme:news").await);

        // Explicit own-tenant prefix is accepted and maps to the same key
        let key = channels.subscribe("s1", "acme", "acme:news").await.unwrap();
        assert_eq!(key, "acme:news");

        // Foreign prefix is rejected
        let err = channels
            .subscribe("s1", "acme", "acme2:news")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ChannelNotPermitted(_)));
        assert!(!channels.contains("acme2:news").await);
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe_are_idempotent() {
        let channels = manager(false);
        channels.subscribe("s1", "acme", "news").await.unwrap();
        channels.subscribe("s1", "acme", "news").await.unwrap();
        assert_eq!(channels.local_members("news").await.len(), 1);

        channels.unsubscribe("s1", "acme", "news").await.unwrap();
        // Second unsubscribe on the same pair is safe
        channels.unsubscribe("s1", "acme", "news").await.unwrap();
        assert_eq!(channels.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_termination_cascades_all_memberships() {
        let channels = manager(false);
        channels.subscribe("s1", "acme", "news").await.unwrap();
        channels.subscribe("s1", "acme", "alerts").await.unwrap();
        channels.subscribe("s2", "acme", "news").await.unwrap();

        channels.on_session_terminated("s1").await;

        assert!(channels.channels_of("s1").await.is_empty());
        assert!(!channels.is_member("news", "s1").await);
        // s2 keeps news alive; alerts is gone
        assert!(channels.contains("news").await);
        assert!(!channels.contains("alerts").await);

        // Concurrent/duplicate termination is a no-op
        channels.on_session_terminated("s1").await;
    }

    #[tokio::test]
    async fn test_persistent_channel_survives_empty() {
        let channels = manager(false);
        channels.declare_persistent("acme", "audit").await.unwrap();
        channels.subscribe("s1", "acme", "audit").await.unwrap();
        channels.unsubscribe("s1", "acme", "audit").await.unwrap();
        assert!(channels.contains("audit").await);
    }
}
