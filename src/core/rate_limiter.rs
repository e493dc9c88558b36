//! Rate limiting module to prevent abuse
//!
//! Connection admission is checked once at handshake (per-IP and, when
//! configured, per-tenant aggregate). Message throughput is gated per
//! session by a token bucket. Buckets refill lazily and idle ones are
//! garbage-collected by a periodic sweep.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::constants::BUCKET_IDLE_EXPIRY_SECS;
use crate::error::{GatewayError, Result};

/// Key a limit applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateKey {
    Ip(IpAddr),
    User(String),
    Tenant(String),
    Session(String),
}

/// Classic token bucket with lazy refill
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    /// Tokens added per second
    refill_rate: f64,
    last_refill: Instant,
    last_activity: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        let now = Instant::now();
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_rate,
            last_refill: now,
            last_activity: now,
        }
    }

    /// Refill from elapsed time, then consume one token. On denial returns
    /// the number of whole seconds until a token becomes available.
    pub fn try_consume(&mut self) -> std::result::Result<(), u64> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
        self.last_activity = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            let retry_after = (deficit / self.refill_rate).ceil() as u64;
            Err(retry_after.max(1))
        }
    }

    fn is_idle(&self, expiry: Duration) -> bool {
        self.last_activity.elapsed() > expiry
    }
}

/// Limits applied at connection admission
#[derive(Debug, Clone)]
pub struct ConnectionCaps {
    pub max_per_ip: usize,
    pub max_per_user: Option<usize>,
    pub max_per_tenant: Option<usize>,
}

/// Combined gateway rate limiter
pub struct RateLimiter {
    enabled: bool,
    caps: ConnectionCaps,
    messages_per_minute: u32,
    burst_size: u32,
    /// Token buckets, created lazily per key
    buckets: RwLock<HashMap<RateKey, TokenBucket>>,
    /// Concurrent connection counts per key
    connections: RwLock<HashMap<RateKey, usize>>,
}

impl RateLimiter {
    pub fn new(
        enabled: bool,
        caps: ConnectionCaps,
        messages_per_minute: u32,
        burst_size: u32,
    ) -> Self {
        Self {
            enabled,
            caps,
            messages_per_minute,
            burst_size,
            buckets: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Admission check at handshake. The per-IP and per-tenant caps are
    /// evaluated independently; the connection is denied if either denies.
    pub async fn admit_connection(&self, ip: Option<IpAddr>, tenant: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut connections = self.connections.write().await;

        if let Some(ip) = ip {
            let count = connections.get(&RateKey::Ip(ip)).copied().unwrap_or(0);
            if count >= self.caps.max_per_ip {
                return Err(GatewayError::ResourceExhausted(format!(
                    "connection limit reached for {}",
                    ip
                )));
            }
        }

        if let Some(max_per_tenant) = self.caps.max_per_tenant {
            let key = RateKey::Tenant(tenant.to_string());
            let count = connections.get(&key).copied().unwrap_or(0);
            if count >= max_per_tenant {
                return Err(GatewayError::ResourceExhausted(format!(
                    "connection limit reached for tenant {}",
                    tenant
                )));
            }
        }

        if let Some(ip) = ip {
            *connections.entry(RateKey::Ip(ip)).or_insert(0) += 1;
        }
        *connections
            .entry(RateKey::Tenant(tenant.to_string()))
            .or_insert(0) += 1;
        Ok(())
    }

    /// Per-user aggregate cap, checked when a session authenticates
    pub async fn admit_user_connection(&self, user_id: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut connections = self.connections.write().await;
        let key = RateKey::User(user_id.to_string());
        let count = connections.get(&key).copied().unwrap_or(0);
        if let Some(max_per_user) = self.caps.max_per_user {
            if count >= max_per_user {
                return Err(GatewayError::ResourceExhausted(format!(
                    "connection limit reached for user {}",
                    user_id
                )));
            }
        }
        *connections.entry(key).or_insert(0) += 1;
        Ok(())
    }

    /// Release the counts a terminated session held
    pub async fn release_connection(
        &self,
        ip: Option<IpAddr>,
        tenant: &str,
        user_id: Option<&str>,
    ) {
        if !self.enabled {
            return;
        }
        let mut connections = self.connections.write().await;
        let mut decrement = |key: RateKey| {
            if let Some(count) = connections.get_mut(&key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    connections.remove(&key);
                }
            }
        };
        if let Some(ip) = ip {
            decrement(RateKey::Ip(ip));
        }
        decrement(RateKey::Tenant(tenant.to_string()));
        if let Some(user_id) = user_id {
            decrement(RateKey::User(user_id.to_string()));
        }
    }

    /// Consume one token from the bucket for `key`, creating it on first
    /// use with the given shape.
    pub async fn admit(&self, key: RateKey, capacity: u32, refill_rate: f64) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut buckets = self.buckets.write().await;
        let bucket = buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(capacity, refill_rate));
        bucket
            .try_consume()
            .map_err(|retry_after_secs| GatewayError::RateLimited { retry_after_secs })
    }

    /// Inbound message gate, keyed by session
    pub async fn admit_message(&self, session_id: &str) -> Result<()> {
        self.admit(
            RateKey::Session(session_id.to_string()),
            self.burst_size,
            self.messages_per_minute as f64 / 60.0,
        )
        .await
    }

    /// Drop the bucket of a terminated session immediately
    pub async fn release_session(&self, session_id: &str) {
        self.buckets
            .write()
            .await
            .remove(&RateKey::Session(session_id.to_string()));
    }

    /// Evict buckets idle past the expiry window
    pub async fn cleanup_idle_buckets(&self) {
        let expiry = Duration::from_secs(BUCKET_IDLE_EXPIRY_SECS);
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| !bucket.is_idle(expiry));
        let evicted = before - buckets.len();
        if evicted > 0 {
            log::debug!("Evicted {} idle rate-limit buckets", evicted);
        }
    }

    /// Start the periodic bucket GC task
    pub fn start_cleanup_task(self: std::sync::Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                self.cleanup_idle_buckets().await;
            }
        });
    }

    pub async fn tracked_buckets(&self) -> usize {
        self.buckets.read().await.len()
    }

    pub async fn connection_count(&self, key: &RateKey) -> usize {
        self.connections.read().await.get(key).copied().unwrap_or(0)
    }
}
