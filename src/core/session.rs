//! Session registry and per-connection outbound queues
//!
//! A session is one logical WebSocket connection, anonymous until its
//! credentials are validated. The registry is the authoritative record of
//! live connections; everything a disconnect must cascade through hangs off
//! the session id handed out here.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, RwLock};
use uuid::Uuid;
use warp::ws::Message as WsMessage;

use crate::auth::AuthContext;
use crate::config::OverflowPolicy;
use crate::core::message::ServerFrame;
use crate::error::{GatewayError, Result};

/// Authentication state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticated,
}

/// Result of pushing a frame onto an outbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue was full; the oldest frame was discarded to make room
    DroppedOldest,
    /// Queue was full and the policy demands disconnection
    Overflow,
    /// Queue already closed (session is going away)
    Closed,
}

struct QueueInner {
    frames: std::sync::Mutex<VecDeque<WsMessage>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

/// Bounded outbound queue between the gateway and a session's writer task.
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct OutboundQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                frames: std::sync::Mutex::new(VecDeque::with_capacity(capacity)),
                notify: Notify::new(),
                capacity,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Push a frame, applying the overflow policy when the queue is full.
    pub fn push(&self, frame: WsMessage, policy: OverflowPolicy) -> PushOutcome {
        if self.inner.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }
        let outcome = {
            let mut frames = self.inner.frames.lock().expect("outbound queue poisoned");
            if frames.len() < self.inner.capacity {
                frames.push_back(frame);
                PushOutcome::Queued
            } else {
                match policy {
                    OverflowPolicy::DropOldest => {
                        frames.pop_front();
                        frames.push_back(frame);
                        PushOutcome::DroppedOldest
                    }
                    OverflowPolicy::Disconnect => PushOutcome::Overflow,
                }
            }
        };
        self.inner.notify.notify_one();
        outcome
    }

    /// Next queued frame; None once the queue is closed and drained.
    pub async fn pop(&self) -> Option<WsMessage> {
        loop {
            {
                let mut frames = self.inner.frames.lock().expect("outbound queue poisoned");
                if let Some(frame) = frames.pop_front() {
                    return Some(frame);
                }
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Close the queue; pending frames are still drained by the writer.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.frames.lock().expect("outbound queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One live connection and its state
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub user_id: Option<String>,
    /// Bound at handshake by the tenant-resolution collaborator; immutable
    /// once the session authenticates.
    pub tenant_id: String,
    pub roles: Vec<String>,
    pub remote_addr: Option<IpAddr>,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    last_heartbeat: Instant,
    failed_auth_attempts: u32,
    rate_limit_strikes: u32,
    queue: OutboundQueue,
}

impl Session {
    fn new(tenant_id: String, remote_addr: Option<IpAddr>, queue: OutboundQueue) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: SessionState::Anonymous,
            user_id: None,
            tenant_id,
            roles: Vec::new(),
            remote_addr,
            connected_at: chrono::Utc::now(),
            last_heartbeat: Instant::now(),
            failed_auth_attempts: 0,
            rate_limit_strikes: 0,
            queue,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_heartbeat.elapsed() > timeout
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Handle returned to the connection handler on registration
#[derive(Debug)]
pub struct RegisteredSession {
    pub session_id: String,
    pub tenant_id: String,
    pub queue: OutboundQueue,
}

/// Manages all live sessions
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    queue_capacity: usize,
    overflow_policy: OverflowPolicy,
}

impl SessionManager {
    pub fn new(queue_capacity: usize, overflow_policy: OverflowPolicy) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            queue_capacity,
            overflow_policy,
        }
    }

    /// Register a new unauthenticated session. Admission checks happen
    /// before this call; registration itself always succeeds.
    pub async fn register(
        &self,
        tenant_id: String,
        remote_addr: Option<IpAddr>,
    ) -> RegisteredSession {
        let queue = OutboundQueue::new(self.queue_capacity);
        let session = Session::new(tenant_id.clone(), remote_addr, queue.clone());
        let session_id = session.id.clone();
        self.sessions.write().await.insert(session_id.clone(), session);
        RegisteredSession {
            session_id,
            tenant_id,
            queue,
        }
    }

    /// Bind a validated identity to a session. The tenant binding from the
    /// handshake is immutable: a token naming a different tenant is refused.
    pub async fn authenticate(&self, session_id: &str, context: &AuthContext) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))?;

        if session.state == SessionState::Authenticated {
            return Err(GatewayError::Unauthorized(
                "session is already authenticated".to_string(),
            ));
        }

        if let Some(ref token_tenant) = context.tenant_id {
            if *token_tenant != session.tenant_id {
                return Err(GatewayError::Unauthorized(format!(
                    "token tenant '{}' does not match connection tenant '{}'",
                    token_tenant, session.tenant_id
                )));
            }
        }

        session.state = SessionState::Authenticated;
        session.user_id = Some(context.user_id.clone());
        session.roles = context.roles.clone();
        Ok(())
    }

    /// Record a failed credential validation; returns the attempt count so
    /// the caller can terminate past the configured limit.
    pub async fn record_auth_failure(&self, session_id: &str) -> u32 {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.failed_auth_attempts += 1;
                session.failed_auth_attempts
            }
            None => 0,
        }
    }

    /// Record a rate-limit violation; returns the strike count.
    pub async fn record_strike(&self, session_id: &str) -> u32 {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.rate_limit_strikes += 1;
                session.rate_limit_strikes
            }
            None => 0,
        }
    }

    /// Reset the idle timer. Returns false if the session is gone, which is
    /// not an error: heartbeats race with eviction by design.
    pub async fn heartbeat(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Sessions whose last heartbeat is older than the timeout
    pub async fn stale_sessions(&self, timeout: Duration) -> Vec<String> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_stale(timeout))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Best-effort send. Returns false when the session is gone or its
    /// queue rejected the frame; never raises.
    pub async fn send(&self, session_id: &str, frame: &ServerFrame) -> bool {
        let (queue, policy) = {
            let sessions = self.sessions.read().await;
            match sessions.get(session_id) {
                Some(session) => (session.queue.clone(), self.overflow_policy),
                None => return false,
            }
        };

        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to serialize frame for {}: {}", session_id, e);
                return false;
            }
        };

        match queue.push(WsMessage::text(text), policy) {
            PushOutcome::Queued => true,
            PushOutcome::DroppedOldest => {
                log::warn!("Outbound queue full for {}; dropped oldest frame", session_id);
                true
            }
            PushOutcome::Overflow => {
                log::warn!("Outbound queue overflow for {}; disconnecting", session_id);
                queue.close();
                false
            }
            PushOutcome::Closed => false,
        }
    }

    /// Remove a session and close its transport queue. Returns the removed
    /// session so the caller can cascade cleanup; None if already gone.
    pub async fn remove(&self, session_id: &str) -> Option<Session> {
        let session = self.sessions.write().await.remove(session_id);
        if let Some(ref session) = session {
            session.queue.close();
        }
        session
    }

    /// Ids of sessions matching a predicate, for scope-based broadcasts
    pub async fn filter_ids<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&Session) -> bool,
    {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| predicate(s))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Tenant bound to a session
    pub async fn tenant_of(&self, session_id: &str) -> Result<String> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.tenant_id.clone())
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))
    }

    pub async fn is_authenticated(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.is_authenticated())
            .unwrap_or(false)
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn all_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }
}
