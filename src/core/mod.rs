//! Core functionality of the message gateway

pub mod broadcast;
pub mod channel;
pub mod message;
pub mod rate_limiter;
pub mod router;
pub mod server;
pub mod session;

// Re-export main components for convenience
pub use broadcast::BroadcastManager;
pub use channel::{Channel, ChannelManager};
pub use message::{BroadcastTarget, BusMessage, ClientFrame, Envelope, ServerFrame};
pub use rate_limiter::{ConnectionCaps, RateKey, RateLimiter, TokenBucket};
pub use router::{FrameHandler, MessageRouter};
pub use server::{GatewayManager, GatewayStats, HealthStatus, SharedGateway};
pub use session::{OutboundQueue, Session, SessionManager, SessionState};
