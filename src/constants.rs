// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3030;
pub const DEFAULT_WS_PATH: &str = "ws";

// Session defaults
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_MISSED_HEARTBEAT_TIMEOUT_SECS: u64 = 90;
pub const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 3;
pub const DEFAULT_DRAIN_WINDOW_SECS: u64 = 10;

// Rate limiting defaults
pub const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 10;
pub const DEFAULT_MESSAGES_PER_MINUTE: u32 = 60;
pub const DEFAULT_BURST_SIZE: u32 = 10;
pub const DEFAULT_RATE_LIMIT_STRIKES: u32 = 5;
pub const BUCKET_IDLE_EXPIRY_SECS: u64 = 600;

// Bus defaults
pub const BUS_TOPIC_PREFIX: &str = "switchyard";
pub const RECONNECT_BASE_DELAY_MS: u64 = 250;
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;
pub const RELAY_DEDUP_CAPACITY: usize = 4096;

// Protocol limits
pub const MAX_FRAME_BYTES: usize = 64 * 1024;
