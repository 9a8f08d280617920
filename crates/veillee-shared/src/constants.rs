/// Default HTTP/WebSocket listen port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Interval between server liveness pings in seconds
pub const PING_INTERVAL_SECS: u64 = 15;

/// Window without inbound activity after which a connection is closed (2 hours)
pub const ACTIVITY_TIMEOUT_SECS: u64 = 7_200;

/// Grace period before an empty room is deleted (1 day)
pub const ROOM_EMPTY_GRACE_SECS: u64 = 86_400;

/// Maximum inbound WebSocket frame size in bytes (64 KiB)
pub const MAX_FRAME_SIZE: usize = 65_536;

/// Per-connection outbound queue depth
pub const WRITE_QUEUE_DEPTH: usize = 256;

/// Upper bound on a metadata-mirror round trip in seconds
pub const CACHE_TIMEOUT_SECS: u64 = 5;

/// Room id length bounds
pub const ROOM_ID_MIN_LEN: usize = 3;
pub const ROOM_ID_MAX_LEN: usize = 64;

/// Random bytes in a generated room id (8 chars after base64url)
pub const ROOM_ID_RANDOM_BYTES: usize = 6;
