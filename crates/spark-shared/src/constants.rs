/// Key namespace prefix used when none is configured
pub const DEFAULT_NAMESPACE: &str = "spark";

/// Maximum number of buffered messages drained per flush
pub const FLUSH_BATCH_SIZE: usize = 50;

/// Delay before an idle buffer is flushed, in seconds
pub const FLUSH_IDLE_SECS: u64 = 60;

/// Extra lifetime a flush token gets beyond the idle delay, in seconds
pub const FLUSH_TOKEN_GRACE_SECS: u64 = 10;

/// Lifetime of the cached chat aggregate, in seconds (5 min)
pub const CHAT_CACHE_TTL_SECS: u64 = 300;

/// Messages each participant must send before a match unlocks
pub const UNLOCK_THRESHOLD: i64 = 50;

/// Length of server-assigned message and media identifiers
pub const MESSAGE_ID_LEN: usize = 20;

/// Length of reaction identifiers
pub const REACTION_ID_LEN: usize = 10;

/// Length of flush tokens
pub const FLUSH_TOKEN_LEN: usize = 32;

/// Page size used when a message query omits its limit
pub const DEFAULT_QUERY_LIMIT: usize = 10;

/// Retry count handed to the delayed-trigger provider
pub const TRIGGER_RETRIES: u32 = 3;

/// Timeout of the outbound delayed-trigger request, in seconds
pub const TRIGGER_TIMEOUT_SECS: u64 = 10;

/// Pub/sub subscription health-check interval, in seconds
pub const SUBSCRIPTION_HEALTH_CHECK_SECS: u64 = 30;

/// Pub/sub subscription send timeout, in seconds
pub const SUBSCRIPTION_SEND_TIMEOUT_SECS: u64 = 10;
