/**
 * Configuration constants for the watch layer
 */
use super::transport::TransportOptions;
use std::time::Duration;

/// First reconnect delay in milliseconds
pub const INITIAL_BACKOFF_MS: u64 = 1000;

/// Multiplier applied to the previous reconnect delay
pub const BACKOFF_FACTOR: f64 = 1.5;

/// Ceiling for a single reconnect delay in milliseconds
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Items requested per page during the initial bulk read
pub const DEFAULT_PAGE_SIZE: u32 = 250;

/// Poll interval for single objects without a usable stream
pub const OBJECT_POLL_INTERVAL_SECS: u64 = 30;

/// Poll interval for lists without a usable stream, and retry interval for failed list reads
pub const LIST_POLL_INTERVAL_SECS: u64 = 15;

/// How often a buffered transport drains its queue
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;

/// Floor for the flush interval; a zero period would never yield
pub const MIN_FLUSH_INTERVAL_MS: u64 = 1;

/// A stream open this long, or one that delivered a message, counts as stable:
/// it re-arms the immediate reconnect and resets the backoff
pub const STABLE_STREAM_MS: u64 = 1000;

/// Server-side watch timeout in seconds (294 vs 300 to stay under the apiserver cap)
pub const WATCH_TIMEOUT_SECONDS: u32 = 294;

/// Abnormal closure: the connection dropped without a close handshake
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// Capacity of the command channel into a transport task
pub const TRANSPORT_COMMAND_CAPACITY: usize = 32;

/// Runtime-tunable subset of the watch configuration
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Page size for bulk reads
    pub page_size: u32,
    /// Re-poll interval for object watches in polling mode
    pub object_poll_interval: Duration,
    /// Re-poll interval for list watches in polling mode, and retry interval after a failed read
    pub list_poll_interval: Duration,
    /// Options handed to every streaming transport
    pub transport: TransportOptions,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            object_poll_interval: Duration::from_secs(OBJECT_POLL_INTERVAL_SECS),
            list_poll_interval: Duration::from_secs(LIST_POLL_INTERVAL_SECS),
            transport: TransportOptions::default(),
        }
    }
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(INITIAL_BACKOFF_MS > 0, "INITIAL_BACKOFF_MS must be greater than 0");
    assert!(MAX_BACKOFF_MS >= INITIAL_BACKOFF_MS, "MAX_BACKOFF_MS must not be below INITIAL_BACKOFF_MS");
    assert!(BACKOFF_FACTOR >= 1.0, "BACKOFF_FACTOR must not shrink the delay");
    assert!(DEFAULT_PAGE_SIZE > 0, "DEFAULT_PAGE_SIZE must be greater than 0");
    assert!(OBJECT_POLL_INTERVAL_SECS > 0, "OBJECT_POLL_INTERVAL_SECS must be greater than 0");
    assert!(LIST_POLL_INTERVAL_SECS > 0, "LIST_POLL_INTERVAL_SECS must be greater than 0");
    assert!(DEFAULT_FLUSH_INTERVAL_MS > 0, "DEFAULT_FLUSH_INTERVAL_MS must be greater than 0");
    assert!(MIN_FLUSH_INTERVAL_MS > 0, "MIN_FLUSH_INTERVAL_MS must be greater than 0");
    assert!(STABLE_STREAM_MS > 0, "STABLE_STREAM_MS must be greater than 0");
    assert!(WATCH_TIMEOUT_SECONDS > 0, "WATCH_TIMEOUT_SECONDS must be greater than 0");
    assert!(TRANSPORT_COMMAND_CAPACITY > 0, "TRANSPORT_COMMAND_CAPACITY must be greater than 0");
};
