//! Constants used throughout the client
//!
//! This module centralizes protocol literals, buffer sizes, and tuned
//! timing values so the connection and parser share one source of truth.

use std::time::Duration;

/// Protocol literals written by the client
pub mod protocol {
    /// Line terminator for every protocol operation
    pub const CRLF: &[u8] = b"\r\n";

    /// Keepalive / flush round-trip request
    pub const PING: &[u8] = b"PING\r\n";

    /// Reply to a server PING
    pub const PONG: &[u8] = b"PONG\r\n";

    /// Publish operation prefix (trailing space included)
    pub const PUB: &[u8] = b"PUB ";

    /// Publish-with-headers operation prefix (trailing space included)
    pub const HPUB: &[u8] = b"HPUB ";

    /// Header block version line
    pub const HEADER_VERSION: &str = "NATS/1.0";

    /// Client language reported in CONNECT
    pub const LANG: &str = "rust";

    /// Client protocol level: 1 enables async INFO updates
    pub const PROTOCOL_VERSION: u8 = 1;

    /// Status code the server puts in a reply header when nobody is subscribed
    pub const NO_RESPONDERS_STATUS: u16 = 503;
}

/// Buffer size constants
pub mod buffer {
    /// Default size of the fixed read buffer handed to the parser (32KB)
    pub const READ: usize = 32 * 1024;

    /// Initial capacity of the outbound buffer (32KB)
    pub const OUTBOUND_INITIAL: usize = 32 * 1024;

    /// Initial size of the publish control-line scratch buffer
    /// Grows to the next power of two if a subject/reply needs more
    pub const SCRATCH_INITIAL: usize = 512;

    /// Initial capacity of the parser argument buffer
    pub const PARSER_ARG: usize = 1024;

    /// Default bytes kept while reconnecting (8MB)
    pub const RECONNECT_DEFAULT: i64 = 8 * 1024 * 1024;

    /// Maximum length of the INFO/handshake line accepted during connect (64KB)
    pub const HANDSHAKE_LINE_MAX: usize = 64 * 1024;

    /// Largest MSG/HMSG size accepted from a server (64MB, the server's own ceiling)
    pub const MSG_MAX: usize = 64 * 1024 * 1024;
}

/// Socket tuning constants
pub mod socket {
    use super::Duration;

    /// Start TCP keepalive probes after this much idle time
    pub const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

    /// Interval between TCP keepalive probes
    pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

    /// Default port when a server URL omits one
    pub const DEFAULT_PORT: u16 = 4222;
}

/// Timing constants
pub mod timing {
    use super::Duration;

    /// Grace period for the final flush when closing
    pub const CLOSE_FLUSH: Duration = Duration::from_millis(500);
}

/// Subscription pending-limit defaults
pub mod limits {
    /// Default pending message limit per subscription
    pub const PENDING_MSGS: i64 = 512 * 1024;

    /// Default pending byte limit per subscription (64MB)
    pub const PENDING_BYTES: i64 = 64 * 1024 * 1024;

    /// Queued events beyond which async errors are dropped instead of delivered
    pub const EVENT_QUEUE: usize = 1024;

    /// Events handed to the callback scheduler per wake-up
    pub const EVENT_BATCH: usize = 32;
}
