//! Default values for configuration fields
//!
//! Used both by serde (`#[serde(default = ...)]`) and by `Options::default()`.

use std::time::Duration;

use crate::constants::{buffer, limits, socket};

#[inline]
pub fn servers() -> Vec<String> {
    vec![format!("nats://127.0.0.1:{}", socket::DEFAULT_PORT)]
}

#[inline]
pub fn allow_reconnect() -> bool {
    true
}

/// Reconnect attempts per server before it leaves the pool (-1 = forever)
#[inline]
pub fn max_reconnect() -> i64 {
    60
}

#[inline]
pub fn reconnect_wait() -> Duration {
    Duration::from_secs(2)
}

#[inline]
pub fn reconnect_jitter() -> Duration {
    Duration::from_millis(100)
}

#[inline]
pub fn reconnect_jitter_tls() -> Duration {
    Duration::from_secs(1)
}

/// Bytes buffered while reconnecting (0 disables buffering, -1 unbounded)
#[inline]
pub fn reconnect_buffer_size() -> i64 {
    buffer::RECONNECT_DEFAULT
}

#[inline]
pub fn connect_timeout() -> Duration {
    Duration::from_secs(2)
}

#[inline]
pub fn ping_interval() -> Duration {
    Duration::from_secs(120)
}

#[inline]
pub fn max_pings_out() -> u32 {
    2
}

#[inline]
pub fn flush_timeout() -> Duration {
    Duration::from_secs(10)
}

#[inline]
pub fn drain_timeout() -> Duration {
    Duration::from_secs(30)
}

#[inline]
pub fn request_timeout() -> Duration {
    Duration::from_secs(1)
}

#[inline]
pub fn pending_msg_limit() -> i64 {
    limits::PENDING_MSGS
}

#[inline]
pub fn pending_bytes_limit() -> i64 {
    limits::PENDING_BYTES
}

#[inline]
pub fn subscription_batch_size() -> usize {
    64
}

/// Write coalescing window of the flusher
#[inline]
pub fn flusher_coalesce_interval() -> Duration {
    Duration::from_millis(1)
}

#[inline]
pub fn inbox_prefix() -> String {
    "_INBOX".to_string()
}

#[inline]
pub fn read_buffer_size() -> usize {
    buffer::READ
}

#[inline]
pub fn tls_verify_cert() -> bool {
    true
}
