//! Error types for the NATS client core
//!
//! Every public operation returns [`NatsError`]. Variants are grouped the way
//! callers need to react to them:
//! - fatal protocol violations ([`NatsError::is_fatal`]) mean the connection is dead
//! - timeouts ([`NatsError::is_timeout`]) can simply be retried
//! - closed/draining errors mean the operation was attempted too late

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T, E = NatsError> = std::result::Result<T, E>;

/// Errors produced by the connection, parser, and subscriptions
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum NatsError {
    /// I/O error on the underlying socket
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// TCP connect or handshake failure against a specific server
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    /// TLS handshake or configuration failure
    #[error("TLS error for {host}: {reason}")]
    Tls { host: String, reason: String },

    /// Server requires TLS but the client did not request it
    #[error("secure connection required by server")]
    SecureConnRequired,

    /// Client requested TLS but the server does not offer it
    #[error("secure connection not available on server")]
    SecureConnUnavailable,

    /// Malformed protocol data; the connection cannot be recovered
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server sent `-ERR` with the given description
    #[error("server error: {0}")]
    Server(String),

    /// Server rejected credentials or a permission check
    #[error("authorization violation: {0}")]
    AuthViolation(String),

    /// Too many unanswered keepalive pings, or server reported a stale connection
    #[error("stale connection")]
    StaleConnection,

    /// A flush, request, connect, or next-message wait timed out
    #[error("operation timed out")]
    Timeout,

    /// Operation attempted on a closed connection
    #[error("connection closed")]
    ConnectionClosed,

    /// The socket dropped while the operation waited; a reconnect is in progress
    #[error("connection lost")]
    Disconnected,

    /// Publish or subscribe attempted while the connection is draining
    #[error("connection is draining")]
    Draining,

    /// A subscription exceeded its pending limits and dropped messages
    #[error("slow consumer on subscription {sid} ({subject})")]
    SlowConsumer { sid: u64, subject: String },

    /// Payload larger than the server-advertised maximum
    #[error("maximum payload exceeded: {size} bytes > {max} bytes")]
    MaxPayload { size: usize, max: usize },

    /// Every server in the pool has used up its reconnect budget
    #[error("no servers available for connection")]
    NoServers,

    /// Subject is empty or contains whitespace
    #[error("invalid subject: {0:?}")]
    BadSubject(String),

    /// Queue group name contains whitespace
    #[error("invalid queue group: {0:?}")]
    BadQueueGroup(String),

    /// Caller passed an out-of-range argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Subscription was unsubscribed or its connection closed
    #[error("invalid subscription")]
    BadSubscription,

    /// Auto-unsubscribe limit reached for this subscription
    #[error("maximum messages delivered")]
    MaxMessagesDelivered,

    /// Too many bytes were published while reconnecting
    #[error("reconnect buffer exceeded")]
    ReconnectBufferExceeded,

    /// Request was published but nobody was listening on the subject
    #[error("no responders available for request")]
    NoResponders,

    /// Request cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// Server URL could not be parsed
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    /// Invalid options
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl NatsError {
    /// Build a protocol error from a description
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Check if the caller may simply try again
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Check if this error means the connection must be torn down
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// Check if this error can be recovered by reconnecting to a server
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(_)
            | Self::StaleConnection
            | Self::Connect { .. }
            | Self::Timeout
            | Self::Disconnected => true,
            Self::Server(msg) => is_stale_connection_text(msg),
            _ => false,
        }
    }

    /// Check if this error is a connection-level closed state
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }

    /// Get the level at which background tasks should report this error
    #[must_use]
    pub fn log_level(&self) -> tracing::Level {
        match self {
            // Peers closing the socket is routine during failover
            Self::Io(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::BrokenPipe
                ) =>
            {
                tracing::Level::DEBUG
            }
            Self::Protocol(_)
            | Self::AuthViolation(_)
            | Self::SecureConnRequired
            | Self::SecureConnUnavailable
            | Self::Tls { .. } => tracing::Level::ERROR,
            Self::Timeout | Self::Cancelled | Self::ConnectionClosed => tracing::Level::DEBUG,
            _ => tracing::Level::WARN,
        }
    }
}

impl From<io::Error> for NatsError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<tokio::time::error::Elapsed> for NatsError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}

/// Server -ERR text for stale connections (case-insensitive)
pub(crate) const STALE_CONNECTION: &str = "stale connection";
/// Server -ERR text prefix for auth failures (case-insensitive)
pub(crate) const AUTHORIZATION_VIOLATION: &str = "authorization violation";
/// Server -ERR text prefix for permission failures (case-insensitive)
pub(crate) const PERMISSIONS_VIOLATION: &str = "permissions violation";

pub(crate) fn is_stale_connection_text(msg: &str) -> bool {
    msg.trim().trim_matches('\'').eq_ignore_ascii_case(STALE_CONNECTION)
}

/// Classify the text of a server `-ERR` line
pub(crate) fn classify_server_error(raw: &str) -> NatsError {
    let text = raw.trim().trim_matches('\'').trim();
    let lower = text.to_ascii_lowercase();
    if lower == STALE_CONNECTION {
        NatsError::StaleConnection
    } else if lower.starts_with(AUTHORIZATION_VIOLATION) || lower.starts_with(PERMISSIONS_VIOLATION)
    {
        NatsError::AuthViolation(text.to_string())
    } else {
        NatsError::Server(text.to_string())
    }
}
