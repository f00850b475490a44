//! Options validation
//!
//! Hard errors for values that would break the connection, warnings for
//! values that work but are probably mistakes.

use std::time::Duration;

use super::types::Options;
use crate::error::{NatsError, Result};
use crate::pool::ServerUrl;
use crate::types::is_valid_publish_subject;

const MIN_RECOMMENDED_PING_INTERVAL: Duration = Duration::from_secs(1);
const MIN_READ_BUFFER: usize = 512;

fn invalid(msg: impl Into<String>) -> NatsError {
    NatsError::Config(msg.into())
}

fn require_nonzero(value: Duration, field: &str) -> Result<()> {
    if value.is_zero() {
        return Err(invalid(format!("{field} must be greater than zero")));
    }
    Ok(())
}

fn validate_limit(value: i64, field: &str) -> Result<()> {
    if value == 0 || value < -1 {
        return Err(invalid(format!(
            "{field} must be positive or -1 for unlimited, got {value}"
        )));
    }
    Ok(())
}

impl Options {
    /// Check options for values the connection cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(invalid("at least one server URL is required"));
        }
        for url in &self.servers {
            ServerUrl::parse(url)?;
        }

        require_nonzero(self.ping_interval, "ping interval")?;
        require_nonzero(self.connect_timeout, "connect timeout")?;
        require_nonzero(self.flush_timeout, "flush timeout")?;
        require_nonzero(self.drain_timeout, "drain timeout")?;
        require_nonzero(self.request_timeout, "request timeout")?;

        if self.max_pings_out == 0 {
            return Err(invalid("max pings out must be greater than zero"));
        }
        if self.subscription_batch_size == 0 {
            return Err(invalid("subscription batch size must be greater than zero"));
        }
        if self.max_reconnect < -1 {
            return Err(invalid("max reconnect must be -1 (forever) or non-negative"));
        }
        if self.reconnect_buffer_size < -1 {
            return Err(invalid(
                "reconnect buffer size must be -1 (unbounded), 0 (disabled), or positive",
            ));
        }
        validate_limit(self.pending_msg_limit, "pending message limit")?;
        validate_limit(self.pending_bytes_limit, "pending byte limit")?;

        if self.read_buffer_size < MIN_READ_BUFFER {
            return Err(invalid(format!(
                "read buffer size must be at least {MIN_READ_BUFFER} bytes"
            )));
        }
        if !is_valid_publish_subject(&self.inbox_prefix)
            || self.inbox_prefix.contains(['*', '>'])
            || self.inbox_prefix.ends_with('.')
        {
            return Err(invalid(format!("invalid inbox prefix {:?}", self.inbox_prefix)));
        }
        if self.token.is_some() && self.user.is_some() {
            return Err(invalid("token and user/password authentication are exclusive"));
        }

        if self.ping_interval < MIN_RECOMMENDED_PING_INTERVAL {
            tracing::warn!(
                "Ping interval {:?} is below {:?}; keepalive traffic will be high",
                self.ping_interval,
                MIN_RECOMMENDED_PING_INTERVAL
            );
        }
        if !self.tls_verify_cert {
            tracing::warn!("TLS certificate verification is disabled");
        }

        Ok(())
    }
}
