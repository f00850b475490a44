//! Configuration types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::defaults;
use crate::connection::Event;
use crate::error::Result;
use crate::types::duration_millis_serde;

/// Receives connection lifecycle and asynchronous error events
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// Overrides the reconnect wait; called with the number of completed passes
/// over the server pool
pub type ReconnectDelayCallback = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Supplies the user JWT sent in CONNECT
pub type UserJwtCallback = Arc<dyn Fn() -> Result<String> + Send + Sync>;

/// Signs the server nonce, returning the encoded signature
pub type SignatureCallback = Arc<dyn Fn(&[u8]) -> Result<String> + Send + Sync>;

/// User hooks; not part of the serialized configuration
#[derive(Clone, Default)]
pub struct Callbacks {
    pub event: Option<EventCallback>,
    pub reconnect_delay: Option<ReconnectDelayCallback>,
    pub user_jwt: Option<UserJwtCallback>,
    pub signature: Option<SignatureCallback>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("event", &self.event.is_some())
            .field("reconnect_delay", &self.reconnect_delay.is_some())
            .field("user_jwt", &self.user_jwt.is_some())
            .field("signature", &self.signature.is_some())
            .finish()
    }
}

/// Connection options
///
/// Loadable from TOML; durations are written in milliseconds with an `_ms`
/// suffix. Pending limits and the reconnect buffer accept `-1` for unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    #[serde(default = "defaults::servers")]
    pub servers: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Keep configured server order instead of shuffling
    #[serde(default)]
    pub no_randomize: bool,
    /// Ask the server not to deliver our own publishes back to us
    #[serde(default)]
    pub no_echo: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub pedantic: bool,

    /// Require TLS (implied by any `tls://` server URL)
    #[serde(default)]
    pub secure: bool,
    #[serde(default = "defaults::tls_verify_cert")]
    pub tls_verify_cert: bool,
    #[serde(default)]
    pub tls_ca_cert_path: Option<String>,

    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Public NKey sent alongside a nonce signature
    #[serde(default)]
    pub nkey: Option<String>,

    #[serde(default = "defaults::allow_reconnect")]
    pub allow_reconnect: bool,
    #[serde(default = "defaults::max_reconnect")]
    pub max_reconnect: i64,
    #[serde(
        rename = "reconnect_wait_ms",
        default = "defaults::reconnect_wait",
        with = "duration_millis_serde"
    )]
    pub reconnect_wait: Duration,
    #[serde(
        rename = "reconnect_jitter_ms",
        default = "defaults::reconnect_jitter",
        with = "duration_millis_serde"
    )]
    pub reconnect_jitter: Duration,
    #[serde(
        rename = "reconnect_jitter_tls_ms",
        default = "defaults::reconnect_jitter_tls",
        with = "duration_millis_serde"
    )]
    pub reconnect_jitter_tls: Duration,
    #[serde(default = "defaults::reconnect_buffer_size")]
    pub reconnect_buffer_size: i64,

    #[serde(
        rename = "connect_timeout_ms",
        default = "defaults::connect_timeout",
        with = "duration_millis_serde"
    )]
    pub connect_timeout: Duration,
    #[serde(
        rename = "ping_interval_ms",
        default = "defaults::ping_interval",
        with = "duration_millis_serde"
    )]
    pub ping_interval: Duration,
    #[serde(default = "defaults::max_pings_out")]
    pub max_pings_out: u32,
    #[serde(
        rename = "flush_timeout_ms",
        default = "defaults::flush_timeout",
        with = "duration_millis_serde"
    )]
    pub flush_timeout: Duration,
    #[serde(
        rename = "drain_timeout_ms",
        default = "defaults::drain_timeout",
        with = "duration_millis_serde"
    )]
    pub drain_timeout: Duration,
    #[serde(
        rename = "request_timeout_ms",
        default = "defaults::request_timeout",
        with = "duration_millis_serde"
    )]
    pub request_timeout: Duration,

    #[serde(default = "defaults::pending_msg_limit")]
    pub pending_msg_limit: i64,
    #[serde(default = "defaults::pending_bytes_limit")]
    pub pending_bytes_limit: i64,
    /// Messages an async subscription handles per queue wake-up
    #[serde(default = "defaults::subscription_batch_size")]
    pub subscription_batch_size: usize,
    /// Shared delivery tasks for async subscriptions (0 = one task each)
    #[serde(default)]
    pub subscriber_delivery_task_count: usize,
    #[serde(
        rename = "flusher_coalesce_interval_ms",
        default = "defaults::flusher_coalesce_interval",
        with = "duration_millis_serde"
    )]
    pub flusher_coalesce_interval: Duration,

    #[serde(default = "defaults::inbox_prefix")]
    pub inbox_prefix: String,
    /// Do not add servers advertised through INFO to the pool
    #[serde(default)]
    pub ignore_discovered_servers: bool,
    #[serde(default = "defaults::read_buffer_size")]
    pub read_buffer_size: usize,

    #[serde(skip)]
    pub callbacks: Callbacks,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            servers: defaults::servers(),
            name: None,
            no_randomize: false,
            no_echo: false,
            verbose: false,
            pedantic: false,
            secure: false,
            tls_verify_cert: defaults::tls_verify_cert(),
            tls_ca_cert_path: None,
            user: None,
            password: None,
            token: None,
            nkey: None,
            allow_reconnect: defaults::allow_reconnect(),
            max_reconnect: defaults::max_reconnect(),
            reconnect_wait: defaults::reconnect_wait(),
            reconnect_jitter: defaults::reconnect_jitter(),
            reconnect_jitter_tls: defaults::reconnect_jitter_tls(),
            reconnect_buffer_size: defaults::reconnect_buffer_size(),
            connect_timeout: defaults::connect_timeout(),
            ping_interval: defaults::ping_interval(),
            max_pings_out: defaults::max_pings_out(),
            flush_timeout: defaults::flush_timeout(),
            drain_timeout: defaults::drain_timeout(),
            request_timeout: defaults::request_timeout(),
            pending_msg_limit: defaults::pending_msg_limit(),
            pending_bytes_limit: defaults::pending_bytes_limit(),
            subscription_batch_size: defaults::subscription_batch_size(),
            subscriber_delivery_task_count: 0,
            flusher_coalesce_interval: defaults::flusher_coalesce_interval(),
            inbox_prefix: defaults::inbox_prefix(),
            ignore_discovered_servers: false,
            read_buffer_size: defaults::read_buffer_size(),
            callbacks: Callbacks::default(),
        }
    }
}

impl Options {
    /// Defaults with the given server list
    #[must_use]
    pub fn with_servers<S: Into<String>>(servers: impl IntoIterator<Item = S>) -> Self {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn user_and_password(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn event_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.callbacks.event = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn reconnect_delay_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.callbacks.reconnect_delay = Some(Arc::new(f));
        self
    }

    /// Authenticate with a user JWT and nonce signature, both produced externally
    #[must_use]
    pub fn user_jwt<J, S>(mut self, jwt: J, sign: S) -> Self
    where
        J: Fn() -> Result<String> + Send + Sync + 'static,
        S: Fn(&[u8]) -> Result<String> + Send + Sync + 'static,
    {
        self.callbacks.user_jwt = Some(Arc::new(jwt));
        self.callbacks.signature = Some(Arc::new(sign));
        self
    }
}
