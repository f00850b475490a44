//! NATS client protocol core
//!
//! An asynchronous client for the NATS text protocol on top of tokio:
//!
//! - [`protocol`]: incremental parser for server operations and encoders for
//!   client operations
//! - [`connection`]: handshake, server pool failover, reconnect buffering,
//!   keepalive, flush, drain and close
//! - [`subscription`]: per-subscription queues with pending limits, slow
//!   consumer detection, auto-unsubscribe and drain
//! - request/reply over a shared inbox subscription
//!
//! Start with [`Connection::connect`].

pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod logging;
pub mod message;
pub mod network;
pub mod nuid;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod stream;
pub mod subscription;
pub mod tls;
pub mod types;

pub use config::Options;
pub use connection::{Connection, ConnectionState, Event, Stats};
pub use error::{NatsError, Result};
pub use message::Msg;
pub use protocol::Headers;
pub use subscription::{AsyncSubscription, MsgFilter, Subscription, SyncSubscription};
