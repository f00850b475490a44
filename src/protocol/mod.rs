//! NATS wire protocol
//!
//! Parsing of server operations, encoding of client operations, and the
//! JSON payloads exchanged during the handshake.

pub mod encode;
pub mod headers;
pub mod info;
pub mod parser;

pub use encode::{ControlLineEncoder, put_decimal, put_sub, put_unsub};
pub use headers::Headers;
pub use info::{ConnectInfo, ServerInfo};
pub use parser::{MsgArgs, Parser, ProtocolHandler, parse_size};
