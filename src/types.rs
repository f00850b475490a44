//! Core value types shared across the client
//!
//! Validated wire identifiers and serde helpers used by configuration.

pub mod duration;
pub mod validated;

pub use duration::{duration_millis_serde, option_duration_millis_serde};
pub use validated::{QueueGroup, Subject, ValidationError, is_valid_publish_subject};
