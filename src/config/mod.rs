//! Configuration
//!
//! [`Options`] controls every tunable of a connection. It can be built in
//! code, loaded from TOML, or overridden by `NATS_*` environment variables.

pub mod defaults;
mod loading;
mod types;
mod validation;

pub use loading::{apply_env_overrides, load_options, load_options_from_env, parse_options};
pub use types::{
    Callbacks, EventCallback, Options, ReconnectDelayCallback, SignatureCallback, UserJwtCallback,
};
