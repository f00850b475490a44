//! Loading options from TOML files and environment variables
//!
//! Environment variables take precedence over the file so deployments can
//! point a shared config at a different cluster:
//! - `NATS_SERVERS` comma-separated URLs (wins over `NATS_URL`)
//! - `NATS_URL` a single URL
//! - `NATS_NAME`, `NATS_USER`, `NATS_PASSWORD`, `NATS_TOKEN`

use anyhow::{Context, Result};
use std::path::Path;

use super::types::Options;

/// Apply environment overrides read through `lookup`
pub fn apply_env_overrides<F>(options: &mut Options, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(list) = non_empty("NATS_SERVERS") {
        let servers: Vec<String> = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        tracing::info!(
            "Using {} server(s) from NATS_SERVERS (overriding config file)",
            servers.len()
        );
        options.servers = servers;
    } else if let Some(url) = non_empty("NATS_URL") {
        tracing::info!("Using server from NATS_URL (overriding config file)");
        options.servers = vec![url.trim().to_string()];
    }

    if let Some(name) = non_empty("NATS_NAME") {
        options.name = Some(name);
    }
    if let Some(user) = non_empty("NATS_USER") {
        options.user = Some(user);
    }
    if let Some(password) = non_empty("NATS_PASSWORD") {
        options.password = Some(password);
    }
    if let Some(token) = non_empty("NATS_TOKEN") {
        options.token = Some(token);
    }
}

/// Parse options from TOML text without validating
pub fn parse_options(content: &str) -> Result<Options> {
    toml::from_str(content).context("Failed to parse options")
}

/// Load options from a TOML file, apply environment overrides, and validate
pub fn load_options(path: impl AsRef<Path>) -> Result<Options> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;

    let mut options: Options = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;

    apply_env_overrides(&mut options, |key| std::env::var(key).ok());
    options
        .validate()
        .with_context(|| format!("Invalid config file '{}'", path.display()))?;
    Ok(options)
}

/// Defaults plus environment overrides, validated
pub fn load_options_from_env() -> Result<Options> {
    let mut options = Options::default();
    apply_env_overrides(&mut options, |key| std::env::var(key).ok());
    options.validate().context("Invalid options from environment")?;
    Ok(options)
}
