//! `INFO` and `CONNECT` payloads

use serde::{Deserialize, Serialize};

use crate::error::{NatsError, Result};

/// Server-advertised information from `INFO {json}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    pub server_id: String,
    pub server_name: String,
    pub version: String,
    pub go: String,
    pub host: String,
    pub port: u16,
    pub headers: bool,
    pub auth_required: bool,
    pub tls_required: bool,
    pub tls_available: bool,
    pub max_payload: usize,
    pub proto: i32,
    pub client_id: u64,
    pub client_ip: String,
    pub nonce: Option<String>,
    pub cluster: Option<String>,
    /// Other cluster members the client may fail over to
    pub connect_urls: Vec<String>,
    /// Lame duck mode: the server is shutting down
    #[serde(rename = "ldm")]
    pub lame_duck_mode: bool,
}

impl ServerInfo {
    /// Decode the JSON argument of an `INFO` line
    pub fn parse(json: &[u8]) -> Result<Self> {
        serde_json::from_slice(json)
            .map_err(|e| NatsError::protocol(format!("invalid INFO payload: {e}")))
    }
}

/// Client options sent in `CONNECT {json}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    #[serde(rename = "jwt", skip_serializing_if = "Option::is_none")]
    pub user_jwt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,
    #[serde(rename = "sig", skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "pass", skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(rename = "auth_token", skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub tls_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lang: String,
    pub version: String,
    pub protocol: u8,
    pub echo: bool,
    pub headers: bool,
    pub no_responders: bool,
}

impl ConnectInfo {
    /// Render the full `CONNECT {json}\r\n` line
    pub fn to_line(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| NatsError::Config(format!("cannot encode CONNECT: {e}")))?;
        let mut line = Vec::with_capacity(json.len() + 10);
        line.extend_from_slice(b"CONNECT ");
        line.extend_from_slice(&json);
        line.extend_from_slice(b"\r\n");
        Ok(line)
    }
}
