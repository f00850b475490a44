//! Server endpoint URLs and pool entries

use std::fmt;
use std::time::{Duration, Instant};

use crate::constants::socket::DEFAULT_PORT;
use crate::error::{NatsError, Result};

/// Transport requested by a URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// `nats://` plain TCP, upgraded to TLS only if the server requires it
    Nats,
    /// `tls://` TLS required
    Tls,
}

impl Scheme {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Nats => "nats",
            Self::Tls => "tls",
        }
    }
}

/// A parsed server URL
///
/// Accepts `nats://host:port`, `tls://host:port`, bare `host:port` and bare
/// `host`. Userinfo is either `user:password@` or a single `token@`.
/// IPv6 literals must be bracketed when a port is present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerUrl {
    scheme: Scheme,
    host: String,
    port: u16,
    user: Option<String>,
    password: Option<String>,
    token: Option<String>,
}

impl ServerUrl {
    /// Parse a server URL, defaulting the scheme to `nats` and the port to 4222
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(NatsError::InvalidUrl(input.to_string()));
        }

        let (scheme, rest) = match trimmed.split_once("://") {
            Some((scheme, rest)) => {
                let scheme = match scheme.to_ascii_lowercase().as_str() {
                    "nats" => Scheme::Nats,
                    "tls" => Scheme::Tls,
                    _ => return Err(NatsError::InvalidUrl(input.to_string())),
                };
                (scheme, rest)
            }
            None => (Scheme::Nats, trimmed),
        };

        // Paths carry no meaning for NATS
        let authority = rest.split('/').next().unwrap_or_default();

        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((info, hp)) => (Some(info), hp),
            None => (None, authority),
        };

        let (host, port) = split_host_port(hostport)
            .ok_or_else(|| NatsError::InvalidUrl(input.to_string()))?;

        let (user, password, token) = match userinfo {
            None | Some("") => (None, None, None),
            Some(info) => match info.split_once(':') {
                Some((user, pass)) => (Some(user.to_string()), Some(pass.to_string()), None),
                None => (None, None, Some(info.to_string())),
            },
        };

        Ok(Self {
            scheme,
            host,
            port,
            user,
            password,
            token,
        })
    }

    #[must_use]
    pub const fn scheme(&self) -> Scheme {
        self.scheme
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Check if the scheme demands TLS
    #[must_use]
    pub fn requires_tls(&self) -> bool {
        self.scheme == Scheme::Tls
    }

    /// `host:port` suitable for socket address resolution
    #[must_use]
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Check if the host names this machine
    #[must_use]
    pub fn is_loopback(&self) -> bool {
        is_loopback_host(&self.host)
    }

    /// Endpoint equivalence used for pool deduplication
    ///
    /// Ports must match. Hosts match case-insensitively, and all loopback
    /// spellings (`localhost`, `127.0.0.1`, `::1`) are the same host.
    #[must_use]
    pub fn same_endpoint(&self, other: &Self) -> bool {
        self.port == other.port
            && (self.host.eq_ignore_ascii_case(&other.host)
                || (self.is_loopback() && other.is_loopback()))
    }
}

/// Displays without credentials so URLs are safe to log
impl fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.socket_addr())
    }
}

impl std::str::FromStr for ServerUrl {
    type Err = NatsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn is_loopback_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" || host == "::1"
}

fn split_host_port(hostport: &str) -> Option<(String, u16)> {
    if let Some(rest) = hostport.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if after.is_empty() => DEFAULT_PORT,
            None => return None,
        };
        return (!host.is_empty()).then(|| (host.to_string(), port));
    }

    // Unbracketed IPv6 literal, no port possible
    if hostport.matches(':').count() > 1 {
        return Some((hostport.to_string(), DEFAULT_PORT));
    }

    let (host, port) = match hostport.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (hostport, DEFAULT_PORT),
    };
    (!host.is_empty()).then(|| (host.to_string(), port))
}

/// One candidate endpoint in the server pool
#[derive(Debug, Clone)]
pub struct Srv {
    pub(crate) id: u64,
    pub url: ServerUrl,
    /// Learned from server INFO rather than configured
    pub is_implicit: bool,
    /// Reconnect attempts since the last successful connection
    pub reconnects: u32,
    pub last_attempt: Option<Instant>,
    pub did_connect: bool,
}

impl Srv {
    pub(crate) fn new(id: u64, url: ServerUrl, is_implicit: bool) -> Self {
        Self {
            id,
            url,
            is_implicit,
            reconnects: 0,
            last_attempt: None,
            did_connect: false,
        }
    }

    pub(crate) fn mark_attempt(&mut self) {
        self.last_attempt = Some(Instant::now());
    }

    /// Time since the last connection attempt, `None` if never attempted
    #[must_use]
    pub fn since_last_attempt(&self) -> Option<Duration> {
        self.last_attempt.map(|t| t.elapsed())
    }
}
