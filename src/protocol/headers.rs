//! Message headers carried by `HMSG` / `HPUB`
//!
//! Wire format:
//!
//! ```text
//! NATS/1.0[ <status>[ <description>]]\r\n
//! Key: Value\r\n
//! ...
//! \r\n
//! ```
//!
//! Keys may repeat and keep their insertion order. Lookup is
//! case-insensitive; keys are written back exactly as given.

use bytes::BufMut;
use std::fmt;

use crate::constants::protocol::{CRLF, HEADER_VERSION, NO_RESPONDERS_STATUS};
use crate::error::{NatsError, Result};

/// Ordered header multi-map with an optional inline status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
    status: Option<u16>,
    description: Option<String>,
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.bytes().any(|b| b == b':' || !(33..=126).contains(&b)) {
        return Err(NatsError::InvalidArgument(format!("invalid header name {key:?}")));
    }
    Ok(())
}

fn validate_value(value: &str) -> Result<()> {
    if value.bytes().any(|b| b == b'\r' || b == b'\n') {
        return Err(NatsError::InvalidArgument(format!(
            "header value contains line break: {value:?}"
        )));
    }
    Ok(())
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Headers carrying only a status line
    #[must_use]
    pub fn with_status(code: u16, description: Option<&str>) -> Self {
        Self {
            entries: Vec::new(),
            status: Some(code),
            description: description.map(str::to_string),
        }
    }

    /// Append a value, keeping any existing values for the key
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let (key, value) = (key.into(), value.into());
        validate_key(&key)?;
        validate_value(&value)?;
        self.entries.push((key, value));
        Ok(())
    }

    /// Set a key to a single value, replacing existing values
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        validate_key(&key)?;
        self.remove(&key);
        self.append(key, value)
    }

    /// First value for `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `key` in insertion order
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Remove every value for `key`, returning whether anything was removed
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        before != self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of key/value pairs
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.status.is_none()
    }

    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Check for the server's "no responders" status
    #[must_use]
    pub fn is_no_responders(&self) -> bool {
        self.status == Some(NO_RESPONDERS_STATUS)
    }

    /// Parse a header block as delivered by `HMSG`
    pub fn parse(block: &[u8]) -> Result<Self> {
        let mut lines = CrlfLines { data: block, pos: 0 };

        let version_line = lines
            .next()
            .ok_or_else(|| NatsError::protocol("empty header block"))?;
        let rest = version_line
            .strip_prefix(HEADER_VERSION.as_bytes())
            .ok_or_else(|| {
                NatsError::protocol(format!(
                    "header block missing version: {:?}",
                    String::from_utf8_lossy(version_line)
                ))
            })?;

        let mut headers = Self::new();
        let status_text = std::str::from_utf8(rest)
            .map_err(|_| NatsError::protocol("header status is not UTF-8"))?
            .trim();
        if !status_text.is_empty() {
            let (code, desc) = match status_text.split_once(' ') {
                Some((code, desc)) => (code, Some(desc.trim())),
                None => (status_text, None),
            };
            let code = code
                .parse::<u16>()
                .map_err(|_| NatsError::protocol(format!("bad header status {code:?}")))?;
            headers.status = Some(code);
            headers.description = desc.filter(|d| !d.is_empty()).map(str::to_string);
        }

        for line in lines {
            if line.is_empty() {
                break;
            }
            let colon = memchr::memchr(b':', line).ok_or_else(|| {
                NatsError::protocol(format!(
                    "header line missing colon: {:?}",
                    String::from_utf8_lossy(line)
                ))
            })?;
            let key = std::str::from_utf8(&line[..colon])
                .map_err(|_| NatsError::protocol("header name is not UTF-8"))?
                .trim();
            let value = std::str::from_utf8(&line[colon + 1..])
                .map_err(|_| NatsError::protocol("header value is not UTF-8"))?
                .trim();
            if key.is_empty() {
                return Err(NatsError::protocol("empty header name"));
            }
            headers.entries.push((key.to_string(), value.to_string()));
        }

        Ok(headers)
    }

    /// Write the wire form, including the terminating blank line
    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_slice(HEADER_VERSION.as_bytes());
        if let Some(code) = self.status {
            out.put_u8(b' ');
            out.put_slice(code.to_string().as_bytes());
            if let Some(desc) = &self.description {
                out.put_u8(b' ');
                out.put_slice(desc.as_bytes());
            }
        }
        out.put_slice(CRLF);
        for (key, value) in &self.entries {
            out.put_slice(key.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(CRLF);
        }
        out.put_slice(CRLF);
    }

    /// Encoded wire form as a new buffer
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len_hint());
        self.encode(&mut out);
        out
    }

    fn encoded_len_hint(&self) -> usize {
        HEADER_VERSION.len()
            + 16
            + self
                .entries
                .iter()
                .map(|(k, v)| k.len() + v.len() + 4)
                .sum::<usize>()
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// Iterator over CRLF-terminated lines (a bare LF also ends a line)
struct CrlfLines<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for CrlfLines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.pos..];
        let (line, advance) = match memchr::memchr(b'\n', rest) {
            Some(lf) => (&rest[..lf], lf + 1),
            None => (rest, rest.len()),
        };
        self.pos += advance;
        Some(line.strip_suffix(b"\r").unwrap_or(line))
    }
}
