//! Duration serialization helpers for configuration files

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Helper for (de)serializing a Duration as whole milliseconds
///
/// Client timeouts are routinely sub-second (flush coalescing, reconnect
/// jitter), so config files express them in milliseconds.
pub mod duration_millis_serde {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper for (de)serializing Option<Duration> as milliseconds
pub mod option_duration_millis_serde {
    use super::*;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Timeouts {
        #[serde(with = "super::duration_millis_serde")]
        wait: Duration,
        #[serde(default, with = "super::option_duration_millis_serde")]
        extra: Option<Duration>,
    }

    #[test]
    fn test_millis_from_toml() {
        let parsed: Timeouts = toml::from_str("wait = 250\nextra = 5").unwrap();
        assert_eq!(parsed.wait, Duration::from_millis(250));
        assert_eq!(parsed.extra, Some(Duration::from_millis(5)));
    }

    #[test]
    fn test_missing_optional_is_none() {
        let parsed: Timeouts = toml::from_str("wait = 1").unwrap();
        assert_eq!(parsed.extra, None);
    }

    #[test]
    fn test_serialize_writes_millis() {
        let value = Timeouts {
            wait: Duration::from_secs(2),
            extra: None,
        };
        let text = toml::to_string(&value).unwrap();
        assert!(text.contains("wait = 2000"));
    }
}
