//! Validated wire identifiers that enforce invariants at construction time

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Validation errors for wire identifiers
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("subject cannot be empty")]
    EmptySubject,

    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),

    #[error("invalid queue group: {0:?}")]
    InvalidQueueGroup(String),
}

impl From<ValidationError> for crate::NatsError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::EmptySubject => Self::BadSubject(String::new()),
            ValidationError::InvalidSubject(s) => Self::BadSubject(s),
            ValidationError::InvalidQueueGroup(q) => Self::BadQueueGroup(q),
        }
    }
}

/// Macro to generate validated string newtypes.
///
/// Each type gets a validating `new()`, `as_str()`, `AsRef<str>`, `Deref`,
/// `Display`, `TryFrom<String>`, and serde impls that re-run validation.
macro_rules! validated_string {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident(String) {
            validation: |$s_param:ident| $validation:expr,
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
        #[serde(transparent)]
        $vis struct $name(String);

        impl $name {
            #[doc = concat!("Create a new ", stringify!($name), " after validation")]
            pub fn new($s_param: impl Into<String>) -> Result<Self, ValidationError> {
                let $s_param: String = $s_param.into();
                let validate = || $validation;
                validate()?;
                Ok(Self($s_param))
            }

            #[doc = concat!("Get the ", stringify!($name), " as a string slice")]
            #[must_use]
            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            #[inline]
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;

            #[inline]
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::new(s).map_err(serde::de::Error::custom)
            }
        }
    };
}

validated_string! {
    /// A subscription subject: dot-separated tokens, `*` matches one token and
    /// `>` matches the remaining tail (only as the last token)
    ///
    /// # Examples
    /// ```
    /// use nats_core_client::types::Subject;
    ///
    /// assert!(Subject::new("orders.*.created").is_ok());
    /// assert!(Subject::new("orders.>").is_ok());
    /// assert!(Subject::new("orders..created").is_err());
    /// assert!(Subject::new("orders.>.created").is_err());
    /// ```
    pub struct Subject(String) {
        validation: |s| validate_subject(&s),
    }
}

validated_string! {
    /// A queue group name (non-empty, no whitespace)
    pub struct QueueGroup(String) {
        validation: |s| {
            if s.is_empty() || s.bytes().any(is_whitespace) {
                Err(ValidationError::InvalidQueueGroup(s.clone()))
            } else {
                Ok(())
            }
        },
    }
}

#[inline]
const fn is_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

fn validate_subject(s: &str) -> Result<(), ValidationError> {
    if s.is_empty() {
        return Err(ValidationError::EmptySubject);
    }
    if s.bytes().any(is_whitespace) {
        return Err(ValidationError::InvalidSubject(s.to_string()));
    }

    let mut tokens = s.split('.').peekable();
    while let Some(token) = tokens.next() {
        if token.is_empty() {
            return Err(ValidationError::InvalidSubject(s.to_string()));
        }
        // Tail wildcard must be the final token
        if token == ">" && tokens.peek().is_some() {
            return Err(ValidationError::InvalidSubject(s.to_string()));
        }
    }
    Ok(())
}

/// Check a publish subject: non-empty and free of protocol-breaking whitespace
///
/// Publishing does not parse tokens, the server rejects anything else.
#[inline]
#[must_use]
pub fn is_valid_publish_subject(subject: &str) -> bool {
    !subject.is_empty() && !subject.bytes().any(is_whitespace)
}
