// Validated newtype wrappers around topic and channel names, so malformed
// names are caught before they reach the wire rather than surfacing as a
// server error frame several round-trips later.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("name must not be empty")]
    Empty,
    #[error("name too long: {len} bytes (max {MAX_NAME_LEN})")]
    TooLong { len: usize },
    #[error("name contains invalid character {0:?}; only [.a-zA-Z0-9_-] and a trailing #ephemeral suffix are allowed")]
    InvalidChar(char),
}

fn validate(s: &str) -> Result<(), NameError> {
    if s.is_empty() {
        return Err(NameError::Empty);
    }
    if s.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong { len: s.len() });
    }
    let body = s.strip_suffix("#ephemeral").unwrap_or(s);
    if body.is_empty() {
        return Err(NameError::Empty);
    }
    for ch in body.chars() {
        if !(ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-') {
            return Err(NameError::InvalidChar(ch));
        }
    }
    Ok(())
}

macro_rules! validated_name {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True for channel names ending in `#ephemeral`: the server
            /// discards these instead of persisting them when idle.
            pub fn is_ephemeral(&self) -> bool {
                self.0.ends_with("#ephemeral")
            }
        }

        impl FromStr for $name {
            type Err = NameError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                validate(s)?;
                Ok($name(s.to_string()))
            }
        }

        impl TryFrom<&str> for $name {
            type Error = NameError;

            fn try_from(s: &str) -> Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl TryFrom<String> for $name {
            type Error = NameError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                validate(&s)?;
                Ok($name(s))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

validated_name!(Topic);
validated_name!(Channel);
