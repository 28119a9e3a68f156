//! Queue channel notifications.
//!
//! Every event on a queue's pub/sub channel is a short text of the form
//! `kind:value`, split on the first colon so ids may contain colons:
//!
//! - `message:<id>`: an id was pushed or requeued
//! - `timeout:<epoch_ms>`: the nearest in-flight deadline changed
//! - `error:<id>`: an id was dead-lettered

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Message(String),
    Timeout(i64),
    Error(String),
}

/// Why a channel payload could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseNotificationError {
    #[error("notification has no kind separator: {0:?}")]
    MissingSeparator(String),

    #[error("unknown notification kind: {0:?}")]
    UnknownKind(String),

    #[error("invalid timeout value: {0:?}")]
    InvalidTimeout(String),
}

/// Parses a deadline or schedule score published by the store.
///
/// Scores normally arrive as integers, but Redis may format large or
/// fractional scores as floats.
pub fn parse_score(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(value) = raw.parse::<i64>() {
        return Some(value);
    }
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v as i64)
}

impl FromStr for Notification {
    type Err = ParseNotificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| ParseNotificationError::MissingSeparator(s.to_string()))?;

        match kind {
            "message" => Ok(Self::Message(value.to_string())),
            "error" => Ok(Self::Error(value.to_string())),
            "timeout" => parse_score(value)
                .map(Self::Timeout)
                .ok_or_else(|| ParseNotificationError::InvalidTimeout(value.to_string())),
            other => Err(ParseNotificationError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(id) => write!(f, "message:{}", id),
            Self::Timeout(at) => write!(f, "timeout:{}", at),
            Self::Error(id) => write!(f, "error:{}", id),
        }
    }
}
