use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

const MAX_MESSAGE_CHARS: usize = 200;
const ELLIPSIS: &str = "...";

/// Stable codes persisted alongside serialized errors. Never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    Network,
    AuthExpired,
    Unexpected,
}

impl SyncErrorKind {
    pub fn code(self) -> i32 {
        match self {
            SyncErrorKind::Network => 0,
            SyncErrorKind::AuthExpired => 1,
            SyncErrorKind::Unexpected => 1000,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(SyncErrorKind::Network),
            1 => Some(SyncErrorKind::AuthExpired),
            1000 => Some(SyncErrorKind::Unexpected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("network error: {message}")]
    Network { message: String, timestamp: i64 },
    #[error("authentication expired")]
    AuthExpired { timestamp: i64 },
    #[error("unexpected error: {message}")]
    Unexpected { message: String, timestamp: i64 },
}

impl SyncError {
    pub fn network(message: impl Into<String>) -> Self {
        SyncError::Network {
            message: message.into(),
            timestamp: now_millis(),
        }
    }

    pub fn auth_expired() -> Self {
        SyncError::AuthExpired {
            timestamp: now_millis(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        SyncError::Unexpected {
            message: message.into(),
            timestamp: now_millis(),
        }
    }

    pub fn kind(&self) -> SyncErrorKind {
        match self {
            SyncError::Network { .. } => SyncErrorKind::Network,
            SyncError::AuthExpired { .. } => SyncErrorKind::AuthExpired,
            SyncError::Unexpected { .. } => SyncErrorKind::Unexpected,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SyncError::Network { timestamp, .. }
            | SyncError::AuthExpired { timestamp }
            | SyncError::Unexpected { timestamp, .. } => *timestamp,
        }
    }

    /// Whether the account needs the user to sign in again before it can sync.
    pub fn requires_reauth(&self) -> bool {
        matches!(self, SyncError::AuthExpired { .. })
    }

    pub fn to_serialized(&self) -> SerializedSyncError {
        let message = match self {
            SyncError::Network { message, .. } | SyncError::Unexpected { message, .. } => {
                message.clone()
            }
            SyncError::AuthExpired { .. } => String::new(),
        };
        SerializedSyncError {
            kind: self.kind().code(),
            timestamp: self.timestamp(),
            message: truncate_message(&message),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::unexpected(format!("I/O error: {err}"))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::unexpected(format!("serialization error: {err}"))
    }
}

/// Persisted form of a [`SyncError`], kept for diagnostics display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedSyncError {
    #[serde(rename = "type")]
    pub kind: i32,
    pub timestamp: i64,
    pub message: String,
}

impl SerializedSyncError {
    pub fn new(kind: i32, timestamp: i64, message: &str) -> Self {
        Self {
            kind,
            timestamp,
            message: truncate_message(message),
        }
    }

    pub fn into_error(self) -> Option<SyncError> {
        let kind = SyncErrorKind::from_code(self.kind)?;
        Some(match kind {
            SyncErrorKind::Network => SyncError::Network {
                message: self.message,
                timestamp: self.timestamp,
            },
            SyncErrorKind::AuthExpired => SyncError::AuthExpired {
                timestamp: self.timestamp,
            },
            SyncErrorKind::Unexpected => SyncError::Unexpected {
                message: self.message,
                timestamp: self.timestamp,
            },
        })
    }
}

fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_MESSAGE_CHARS {
        return message.to_string();
    }
    let keep = MAX_MESSAGE_CHARS - ELLIPSIS.len();
    let mut out: String = message.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}

pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
