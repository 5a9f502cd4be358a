//! Lifecycle events emitted by the transfer engine
//!
//! Events arrive one at a time as JSON objects tagged by an `event` field.
//! Delivery is unordered and may duplicate; unknown extra fields are ignored.
//!
//! ```
//! use ferry_core::events::EngineEvent;
//!
//! let line = r#"{"event":"progress","transfer_id":"t1","progress":0.5,
//!                "bytes_transferred":512,"total_bytes":1024}"#;
//! let event = EngineEvent::from_json(line).unwrap();
//! assert_eq!(event.transfer_id(), Some("t1"));
//! assert_eq!(event.kind(), "progress");
//! ```

use crate::error::ErrorCode;
use crate::transfer::{ConnectionStatus, Protocol, TransferMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transfer accepted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartedEvent {
    /// Engine-assigned id
    pub transfer_id: String,
    /// File being transferred
    #[serde(default)]
    pub filename: String,
    /// Size of the file in bytes, `0` if unknown
    #[serde(default)]
    pub file_size: u64,
    /// Transport protocol
    #[serde(default)]
    pub protocol: Protocol,
    /// Local role
    #[serde(default)]
    pub mode: TransferMode,
    /// Unix seconds; `0` means "now"
    #[serde(default)]
    pub timestamp: f64,
}

/// Periodic progress report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Transfer id
    pub transfer_id: String,
    /// Fraction complete, expected in `[0, 1]`
    pub progress: f64,
    /// Bytes/second
    #[serde(default)]
    pub speed: f64,
    /// Seconds remaining, `0` if unknown
    #[serde(default)]
    pub eta: f64,
    /// Bytes transferred so far
    #[serde(default)]
    pub bytes_transferred: u64,
    /// Total bytes, `0` if unknown
    #[serde(default)]
    pub total_bytes: u64,
    /// Unix seconds; `0` means "now"
    #[serde(default)]
    pub timestamp: f64,
}

/// Transfer failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Transfer id
    pub transfer_id: String,
    /// Message reported by the engine
    pub error_message: String,
    /// Classified code
    #[serde(default = "unknown_code")]
    pub error_code: ErrorCode,
    /// Engine's own recoverability hint
    #[serde(default)]
    pub recoverable: bool,
    /// Unix seconds; `0` means "now"
    #[serde(default)]
    pub timestamp: f64,
}

fn unknown_code() -> ErrorCode {
    ErrorCode::UnknownError
}

/// Transfer finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedEvent {
    /// Transfer id
    pub transfer_id: String,
    /// Whether the engine considers the transfer successful
    pub success: bool,
    /// Bytes transferred in total
    #[serde(default)]
    pub bytes_transferred: u64,
    /// Duration in seconds
    #[serde(default)]
    pub duration: f64,
    /// Checksum of the transferred file, empty if unavailable
    #[serde(default)]
    pub checksum: String,
    /// Unix seconds; `0` means "now"
    #[serde(default)]
    pub timestamp: f64,
}

/// Transfer cancelled by either side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelledEvent {
    /// Transfer id
    pub transfer_id: String,
    /// Free-form reason
    #[serde(default)]
    pub reason: String,
    /// Unix seconds; `0` means "now"
    #[serde(default)]
    pub timestamp: f64,
}

/// Connection state kinds reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionEventType {
    /// Dialing
    Connecting,
    /// Connected
    Connected,
    /// Waiting for peers
    Listening,
    /// Connection closed
    Disconnected,
}

impl From<ConnectionEventType> for ConnectionStatus {
    fn from(kind: ConnectionEventType) -> Self {
        match kind {
            ConnectionEventType::Connecting => ConnectionStatus::Connecting,
            ConnectionEventType::Connected => ConnectionStatus::Connected,
            ConnectionEventType::Listening => ConnectionStatus::Listening,
            ConnectionEventType::Disconnected => ConnectionStatus::Disconnected,
        }
    }
}

/// Connection state change, may arrive before any transfer starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    /// Transfer id, if the connection belongs to one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,
    /// State kind
    pub event_type: ConnectionEventType,
    /// Remote or local address
    #[serde(default)]
    pub address: String,
    /// Transport protocol
    #[serde(default)]
    pub protocol: Protocol,
    /// Unix seconds; `0` means "now"
    #[serde(default)]
    pub timestamp: f64,
}

/// Any event the engine may emit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum EngineEvent {
    /// Transfer accepted
    Started(StartedEvent),
    /// Progress report
    Progress(ProgressEvent),
    /// Failure
    Error(ErrorEvent),
    /// Finished
    Completed(CompletedEvent),
    /// Cancelled
    Cancelled(CancelledEvent),
    /// Connection state change
    Connection(ConnectionEvent),
}

impl EngineEvent {
    /// Parse a single JSON event
    pub fn from_json(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }

    /// Transfer id carried by the event, if any
    #[must_use]
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            Self::Started(e) => Some(&e.transfer_id),
            Self::Progress(e) => Some(&e.transfer_id),
            Self::Error(e) => Some(&e.transfer_id),
            Self::Completed(e) => Some(&e.transfer_id),
            Self::Cancelled(e) => Some(&e.transfer_id),
            Self::Connection(e) => e.transfer_id.as_deref(),
        }
    }

    /// Event tag as it appears on the wire
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Started(_) => "started",
            Self::Progress(_) => "progress",
            Self::Error(_) => "error",
            Self::Completed(_) => "completed",
            Self::Cancelled(_) => "cancelled",
            Self::Connection(_) => "connection",
        }
    }

    /// Returns true for completed, cancelled and error events
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Completed(_) | Self::Cancelled(_))
    }

    /// Raw timestamp in unix seconds
    #[must_use]
    pub fn timestamp(&self) -> f64 {
        match self {
            Self::Started(e) => e.timestamp,
            Self::Progress(e) => e.timestamp,
            Self::Error(e) => e.timestamp,
            Self::Completed(e) => e.timestamp,
            Self::Cancelled(e) => e.timestamp,
            Self::Connection(e) => e.timestamp,
        }
    }

    /// `Started` with the given id, filename and size
    #[must_use]
    pub fn started(id: impl Into<String>, filename: impl Into<String>, file_size: u64) -> Self {
        Self::Started(StartedEvent {
            transfer_id: id.into(),
            filename: filename.into(),
            file_size,
            protocol: Protocol::Tcp,
            mode: TransferMode::Transmitter,
            timestamp: 0.0,
        })
    }

    /// `Progress` with the given fraction and byte counts
    #[must_use]
    pub fn progress(
        id: impl Into<String>,
        progress: f64,
        bytes_transferred: u64,
        total_bytes: u64,
    ) -> Self {
        Self::Progress(ProgressEvent {
            transfer_id: id.into(),
            progress,
            speed: 0.0,
            eta: 0.0,
            bytes_transferred,
            total_bytes,
            timestamp: 0.0,
        })
    }

    /// `Error` with the given code and message
    #[must_use]
    pub fn error(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorEvent {
            transfer_id: id.into(),
            error_message: message.into(),
            error_code: code,
            recoverable: code.is_recoverable(),
            timestamp: 0.0,
        })
    }

    /// `Completed` with the given outcome
    #[must_use]
    pub fn completed(
        id: impl Into<String>,
        success: bool,
        bytes_transferred: u64,
        duration: f64,
        checksum: impl Into<String>,
    ) -> Self {
        Self::Completed(CompletedEvent {
            transfer_id: id.into(),
            success,
            bytes_transferred,
            duration,
            checksum: checksum.into(),
            timestamp: 0.0,
        })
    }

    /// `Cancelled` with the given reason
    #[must_use]
    pub fn cancelled(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Cancelled(CancelledEvent {
            transfer_id: id.into(),
            reason: reason.into(),
            timestamp: 0.0,
        })
    }

    /// `Connection` not tied to a transfer
    #[must_use]
    pub fn connection(event_type: ConnectionEventType, address: impl Into<String>) -> Self {
        Self::Connection(ConnectionEvent {
            transfer_id: None,
            event_type,
            address: address.into(),
            protocol: Protocol::Tcp,
            timestamp: 0.0,
        })
    }
}

/// Convert an event timestamp to a wall-clock time
///
/// Non-positive or out-of-range values fall back to `now`.
#[must_use]
pub fn event_time(timestamp: f64, now: DateTime<Utc>) -> DateTime<Utc> {
    if !timestamp.is_finite() || timestamp <= 0.0 {
        return now;
    }
    let secs = timestamp.trunc() as i64;
    let nanos = ((timestamp.fract()) * 1e9) as u32;
    DateTime::from_timestamp(secs, nanos).unwrap_or(now)
}
