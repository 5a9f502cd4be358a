//! Error taxonomy for Ferry
//!
//! Every failure that reaches the orchestration layer, whether it arrives as an
//! `error` event from the transfer engine or as a failed engine call, is
//! normalized into a single [`ErrorCode`] taxonomy.
//!
//! # Error Categories
//!
//! - **Protocol/Network**: `NETWORK_ERROR`, `CONNECTION_REFUSED`, `TIMEOUT`,
//!   `RATE_LIMIT_EXCEEDED`. Recoverable and eligible for automatic retry.
//! - **Data integrity**: `CHECKSUM_MISMATCH`, `CORRUPTED_DATA`. Recoverable,
//!   but never retried automatically.
//! - **Fatal/local**: everything else. Surfaced immediately, never retried.
//!
//! # Example
//!
//! ```
//! use ferry_core::error::{ErrorCode, TransferError};
//!
//! let err = TransferError::new(ErrorCode::Timeout, "engine did not answer");
//! assert!(err.is_recoverable());
//! assert!(err.code.is_auto_retryable());
//! ```

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Classified error code shared by engine events and command failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Generic network failure
    NetworkError,
    /// Remote endpoint refused the connection
    ConnectionRefused,
    /// Operation timed out
    Timeout,
    /// Remote side is throttling requests
    RateLimitExceeded,
    /// Received data did not match the advertised checksum
    ChecksumMismatch,
    /// Received data could not be decoded
    CorruptedData,
    /// Protocol violation reported by the engine
    ProtocolError,
    /// Local file could not be read or written
    FileError,
    /// Transfer configuration was rejected
    ConfigError,
    /// Insufficient permissions for a local operation
    PermissionDenied,
    /// Not enough disk space for the incoming file
    InsufficientSpace,
    /// Source file does not exist
    FileNotFound,
    /// Transfer was cancelled
    Cancelled,
    /// Anything the engine could not classify
    #[serde(other)]
    UnknownError,
}

/// Codes that may succeed if the transfer is attempted again
const RECOVERABLE: &[ErrorCode] = &[
    ErrorCode::NetworkError,
    ErrorCode::ConnectionRefused,
    ErrorCode::Timeout,
    ErrorCode::ChecksumMismatch,
    ErrorCode::CorruptedData,
    ErrorCode::RateLimitExceeded,
];

/// Codes retried without asking the user
const AUTO_RETRYABLE: &[ErrorCode] = &[
    ErrorCode::NetworkError,
    ErrorCode::ConnectionRefused,
    ErrorCode::Timeout,
    ErrorCode::RateLimitExceeded,
];

impl ErrorCode {
    /// All codes, in declaration order
    pub const ALL: [ErrorCode; 14] = [
        ErrorCode::NetworkError,
        ErrorCode::ConnectionRefused,
        ErrorCode::Timeout,
        ErrorCode::RateLimitExceeded,
        ErrorCode::ChecksumMismatch,
        ErrorCode::CorruptedData,
        ErrorCode::ProtocolError,
        ErrorCode::FileError,
        ErrorCode::ConfigError,
        ErrorCode::PermissionDenied,
        ErrorCode::InsufficientSpace,
        ErrorCode::FileNotFound,
        ErrorCode::Cancelled,
        ErrorCode::UnknownError,
    ];

    /// Wire representation (`NETWORK_ERROR`, `TIMEOUT`, ...)
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::ConnectionRefused => "CONNECTION_REFUSED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::ChecksumMismatch => "CHECKSUM_MISMATCH",
            ErrorCode::CorruptedData => "CORRUPTED_DATA",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::FileError => "FILE_ERROR",
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::InsufficientSpace => "INSUFFICIENT_SPACE",
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Returns true if the transfer may succeed when attempted again
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        RECOVERABLE.contains(self)
    }

    /// Returns true if the code may be retried without user intervention
    ///
    /// This is a strict subset of [`ErrorCode::is_recoverable`]: data
    /// integrity failures are recoverable but never retried automatically.
    #[must_use]
    pub fn is_auto_retryable(&self) -> bool {
        AUTO_RETRYABLE.contains(self)
    }

    /// Human-readable message shown to the user
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        match self {
            ErrorCode::NetworkError => "Network connection failed. Please check your connection.",
            ErrorCode::ConnectionRefused => {
                "Connection refused. Make sure the receiver is running and reachable."
            }
            ErrorCode::Timeout => "The operation timed out. The network may be slow or unavailable.",
            ErrorCode::RateLimitExceeded => "Too many requests. Please wait before trying again.",
            ErrorCode::ChecksumMismatch => {
                "File integrity check failed. The file may have been corrupted in transit."
            }
            ErrorCode::CorruptedData => "Received data is corrupted.",
            ErrorCode::FileError => "Could not read or write the file.",
            ErrorCode::ConfigError => "The transfer configuration is invalid.",
            ErrorCode::PermissionDenied => "Permission denied. Check file and folder permissions.",
            ErrorCode::InsufficientSpace => "Not enough disk space to complete the transfer.",
            ErrorCode::FileNotFound => "The selected file could not be found.",
            ErrorCode::Cancelled => "The transfer was cancelled.",
            ErrorCode::ProtocolError | ErrorCode::UnknownError => "An unexpected error occurred",
        }
    }

    /// Suggested recovery action, if there is one
    #[must_use]
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            ErrorCode::NetworkError => Some("Check network connection and try again"),
            ErrorCode::ConnectionRefused => {
                Some("Ensure the target is reachable and accepting connections")
            }
            ErrorCode::Timeout => {
                Some("Operation timed out. Check network conditions and try again")
            }
            ErrorCode::RateLimitExceeded => Some("Rate limit exceeded. Wait before retrying"),
            ErrorCode::ChecksumMismatch | ErrorCode::CorruptedData => {
                Some("File may be corrupted. Try transferring again")
            }
            ErrorCode::FileNotFound => Some("Verify that the file exists and is accessible"),
            ErrorCode::PermissionDenied => Some("Check permissions for the file and folder"),
            ErrorCode::InsufficientSpace => Some("Free up disk space and try again"),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = std::convert::Infallible;

    /// Unknown strings map to [`ErrorCode::UnknownError`]
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(ErrorCode::ALL
            .into_iter()
            .find(|code| code.as_str().eq_ignore_ascii_case(s.trim()))
            .unwrap_or(ErrorCode::UnknownError))
    }
}

/// A classified transfer failure
///
/// This is what engine calls return and what the retry machinery operates on.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct TransferError {
    /// Classified code
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Transfer the failure belongs to, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,
    /// Whether another attempt could succeed
    pub recoverable: bool,
}

impl TransferError {
    /// Create an error whose recoverability follows the code's classification
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            transfer_id: None,
            recoverable: code.is_recoverable(),
        }
    }

    /// Create an error carrying the code's default user message
    #[must_use]
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.user_message())
    }

    /// Attach the transfer id the failure belongs to
    #[must_use]
    pub fn with_transfer_id(mut self, transfer_id: impl Into<String>) -> Self {
        self.transfer_id = Some(transfer_id.into());
        self
    }

    /// Returns true if another attempt could succeed
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
            ErrorKind::TimedOut => ErrorCode::Timeout,
            ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            ErrorKind::NotFound => ErrorCode::FileNotFound,
            ErrorKind::InvalidData => ErrorCode::CorruptedData,
            _ => ErrorCode::NetworkError,
        };
        TransferError::new(code, err.to_string())
    }
}

/// Errors returned by orchestrator commands
#[derive(Debug, Error, Clone)]
pub enum OrchestratorError {
    /// A different transfer is already active
    #[error("Transfer {active} is already in progress (rejected {incoming})")]
    Conflict {
        /// Id of the active transfer
        active: String,
        /// Id of the rejected transfer
        incoming: String,
    },

    /// No active, non-terminal transfer exists
    #[error("No active transfer")]
    NoActiveTransfer,

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Engine call failed
    #[error("Transfer error [{}]: {}", .0.code, .0.message)]
    Transfer(#[from] TransferError),

    /// Backing store failed
    #[error("Storage error: {0}")]
    Storage(Cow<'static, str>),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),

    /// Orchestrator has been torn down
    #[error("Orchestrator is shut down")]
    ShutDown,
}

impl OrchestratorError {
    /// Classified code of this error
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            OrchestratorError::Transfer(err) => err.code,
            OrchestratorError::InvalidConfig(_) => ErrorCode::ConfigError,
            OrchestratorError::Storage(_) => ErrorCode::FileError,
            OrchestratorError::Conflict { .. }
            | OrchestratorError::NoActiveTransfer
            | OrchestratorError::Serialization(_)
            | OrchestratorError::ShutDown => ErrorCode::UnknownError,
        }
    }

    /// Transfer the error refers to, if any
    #[must_use]
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            OrchestratorError::Conflict { active, .. } => Some(active),
            OrchestratorError::Transfer(err) => err.transfer_id.as_deref(),
            _ => None,
        }
    }

    /// Returns true if the caller could try the same command again
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            OrchestratorError::Transfer(err) => err.recoverable,
            OrchestratorError::Conflict { .. } => true,
            _ => false,
        }
    }

    /// Create an invalid config error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        OrchestratorError::InvalidConfig(Cow::Borrowed(context))
    }

    /// Create a storage error with static context (zero allocation)
    #[must_use]
    pub const fn storage(context: &'static str) -> Self {
        OrchestratorError::Storage(Cow::Borrowed(context))
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Serialization(Cow::Owned(err.to_string()))
    }
}

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_codes() {
        for code in [
            ErrorCode::NetworkError,
            ErrorCode::ConnectionRefused,
            ErrorCode::Timeout,
            ErrorCode::ChecksumMismatch,
            ErrorCode::CorruptedData,
            ErrorCode::RateLimitExceeded,
        ] {
            assert!(code.is_recoverable(), "{code} should be recoverable");
        }

        for code in [
            ErrorCode::FileError,
            ErrorCode::ConfigError,
            ErrorCode::PermissionDenied,
            ErrorCode::InsufficientSpace,
            ErrorCode::FileNotFound,
            ErrorCode::Cancelled,
            ErrorCode::UnknownError,
            ErrorCode::ProtocolError,
        ] {
            assert!(!code.is_recoverable(), "{code} should not be recoverable");
        }
    }

    #[test]
    fn test_auto_retry_is_subset_of_recoverable() {
        for code in ErrorCode::ALL {
            if code.is_auto_retryable() {
                assert!(code.is_recoverable());
            }
        }
        assert!(!ErrorCode::ChecksumMismatch.is_auto_retryable());
        assert!(!ErrorCode::CorruptedData.is_auto_retryable());
    }

    #[test]
    fn test_code_parsing() {
        assert_eq!(
            "NETWORK_ERROR".parse::<ErrorCode>().unwrap(),
            ErrorCode::NetworkError
        );
        assert_eq!("timeout".parse::<ErrorCode>().unwrap(), ErrorCode::Timeout);
        assert_eq!(
            "SOMETHING_NEW".parse::<ErrorCode>().unwrap(),
            ErrorCode::UnknownError
        );
    }

    #[test]
    fn test_code_serde() {
        let json = serde_json::to_string(&ErrorCode::RateLimitExceeded).unwrap();
        assert_eq!(json, "\"RATE_LIMIT_EXCEEDED\"");

        let code: ErrorCode = serde_json::from_str("\"NOT_A_CODE\"").unwrap();
        assert_eq!(code, ErrorCode::UnknownError);
    }

    #[test]
    fn test_default_user_message() {
        assert_eq!(
            ErrorCode::UnknownError.user_message(),
            "An unexpected error occurred"
        );
        assert!(ErrorCode::FileNotFound.suggestion().is_some());
        assert!(ErrorCode::Cancelled.suggestion().is_none());
    }

    #[test]
    fn test_io_error_classification() {
        let cases = [
            (std::io::ErrorKind::ConnectionRefused, ErrorCode::ConnectionRefused),
            (std::io::ErrorKind::TimedOut, ErrorCode::Timeout),
            (std::io::ErrorKind::PermissionDenied, ErrorCode::PermissionDenied),
            (std::io::ErrorKind::NotFound, ErrorCode::FileNotFound),
            (std::io::ErrorKind::BrokenPipe, ErrorCode::NetworkError),
        ];

        for (kind, expected) in cases {
            let err: TransferError = std::io::Error::new(kind, "boom").into();
            assert_eq!(err.code, expected);
            assert_eq!(err.recoverable, expected.is_recoverable());
        }
    }

    #[test]
    fn test_orchestrator_error_facets() {
        let err = OrchestratorError::Conflict {
            active: "t1".into(),
            incoming: "t2".into(),
        };
        assert_eq!(err.transfer_id(), Some("t1"));
        assert!(err.to_string().contains("t1"));

        let err: OrchestratorError =
            TransferError::new(ErrorCode::Timeout, "slow").with_transfer_id("t9").into();
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert_eq!(err.transfer_id(), Some("t9"));
        assert!(err.is_recoverable());

        let err = OrchestratorError::invalid_config("port must be non-zero");
        assert_eq!(err.code(), ErrorCode::ConfigError);
        assert!(!err.is_recoverable());
    }
}
