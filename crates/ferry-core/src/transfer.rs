//! Transfer snapshot and the enums shared by events, history and config
//!
//! A [`TransferSnapshot`] is the live view of the single active transfer. It
//! is owned by the state machine; everything else receives copies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Transport protocol used by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Stream transport
    #[default]
    #[serde(alias = "TCP")]
    Tcp,
    /// Datagram transport
    #[serde(alias = "UDP")]
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(format!("Invalid protocol: {other}. Must be 'tcp' or 'udp'")),
        }
    }
}

/// Role of the local endpoint in a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Local side sends the file
    #[default]
    #[serde(alias = "sender", alias = "send")]
    Transmitter,
    /// Local side receives the file
    #[serde(alias = "receive", alias = "recv")]
    Receiver,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transmitter => write!(f, "transmitter"),
            Self::Receiver => write!(f, "receiver"),
        }
    }
}

impl FromStr for TransferMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transmitter" | "sender" | "send" => Ok(Self::Transmitter),
            "receiver" | "receive" | "recv" => Ok(Self::Receiver),
            other => Err(format!(
                "Invalid mode: {other}. Must be 'transmitter' or 'receiver'"
            )),
        }
    }
}

/// Direction recorded in history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    /// File left this endpoint
    #[default]
    Sent,
    /// File arrived at this endpoint
    Received,
}

impl From<TransferMode> for TransferDirection {
    fn from(mode: TransferMode) -> Self {
        match mode {
            TransferMode::Transmitter => Self::Sent,
            TransferMode::Receiver => Self::Received,
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Received => write!(f, "received"),
        }
    }
}

impl FromStr for TransferDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sent" | "send" => Ok(Self::Sent),
            "received" | "receive" => Ok(Self::Received),
            other => Err(format!("Invalid direction: {other}")),
        }
    }
}

/// Lifecycle status of the active transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// No transfer
    #[default]
    Idle,
    /// Started, no progress reported yet
    Connecting,
    /// Progress is being reported
    Transferring,
    /// Finished successfully
    Completed,
    /// Failed
    Error,
    /// Cancelled by either side
    Cancelled,
}

impl TransferStatus {
    /// Returns true for `Completed`, `Error` and `Cancelled`
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Transferring => write!(f, "Transferring"),
            Self::Completed => write!(f, "Completed"),
            Self::Error => write!(f, "Error"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Engine connection state, tracked independently of the snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Not connected
    #[default]
    Disconnected,
    /// Dialing the remote endpoint
    Connecting,
    /// Connected to the remote endpoint
    Connected,
    /// Waiting for an incoming connection
    Listening,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Listening => write!(f, "listening"),
        }
    }
}

/// Live state of the active transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    /// Engine-assigned id, unique per attempt
    pub id: String,

    /// Current status
    pub status: TransferStatus,

    /// Fraction complete, in `[0, 1]`
    pub progress: f64,

    /// Bytes transferred so far
    pub bytes_transferred: u64,

    /// Total bytes, `0` until known
    pub total_bytes: u64,

    /// Instantaneous speed in bytes/second
    pub speed: f64,

    /// Seconds remaining; `0` means unknown
    pub eta: f64,

    /// Failure message, present only in `Error`
    pub error: Option<String>,

    /// File being transferred
    pub filename: String,

    /// Transport protocol
    pub protocol: Protocol,

    /// Local role
    pub mode: TransferMode,

    /// Remote address, if known
    pub target: String,

    /// When the engine reported the start
    pub started_at: DateTime<Utc>,
}

impl TransferSnapshot {
    /// Fresh snapshot in `Connecting`
    #[must_use]
    pub fn connecting(
        id: impl Into<String>,
        filename: impl Into<String>,
        total_bytes: u64,
        protocol: Protocol,
        mode: TransferMode,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            status: TransferStatus::Connecting,
            progress: 0.0,
            bytes_transferred: 0,
            total_bytes,
            speed: 0.0,
            eta: 0.0,
            error: None,
            filename: filename.into(),
            protocol,
            mode,
            target: String::new(),
            started_at,
        }
    }

    /// Returns true once the transfer reached a terminal status
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time since the transfer started, saturating at zero
    #[must_use]
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or_default()
    }

    /// Progress as a percentage
    #[must_use]
    pub fn percent(&self) -> f64 {
        self.progress * 100.0
    }

    /// Get human-readable ETA string
    pub fn eta_string(&self) -> String {
        if self.status == TransferStatus::Completed {
            return "Complete".to_string();
        }
        if self.eta <= 0.0 || !self.eta.is_finite() {
            return "Calculating...".to_string();
        }

        let seconds = self.eta as u64;
        if seconds < 60 {
            format!("{seconds}s")
        } else if seconds < 3600 {
            format!("{}m {}s", seconds / 60, seconds % 60)
        } else {
            format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
        }
    }

    /// Get human-readable speed string
    pub fn speed_string(&self) -> String {
        if self.speed < 1024.0 {
            format!("{:.2} B/s", self.speed)
        } else if self.speed < 1024.0 * 1024.0 {
            format!("{:.2} KiB/s", self.speed / 1024.0)
        } else if self.speed < 1024.0 * 1024.0 * 1024.0 {
            format!("{:.2} MiB/s", self.speed / (1024.0 * 1024.0))
        } else {
            format!("{:.2} GiB/s", self.speed / (1024.0 * 1024.0 * 1024.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> TransferSnapshot {
        TransferSnapshot::connecting(
            "t1",
            "report.pdf",
            1000,
            Protocol::Tcp,
            TransferMode::Transmitter,
            Utc::now(),
        )
    }

    #[test]
    fn test_snapshot_connecting() {
        let snap = snapshot();
        assert_eq!(snap.status, TransferStatus::Connecting);
        assert_eq!(snap.progress, 0.0);
        assert_eq!(snap.total_bytes, 1000);
        assert!(snap.error.is_none());
        assert!(!snap.is_terminal());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Error.is_terminal());
        assert!(TransferStatus::Cancelled.is_terminal());
        assert!(!TransferStatus::Idle.is_terminal());
        assert!(!TransferStatus::Connecting.is_terminal());
        assert!(!TransferStatus::Transferring.is_terminal());
    }

    #[test]
    fn test_mode_aliases() {
        assert_eq!(
            "sender".parse::<TransferMode>().unwrap(),
            TransferMode::Transmitter
        );
        assert_eq!("RECV".parse::<TransferMode>().unwrap(), TransferMode::Receiver);
        assert!("sideways".parse::<TransferMode>().is_err());

        let mode: TransferMode = serde_json::from_str("\"send\"").unwrap();
        assert_eq!(mode, TransferMode::Transmitter);
        assert_eq!(TransferDirection::from(mode), TransferDirection::Sent);
        assert_eq!(
            TransferDirection::from(TransferMode::Receiver),
            TransferDirection::Received
        );
    }

    #[test]
    fn test_protocol_parsing() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("quic".parse::<Protocol>().is_err());

        let json = serde_json::to_string(&Protocol::Udp).unwrap();
        assert_eq!(json, "\"udp\"");
    }

    #[test]
    fn test_eta_string() {
        let mut snap = snapshot();

        // Unknown
        assert_eq!(snap.eta_string(), "Calculating...");

        snap.eta = 30.0;
        assert_eq!(snap.eta_string(), "30s");

        snap.eta = 90.0;
        assert_eq!(snap.eta_string(), "1m 30s");

        snap.eta = 3700.0;
        assert_eq!(snap.eta_string(), "1h 1m");

        snap.status = TransferStatus::Completed;
        assert_eq!(snap.eta_string(), "Complete");
    }

    #[test]
    fn test_speed_string() {
        let mut snap = snapshot();

        snap.speed = 500.0;
        assert_eq!(snap.speed_string(), "500.00 B/s");

        snap.speed = 1024.0 * 50.0;
        assert_eq!(snap.speed_string(), "50.00 KiB/s");

        snap.speed = 1024.0 * 1024.0 * 2.5;
        assert_eq!(snap.speed_string(), "2.50 MiB/s");

        snap.speed = 1024.0 * 1024.0 * 1024.0 * 1.5;
        assert_eq!(snap.speed_string(), "1.50 GiB/s");
    }

    #[test]
    fn test_elapsed_saturates() {
        let snap = snapshot();
        let before = snap.started_at - chrono::Duration::seconds(5);
        assert_eq!(snap.elapsed(before), Duration::ZERO);

        let after = snap.started_at + chrono::Duration::seconds(5);
        assert_eq!(snap.elapsed(after), Duration::from_secs(5));
    }
}
