//! Boundary to the external transfer engine
//!
//! The engine does the actual I/O. The orchestrator only asks it to start,
//! receive, cancel and report progress; lifecycle updates come back as
//! [`EngineEvent`](crate::events::EngineEvent)s on a separate channel.

use crate::config::{TransferConfig, ValidatedConfig};
use crate::error::TransferError;
use crate::events::ProgressEvent;
use crate::transfer::Protocol;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Operations offered by a transfer engine
///
/// Every failure is normalized into a [`TransferError`].
#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Send `file_path` to `target`, returning the new transfer id
    async fn start(
        &self,
        config: &ValidatedConfig,
        file_path: &Path,
        target: &str,
    ) -> Result<String, TransferError>;

    /// Listen for an incoming transfer, returning its id
    async fn receive(
        &self,
        port: u16,
        protocol: Protocol,
        output_dir: &Path,
    ) -> Result<String, TransferError>;

    /// Ask the engine to cancel a transfer
    async fn cancel(&self, transfer_id: &str) -> Result<(), TransferError>;

    /// Poll the engine for the latest progress of a transfer
    async fn get_progress(&self, transfer_id: &str) -> Result<ProgressEvent, TransferError>;

    /// Let the engine veto a configuration
    async fn validate_config(&self, config: &TransferConfig) -> Result<bool, TransferError>;
}

/// Arguments of the last user-requested start, replayed by retries
#[derive(Debug, Clone, PartialEq)]
pub enum StartRequest {
    /// Outgoing transfer
    Send {
        /// Validated configuration
        config: ValidatedConfig,
        /// File to send
        file_path: PathBuf,
        /// Remote address
        target: String,
    },
    /// Incoming transfer
    Receive {
        /// Port to listen on
        port: u16,
        /// Transport protocol
        protocol: Protocol,
        /// Directory to save into
        output_dir: PathBuf,
    },
}

impl StartRequest {
    /// Call the matching engine operation
    pub async fn invoke(&self, engine: &dyn TransferEngine) -> Result<String, TransferError> {
        match self {
            Self::Send {
                config,
                file_path,
                target,
            } => engine.start(config, file_path, target).await,
            Self::Receive {
                port,
                protocol,
                output_dir,
            } => engine.receive(*port, *protocol, output_dir).await,
        }
    }

    /// Short description for logs and conflict errors
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Send {
                file_path, target, ..
            } => format!("{} -> {}", file_path.display(), target),
            Self::Receive { port, protocol, .. } => format!("receive on {protocol}:{port}"),
        }
    }
}
