//! # Ferry Core
//!
//! Orchestration layer for point-to-point file transfers.
//!
//! The transfer engine does the I/O; this crate sits above it and provides:
//! - A single-transfer state machine driven by engine events
//! - Error classification and retry policy with exponential backoff
//! - A persistent, capped transfer history with filtering and statistics
//! - Capped user notifications with auto-dismiss
//! - Configuration validation and persistence
//!
//! ## Architecture
//!
//! ```text
//!  commands (start / receive / cancel / dismiss)
//!        │
//!        ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     TransferOrchestrator                          │
//! │  ┌────────────────────┐  ┌──────────────┐  ┌──────────────────┐  │
//! │  │ TransferStateMachine│─▶│ HistoryStore │  │ NotificationDisp.│  │
//! │  │  (snapshot, retry)  │  └──────┬───────┘  └──────────────────┘  │
//! │  └─────────┬──────────┘         │ Storage                         │
//! │            │ Effects            ▼                                 │
//! │      TimerRegistry        Memory / File                           │
//! └────────────┬─────────────────────────────────────▲───────────────┘
//!              │ start / receive / cancel            │ EngineEvent
//!              ▼                                     │
//!        ┌──────────────────────────────────────────────┐
//!        │                TransferEngine                 │
//!        └──────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod notification;
pub mod orchestrator;
pub mod retry;
pub mod storage;
pub mod timers;
pub mod transfer;

pub use config::{ConfigError, ConfigStore, OrchestratorSettings, TransferConfig, ValidatedConfig};
pub use error::{ErrorCode, OrchestratorError, Result, TransferError};
pub use events::{
    CancelledEvent, CompletedEvent, ConnectionEvent, ConnectionEventType, EngineEvent, ErrorEvent,
    ProgressEvent, StartedEvent,
};
pub use history::{
    HistoryFilter, HistoryRecord, HistoryStats, HistoryStatus, HistoryStore, ImportResult,
    MAX_HISTORY_ITEMS, RecordPatch, SortDirection, SortField, SortOptions,
};
pub use notification::{
    Notification, NotificationDispatcher, NotificationKind, NotificationRequest, Notifier,
};
pub use orchestrator::{
    CancelTarget, Effect, EventOutcome, IgnoreReason, StartRequest, TransferEngine,
    TransferOrchestrator, TransferStateMachine, event_channel,
};
pub use retry::{RetryConfig, RetryHandler, RetryPolicy, RetryTracker, backoff_delay, should_retry};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
pub use timers::TimerRegistry;
pub use transfer::{
    ConnectionStatus, Protocol, TransferDirection, TransferMode, TransferSnapshot, TransferStatus,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
