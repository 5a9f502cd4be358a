//! Transfer state machine
//!
//! Owns the lifecycle of at most one active transfer. Handlers run to
//! completion without awaiting; anything delayed or external is returned as an
//! [`Effect`] for the orchestrator to carry out.
//!
//! ```text
//!           Started            Progress
//!   Idle ───────────▶ Connecting ───────▶ Transferring
//!    ▲                    │                    │
//!    │                    └──────────┬─────────┘
//!    │                               ▼
//!    │   clear delay / dismiss   Completed | Error | Cancelled
//!    └───────────────────────────────┘
//! ```
//!
//! Every handler except `connection` is guarded by the snapshot id: events for
//! another transfer, or for a transfer that already reached a terminal state,
//! are ignored and reported as [`EventOutcome::Ignored`].

use crate::config::OrchestratorSettings;
use crate::error::{ErrorCode, OrchestratorError, Result, TransferError};
use crate::events::{
    CancelledEvent, CompletedEvent, ConnectionEvent, EngineEvent, ErrorEvent, ProgressEvent,
    StartedEvent, event_time,
};
use crate::history::{HistoryRecord, HistoryStatus, HistoryStore};
use crate::notification::{NotificationRequest, Notifier};
use crate::retry::{RetryPolicy, RetryTracker, should_retry};
use crate::transfer::{ConnectionStatus, TransferDirection, TransferSnapshot, TransferStatus};
use chrono::Utc;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Why an event was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No snapshot exists
    NoActiveTransfer,
    /// Event belongs to another transfer
    IdMismatch,
    /// Snapshot already reached a terminal state
    AlreadyTerminal,
    /// `Started` re-delivered for the active transfer
    DuplicateStart,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoActiveTransfer => write!(f, "no active transfer"),
            Self::IdMismatch => write!(f, "id mismatch"),
            Self::AlreadyTerminal => write!(f, "already terminal"),
            Self::DuplicateStart => write!(f, "duplicate start"),
        }
    }
}

/// Side effect requested by a handler
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Clear the snapshot of `transfer_id` after `delay`
    ScheduleClear {
        /// Transfer to clear
        transfer_id: String,
        /// Delay before clearing
        delay: Duration,
    },
    /// Re-invoke the engine's start operation after `delay`
    ScheduleRetry {
        /// Failed transfer
        transfer_id: String,
        /// Backoff delay
        delay: Duration,
        /// Failed attempts so far
        attempt: u32,
    },
    /// Cancel every timer owned by `transfer_id`
    CancelTimers {
        /// Owner of the timers
        transfer_id: String,
    },
}

/// Result of feeding one event to the machine
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// Event changed the state; effects must be carried out
    Applied(Vec<Effect>),
    /// Event was dropped
    Ignored(IgnoreReason),
}

impl EventOutcome {
    /// Returns true if the event changed the state
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// Effects to carry out (empty when ignored)
    #[must_use]
    pub fn effects(&self) -> &[Effect] {
        match self {
            Self::Applied(effects) => effects,
            Self::Ignored(_) => &[],
        }
    }

    /// Consume the outcome, returning its effects
    #[must_use]
    pub fn into_effects(self) -> Vec<Effect> {
        match self {
            Self::Applied(effects) => effects,
            Self::Ignored(_) => Vec::new(),
        }
    }
}

/// A retry waiting for its backoff timer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRetry {
    /// Failed transfer
    pub transfer_id: String,
    /// Failed attempts so far
    pub attempt: u32,
}

/// What [`TransferStateMachine::cancel_target`] resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelTarget {
    /// Ask the engine to cancel this transfer
    Engine(String),
    /// Abort the pending retry of this failed transfer
    PendingRetry(String),
}

/// Single-writer lifecycle owner
#[derive(Debug)]
pub struct TransferStateMachine {
    current: Option<TransferSnapshot>,
    connection_status: ConnectionStatus,
    last_error: Option<TransferError>,

    retries: RetryTracker,
    policy: RetryPolicy,
    retry_budget: Option<u32>,
    inflight_retry: Option<u32>,
    pending_retry: Option<PendingRetry>,

    error_notification: Option<String>,
    pending_target: Option<String>,

    completed_clear_delay: Duration,
    cancelled_clear_delay: Duration,
}

impl Default for TransferStateMachine {
    fn default() -> Self {
        Self::new(&OrchestratorSettings::default())
    }
}

impl TransferStateMachine {
    /// Create an idle machine
    #[must_use]
    pub fn new(settings: &OrchestratorSettings) -> Self {
        Self {
            current: None,
            connection_status: ConnectionStatus::Disconnected,
            last_error: None,
            retries: RetryTracker::new(),
            policy: RetryPolicy::new(settings.retry.clone()),
            retry_budget: None,
            inflight_retry: None,
            pending_retry: None,
            error_notification: None,
            pending_target: None,
            completed_clear_delay: settings.completed_clear_delay,
            cancelled_clear_delay: settings.cancelled_clear_delay,
        }
    }

    /// Current snapshot, `None` when idle
    #[must_use]
    pub fn snapshot(&self) -> Option<&TransferSnapshot> {
        self.current.as_ref()
    }

    /// Status of the current snapshot, `Idle` when there is none
    #[must_use]
    pub fn status(&self) -> TransferStatus {
        self.current
            .as_ref()
            .map_or(TransferStatus::Idle, |s| s.status)
    }

    /// Engine connection state
    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection_status
    }

    /// Most recent classified failure
    #[must_use]
    pub fn last_error(&self) -> Option<&TransferError> {
        self.last_error.as_ref()
    }

    /// Retry waiting for its timer, if any
    #[must_use]
    pub fn pending_retry(&self) -> Option<&PendingRetry> {
        self.pending_retry.as_ref()
    }

    /// Failed attempts recorded for `transfer_id`
    #[must_use]
    pub fn retry_attempts(&self, transfer_id: &str) -> u32 {
        self.retries.attempts(transfer_id)
    }

    /// Returns true if a non-terminal transfer is active
    #[must_use]
    pub fn has_active_transfer(&self) -> bool {
        self.current.as_ref().is_some_and(|s| !s.is_terminal())
    }

    /// Arm the machine for a transfer requested by the user
    ///
    /// Fails if another transfer is still running. A pending retry of an
    /// earlier transfer is abandoned.
    pub fn begin_transfer(
        &mut self,
        retry_budget: Option<u32>,
        target: Option<String>,
        label: &str,
    ) -> Result<Vec<Effect>> {
        if let Some(active) = self.current.as_ref().filter(|s| !s.is_terminal()) {
            return Err(OrchestratorError::Conflict {
                active: active.id.clone(),
                incoming: label.to_string(),
            });
        }

        let mut effects = Vec::new();
        if let Some(pending) = self.pending_retry.take() {
            debug!("Abandoning pending retry of {}", pending.transfer_id);
            self.retries.clear(&pending.transfer_id);
            effects.push(Effect::CancelTimers {
                transfer_id: pending.transfer_id,
            });
        }

        self.retry_budget = retry_budget;
        self.pending_target = target;
        self.inflight_retry = None;
        Ok(effects)
    }

    /// Take the pending retry of `transfer_id` and mark a retry as in flight
    ///
    /// Called when the backoff timer fires, right before the engine is asked
    /// to start again. Returns the attempt count carried to the new transfer.
    pub fn fire_retry(&mut self, transfer_id: &str) -> Option<u32> {
        let pending = self
            .pending_retry
            .take_if(|p| p.transfer_id == transfer_id)?;
        self.inflight_retry = Some(pending.attempt);
        info!(
            "Retrying transfer {} (attempt {})",
            transfer_id,
            pending.attempt + 1
        );
        Some(pending.attempt)
    }

    /// Record that a retry could not be started
    pub fn retry_failed_to_start(&mut self, err: TransferError, notifier: &dyn Notifier) {
        self.inflight_retry = None;
        if let Some(id) = self.error_notification.take() {
            dismiss_quietly(notifier, &id);
        }
        error!("Retry could not be started: {}", err);
        let id = notifier.notify(
            NotificationRequest::error("Retry failed", failure_message(err.code, &err.message))
                .persistent(),
        );
        self.error_notification = Some(id);
        self.last_error = Some(err);
    }

    /// Record a start command the engine refused
    ///
    /// No snapshot exists yet, so only the last error changes.
    pub fn record_command_error(&mut self, err: TransferError) {
        self.retry_budget = None;
        self.pending_target = None;
        self.last_error = Some(err);
    }

    /// Dispatch an event to its handler
    ///
    /// Only `started` can fail, when another transfer is still active.
    pub fn handle(
        &mut self,
        event: &EngineEvent,
        history: &mut HistoryStore,
        notifier: &dyn Notifier,
    ) -> Result<EventOutcome> {
        let outcome = match event {
            EngineEvent::Started(e) => return self.on_started(e, notifier),
            EngineEvent::Progress(e) => self.on_progress(e),
            EngineEvent::Error(e) => self.on_error(e, history, notifier),
            EngineEvent::Completed(e) => self.on_completed(e, history, notifier),
            EngineEvent::Cancelled(e) => self.on_cancelled(e, history, notifier),
            EngineEvent::Connection(e) => self.on_connection_event(e),
        };
        Ok(outcome)
    }

    fn active_mut(&mut self, transfer_id: &str) -> std::result::Result<&mut TransferSnapshot, IgnoreReason> {
        let snapshot = self.current.as_mut().ok_or(IgnoreReason::NoActiveTransfer)?;
        if snapshot.id != transfer_id {
            return Err(IgnoreReason::IdMismatch);
        }
        if snapshot.is_terminal() {
            return Err(IgnoreReason::AlreadyTerminal);
        }
        Ok(snapshot)
    }

    fn ignored(kind: &str, transfer_id: &str, reason: IgnoreReason) -> EventOutcome {
        debug!("Ignoring {} event for {}: {}", kind, transfer_id, reason);
        EventOutcome::Ignored(reason)
    }

    /// Start tracking a new transfer
    pub fn on_started(
        &mut self,
        event: &StartedEvent,
        notifier: &dyn Notifier,
    ) -> Result<EventOutcome> {
        let mut effects = Vec::new();

        if let Some(current) = &self.current {
            if current.id == event.transfer_id {
                let reason = if current.is_terminal() {
                    IgnoreReason::AlreadyTerminal
                } else {
                    IgnoreReason::DuplicateStart
                };
                return Ok(Self::ignored("started", &event.transfer_id, reason));
            }
            if !current.is_terminal() {
                return Err(OrchestratorError::Conflict {
                    active: current.id.clone(),
                    incoming: event.transfer_id.clone(),
                });
            }
            // Previous transfer finished; its clear timer must not hit the new one.
            // A retry in flight is still running the start that produced this event.
            if self.inflight_retry.is_none() {
                effects.push(Effect::CancelTimers {
                    transfer_id: current.id.clone(),
                });
            }
        }

        let mut snapshot = TransferSnapshot::connecting(
            event.transfer_id.clone(),
            event.filename.clone(),
            event.file_size,
            event.protocol,
            event.mode,
            event_time(event.timestamp, Utc::now()),
        );
        snapshot.target = self.pending_target.clone().unwrap_or_default();

        match self.inflight_retry.take() {
            Some(attempts) => self.retries.carry_over(&event.transfer_id, attempts),
            None => self.retries.reset(&event.transfer_id),
        }
        self.pending_retry = None;
        self.last_error = None;
        if let Some(id) = self.error_notification.take() {
            dismiss_quietly(notifier, &id);
        }

        info!(
            "Transfer {} started: {} ({} bytes, {} over {})",
            snapshot.id, snapshot.filename, snapshot.total_bytes, snapshot.mode, snapshot.protocol
        );
        notifier.notify(NotificationRequest::info(
            "Transfer started",
            format!("{} ({})", snapshot.filename, snapshot.mode),
        ));

        self.current = Some(snapshot);
        Ok(EventOutcome::Applied(effects))
    }

    /// Update progress of the active transfer
    pub fn on_progress(&mut self, event: &ProgressEvent) -> EventOutcome {
        let snapshot = match self.active_mut(&event.transfer_id) {
            Ok(snapshot) => snapshot,
            Err(reason) => return Self::ignored("progress", &event.transfer_id, reason),
        };

        if snapshot.status == TransferStatus::Connecting {
            debug!("Transfer {} is now transferring", snapshot.id);
        }
        snapshot.status = TransferStatus::Transferring;

        // Progress never goes backwards; a report behind the snapshot is stale
        // and none of its figures are taken
        if !event.progress.is_finite() || event.progress < snapshot.progress {
            debug!(
                "Stale progress {} for {} (at {})",
                event.progress, snapshot.id, snapshot.progress
            );
            return EventOutcome::Applied(Vec::new());
        }
        snapshot.progress = event.progress.min(1.0);

        if event.total_bytes > 0 {
            snapshot.total_bytes = event.total_bytes;
        }
        snapshot.bytes_transferred = if snapshot.total_bytes > 0 {
            event.bytes_transferred.min(snapshot.total_bytes)
        } else {
            event.bytes_transferred
        };
        snapshot.speed = non_negative(event.speed);
        snapshot.eta = non_negative(event.eta);

        EventOutcome::Applied(Vec::new())
    }

    /// Fail the active transfer, possibly scheduling a retry
    pub fn on_error(
        &mut self,
        event: &ErrorEvent,
        history: &mut HistoryStore,
        notifier: &dyn Notifier,
    ) -> EventOutcome {
        let snapshot = match self.active_mut(&event.transfer_id) {
            Ok(snapshot) => snapshot,
            Err(reason) => return Self::ignored("error", &event.transfer_id, reason),
        };

        snapshot.status = TransferStatus::Error;
        snapshot.error = Some(event.error_message.clone());
        let snapshot = snapshot.clone();

        history.add_record(HistoryRecord {
            id: snapshot.id.clone(),
            filename: snapshot.filename.clone(),
            size: snapshot.total_bytes,
            mode: snapshot.mode.into(),
            protocol: snapshot.protocol,
            target: snapshot.target.clone(),
            status: HistoryStatus::Failed,
            timestamp: event_time(event.timestamp, Utc::now()),
            duration: 0.0,
            checksum: String::new(),
            error: Some(event.error_message.clone()),
        });

        let code = event.error_code;
        let mut err = TransferError::new(code, event.error_message.clone())
            .with_transfer_id(snapshot.id.clone());
        err.recoverable = event.recoverable || code.is_recoverable();
        self.last_error = Some(err);

        let attempts = self.retries.record_failure(&snapshot.id);
        if let Some(id) = self.error_notification.take() {
            dismiss_quietly(notifier, &id);
        }

        let budget = self.retry_budget.unwrap_or(0);
        if should_retry(code, attempts, budget) {
            let delay = self.policy.compute_delay(code, attempts);
            warn!(
                code = %code,
                "Transfer {} failed (attempt {}/{}): {}. Retrying in {:?}",
                snapshot.id,
                attempts,
                budget,
                event.error_message,
                delay
            );

            let id = notifier.notify(
                NotificationRequest::error(
                    "Transfer failed",
                    format!(
                        "{} Retrying in {:.1}s (attempt {} of {}).",
                        failure_message(code, &event.error_message),
                        delay.as_secs_f64(),
                        attempts + 1,
                        budget
                    ),
                )
                .persistent(),
            );
            self.error_notification = Some(id);
            self.pending_retry = Some(PendingRetry {
                transfer_id: snapshot.id.clone(),
                attempt: attempts,
            });

            return EventOutcome::Applied(vec![Effect::ScheduleRetry {
                transfer_id: snapshot.id,
                delay,
                attempt: attempts,
            }]);
        }

        if attempts > 1 {
            error!(
                code = %code,
                "Transfer {} failed after {} attempts: {}",
                snapshot.id, attempts, event.error_message
            );
        } else {
            warn!(code = %code, "Transfer {} failed: {}", snapshot.id, event.error_message);
        }
        self.retries.clear(&snapshot.id);

        let message = match code.suggestion() {
            Some(hint) => format!("{} {}.", failure_message(code, &event.error_message), hint),
            None => failure_message(code, &event.error_message),
        };
        let id = notifier
            .notify(NotificationRequest::error("Transfer failed", message).persistent());
        self.error_notification = Some(id);

        EventOutcome::Applied(Vec::new())
    }

    /// Finish the active transfer
    pub fn on_completed(
        &mut self,
        event: &CompletedEvent,
        history: &mut HistoryStore,
        notifier: &dyn Notifier,
    ) -> EventOutcome {
        let snapshot = match self.active_mut(&event.transfer_id) {
            Ok(snapshot) => snapshot,
            Err(reason) => return Self::ignored("completed", &event.transfer_id, reason),
        };

        snapshot.status = TransferStatus::Completed;
        snapshot.progress = 1.0;
        snapshot.eta = 0.0;
        if event.bytes_transferred > 0 {
            snapshot.bytes_transferred = event.bytes_transferred;
        } else if event.success && snapshot.total_bytes > 0 {
            snapshot.bytes_transferred = snapshot.total_bytes;
        }
        let snapshot = snapshot.clone();

        history.add_record(HistoryRecord {
            id: snapshot.id.clone(),
            filename: snapshot.filename.clone(),
            size: snapshot.bytes_transferred,
            mode: snapshot.mode.into(),
            protocol: snapshot.protocol,
            target: snapshot.target.clone(),
            status: if event.success {
                HistoryStatus::Completed
            } else {
                HistoryStatus::Failed
            },
            timestamp: event_time(event.timestamp, Utc::now()),
            duration: non_negative(event.duration),
            checksum: event.checksum.clone(),
            error: None,
        });
        self.retries.clear(&snapshot.id);

        if event.success {
            info!(
                "Transfer {} completed: {} bytes in {:.1}s",
                snapshot.id, snapshot.bytes_transferred, event.duration
            );
            notifier.notify(NotificationRequest::success(
                "Transfer completed",
                format!(
                    "{} {} successfully",
                    snapshot.filename,
                    TransferDirection::from(snapshot.mode)
                ),
            ));
        } else {
            warn!("Transfer {} finished unsuccessfully", snapshot.id);
            notifier.notify(NotificationRequest::warning(
                "Transfer finished with errors",
                format!("{} may be incomplete", snapshot.filename),
            ));
        }

        EventOutcome::Applied(vec![Effect::ScheduleClear {
            transfer_id: snapshot.id,
            delay: self.completed_clear_delay,
        }])
    }

    /// Cancel the active transfer
    pub fn on_cancelled(
        &mut self,
        event: &CancelledEvent,
        history: &mut HistoryStore,
        notifier: &dyn Notifier,
    ) -> EventOutcome {
        let snapshot = match self.active_mut(&event.transfer_id) {
            Ok(snapshot) => snapshot,
            Err(reason) => return Self::ignored("cancelled", &event.transfer_id, reason),
        };

        snapshot.status = TransferStatus::Cancelled;
        snapshot.speed = 0.0;
        snapshot.eta = 0.0;
        let snapshot = snapshot.clone();
        let now = Utc::now();

        history.add_record(HistoryRecord {
            id: snapshot.id.clone(),
            filename: snapshot.filename.clone(),
            size: snapshot.total_bytes,
            mode: snapshot.mode.into(),
            protocol: snapshot.protocol,
            target: snapshot.target.clone(),
            status: HistoryStatus::Cancelled,
            timestamp: event_time(event.timestamp, now),
            duration: snapshot.elapsed(now).as_secs_f64(),
            checksum: String::new(),
            error: (!event.reason.is_empty()).then(|| event.reason.clone()),
        });
        self.retries.clear(&snapshot.id);

        info!("Transfer {} cancelled: {}", snapshot.id, event.reason);
        let message = if event.reason.is_empty() {
            format!("{} was cancelled", snapshot.filename)
        } else {
            format!("{} was cancelled: {}", snapshot.filename, event.reason)
        };
        notifier.notify(NotificationRequest::warning("Transfer cancelled", message));

        EventOutcome::Applied(vec![Effect::ScheduleClear {
            transfer_id: snapshot.id,
            delay: self.cancelled_clear_delay,
        }])
    }

    /// Track the engine's connection state
    pub fn on_connection_event(&mut self, event: &ConnectionEvent) -> EventOutcome {
        let status = ConnectionStatus::from(event.event_type);
        if status != self.connection_status {
            debug!(
                "Connection {} -> {} ({})",
                self.connection_status, status, event.address
            );
        }
        self.connection_status = status;
        EventOutcome::Applied(Vec::new())
    }

    /// Resolve what `cancel()` should act on
    pub fn cancel_target(&self) -> Result<CancelTarget> {
        if let Some(active) = self.current.as_ref().filter(|s| !s.is_terminal()) {
            return Ok(CancelTarget::Engine(active.id.clone()));
        }
        if let Some(pending) = &self.pending_retry {
            return Ok(CancelTarget::PendingRetry(pending.transfer_id.clone()));
        }
        Err(OrchestratorError::NoActiveTransfer)
    }

    /// Abandon the pending retry of `transfer_id`
    pub fn abort_pending_retry(&mut self, transfer_id: &str, notifier: &dyn Notifier) -> bool {
        if self
            .pending_retry
            .take_if(|p| p.transfer_id == transfer_id)
            .is_none()
        {
            return false;
        }
        self.retries.clear(transfer_id);
        if let Some(id) = self.error_notification.take() {
            dismiss_quietly(notifier, &id);
        }
        info!("Pending retry of {} cancelled", transfer_id);
        notifier.notify(NotificationRequest::warning(
            "Retry cancelled",
            "The failed transfer will not be retried",
        ));
        true
    }

    /// Forget the last error without touching the snapshot
    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Acknowledge a failed transfer: back to idle
    ///
    /// A pending retry is abandoned. Returns the effects to carry out; empty
    /// when the snapshot is not in `Error`.
    pub fn dismiss(&mut self, notifier: &dyn Notifier) -> Vec<Effect> {
        let Some(snapshot) = self
            .current
            .take_if(|s| s.status == TransferStatus::Error)
        else {
            return Vec::new();
        };

        self.last_error = None;
        if let Some(id) = self.error_notification.take() {
            dismiss_quietly(notifier, &id);
        }
        if self
            .pending_retry
            .take_if(|p| p.transfer_id == snapshot.id)
            .is_some()
        {
            self.retries.clear(&snapshot.id);
        }
        debug!("Transfer {} dismissed", snapshot.id);

        vec![Effect::CancelTimers {
            transfer_id: snapshot.id,
        }]
    }

    /// Drop the snapshot of `transfer_id` if it is still the terminal one
    pub fn clear_if_terminal(&mut self, transfer_id: &str) -> bool {
        let cleared = self
            .current
            .take_if(|s| s.id == transfer_id && s.is_terminal())
            .is_some();
        if cleared {
            debug!("Snapshot of {} cleared", transfer_id);
        }
        cleared
    }

    /// Drop every piece of per-transfer state
    pub fn reset(&mut self) {
        self.current = None;
        self.last_error = None;
        self.pending_retry = None;
        self.inflight_retry = None;
        self.error_notification = None;
        self.pending_target = None;
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// User-facing text for a failure
///
/// Codes without a specific message keep the engine's detail.
fn failure_message(code: ErrorCode, detail: &str) -> String {
    let detail = detail.trim().trim_end_matches('.');
    match code {
        ErrorCode::ProtocolError | ErrorCode::UnknownError if !detail.is_empty() => {
            format!("{}: {}.", code.user_message(), detail)
        }
        ErrorCode::ProtocolError | ErrorCode::UnknownError => format!("{}.", code.user_message()),
        _ => code.user_message().to_string(),
    }
}

fn dismiss_quietly(notifier: &dyn Notifier, id: &str) {
    if !notifier.dismiss(id) {
        debug!("Notification {} was already gone", id);
    }
}
