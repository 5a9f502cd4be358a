//! Transfer orchestrator
//!
//! Owns the state machine, history store, notification dispatcher and timer
//! registry, and connects them to a [`TransferEngine`]. Engine events are
//! consumed one at a time; each handler runs to completion while holding the
//! state lock. Engine calls and backoff delays happen outside of it.
//!
//! Lock order: machine, then history.

pub mod engine;
pub mod machine;

pub use engine::{StartRequest, TransferEngine};
pub use machine::{
    CancelTarget, Effect, EventOutcome, IgnoreReason, PendingRetry, TransferStateMachine,
};

use crate::config::{OrchestratorSettings, ValidatedConfig};
use crate::error::{OrchestratorError, Result, TransferError};
use crate::events::EngineEvent;
use crate::history::HistoryStore;
use crate::notification::NotificationDispatcher;
use crate::retry::RetryHandler;
use crate::storage::Storage;
use crate::timers::{TimerRegistry, clear_key, retry_key};
use crate::transfer::{ConnectionStatus, Protocol, TransferSnapshot, TransferStatus};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default capacity of the engine event queue
pub const DEFAULT_EVENT_QUEUE: usize = 256;

/// Create the queue the engine pushes events into
#[must_use]
pub fn event_channel(capacity: usize) -> (mpsc::Sender<EngineEvent>, mpsc::Receiver<EngineEvent>) {
    mpsc::channel(capacity.max(1))
}

struct Inner {
    machine: Mutex<TransferStateMachine>,
    history: Arc<RwLock<HistoryStore>>,
    notifications: NotificationDispatcher,
    engine: Arc<dyn TransferEngine>,
    timers: TimerRegistry,
    start_retry: RetryHandler,
    snapshot_tx: watch::Sender<Option<TransferSnapshot>>,
    last_request: Mutex<Option<StartRequest>>,
    shut_down: AtomicBool,
}

/// Entry point of the orchestration layer
///
/// Cheap to clone; every clone drives the same state.
#[derive(Clone)]
pub struct TransferOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TransferOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOrchestrator")
            .field("pending_timers", &self.inner.timers.len())
            .field("shut_down", &self.inner.shut_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TransferOrchestrator {
    /// Build an orchestrator; call [`initialize`](Self::initialize) before use
    #[must_use]
    pub fn new(
        engine: Arc<dyn TransferEngine>,
        storage: Arc<dyn Storage>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (snapshot_tx, _rx) = watch::channel(None);
        let notifications =
            NotificationDispatcher::new(settings.notification_cap, settings.notification_duration);

        Self {
            inner: Arc::new(Inner {
                machine: Mutex::new(TransferStateMachine::new(&settings)),
                history: Arc::new(RwLock::new(HistoryStore::new(storage))),
                notifications,
                engine,
                timers: TimerRegistry::new(),
                start_retry: RetryHandler::for_network_operations(),
                snapshot_tx,
                last_request: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Rehydrate persisted history
    pub async fn initialize(&self) -> Result<()> {
        self.ensure_running()?;
        let mut history = self.inner.history.write().await;
        history.reload();
        info!("Orchestrator initialized with {} history records", history.len());
        Ok(())
    }

    /// Cancel every timer and refuse further commands
    pub async fn cleanup(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.timers.cancel_all();
        self.inner.notifications.shutdown();

        let mut machine = self.inner.machine.lock().await;
        machine.reset();
        self.publish(&machine);
        info!("Orchestrator shut down");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            Err(OrchestratorError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn publish(&self, machine: &TransferStateMachine) {
        let next = machine.snapshot().cloned();
        self.inner.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn apply_effects(&self, effects: &[Effect]) {
        for effect in effects {
            match effect {
                Effect::ScheduleClear { transfer_id, delay } => {
                    let weak = self.downgrade();
                    let id = transfer_id.clone();
                    self.inner
                        .timers
                        .schedule(clear_key(transfer_id), *delay, async move {
                            if let Some(this) = Self::upgrade(&weak) {
                                this.clear_snapshot(&id).await;
                            }
                        });
                }
                Effect::ScheduleRetry {
                    transfer_id, delay, ..
                } => {
                    let weak = self.downgrade();
                    let id = transfer_id.clone();
                    self.inner
                        .timers
                        .schedule(retry_key(transfer_id), *delay, async move {
                            if let Some(this) = Self::upgrade(&weak) {
                                this.run_retry(&id).await;
                            }
                        });
                }
                Effect::CancelTimers { transfer_id } => {
                    self.inner.timers.cancel(&clear_key(transfer_id));
                    self.inner.timers.cancel(&retry_key(transfer_id));
                }
            }
        }
    }

    async fn clear_snapshot(&self, transfer_id: &str) {
        let mut machine = self.inner.machine.lock().await;
        if machine.clear_if_terminal(transfer_id) {
            self.publish(&machine);
        }
    }

    async fn run_retry(&self, transfer_id: &str) {
        if self.ensure_running().is_err() {
            return;
        }
        if self.inner.machine.lock().await.fire_retry(transfer_id).is_none() {
            debug!("Retry of {} no longer pending", transfer_id);
            return;
        }

        let request = self.inner.last_request.lock().await.clone();
        let result = match request {
            Some(request) => self.invoke(&request).await,
            None => Err(TransferError::new(
                crate::error::ErrorCode::ConfigError,
                "No transfer request to retry",
            )),
        };

        match result {
            Ok(new_id) => info!("Retry of {} started as {}", transfer_id, new_id),
            Err(err) => {
                let mut machine = self.inner.machine.lock().await;
                if self.ensure_running().is_err() {
                    debug!("Retry of {} ended after shutdown: {}", transfer_id, err);
                    return;
                }
                machine.retry_failed_to_start(err.with_transfer_id(transfer_id), &self.inner.notifications);
                self.publish(&machine);
            }
        }
    }

    /// Ask the engine to start `request`, retrying transient failures
    ///
    /// Each attempt first checks that the orchestrator is still running.
    async fn invoke(&self, request: &StartRequest) -> std::result::Result<String, TransferError> {
        let engine = Arc::clone(&self.inner.engine);
        self.inner
            .start_retry
            .retry(|| {
                let engine = Arc::clone(&engine);
                let request = request.clone();
                let running = self.ensure_running().is_ok();
                async move {
                    if !running {
                        return Err(TransferError::new(
                            crate::error::ErrorCode::Cancelled,
                            "Orchestrator shut down",
                        ));
                    }
                    request.invoke(engine.as_ref()).await
                }
            })
            .await
    }

    /// Feed one engine event through the state machine
    ///
    /// Only a conflicting `started` event fails; everything else is either
    /// applied or ignored.
    pub async fn handle_event(&self, event: EngineEvent) -> Result<EventOutcome> {
        self.ensure_running()?;

        let mut machine = self.inner.machine.lock().await;
        let mut history = self.inner.history.write().await;
        let outcome = machine.handle(&event, &mut history, &self.inner.notifications)?;
        drop(history);

        self.apply_effects(outcome.effects());
        self.publish(&machine);
        Ok(outcome)
    }

    /// Consume events until the channel closes or the orchestrator shuts down
    ///
    /// Returns the number of applied events.
    pub async fn run(&self, mut events: mpsc::Receiver<EngineEvent>) -> usize {
        let mut applied = 0;
        while let Some(event) = events.recv().await {
            let kind = event.kind();
            match self.handle_event(event).await {
                Ok(outcome) if outcome.is_applied() => applied += 1,
                Ok(_) => {}
                Err(OrchestratorError::ShutDown) => break,
                Err(e) => warn!("Rejected {} event: {}", kind, e),
            }
        }
        debug!("Event pump stopped after {} applied events", applied);
        applied
    }

    /// Run the event pump on a background task
    pub fn spawn_event_pump(&self, events: mpsc::Receiver<EngineEvent>) -> JoinHandle<usize> {
        let this = self.clone();
        tokio::spawn(async move { this.run(events).await })
    }

    /// Send a file using a validated configuration
    ///
    /// `target` overrides the configured target address. The engine call is
    /// retried on transient failures; its id is returned.
    pub async fn start_transfer(
        &self,
        config: &ValidatedConfig,
        file_path: impl AsRef<Path>,
        target: Option<&str>,
    ) -> Result<String> {
        self.ensure_running()?;

        let target = target
            .map(str::to_string)
            .or_else(|| config.target_ip.clone())
            .unwrap_or_default();
        let request = StartRequest::Send {
            config: config.clone(),
            file_path: file_path.as_ref().to_path_buf(),
            target: target.clone(),
        };

        if !self.inner.engine.validate_config(config.config()).await? {
            return Err(OrchestratorError::invalid_config(
                "configuration rejected by the transfer engine",
            ));
        }

        self.begin(request, config.retry_budget(), Some(target)).await
    }

    /// Wait for an incoming file
    pub async fn receive(
        &self,
        port: u16,
        protocol: Protocol,
        output_dir: impl AsRef<Path>,
    ) -> Result<String> {
        self.ensure_running()?;
        if port == 0 {
            return Err(OrchestratorError::invalid_config("port must be non-zero"));
        }

        let request = StartRequest::Receive {
            port,
            protocol,
            output_dir: output_dir.as_ref().to_path_buf(),
        };
        self.begin(request, None, None).await
    }

    async fn begin(
        &self,
        request: StartRequest,
        retry_budget: Option<u32>,
        target: Option<String>,
    ) -> Result<String> {
        {
            let mut machine = self.inner.machine.lock().await;
            let effects = machine.begin_transfer(retry_budget, target, &request.label())?;
            self.apply_effects(&effects);
        }
        *self.inner.last_request.lock().await = Some(request.clone());

        info!("Starting transfer: {}", request.label());
        match self.invoke(&request).await {
            Ok(id) => {
                debug!("Engine accepted transfer {}", id);
                Ok(id)
            }
            Err(err) => {
                let mut machine = self.inner.machine.lock().await;
                if self.ensure_running().is_ok() {
                    machine.record_command_error(err.clone());
                }
                Err(err.into())
            }
        }
    }

    /// Cancel the active transfer, or abort a pending retry
    ///
    /// Advisory: the snapshot only changes when the engine confirms with a
    /// `cancelled` event.
    pub async fn cancel(&self) -> Result<()> {
        self.ensure_running()?;

        let target = self.inner.machine.lock().await.cancel_target()?;
        match target {
            CancelTarget::Engine(id) => {
                info!("Cancelling transfer {}", id);
                self.inner
                    .engine
                    .cancel(&id)
                    .await
                    .map_err(|e| OrchestratorError::from(e.with_transfer_id(id)))
            }
            CancelTarget::PendingRetry(id) => {
                let mut machine = self.inner.machine.lock().await;
                if machine.abort_pending_retry(&id, &self.inner.notifications) {
                    self.inner.timers.cancel(&retry_key(&id));
                }
                self.publish(&machine);
                Ok(())
            }
        }
    }

    /// Poll the engine for progress of the active transfer
    pub async fn refresh_progress(&self) -> Result<EventOutcome> {
        self.ensure_running()?;
        let id = match self.inner.machine.lock().await.cancel_target()? {
            CancelTarget::Engine(id) => id,
            CancelTarget::PendingRetry(_) => return Err(OrchestratorError::NoActiveTransfer),
        };
        let progress = self
            .inner
            .engine
            .get_progress(&id)
            .await
            .map_err(|e| e.with_transfer_id(id))?;
        self.handle_event(EngineEvent::Progress(progress)).await
    }

    /// Forget the last error without touching the snapshot
    pub async fn clear_error(&self) -> Result<()> {
        self.ensure_running()?;
        self.inner.machine.lock().await.clear_error();
        Ok(())
    }

    /// Acknowledge a failed transfer and return to idle
    ///
    /// Returns false when the snapshot was not in `Error`.
    pub async fn dismiss(&self) -> Result<bool> {
        self.ensure_running()?;
        let mut machine = self.inner.machine.lock().await;
        let effects = machine.dismiss(&self.inner.notifications);
        self.apply_effects(&effects);
        self.publish(&machine);
        Ok(!effects.is_empty())
    }

    /// Copy of the current snapshot
    #[must_use]
    pub fn snapshot(&self) -> Option<TransferSnapshot> {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Status of the current snapshot
    #[must_use]
    pub fn status(&self) -> TransferStatus {
        self.inner
            .snapshot_tx
            .borrow()
            .as_ref()
            .map_or(TransferStatus::Idle, |s| s.status)
    }

    /// Subscribe to snapshot changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<TransferSnapshot>> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Most recent classified failure
    pub async fn last_error(&self) -> Option<TransferError> {
        self.inner.machine.lock().await.last_error().cloned()
    }

    /// Engine connection state
    pub async fn connection_status(&self) -> ConnectionStatus {
        self.inner.machine.lock().await.connection_status()
    }

    /// Failed attempts recorded for `transfer_id`
    pub async fn retry_attempts(&self, transfer_id: &str) -> u32 {
        self.inner.machine.lock().await.retry_attempts(transfer_id)
    }

    /// Shared handle to the history store
    #[must_use]
    pub fn history(&self) -> Arc<RwLock<HistoryStore>> {
        Arc::clone(&self.inner.history)
    }

    /// Notification dispatcher
    #[must_use]
    pub fn notifications(&self) -> &NotificationDispatcher {
        &self.inner.notifications
    }

    /// Returns true if a timer is pending under `key`
    #[must_use]
    pub fn has_timer(&self, key: &str) -> bool {
        self.inner.timers.is_scheduled(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::error::ErrorCode;
    use crate::events::ProgressEvent;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Engine that hands out sequential ids
    #[derive(Default)]
    struct CountingEngine {
        starts: AtomicU32,
        cancels: AtomicU32,
    }

    #[async_trait]
    impl TransferEngine for CountingEngine {
        async fn start(
            &self,
            _config: &ValidatedConfig,
            _file_path: &Path,
            _target: &str,
        ) -> std::result::Result<String, TransferError> {
            let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("t{n}"))
        }

        async fn receive(
            &self,
            port: u16,
            _protocol: Protocol,
            _output_dir: &Path,
        ) -> std::result::Result<String, TransferError> {
            Ok(format!("rx-{port}"))
        }

        async fn cancel(&self, _transfer_id: &str) -> std::result::Result<(), TransferError> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn get_progress(
            &self,
            transfer_id: &str,
        ) -> std::result::Result<ProgressEvent, TransferError> {
            Ok(ProgressEvent {
                transfer_id: transfer_id.to_string(),
                progress: 0.25,
                speed: 100.0,
                eta: 3.0,
                bytes_transferred: 256,
                total_bytes: 1024,
                timestamp: 0.0,
            })
        }

        async fn validate_config(
            &self,
            config: &TransferConfig,
        ) -> std::result::Result<bool, TransferError> {
            Ok(config.port != 9)
        }
    }

    fn orchestrator() -> (TransferOrchestrator, Arc<CountingEngine>) {
        let engine = Arc::new(CountingEngine::default());
        let orchestrator = TransferOrchestrator::new(
            engine.clone(),
            Arc::new(MemoryStorage::new()),
            OrchestratorSettings::default(),
        );
        (orchestrator, engine)
    }

    fn config() -> ValidatedConfig {
        TransferConfig {
            target_ip: Some("127.0.0.1".into()),
            ..Default::default()
        }
        .validate()
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_snapshot_cleared_after_delay() {
        let (orch, _) = orchestrator();
        orch.initialize().await.unwrap();

        orch.handle_event(EngineEvent::started("t1", "a", 10)).await.unwrap();
        orch.handle_event(EngineEvent::completed("t1", true, 10, 1.0, "")).await.unwrap();
        assert!(orch.has_timer("clear:t1"));

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(orch.status(), TransferStatus::Completed);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(orch.snapshot().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_reinvokes_engine() {
        let (orch, engine) = orchestrator();
        let id = orch.start_transfer(&config(), "/tmp/a.bin", None).await.unwrap();
        assert_eq!(id, "t1");

        orch.handle_event(EngineEvent::started("t1", "a.bin", 10)).await.unwrap();
        orch.handle_event(EngineEvent::error("t1", ErrorCode::ConnectionRefused, "refused"))
            .await
            .unwrap();
        assert!(orch.has_timer("retry:t1"));

        // ConnectionRefused, attempt 1: at most 1250 * 0.75 ms
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(engine.starts.load(Ordering::SeqCst), 2);
        assert!(!orch.has_timer("retry:t1"));

        orch.handle_event(EngineEvent::started("t2", "a.bin", 10)).await.unwrap();
        assert_eq!(orch.retry_attempts("t2").await, 1);
        assert_eq!(orch.snapshot().unwrap().target, "127.0.0.1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_paths() {
        let (orch, engine) = orchestrator();
        assert!(matches!(
            orch.cancel().await,
            Err(OrchestratorError::NoActiveTransfer)
        ));

        orch.handle_event(EngineEvent::started("t1", "a", 10)).await.unwrap();
        orch.cancel().await.unwrap();
        assert_eq!(engine.cancels.load(Ordering::SeqCst), 1);
        // Advisory: nothing changes until the engine confirms
        assert_eq!(orch.status(), TransferStatus::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_pending_retry() {
        let (orch, engine) = orchestrator();
        orch.start_transfer(&config(), "/tmp/a.bin", None).await.unwrap();
        orch.handle_event(EngineEvent::started("t1", "a.bin", 10)).await.unwrap();
        orch.handle_event(EngineEvent::error("t1", ErrorCode::Timeout, "slow"))
            .await
            .unwrap();

        orch.cancel().await.unwrap();
        assert!(!orch.has_timer("retry:t1"));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(engine.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_engine_veto() {
        let (orch, _) = orchestrator();
        let mut raw = config().into_inner();
        raw.port = 9;
        let err = orch
            .start_transfer(&raw.validate().unwrap(), "/tmp/a", None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_refresh_progress() {
        let (orch, _) = orchestrator();
        orch.handle_event(EngineEvent::started("t1", "a", 1024)).await.unwrap();
        assert!(orch.refresh_progress().await.unwrap().is_applied());
        assert_eq!(orch.snapshot().unwrap().bytes_transferred, 256);
    }

    #[tokio::test]
    async fn test_receive_and_conflict() {
        let (orch, _) = orchestrator();
        assert_eq!(orch.receive(7000, Protocol::Udp, PathBuf::from("/tmp")).await.unwrap(), "rx-7000");

        orch.handle_event(EngineEvent::started("rx-7000", "in.bin", 10)).await.unwrap();
        let err = orch.receive(7001, Protocol::Udp, "/tmp").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_event_pump_logs_conflicts() {
        let (orch, _) = orchestrator();
        let (tx, rx) = event_channel(8);
        let pump = orch.spawn_event_pump(rx);

        tx.send(EngineEvent::started("t1", "a", 10)).await.unwrap();
        tx.send(EngineEvent::started("t2", "b", 10)).await.unwrap();
        tx.send(EngineEvent::progress("t2", 0.5, 5, 10)).await.unwrap();
        tx.send(EngineEvent::progress("t1", 0.5, 5, 10)).await.unwrap();
        drop(tx);

        assert_eq!(pump.await.unwrap(), 2);
        assert_eq!(orch.snapshot().unwrap().id, "t1");
    }

    #[tokio::test]
    async fn test_cleanup_rejects_commands() {
        let (orch, _) = orchestrator();
        orch.cleanup().await;
        assert!(matches!(
            orch.handle_event(EngineEvent::started("t1", "a", 1)).await,
            Err(OrchestratorError::ShutDown)
        ));
        assert!(orch.initialize().await.is_err());
        assert!(matches!(orch.clear_error().await, Err(OrchestratorError::ShutDown)));
        assert!(matches!(orch.dismiss().await, Err(OrchestratorError::ShutDown)));
        assert!(matches!(
            orch.refresh_progress().await,
            Err(OrchestratorError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_dismiss_after_error() {
        let (orch, _) = orchestrator();
        orch.handle_event(EngineEvent::started("t1", "a", 1)).await.unwrap();
        orch.handle_event(EngineEvent::error("t1", ErrorCode::FileError, "disk"))
            .await
            .unwrap();
        assert!(orch.last_error().await.is_some());

        assert!(orch.dismiss().await.unwrap());
        assert!(orch.snapshot().is_none());
        assert!(orch.last_error().await.is_none());
        assert!(!orch.dismiss().await.unwrap());
    }
}
