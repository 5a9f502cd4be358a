//! Shared fixtures for Ferry integration tests
//!
//! Provides a scriptable [`MockEngine`] and builders for orchestrators and
//! history records.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ferry_core::{
    ErrorCode, HistoryRecord, HistoryStatus, MemoryStorage, OrchestratorSettings, ProgressEvent,
    Protocol, Storage, TransferConfig, TransferDirection, TransferEngine, TransferError,
    TransferOrchestrator, ValidatedConfig,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// A recorded `start` call
#[derive(Debug, Clone, PartialEq)]
pub struct StartCall {
    /// Id handed back to the orchestrator
    pub id: String,
    /// File requested
    pub file_path: PathBuf,
    /// Target requested
    pub target: String,
}

/// Engine double that hands out `t1`, `t2`, ... and records every call
#[derive(Debug, Default)]
pub struct MockEngine {
    next_id: AtomicU32,
    calls: AtomicU32,
    starts: Mutex<Vec<StartCall>>,
    cancels: Mutex<Vec<String>>,
    start_failures: Mutex<VecDeque<TransferError>>,
}

impl MockEngine {
    /// New shared engine
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `start`/`receive` call fail with `code`
    pub fn fail_next_start(&self, code: ErrorCode, message: &str) {
        self.start_failures
            .lock()
            .unwrap()
            .push_back(TransferError::new(code, message.to_string()));
    }

    /// Every `start`/`receive` call so far
    pub fn starts(&self) -> Vec<StartCall> {
        self.starts.lock().unwrap().clone()
    }

    /// Number of `start`/`receive` calls
    pub fn start_count(&self) -> usize {
        self.starts.lock().unwrap().len()
    }

    /// Number of `start`/`receive` calls, failed ones included
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Id returned by the most recent successful start
    pub fn last_id(&self) -> Option<String> {
        self.starts.lock().unwrap().last().map(|c| c.id.clone())
    }

    /// Ids passed to `cancel`
    pub fn cancelled(&self) -> Vec<String> {
        self.cancels.lock().unwrap().clone()
    }

    fn begin(&self, file_path: &Path, target: &str) -> Result<String, TransferError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.start_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let id = format!("t{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.starts.lock().unwrap().push(StartCall {
            id: id.clone(),
            file_path: file_path.to_path_buf(),
            target: target.to_string(),
        });
        Ok(id)
    }
}

#[async_trait]
impl TransferEngine for MockEngine {
    async fn start(
        &self,
        _config: &ValidatedConfig,
        file_path: &Path,
        target: &str,
    ) -> Result<String, TransferError> {
        self.begin(file_path, target)
    }

    async fn receive(
        &self,
        port: u16,
        _protocol: Protocol,
        output_dir: &Path,
    ) -> Result<String, TransferError> {
        self.begin(output_dir, &format!(":{port}"))
    }

    async fn cancel(&self, transfer_id: &str) -> Result<(), TransferError> {
        self.cancels.lock().unwrap().push(transfer_id.to_string());
        Ok(())
    }

    async fn get_progress(&self, transfer_id: &str) -> Result<ProgressEvent, TransferError> {
        Err(TransferError::new(ErrorCode::UnknownError, "no live progress").with_transfer_id(transfer_id))
    }

    async fn validate_config(&self, config: &TransferConfig) -> Result<bool, TransferError> {
        Ok(config.check().is_ok())
    }
}

/// Orchestrator over in-memory storage with default settings
pub fn orchestrator(engine: &Arc<MockEngine>) -> TransferOrchestrator {
    orchestrator_with_storage(engine, Arc::new(MemoryStorage::new()))
}

/// Orchestrator over the given storage with default settings
pub fn orchestrator_with_storage(
    engine: &Arc<MockEngine>,
    storage: Arc<dyn Storage>,
) -> TransferOrchestrator {
    TransferOrchestrator::new(engine.clone(), storage, OrchestratorSettings::default())
}

/// Valid transmitter configuration aimed at `target`
pub fn send_config(target: &str) -> ValidatedConfig {
    TransferConfig {
        target_ip: Some(target.to_string()),
        ..Default::default()
    }
    .validate()
    .unwrap()
}

/// Fixed point in time, `offset_secs` after 2024-01-01
pub fn at(offset_secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(offset_secs)
}

/// History record with sensible defaults
pub fn record(id: &str, status: HistoryStatus, offset_secs: i64) -> HistoryRecord {
    HistoryRecord {
        id: id.to_string(),
        filename: format!("{id}.bin"),
        size: 1000,
        mode: TransferDirection::Sent,
        protocol: Protocol::Tcp,
        target: "10.0.0.2".to_string(),
        status,
        timestamp: at(offset_secs),
        duration: 10.0,
        checksum: String::new(),
        error: None,
    }
}
