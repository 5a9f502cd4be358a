//! Replay of recorded engine event logs
//!
//! A log is a JSON-lines file, one engine event per line. Blank lines and
//! lines starting with `#` are skipped. Events are pushed into the
//! orchestrator's queue with the original spacing (divided by the speed-up
//! factor) while the live snapshot is rendered.

use crate::progress::{TransferProgress, format_bytes, format_seconds};
use async_trait::async_trait;
use console::style;
use ferry_core::{
    EngineEvent, ErrorCode, Notification, NotificationKind, Protocol, ProgressEvent,
    TransferConfig, TransferEngine, TransferError, TransferOrchestrator, TransferSnapshot,
    ValidatedConfig, event_channel,
};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Longest pause inserted between two replayed events
pub const MAX_REPLAY_GAP: Duration = Duration::from_secs(10);

/// Parsed event log
#[derive(Debug, Default)]
pub struct EventLog {
    /// Events in file order
    pub events: Vec<EngineEvent>,
    /// Unparseable lines: 1-based line number and parse error
    pub skipped: Vec<(usize, String)>,
}

impl EventLog {
    /// Parse a JSON-lines document
    #[must_use]
    pub fn parse(input: &str) -> Self {
        let mut log = Self::default();
        for (idx, line) in input.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match EngineEvent::from_json(line) {
                Ok(event) => log.events.push(event),
                Err(e) => {
                    tracing::warn!("Skipping line {}: {}", idx + 1, e);
                    log.skipped.push((idx + 1, e.to_string()));
                }
            }
        }
        log
    }

    /// Read and parse a log file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", path.display(), e))?;
        Ok(Self::parse(&contents))
    }
}

/// Pause before replaying `next`, given the previous event's timestamp
#[must_use]
pub fn replay_gap(previous: f64, next: f64, speed_up: f64) -> Duration {
    if previous <= 0.0 || next <= previous || speed_up.is_nan() || speed_up <= 0.0 {
        return Duration::ZERO;
    }
    let secs = (next - previous) / speed_up;
    if !secs.is_finite() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(secs).min(MAX_REPLAY_GAP)
}

/// Engine stand-in for replays: hands out ids and logs every call
///
/// Lifecycle events come from the log, so a replay only reaches this engine
/// through retries or explicit commands.
#[derive(Debug, Default)]
pub struct RecordingEngine {
    next_id: AtomicU64,
    calls: AtomicU64,
}

impl RecordingEngine {
    /// Number of engine calls received
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn record(&self, call: &str) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Engine call during replay: {}", call);
    }

    fn next_id(&self) -> String {
        format!("replay-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[async_trait]
impl TransferEngine for RecordingEngine {
    async fn start(
        &self,
        _config: &ValidatedConfig,
        file_path: &Path,
        target: &str,
    ) -> Result<String, TransferError> {
        self.record(&format!("start {} -> {}", file_path.display(), target));
        Ok(self.next_id())
    }

    async fn receive(
        &self,
        port: u16,
        protocol: Protocol,
        output_dir: &Path,
    ) -> Result<String, TransferError> {
        self.record(&format!(
            "receive {}:{} into {}",
            protocol,
            port,
            output_dir.display()
        ));
        Ok(self.next_id())
    }

    async fn cancel(&self, transfer_id: &str) -> Result<(), TransferError> {
        self.record(&format!("cancel {transfer_id}"));
        Ok(())
    }

    async fn get_progress(&self, transfer_id: &str) -> Result<ProgressEvent, TransferError> {
        self.record(&format!("progress {transfer_id}"));
        Err(TransferError::new(
            ErrorCode::UnknownError,
            "replayed transfers report progress through events only",
        )
        .with_transfer_id(transfer_id))
    }

    async fn validate_config(&self, config: &TransferConfig) -> Result<bool, TransferError> {
        Ok(config.check().is_ok())
    }
}

/// Outcome of a replay
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Events read from the log
    pub events: usize,
    /// Events that changed state
    pub applied: usize,
    /// Unparseable lines
    pub skipped: usize,
}

/// Feed `log` through `orchestrator`, rendering as it goes
///
/// # Errors
///
/// Returns an error if the event pump panicked.
pub async fn replay(
    orchestrator: &TransferOrchestrator,
    log: EventLog,
    speed_up: f64,
) -> anyhow::Result<ReplaySummary> {
    let mut summary = ReplaySummary {
        events: log.events.len(),
        skipped: log.skipped.len(),
        ..Default::default()
    };

    let (tx, rx) = event_channel(ferry_core::orchestrator::DEFAULT_EVENT_QUEUE);
    let mut pump = orchestrator.spawn_event_pump(rx);

    let feeder = tokio::spawn(async move {
        let mut previous = 0.0;
        for event in log.events {
            let timestamp = event.timestamp();
            tokio::time::sleep(replay_gap(previous, timestamp, speed_up)).await;
            if timestamp > 0.0 {
                previous = timestamp;
            }
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });

    let mut snapshots = orchestrator.subscribe();
    let mut notifications = orchestrator.notifications().subscribe();
    let mut renderer = Renderer::default();

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                renderer.render(snapshot.as_ref());
            }
            changed = notifications.changed() => {
                if changed.is_err() {
                    break;
                }
                let list = notifications.borrow_and_update().clone();
                renderer.announce(&list);
            }
            applied = &mut pump => {
                summary.applied = applied?;
                break;
            }
        }
    }

    feeder.abort();
    renderer.render(orchestrator.snapshot().as_ref());
    renderer.announce(&orchestrator.notifications().notifications());
    Ok(summary)
}

#[derive(Default)]
struct Renderer {
    bar: Option<TransferProgress>,
    seen: HashSet<String>,
}

impl Renderer {
    fn render(&mut self, snapshot: Option<&TransferSnapshot>) {
        let Some(snapshot) = snapshot else {
            return;
        };
        let stale = self
            .bar
            .as_ref()
            .is_none_or(|bar| bar.transfer_id() != snapshot.id);
        if stale {
            self.bar = Some(TransferProgress::new(
                &snapshot.id,
                snapshot.total_bytes,
                &snapshot.filename,
            ));
        }
        if let Some(bar) = &self.bar {
            if !bar.is_finished() {
                bar.render(snapshot);
            }
        }
    }

    fn announce(&mut self, list: &[Notification]) {
        // Newest first; print oldest unseen first
        for notification in list.iter().rev() {
            if !self.seen.insert(notification.id.clone()) {
                continue;
            }
            let line = format_notification(notification);
            match &self.bar {
                Some(bar) if !bar.is_finished() => bar.println(line),
                _ => println!("{line}"),
            }
        }
    }
}

fn format_notification(notification: &Notification) -> String {
    let label = match notification.kind {
        NotificationKind::Info => style("info").cyan(),
        NotificationKind::Success => style("done").green(),
        NotificationKind::Warning => style("warn").yellow(),
        NotificationKind::Error => style("fail").red().bold(),
    };
    format!(
        "[{}] {}: {}",
        label,
        style(&notification.title).bold(),
        notification.message
    )
}

/// Print a short summary of a replay
pub fn print_summary(summary: &ReplaySummary, history_len: usize, path: &Path) {
    println!();
    println!("Replayed {}", path.display());
    println!("  Events:   {} ({} applied)", summary.events, summary.applied);
    if summary.skipped > 0 {
        println!("  Skipped:  {} unparseable lines", summary.skipped);
    }
    println!("  History:  {history_len} records");
}

/// Describe a snapshot on one line
#[must_use]
pub fn describe_snapshot(snapshot: &TransferSnapshot) -> String {
    format!(
        "{} {} [{}] {}/{} in {}",
        snapshot.id,
        snapshot.filename,
        snapshot.status,
        format_bytes(snapshot.bytes_transferred),
        format_bytes(snapshot.total_bytes),
        format_seconds(snapshot.elapsed(chrono::Utc::now()).as_secs_f64())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::{MemoryStorage, OrchestratorSettings};
    use std::sync::Arc;

    const LOG: &str = r#"
# two transfers
{"event":"started","transfer_id":"t1","filename":"a.bin","file_size":1024,"protocol":"tcp","mode":"transmitter","timestamp":100.0}
{"event":"progress","transfer_id":"t1","progress":0.5,"bytes_transferred":512,"total_bytes":1024,"timestamp":101.0}
not json
{"event":"completed","transfer_id":"t1","success":true,"bytes_transferred":1024,"duration":2.0,"checksum":"abc","timestamp":102.0}
"#;

    #[test]
    fn test_parse_skips_comments_and_garbage() {
        let log = EventLog::parse(LOG);
        assert_eq!(log.events.len(), 3);
        assert_eq!(log.skipped.len(), 1);
        assert_eq!(log.skipped[0].0, 5);
    }

    #[test]
    fn test_read_missing_file() {
        assert!(EventLog::read(Path::new("/nonexistent/events.jsonl")).is_err());
    }

    #[test]
    fn test_replay_gap() {
        assert_eq!(replay_gap(0.0, 100.0, 1.0), Duration::ZERO);
        assert_eq!(replay_gap(100.0, 101.0, 1.0), Duration::from_secs(1));
        assert_eq!(replay_gap(100.0, 101.0, 4.0), Duration::from_millis(250));
        assert_eq!(replay_gap(100.0, 99.0, 1.0), Duration::ZERO);
        assert_eq!(replay_gap(100.0, 1000.0, 1.0), MAX_REPLAY_GAP);
        assert_eq!(replay_gap(100.0, 101.0, 0.0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_records_history() {
        let engine = Arc::new(RecordingEngine::default());
        let orchestrator = TransferOrchestrator::new(
            engine.clone(),
            Arc::new(MemoryStorage::new()),
            OrchestratorSettings::default(),
        );
        orchestrator.initialize().await.unwrap();

        let summary = replay(&orchestrator, EventLog::parse(LOG), 1.0).await.unwrap();
        assert_eq!(summary.events, 3);
        assert_eq!(summary.applied, 3);
        assert_eq!(summary.skipped, 1);

        let history = orchestrator.history();
        let history = history.read().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history.records()[0].checksum, "abc");
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_recording_engine_ids() {
        let engine = RecordingEngine::default();
        let config = TransferConfig {
            target_ip: Some("10.0.0.2".into()),
            ..Default::default()
        };
        assert!(engine.validate_config(&config).await.unwrap());

        let validated = config.validate().unwrap();
        let id = engine.start(&validated, Path::new("a"), "10.0.0.2").await.unwrap();
        assert_eq!(id, "replay-1");
        assert!(engine.get_progress(&id).await.is_err());
        assert_eq!(engine.calls(), 2);
    }
}
