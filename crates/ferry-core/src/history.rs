//! Persisted, queryable log of finished transfers
//!
//! The store keeps at most [`MAX_HISTORY_ITEMS`] records, most recent first.
//! Every mutation re-persists the whole list under [`HISTORY_KEY`];
//! persistence failures are logged and never surface to the caller.
//!
//! Queries are a view over the records: a conjunctive [`HistoryFilter`], a
//! case-insensitive search over filename/target/checksum and a stable sort.

use crate::storage::{HISTORY_KEY, Storage};
use crate::transfer::{Protocol, TransferDirection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum number of records kept
pub const MAX_HISTORY_ITEMS: usize = 1000;

/// Outcome recorded for a finished transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    /// Transfer succeeded
    #[default]
    Completed,
    /// Transfer failed
    Failed,
    /// Transfer was cancelled
    Cancelled,
}

impl fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for HistoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("Invalid status: {other}")),
        }
    }
}

/// Summary of one finished transfer attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Transfer id, unique within the store
    pub id: String,
    /// File name
    pub filename: String,
    /// Size in bytes
    pub size: u64,
    /// Direction
    pub mode: TransferDirection,
    /// Transport protocol
    pub protocol: Protocol,
    /// Remote address
    pub target: String,
    /// Outcome
    pub status: HistoryStatus,
    /// When the transfer finished
    pub timestamp: DateTime<Utc>,
    /// Duration in seconds
    pub duration: f64,
    /// Checksum, empty if unavailable
    pub checksum: String,
    /// Failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Partial update applied by [`HistoryStore::update_record`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    /// New file name
    pub filename: Option<String>,
    /// New size
    pub size: Option<u64>,
    /// New target
    pub target: Option<String>,
    /// New status
    pub status: Option<HistoryStatus>,
    /// New duration
    pub duration: Option<f64>,
    /// New checksum
    pub checksum: Option<String>,
    /// New error message
    pub error: Option<String>,
}

impl RecordPatch {
    fn apply(self, record: &mut HistoryRecord) {
        if let Some(filename) = self.filename {
            record.filename = filename;
        }
        if let Some(size) = self.size {
            record.size = size;
        }
        if let Some(target) = self.target {
            record.target = target;
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(duration) = self.duration {
            record.duration = duration;
        }
        if let Some(checksum) = self.checksum {
            record.checksum = checksum;
        }
        if let Some(error) = self.error {
            record.error = Some(error);
        }
    }
}

/// Conjunctive record filter; `None` fields match everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryFilter {
    /// Only this outcome
    pub status: Option<HistoryStatus>,
    /// Only this protocol
    pub protocol: Option<Protocol>,
    /// Only this direction
    pub mode: Option<TransferDirection>,
    /// Case-insensitive substring of the file name
    pub filename_contains: Option<String>,
    /// Inclusive lower bound on the timestamp
    pub from_date: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the timestamp
    pub to_date: Option<DateTime<Utc>>,
}

impl HistoryFilter {
    /// Returns true if `record` passes every set criterion
    #[must_use]
    pub fn matches(&self, record: &HistoryRecord) -> bool {
        if self.status.is_some_and(|s| s != record.status) {
            return false;
        }
        if self.protocol.is_some_and(|p| p != record.protocol) {
            return false;
        }
        if self.mode.is_some_and(|m| m != record.mode) {
            return false;
        }
        if let Some(needle) = self.filename_contains.as_deref() {
            if !contains_ignore_case(&record.filename, needle) {
                return false;
            }
        }
        if self.from_date.is_some_and(|from| record.timestamp < from) {
            return false;
        }
        if self.to_date.is_some_and(|to| record.timestamp > to) {
            return false;
        }
        true
    }
}

/// Field to sort on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    /// Finish time
    #[default]
    Timestamp,
    /// File name
    Filename,
    /// Size in bytes
    Size,
    /// Duration
    Duration,
    /// Outcome
    Status,
    /// Protocol
    Protocol,
    /// Direction
    Mode,
    /// Remote address
    Target,
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "timestamp" | "date" => Ok(Self::Timestamp),
            "filename" | "name" => Ok(Self::Filename),
            "size" => Ok(Self::Size),
            "duration" => Ok(Self::Duration),
            "status" => Ok(Self::Status),
            "protocol" => Ok(Self::Protocol),
            "mode" => Ok(Self::Mode),
            "target" => Ok(Self::Target),
            other => Err(format!("Invalid sort field: {other}")),
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Smallest first
    Asc,
    /// Largest first
    #[default]
    Desc,
}

/// Sort options for the query view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SortOptions {
    /// Field to sort on
    pub field: SortField,
    /// Direction
    pub direction: SortDirection,
}

impl SortOptions {
    fn compare(&self, a: &HistoryRecord, b: &HistoryRecord) -> Ordering {
        let ordering = match self.field {
            SortField::Timestamp => a.timestamp.cmp(&b.timestamp),
            SortField::Filename => cmp_ignore_case(&a.filename, &b.filename),
            SortField::Size => a.size.cmp(&b.size),
            SortField::Duration => a.duration.total_cmp(&b.duration),
            SortField::Status => cmp_ignore_case(&a.status.to_string(), &b.status.to_string()),
            SortField::Protocol => {
                cmp_ignore_case(&a.protocol.to_string(), &b.protocol.to_string())
            }
            SortField::Mode => cmp_ignore_case(&a.mode.to_string(), &b.mode.to_string()),
            SortField::Target => cmp_ignore_case(&a.target, &b.target),
        };

        match self.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    }
}

fn cmp_ignore_case(a: &str, b: &str) -> Ordering {
    a.to_lowercase().cmp(&b.to_lowercase())
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Result of [`HistoryStore::import_history`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportResult {
    /// False if the input was not a JSON array
    pub success: bool,
    /// Records added to the store
    pub imported: usize,
    /// Records skipped because their id already existed
    pub skipped: usize,
    /// One entry per rejected record, or the parse error
    pub errors: Vec<String>,
}

/// Per-protocol record counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProtocolBreakdown {
    /// TCP records
    pub tcp: usize,
    /// UDP records
    pub udp: usize,
}

/// Per-direction record counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModeBreakdown {
    /// Sent records
    pub sent: usize,
    /// Received records
    pub received: usize,
}

/// Aggregate statistics over the whole store
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryStats {
    /// Number of records
    pub total: usize,
    /// Completed records
    pub completed: usize,
    /// Failed records
    pub failed: usize,
    /// Cancelled records
    pub cancelled: usize,
    /// `100 * completed / total`, `0` when empty
    pub success_rate: f64,
    /// Bytes over completed records
    pub total_bytes: u64,
    /// Seconds over completed records
    pub total_duration: f64,
    /// `total_bytes / total_duration`, `0` when duration is zero
    pub average_speed: f64,
    /// Records per protocol
    pub by_protocol: ProtocolBreakdown,
    /// Records per direction
    pub by_mode: ModeBreakdown,
}

/// Lenient shape accepted on import
#[derive(Debug, Deserialize)]
struct ImportedRecord {
    id: Option<String>,
    filename: Option<String>,
    timestamp: Option<Value>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    mode: TransferDirection,
    #[serde(default)]
    protocol: Protocol,
    #[serde(default)]
    target: String,
    #[serde(default)]
    status: HistoryStatus,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    checksum: String,
    #[serde(default)]
    error: Option<String>,
}

impl ImportedRecord {
    fn into_record(self) -> Result<HistoryRecord, String> {
        let id = self
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or("missing id")?;
        let filename = self.filename.ok_or("missing filename")?;
        let timestamp = self
            .timestamp
            .as_ref()
            .ok_or("missing timestamp")
            .and_then(|v| parse_timestamp(v).ok_or("invalid timestamp"))?;

        Ok(HistoryRecord {
            id,
            filename,
            size: self.size,
            mode: self.mode,
            protocol: self.protocol,
            target: self.target,
            status: self.status,
            timestamp,
            duration: self.duration,
            checksum: self.checksum,
            error: self.error,
        })
    }
}

/// ISO-8601 string or epoch milliseconds
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// The history log
#[derive(Debug)]
pub struct HistoryStore {
    records: Vec<HistoryRecord>,
    storage: Arc<dyn Storage>,
    filter: HistoryFilter,
    search_query: String,
    sort: SortOptions,
}

impl HistoryStore {
    /// Create an empty store backed by `storage`
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            records: Vec::new(),
            storage,
            filter: HistoryFilter::default(),
            search_query: String::new(),
            sort: SortOptions::default(),
        }
    }

    /// Create a store and rehydrate it from `storage`
    #[must_use]
    pub fn load(storage: Arc<dyn Storage>) -> Self {
        let mut store = Self::new(storage);
        store.reload();
        store
    }

    /// Replace the in-memory records with the persisted ones
    ///
    /// A missing value leaves the store empty; a corrupted one is logged and
    /// replaced by an empty history.
    pub fn reload(&mut self) {
        self.records = match self.storage.get(HISTORY_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<HistoryRecord>>(&raw) {
                Ok(mut records) => {
                    records.truncate(MAX_HISTORY_ITEMS);
                    debug!("Loaded {} history records", records.len());
                    records
                }
                Err(e) => {
                    warn!("Stored history is corrupted, starting empty: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to read history: {}", e);
                Vec::new()
            }
        };
    }

    /// All records, most recent first
    #[must_use]
    pub fn records(&self) -> &[HistoryRecord] {
        &self.records
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if there are no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a record by id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&HistoryRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Returns true if a record with `id` exists
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Prepend a record, evicting the oldest past the cap
    ///
    /// Returns false (and leaves the store untouched) if the id already exists.
    pub fn add_record(&mut self, record: HistoryRecord) -> bool {
        if self.contains(&record.id) {
            warn!("History already contains record {}, ignoring", record.id);
            return false;
        }

        debug!("Adding history record {} ({})", record.id, record.status);
        self.records.insert(0, record);
        self.records.truncate(MAX_HISTORY_ITEMS);
        self.persist();
        true
    }

    /// Apply `patch` to the record with `id`
    pub fn update_record(&mut self, id: &str, patch: RecordPatch) -> bool {
        let Some(record) = self.records.iter_mut().find(|r| r.id == id) else {
            return false;
        };
        patch.apply(record);
        self.persist();
        true
    }

    /// Remove the record with `id`
    pub fn remove_record(&mut self, id: &str) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.id != id);
        let removed = self.records.len() != before;
        if removed {
            self.persist();
        }
        removed
    }

    /// Remove every record
    pub fn clear_history(&mut self) {
        self.records.clear();
        self.persist();
        info!("History cleared");
    }

    /// Replace the active filter
    pub fn set_filter(&mut self, filter: HistoryFilter) {
        self.filter = filter;
    }

    /// Active filter
    #[must_use]
    pub fn filter(&self) -> &HistoryFilter {
        &self.filter
    }

    /// Replace the search query; empty matches everything
    pub fn set_search_query(&mut self, query: impl Into<String>) {
        self.search_query = query.into();
    }

    /// Active search query
    #[must_use]
    pub fn search_query(&self) -> &str {
        &self.search_query
    }

    /// Replace the sort options
    pub fn set_sort_options(&mut self, sort: SortOptions) {
        self.sort = sort;
    }

    /// Active sort options
    #[must_use]
    pub fn sort_options(&self) -> SortOptions {
        self.sort
    }

    fn matches_search(&self, record: &HistoryRecord) -> bool {
        let query = self.search_query.trim();
        if query.is_empty() {
            return true;
        }
        contains_ignore_case(&record.filename, query)
            || contains_ignore_case(&record.target, query)
            || contains_ignore_case(&record.checksum, query)
    }

    /// Filtered, searched and sorted copy of the records
    #[must_use]
    pub fn filtered_records(&self) -> Vec<HistoryRecord> {
        let mut view: Vec<HistoryRecord> = self
            .records
            .iter()
            .filter(|r| self.filter.matches(r) && self.matches_search(r))
            .cloned()
            .collect();

        let sort = self.sort;
        view.sort_by(|a, b| sort.compare(a, b));
        view
    }

    /// Serialize every record as a pretty-printed JSON array
    pub fn export_history(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.records)
    }

    /// Import records from a JSON array
    ///
    /// Invalid records are reported in `errors`; records whose id already
    /// exists are skipped. Survivors are prepended and the list re-capped.
    pub fn import_history(&mut self, json: &str) -> ImportResult {
        let parsed: Value = match serde_json::from_str(json) {
            Ok(value) => value,
            Err(e) => {
                return ImportResult {
                    success: false,
                    errors: vec![format!("Invalid JSON: {e}")],
                    ..Default::default()
                };
            }
        };

        let Value::Array(items) = parsed else {
            return ImportResult {
                success: false,
                errors: vec!["Expected a JSON array of records".to_string()],
                ..Default::default()
            };
        };

        let mut result = ImportResult {
            success: true,
            ..Default::default()
        };
        let mut seen: HashSet<String> = self.records.iter().map(|r| r.id.clone()).collect();
        let mut survivors = Vec::new();

        for (index, item) in items.into_iter().enumerate() {
            let record = serde_json::from_value::<ImportedRecord>(item)
                .map_err(|e| e.to_string())
                .and_then(ImportedRecord::into_record);

            match record {
                Ok(record) if seen.contains(&record.id) => {
                    debug!("Skipping duplicate history record {}", record.id);
                    result.skipped += 1;
                }
                Ok(record) => {
                    seen.insert(record.id.clone());
                    survivors.push(record);
                }
                Err(e) => result.errors.push(format!("Record {index}: {e}")),
            }
        }

        result.imported = survivors.len();
        if !survivors.is_empty() {
            survivors.append(&mut self.records);
            self.records = survivors;
            self.records.truncate(MAX_HISTORY_ITEMS);
            self.persist();
        }

        info!(
            "Imported {} history records ({} skipped, {} invalid)",
            result.imported,
            result.skipped,
            result.errors.len()
        );
        result
    }

    /// Aggregate statistics over every record
    #[must_use]
    pub fn stats(&self) -> HistoryStats {
        let mut stats = HistoryStats {
            total: self.records.len(),
            ..Default::default()
        };

        for record in &self.records {
            match record.status {
                HistoryStatus::Completed => {
                    stats.completed += 1;
                    stats.total_bytes += record.size;
                    stats.total_duration += record.duration;
                }
                HistoryStatus::Failed => stats.failed += 1,
                HistoryStatus::Cancelled => stats.cancelled += 1,
            }
            match record.protocol {
                Protocol::Tcp => stats.by_protocol.tcp += 1,
                Protocol::Udp => stats.by_protocol.udp += 1,
            }
            match record.mode {
                TransferDirection::Sent => stats.by_mode.sent += 1,
                TransferDirection::Received => stats.by_mode.received += 1,
            }
        }

        if stats.total > 0 {
            stats.success_rate = stats.completed as f64 / stats.total as f64 * 100.0;
        }
        if stats.total_duration > 0.0 {
            stats.average_speed = stats.total_bytes as f64 / stats.total_duration;
        }
        stats
    }

    fn persist(&self) {
        let raw = match serde_json::to_string(&self.records) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to serialize history: {}", e);
                return;
            }
        };
        if let Err(e) = self.storage.set(HISTORY_KEY, &raw) {
            warn!("Failed to persist history: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, StorageError};
    use chrono::TimeZone;

    fn record(id: &str, status: HistoryStatus) -> HistoryRecord {
        HistoryRecord {
            id: id.to_string(),
            filename: format!("{id}.bin"),
            size: 1024,
            mode: TransferDirection::Sent,
            protocol: Protocol::Tcp,
            target: "10.0.0.1".to_string(),
            status,
            timestamp: Utc::now(),
            duration: 2.0,
            checksum: String::new(),
            error: None,
        }
    }

    fn store() -> (HistoryStore, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (HistoryStore::new(storage.clone()), storage)
    }

    /// Rejects every write
    #[derive(Debug)]
    struct ReadOnlyStorage;

    impl Storage for ReadOnlyStorage {
        fn get(&self, _key: &str) -> crate::storage::Result<Option<String>> {
            Ok(None)
        }

        fn set(&self, key: &str, _value: &str) -> crate::storage::Result<()> {
            Err(StorageError::Io {
                key: key.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            })
        }

        fn remove(&self, _key: &str) -> crate::storage::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_add_prepends_and_persists() {
        let (mut history, storage) = store();
        assert!(history.add_record(record("a", HistoryStatus::Completed)));
        assert!(history.add_record(record("b", HistoryStatus::Failed)));

        assert_eq!(history.records()[0].id, "b");
        assert_eq!(history.records()[1].id, "a");

        let reloaded = HistoryStore::load(storage);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.records()[0].id, "b");
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let (mut history, _) = store();
        assert!(history.add_record(record("a", HistoryStatus::Completed)));
        assert!(!history.add_record(record("a", HistoryStatus::Failed)));
        assert_eq!(history.len(), 1);
        assert_eq!(history.records()[0].status, HistoryStatus::Completed);
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let (mut history, _) = store();
        for i in 0..(MAX_HISTORY_ITEMS + 5) {
            history.add_record(record(&format!("r{i}"), HistoryStatus::Completed));
        }

        assert_eq!(history.len(), MAX_HISTORY_ITEMS);
        assert_eq!(history.records()[0].id, format!("r{}", MAX_HISTORY_ITEMS + 4));
        assert!(!history.contains("r0"));
        assert!(!history.contains("r4"));
        assert!(history.contains("r5"));
    }

    #[test]
    fn test_persistence_failure_is_not_fatal() {
        let mut history = HistoryStore::new(Arc::new(ReadOnlyStorage));
        assert!(history.add_record(record("a", HistoryStatus::Completed)));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_corrupted_storage_loads_empty() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(HISTORY_KEY, "[{\"id\": 1").unwrap();
        assert!(HistoryStore::load(storage).is_empty());
    }

    #[test]
    fn test_update_and_remove() {
        let (mut history, _) = store();
        history.add_record(record("a", HistoryStatus::Failed));

        let patch = RecordPatch {
            status: Some(HistoryStatus::Completed),
            checksum: Some("abc".to_string()),
            ..Default::default()
        };
        assert!(history.update_record("a", patch));
        assert_eq!(history.get("a").unwrap().status, HistoryStatus::Completed);
        assert_eq!(history.get("a").unwrap().checksum, "abc");
        assert!(!history.update_record("missing", RecordPatch::default()));

        assert!(history.remove_record("a"));
        assert!(!history.remove_record("a"));
        assert!(history.is_empty());
    }

    #[test]
    fn test_clear_history() {
        let (mut history, storage) = store();
        history.add_record(record("a", HistoryStatus::Completed));
        history.clear_history();
        assert!(history.is_empty());
        assert_eq!(storage.get(HISTORY_KEY).unwrap().as_deref(), Some("[]"));
    }

    #[test]
    fn test_filter_is_conjunctive() {
        let (mut history, _) = store();
        let mut udp = record("udp", HistoryStatus::Completed);
        udp.protocol = Protocol::Udp;
        history.add_record(udp);
        history.add_record(record("tcp-ok", HistoryStatus::Completed));
        history.add_record(record("tcp-fail", HistoryStatus::Failed));

        history.set_filter(HistoryFilter {
            status: Some(HistoryStatus::Completed),
            protocol: Some(Protocol::Tcp),
            ..Default::default()
        });
        let view = history.filtered_records();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].id, "tcp-ok");
    }

    #[test]
    fn test_filter_date_range() {
        let (mut history, _) = store();
        let mut old = record("old", HistoryStatus::Completed);
        old.timestamp = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let mut new = record("new", HistoryStatus::Completed);
        new.timestamp = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        history.add_record(old);
        history.add_record(new);

        history.set_filter(HistoryFilter {
            from_date: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            ..Default::default()
        });
        let view = history.filtered_records();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].id, "new");
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let (mut history, _) = store();
        let mut a = record("a", HistoryStatus::Completed);
        a.filename = "Holiday-Photos.zip".to_string();
        let mut b = record("b", HistoryStatus::Completed);
        b.checksum = "DEADBEEF".to_string();
        history.add_record(a);
        history.add_record(b);
        history.add_record(record("c", HistoryStatus::Completed));

        history.set_search_query("photos");
        assert_eq!(history.filtered_records().len(), 1);

        history.set_search_query("deadbeef");
        assert_eq!(history.filtered_records()[0].id, "b");

        // Target matches every record
        history.set_search_query("10.0.0");
        assert_eq!(history.filtered_records().len(), 3);

        history.set_search_query("");
        assert_eq!(history.filtered_records().len(), 3);
    }

    #[test]
    fn test_sort_is_stable_and_case_insensitive() {
        let (mut history, _) = store();
        let names = [("1", "beta"), ("2", "Alpha"), ("3", "alpha"), ("4", "Gamma")];
        for (id, name) in names {
            let mut r = record(id, HistoryStatus::Completed);
            r.filename = name.to_string();
            history.add_record(r);
        }
        // Store order (most recent first): 4, 3, 2, 1

        history.set_sort_options(SortOptions {
            field: SortField::Filename,
            direction: SortDirection::Asc,
        });
        let ids: Vec<_> = history.filtered_records().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, ["3", "2", "1", "4"]);

        history.set_sort_options(SortOptions {
            field: SortField::Filename,
            direction: SortDirection::Desc,
        });
        let ids: Vec<_> = history.filtered_records().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, ["4", "1", "3", "2"]);
    }

    #[test]
    fn test_sort_by_size() {
        let (mut history, _) = store();
        for (id, size) in [("a", 30), ("b", 10), ("c", 20)] {
            let mut r = record(id, HistoryStatus::Completed);
            r.size = size;
            history.add_record(r);
        }
        history.set_sort_options(SortOptions {
            field: SortField::Size,
            direction: SortDirection::Asc,
        });
        let sizes: Vec<_> = history.filtered_records().iter().map(|r| r.size).collect();
        assert_eq!(sizes, [10, 20, 30]);
    }

    #[test]
    fn test_stats() {
        let (mut history, _) = store();
        history.add_record(record("c1", HistoryStatus::Completed));
        let mut c2 = record("c2", HistoryStatus::Completed);
        c2.protocol = Protocol::Udp;
        c2.mode = TransferDirection::Received;
        history.add_record(c2);
        history.add_record(record("f1", HistoryStatus::Failed));
        history.add_record(record("x1", HistoryStatus::Cancelled));

        let stats = history.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.success_rate, 50.0);
        assert_eq!(stats.total_bytes, 2048);
        assert_eq!(stats.total_duration, 4.0);
        assert_eq!(stats.average_speed, 512.0);
        assert_eq!(stats.by_protocol, ProtocolBreakdown { tcp: 3, udp: 1 });
        assert_eq!(stats.by_mode, ModeBreakdown { sent: 3, received: 1 });
    }

    #[test]
    fn test_stats_empty() {
        let (history, _) = store();
        let stats = history.stats();
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.average_speed, 0.0);
    }

    #[test]
    fn test_export_uses_iso_timestamps() {
        let (mut history, _) = store();
        let mut r = record("a", HistoryStatus::Completed);
        r.timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        history.add_record(r);

        let exported: Value = serde_json::from_str(&history.export_history().unwrap()).unwrap();
        assert_eq!(exported[0]["timestamp"], "2024-03-01T12:00:00Z");
        assert_eq!(exported[0]["status"], "completed");
    }

    #[test]
    fn test_import_malformed_json() {
        let (mut history, _) = store();
        let result = history.import_history("[{");
        assert!(!result.success);
        assert_eq!(result.imported, 0);
        assert_eq!(result.errors.len(), 1);

        let result = history.import_history(r#"{"id":"a"}"#);
        assert!(!result.success);
    }

    #[test]
    fn test_import_skips_existing_ids() {
        let (mut history, _) = store();
        history.add_record(record("a", HistoryStatus::Completed));

        let json = r#"[{"id":"a","filename":"x","timestamp":"2024-01-01T00:00:00Z"}]"#;
        let result = history.import_history(json);
        assert!(result.success);
        assert_eq!(result.imported, 0);
        assert_eq!(result.skipped, 1);
        assert!(result.errors.is_empty());
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_import_reports_invalid_records() {
        let (mut history, _) = store();
        history.add_record(record("existing", HistoryStatus::Completed));

        let json = r#"[
            {"id":"new","filename":"n.bin","timestamp":1704067200000,"size":42,"protocol":"udp"},
            {"filename":"no-id.bin","timestamp":"2024-01-01T00:00:00Z"}
        ]"#;
        let result = history.import_history(json);
        assert!(result.success);
        assert_eq!(result.imported, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("id"));

        // Survivors are prepended with defaults filled in
        let imported = &history.records()[0];
        assert_eq!(imported.id, "new");
        assert_eq!(imported.size, 42);
        assert_eq!(imported.protocol, Protocol::Udp);
        assert_eq!(imported.mode, TransferDirection::Sent);
        assert_eq!(imported.status, HistoryStatus::Completed);
        assert_eq!(imported.timestamp.timestamp(), 1_704_067_200);
    }

    #[test]
    fn test_import_duplicate_within_batch() {
        let (mut history, _) = store();
        let json = r#"[
            {"id":"a","filename":"1","timestamp":"2024-01-01T00:00:00Z"},
            {"id":"a","filename":"2","timestamp":"2024-01-01T00:00:00Z"}
        ]"#;
        let result = history.import_history(json);
        assert_eq!(result.imported, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(history.get("a").unwrap().filename, "1");
    }

    #[test]
    fn test_export_import_roundtrip() {
        let (mut source, _) = store();
        source.add_record(record("a", HistoryStatus::Completed));
        source.add_record(record("b", HistoryStatus::Cancelled));
        let exported = source.export_history().unwrap();

        let (mut target, _) = store();
        let result = target.import_history(&exported);
        assert_eq!(result.imported, 2);
        assert_eq!(target.records(), source.records());
    }
}
