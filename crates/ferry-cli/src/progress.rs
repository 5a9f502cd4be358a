//! Transfer progress display with progress bars.

use ferry_core::{TransferSnapshot, TransferStatus};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const BAR_TEMPLATE: &str = "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Progress bar following the orchestrator's snapshot
pub struct TransferProgress {
    bar: ProgressBar,
    transfer_id: String,
}

impl TransferProgress {
    /// Create a new progress tracker
    #[must_use]
    pub fn new(transfer_id: &str, total_bytes: u64, filename: &str) -> Self {
        let bar = ProgressBar::new(total_bytes);

        let style = ProgressStyle::default_bar()
            .template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        bar.set_message(format!("Transferring: {filename}"));

        Self {
            bar,
            transfer_id: transfer_id.to_string(),
        }
    }

    /// Id of the transfer this bar follows
    #[must_use]
    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    /// Update progress
    pub fn update(&self, transferred_bytes: u64) {
        self.bar.set_position(transferred_bytes);
    }

    /// Mirror a snapshot of the same transfer
    pub fn render(&self, snapshot: &TransferSnapshot) {
        if snapshot.total_bytes > 0 {
            self.bar.set_length(snapshot.total_bytes);
        }
        self.update(snapshot.bytes_transferred);

        match snapshot.status {
            TransferStatus::Connecting => {
                self.set_message(format!("Connecting: {}", snapshot.filename));
            }
            TransferStatus::Transferring => self.set_message(format!(
                "Transferring: {} ({:.0}%, {}, ETA {})",
                snapshot.filename,
                snapshot.percent(),
                snapshot.speed_string(),
                snapshot.eta_string()
            )),
            TransferStatus::Completed => self.finish(),
            TransferStatus::Error => {
                let reason = snapshot.error.as_deref().unwrap_or("unknown error");
                self.set_message(format!("Failed: {reason}"));
                self.abandon();
            }
            TransferStatus::Cancelled => {
                self.set_message("Cancelled".to_string());
                self.abandon();
            }
            TransferStatus::Idle => {}
        }
    }

    /// Print a line above the bar without tearing it
    pub fn println(&self, line: impl AsRef<str>) {
        self.bar.println(line);
    }

    /// Set custom message
    pub fn set_message(&self, msg: String) {
        self.bar.set_message(msg);
    }

    /// Finish with success message
    pub fn finish(&self) {
        self.bar.finish_with_message("Transfer complete!");
    }

    /// Abandon the progress bar (for errors)
    pub fn abandon(&self) {
        self.bar.abandon();
    }

    /// Returns true once the bar stopped drawing
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.bar.is_finished()
    }
}

/// Format bytes in human-readable format
///
/// # Example
///
/// ```
/// use ferry_cli::progress::format_bytes;
///
/// assert_eq!(format_bytes(1024), "1.00 KB");
/// assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
/// assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
/// ```
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Format speed in human-readable format (bytes/sec)
#[must_use]
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec.max(0.0) as u64))
}

/// Format duration in human-readable format
///
/// # Example
///
/// ```
/// use ferry_cli::progress::format_duration;
/// use std::time::Duration;
///
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Format a duration given in (possibly fractional) seconds
#[must_use]
pub fn format_seconds(seconds: f64) -> String {
    if !seconds.is_finite() || seconds <= 0.0 {
        return "0s".to_string();
    }
    format_duration(Duration::from_secs_f64(seconds))
}
