//! Harvest and library-scan progress reporting.
//!
//! The pipeline never talks to a UI directly. Every item outcome, page
//! boundary, and scan batch is pushed through a [`ProgressSink`]; the CLI
//! renders events on **stderr** (so stdout stays parseable for scripts) and a
//! graphical front end can consume them from a [`ChannelProgress`] queue.

use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Coarse status attached to every event, matching the activity-log colors.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Info,
    Downloading,
    Success,
    Error,
}

/// Why an item was not downloaded.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyArchived,
    NoAudio,
}

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Scanning the archive for existing identities.
    IndexBuilding { directory: PathBuf },
    IndexBuilt { existing: usize },
    PageStarted { page: u32 },
    /// No items on this page; the run is done.
    CatalogExhausted { page: u32 },
    PageLimitReached { max_pages: u32 },
    ItemSkipped { title: String, reason: SkipReason },
    ItemDownloading {
        title: String,
        thumbnail: Option<Vec<u8>>,
    },
    ItemRetry {
        title: String,
        attempt: u32,
        max_attempts: u32,
    },
    ItemArchived {
        title: String,
        path: PathBuf,
        thumbnail: Option<Vec<u8>>,
    },
    ItemFailed { title: String, error: String },
    /// The file was downloaded but tagging or the lyrics sidecar failed.
    EmbedFailed { title: String, error: String },
    ItemCancelled { title: String },
    /// Terminal event of a harvest run.
    RunFinished { state: String, message: String },
    ScanBatch { songs: usize },
    ScanDone {
        total: usize,
        reparsed: usize,
    },
}

impl ProgressEvent {
    pub fn status(&self) -> EventStatus {
        match self {
            ProgressEvent::ItemDownloading { .. } => EventStatus::Downloading,
            ProgressEvent::ItemArchived { .. } => EventStatus::Success,
            ProgressEvent::ItemFailed { .. } | ProgressEvent::EmbedFailed { .. } => {
                EventStatus::Error
            }
            ProgressEvent::RunFinished { state, .. } => match state.as_str() {
                "completed" => EventStatus::Success,
                "failed" => EventStatus::Error,
                _ => EventStatus::Info,
            },
            _ => EventStatus::Info,
        }
    }

    /// The human-readable log line for this event.
    pub fn line(&self) -> String {
        match self {
            ProgressEvent::IndexBuilding { directory } => {
                format!("Scanning existing files in {}...", directory.display())
            }
            ProgressEvent::IndexBuilt { existing } => {
                format!("Found {} existing songs.", format_number(*existing as u64))
            }
            ProgressEvent::PageStarted { page } => format!("Page {}...", page),
            ProgressEvent::CatalogExhausted { .. } => "No more songs found.".to_string(),
            ProgressEvent::PageLimitReached { max_pages } => {
                format!("Reached max pages limit ({}). Stopping.", max_pages)
            }
            ProgressEvent::ItemSkipped { title, reason } => match reason {
                SkipReason::AlreadyArchived => format!("Skipping: {}", title),
                SkipReason::NoAudio => format!("Skipping: {} (no audio)", title),
            },
            ProgressEvent::ItemDownloading { title, .. } => format!("Downloading: {}", title),
            ProgressEvent::ItemRetry {
                attempt,
                max_attempts,
                ..
            } => format!("  Retry {}/{}...", attempt, max_attempts),
            ProgressEvent::ItemArchived { title, .. } => format!("✓ {}", title),
            ProgressEvent::ItemFailed { title, error } => format!("Failed: {} - {}", title, error),
            ProgressEvent::EmbedFailed { title, error } => {
                format!("  Metadata error: {} - {}", title, error)
            }
            ProgressEvent::ItemCancelled { title } => format!("Cancelled: {}", title),
            ProgressEvent::RunFinished { message, .. } => message.clone(),
            ProgressEvent::ScanBatch { songs } => format!("library  +{} songs", songs),
            ProgressEvent::ScanDone { total, reparsed } => format!(
                "library  {} songs ({} re-read)",
                format_number(*total as u64),
                format_number(*reparsed as u64)
            ),
        }
    }

    pub fn thumbnail(&self) -> Option<&[u8]> {
        match self {
            ProgressEvent::ItemDownloading { thumbnail, .. }
            | ProgressEvent::ItemArchived { thumbnail, .. } => thumbnail.as_deref(),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::IndexBuilding { .. } => "index_building",
            ProgressEvent::IndexBuilt { .. } => "index_built",
            ProgressEvent::PageStarted { .. } => "page_started",
            ProgressEvent::CatalogExhausted { .. } => "catalog_exhausted",
            ProgressEvent::PageLimitReached { .. } => "page_limit_reached",
            ProgressEvent::ItemSkipped { .. } => "item_skipped",
            ProgressEvent::ItemDownloading { .. } => "item_downloading",
            ProgressEvent::ItemRetry { .. } => "item_retry",
            ProgressEvent::ItemArchived { .. } => "item_archived",
            ProgressEvent::ItemFailed { .. } => "item_failed",
            ProgressEvent::EmbedFailed { .. } => "embed_failed",
            ProgressEvent::ItemCancelled { .. } => "item_cancelled",
            ProgressEvent::RunFinished { .. } => "run_finished",
            ProgressEvent::ScanBatch { .. } => "scan_batch",
            ProgressEvent::ScanDone { .. } => "scan_done",
        }
    }
}

/// Receives progress events. Called from worker tasks, so it must be cheap
/// and must not block for long.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "Downloading: Midnight Drive".
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = format!("{}\n", event.line());
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressSink for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = serde_json::json!({
            "event": event.kind(),
            "status": event.status(),
            "message": event.line(),
            "has_thumbnail": event.thumbnail().is_some(),
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op sink when progress is disabled.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Forwards events into an unbounded queue for a single-threaded consumer.
///
/// Events are dropped once the receiver is gone.
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn report(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn sink(&self) -> Box<dyn ProgressSink> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
