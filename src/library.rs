//! Browsing operations over the scanned library.
//!
//! Everything here works on the [`SongMetadata`] list produced by a
//! [`LibraryScanner`](crate::scan_cache::LibraryScanner) pass: search, sort,
//! display formatting, plus the two file-mutating actions (delete, lyrics
//! edit).

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::archive::lyrics_sidecar_path;
use crate::config::Config;
use crate::labels::{label_key, Label, LabelStore};
use crate::metadata::{Id3TagStore, MetadataEmbedder, SongParser};
use crate::models::SongMetadata;
use crate::progress::ProgressSink;
use crate::scan_cache::{LibraryScanner, ScanMessage, ScanSummary};

/// Drain a scan pass into one list.
///
/// Returns the default summary if the pass ended without a done marker.
pub async fn collect_scan(mut rx: mpsc::Receiver<ScanMessage>) -> (Vec<SongMetadata>, ScanSummary) {
    let mut songs = Vec::new();
    while let Some(message) = rx.recv().await {
        match message {
            ScanMessage::Batch(batch) => songs.extend(batch),
            ScanMessage::Done(summary) => return (songs, summary),
        }
    }
    log::warn!("Library scan ended early");
    (songs, ScanSummary::default())
}

/// Case-insensitive match on title or artist. An empty query keeps everything.
pub fn filter_songs<'a>(songs: &'a [SongMetadata], query: &str) -> Vec<&'a SongMetadata> {
    let query = query.trim().to_lowercase();
    songs
        .iter()
        .filter(|song| {
            query.is_empty()
                || song.title.to_lowercase().contains(&query)
                || song.artist.to_lowercase().contains(&query)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum SortKey {
    Title,
    Artist,
    Duration,
    #[default]
    Date,
    Size,
}

impl SortKey {
    /// Dates list newest first; everything else ascending.
    pub fn descending_by_default(&self) -> bool {
        matches!(self, SortKey::Date)
    }
}

/// Sort in place by `key`; `reverse` flips the key's default direction.
pub fn sort_songs(songs: &mut [&SongMetadata], key: SortKey, reverse: bool) {
    songs.sort_by(|a, b| match key {
        SortKey::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
        SortKey::Artist => a.artist.to_lowercase().cmp(&b.artist.to_lowercase()),
        SortKey::Duration => a.duration_secs.cmp(&b.duration_secs),
        SortKey::Date => a.date.cmp(&b.date),
        SortKey::Size => a.file_size.cmp(&b.file_size),
    });
    if key.descending_by_default() != reverse {
        songs.reverse();
    }
}

/// `M:SS`, or `--:--` when the duration is unknown.
pub fn format_duration(seconds: u64) -> String {
    if seconds == 0 {
        return "--:--".to_string();
    }
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 KB".to_string();
    }
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if value < 1024.0 {
            return format!("{:.1} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.1} TB", value)
}

/// Remove an audio file and its lyrics sidecar.
pub fn delete_song(path: &Path) -> Result<()> {
    std::fs::remove_file(path).with_context(|| format!("Failed to delete {}", path.display()))?;
    let sidecar = lyrics_sidecar_path(path);
    if sidecar.exists() {
        std::fs::remove_file(&sidecar)
            .with_context(|| format!("Failed to delete {}", sidecar.display()))?;
    }
    log::info!("Deleted {}", path.display());
    Ok(())
}

/// Replace a song's lyrics in its tags and sidecar, then read the file back
/// and confirm the tag holds the new text.
pub fn save_lyrics(
    path: &Path,
    lyrics: &str,
    embedder: &dyn MetadataEmbedder,
    parser: &dyn SongParser,
) -> Result<()> {
    embedder
        .write_lyrics(path, lyrics)
        .with_context(|| format!("Failed to save lyrics for {}", path.display()))?;

    let sidecar = lyrics_sidecar_path(path);
    if lyrics.trim().is_empty() {
        if sidecar.exists() {
            std::fs::remove_file(&sidecar)
                .with_context(|| format!("Failed to remove {}", sidecar.display()))?;
        }
    } else {
        std::fs::write(&sidecar, lyrics)
            .with_context(|| format!("Failed to write {}", sidecar.display()))?;
    }

    let stored = parser.parse_song(path).lyrics.unwrap_or_default();
    let expected = normalize_lyrics(lyrics);
    let actual = normalize_lyrics(&stored);
    if expected != actual {
        bail!(
            "Lyrics did not persist in {} (expected {} chars, found {})",
            path.display(),
            expected.len(),
            actual.len()
        );
    }
    Ok(())
}

fn normalize_lyrics(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_string()
}

/// Filters for `sunosync library list`.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub search: Option<String>,
    pub sort: SortKey,
    pub reverse: bool,
    pub label: Option<Label>,
}

/// `sunosync library list`: refresh the scan cache and print the table.
pub async fn run_list(config: &Config, options: &ListOptions, sink: Arc<dyn ProgressSink>) -> Result<()> {
    let scanner = LibraryScanner::from_config(config, sink);
    let rx = scanner
        .refresh()
        .context("A library scan is already running")?;
    let (songs, summary) = collect_scan(rx).await;
    let labels = LabelStore::load(&config.labels_path());

    let mut view = filter_songs(&songs, options.search.as_deref().unwrap_or(""));
    if let Some(wanted) = options.label {
        view.retain(|song| labels.get(&label_key(song)) == Some(wanted));
    }
    sort_songs(&mut view, options.sort, options.reverse);

    for song in &view {
        let label = labels
            .get(&label_key(song))
            .map(|l| l.as_str())
            .unwrap_or("");
        println!(
            "{:<40}  {:<20}  {:>6}  {:<10}  {:>9}  {:<5}  {}",
            clip_text(&song.title, 40),
            clip_text(&song.artist, 20),
            format_duration(song.duration_secs),
            clip_text(&song.date, 10),
            format_size(song.file_size),
            label,
            song.path.display()
        );
    }
    println!(
        "{} of {} songs ({} re-read)",
        view.len(),
        summary.total,
        summary.reparsed
    );
    Ok(())
}

fn clip_text(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(width.saturating_sub(1)).collect();
    clipped.push('…');
    clipped
}

/// `sunosync library delete`.
pub fn run_delete(path: &Path) -> Result<()> {
    delete_song(path)?;
    println!("deleted {}", path.display());
    Ok(())
}

/// `sunosync lyrics show`: tag lyrics, falling back to the sidecar.
pub fn run_lyrics_show(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!("No such file: {}", path.display());
    }
    let from_tag = Id3TagStore.parse_song(path).lyrics;
    let lyrics = match from_tag {
        Some(lyrics) => Some(lyrics),
        None => std::fs::read_to_string(lyrics_sidecar_path(path)).ok(),
    };
    match lyrics {
        Some(text) if !text.trim().is_empty() => println!("{}", text.trim_end()),
        _ => println!("(no lyrics)"),
    }
    Ok(())
}

/// `sunosync lyrics save --from <file>`.
pub fn run_lyrics_save(path: &Path, source: &Path) -> Result<()> {
    if !path.exists() {
        bail!("No such file: {}", path.display());
    }
    let text = std::fs::read_to_string(source)
        .with_context(|| format!("Failed to read {}", source.display()))?;
    save_lyrics(path, &text, &Id3TagStore, &Id3TagStore)?;
    println!("Lyrics saved and verified: {}", path.display());
    Ok(())
}
