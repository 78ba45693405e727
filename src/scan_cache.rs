//! Library scan with a persisted modification-time cache.
//!
//! A refresh walks the archive root on a background thread. For each audio
//! file the current modification time is compared against the cached entry
//! for its absolute path: an equal timestamp reuses the stored
//! [`SongMetadata`], anything else re-parses the file and overwrites the
//! entry. Results stream to the consumer as [`ScanMessage::Batch`]es of
//! `batch_size` songs followed by one [`ScanMessage::Done`].
//!
//! The cache file is a flat JSON object keyed by path:
//!
//! ```json
//! { "/music/Song.mp3": { "mod_time": { "secs": 1700000000, "nanos": 0 },
//!                        "metadata": { "title": "Song", ... } } }
//! ```
//!
//! It is written once per pass, and only when some entry changed. Entries for
//! files that have since disappeared are kept.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::archive::is_library_audio;
use crate::config::Config;
use crate::metadata::{Id3TagStore, SongParser};
use crate::models::SongMetadata;
use crate::progress::{ProgressEvent, ProgressSink};

const DEFAULT_BATCH_SIZE: usize = 20;
const QUEUE_DEPTH: usize = 8;

/// File modification time at full filesystem precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModTime {
    pub secs: u64,
    pub nanos: u32,
}

impl ModTime {
    /// Modification time of `path`, or `None` if it cannot be read.
    pub fn of(path: &Path) -> Option<Self> {
        let modified = std::fs::metadata(path).ok()?.modified().ok()?;
        Some(Self::from(modified))
    }
}

impl From<SystemTime> for ModTime {
    fn from(time: SystemTime) -> Self {
        let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            secs: since.as_secs(),
            nanos: since.subsec_nanos(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCacheEntry {
    pub mod_time: ModTime,
    pub metadata: SongMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanCache {
    entries: BTreeMap<String, ScanCacheEntry>,
}

impl ScanCache {
    /// Load the cache, starting empty if the file is missing or unreadable.
    pub fn load(path: &Path) -> Self {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                log::warn!("Could not read scan cache {}: {}", path.display(), e);
                return Self::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(cache) => cache,
            Err(e) => {
                log::warn!("Ignoring corrupt scan cache {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Write the cache to a temporary file and rename it over `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Cached metadata for `key`, only if it was recorded at `mod_time`.
    pub fn fresh(&self, key: &str, mod_time: ModTime) -> Option<&SongMetadata> {
        self.entries
            .get(key)
            .filter(|entry| entry.mod_time == mod_time)
            .map(|entry| &entry.metadata)
    }

    /// Record `entry` for `key`, replacing any older entry.
    pub fn insert(&mut self, key: String, entry: ScanCacheEntry) {
        self.entries.insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub total: usize,
    pub reused: usize,
    pub reparsed: usize,
    /// Whether the cache file was rewritten.
    pub persisted: bool,
}

/// What a refresh sends to its receiver: batches of songs, then one `Done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanMessage {
    Batch(Vec<SongMetadata>),
    Done(ScanSummary),
}

/// Background library scan backed by a [`ScanCache`]. At most one refresh
/// runs at a time.
pub struct LibraryScanner {
    root: PathBuf,
    cache_path: PathBuf,
    batch_size: usize,
    parser: Arc<dyn SongParser>,
    sink: Arc<dyn ProgressSink>,
    scanning: Arc<AtomicBool>,
}

impl LibraryScanner {
    pub fn new(
        root: impl Into<PathBuf>,
        cache_path: impl Into<PathBuf>,
        parser: Arc<dyn SongParser>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            root: root.into(),
            cache_path: cache_path.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            parser,
            sink,
            scanning: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_config(config: &Config, sink: Arc<dyn ProgressSink>) -> Self {
        Self::new(
            config.archive.path.clone(),
            config.scan_cache_path(),
            Arc::new(Id3TagStore),
            sink,
        )
        .with_batch_size(config.library.batch_size)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// True while a refresh is running.
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Start a scan pass on a background thread.
    ///
    /// Returns `None` without doing anything while a previous pass is still
    /// running.
    pub fn refresh(&self) -> Option<mpsc::Receiver<ScanMessage>> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("Library scan already running; refresh ignored");
            return None;
        }

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let pass = ScanPass {
            root: self.root.clone(),
            cache_path: self.cache_path.clone(),
            batch_size: self.batch_size,
            parser: self.parser.clone(),
            sink: self.sink.clone(),
        };
        let scanning = self.scanning.clone();
        let spawned = std::thread::Builder::new()
            .name("library-scan".to_string())
            .spawn(move || {
                let busy = BusyFlag(scanning);
                let summary = pass.run(&tx);
                // Cleared before the done marker so a consumer may refresh right away.
                drop(busy);
                let _ = tx.blocking_send(ScanMessage::Done(summary));
            });

        match spawned {
            Ok(_) => Some(rx),
            Err(e) => {
                log::error!("Could not start library scan: {}", e);
                self.scanning.store(false, Ordering::SeqCst);
                None
            }
        }
    }
}

/// Clears the scanning flag when the pass ends, even by panic.
struct BusyFlag(Arc<AtomicBool>);

impl Drop for BusyFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct ScanPass {
    root: PathBuf,
    cache_path: PathBuf,
    batch_size: usize,
    parser: Arc<dyn SongParser>,
    sink: Arc<dyn ProgressSink>,
}

impl ScanPass {
    fn run(&self, tx: &mpsc::Sender<ScanMessage>) -> ScanSummary {
        let mut cache = ScanCache::load(&self.cache_path);
        let mut summary = ScanSummary::default();
        let mut batch = Vec::with_capacity(self.batch_size);

        for path in audio_files(&self.root) {
            let Some(mod_time) = ModTime::of(&path) else {
                continue;
            };
            let key = path.to_string_lossy().to_string();
            let song = match cache.fresh(&key, mod_time) {
                Some(song) => {
                    summary.reused += 1;
                    song.clone()
                }
                None => {
                    let song = self.parser.parse_song(&path);
                    cache.insert(
                        key,
                        ScanCacheEntry {
                            mod_time,
                            metadata: song.clone(),
                        },
                    );
                    summary.reparsed += 1;
                    song
                }
            };
            summary.total += 1;
            batch.push(song);

            if batch.len() >= self.batch_size {
                self.flush(tx, &mut batch);
            }
        }
        if !batch.is_empty() {
            self.flush(tx, &mut batch);
        }

        if summary.reparsed > 0 {
            match cache.save(&self.cache_path) {
                Ok(()) => summary.persisted = true,
                Err(e) => log::warn!("Could not save scan cache: {:#}", e),
            }
        }

        log::info!(
            "Library scan: {} songs, {} reused, {} re-read",
            summary.total,
            summary.reused,
            summary.reparsed
        );
        self.sink.report(ProgressEvent::ScanDone {
            total: summary.total,
            reparsed: summary.reparsed,
        });
        summary
    }

    fn flush(&self, tx: &mpsc::Sender<ScanMessage>, batch: &mut Vec<SongMetadata>) {
        let songs = std::mem::replace(batch, Vec::with_capacity(self.batch_size));
        self.sink.report(ProgressEvent::ScanBatch { songs: songs.len() });
        // A dropped receiver still lets the pass finish and persist the cache.
        let _ = tx.blocking_send(ScanMessage::Batch(songs));
    }
}

/// Audio files under `root`, as absolute paths.
fn audio_files(root: &Path) -> Vec<PathBuf> {
    if !root.exists() {
        return Vec::new();
    }
    let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    WalkDir::new(&root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && is_library_audio(entry.path()))
        .map(|entry| entry.into_path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Parses by file name and counts how often it was asked to.
    #[derive(Default)]
    struct CountingParser {
        parsed: AtomicUsize,
    }

    impl SongParser for CountingParser {
        fn parse_song(&self, path: &Path) -> SongMetadata {
            self.parsed.fetch_add(1, Ordering::SeqCst);
            SongMetadata {
                path: path.to_path_buf(),
                title: path.file_stem().unwrap().to_string_lossy().to_string(),
                artist: "Unknown".into(),
                file_size: std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
                ..Default::default()
            }
        }
    }

    fn scanner(root: &Path, parser: Arc<CountingParser>) -> LibraryScanner {
        LibraryScanner::new(
            root,
            root.join(".cache").join("library_cache.json"),
            parser,
            Arc::new(NoProgress),
        )
        .with_batch_size(2)
    }

    fn drain(mut rx: mpsc::Receiver<ScanMessage>) -> (Vec<Vec<SongMetadata>>, ScanSummary) {
        let mut batches = Vec::new();
        while let Some(message) = rx.blocking_recv() {
            match message {
                ScanMessage::Batch(songs) => batches.push(songs),
                ScanMessage::Done(summary) => return (batches, summary),
            }
        }
        panic!("scan ended without a done marker");
    }

    fn titles(batches: &[Vec<SongMetadata>]) -> Vec<String> {
        let mut titles: Vec<String> = batches.iter().flatten().map(|s| s.title.clone()).collect();
        titles.sort();
        titles
    }

    #[test]
    fn unchanged_rescan_reuses_every_entry() {
        let tmp = TempDir::new().unwrap();
        for name in ["a.mp3", "b.mp3", "c.wav", "notes.txt"] {
            std::fs::write(tmp.path().join(name), name).unwrap();
        }
        let parser = Arc::new(CountingParser::default());
        let scanner = scanner(tmp.path(), parser.clone());

        let (batches, first) = drain(scanner.refresh().unwrap());
        assert_eq!(first.total, 3);
        assert_eq!(first.reparsed, 3);
        assert!(first.persisted);
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 1]);

        let (again, second) = drain(scanner.refresh().unwrap());
        assert_eq!(second.reused, 3);
        assert_eq!(second.reparsed, 0);
        assert!(!second.persisted);
        assert_eq!(titles(&again), titles(&batches));
        assert_eq!(parser.parsed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn touched_file_is_the_only_one_reparsed() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.mp3");
        std::fs::write(&a, "a").unwrap();
        std::fs::write(tmp.path().join("b.mp3"), "b").unwrap();
        let parser = Arc::new(CountingParser::default());
        let scanner = scanner(tmp.path(), parser.clone());
        drain(scanner.refresh().unwrap());

        let later = SystemTime::now() + Duration::from_secs(120);
        std::fs::File::options()
            .write(true)
            .open(&a)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let (_, summary) = drain(scanner.refresh().unwrap());
        assert_eq!(summary.reparsed, 1);
        assert_eq!(summary.reused, 1);
        assert_eq!(parser.parsed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cache_survives_a_new_scanner() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.mp3"), "a").unwrap();
        drain(scanner(tmp.path(), Arc::new(CountingParser::default())).refresh().unwrap());

        let fresh_parser = Arc::new(CountingParser::default());
        let (_, summary) = drain(scanner(tmp.path(), fresh_parser.clone()).refresh().unwrap());
        assert_eq!(summary.reused, 1);
        assert_eq!(fresh_parser.parsed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn refresh_is_ignored_while_scanning() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.mp3"), "a").unwrap();
        let scanner = scanner(tmp.path(), Arc::new(CountingParser::default()));

        scanner.scanning.store(true, Ordering::SeqCst);
        assert!(scanner.refresh().is_none());
        scanner.scanning.store(false, Ordering::SeqCst);

        let rx = scanner.refresh().unwrap();
        drain(rx);
        for _ in 0..100 {
            if !scanner.is_scanning() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!scanner.is_scanning());
    }

    #[test]
    fn corrupt_cache_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(ScanCache::load(&path).is_empty());
        assert!(ScanCache::load(&tmp.path().join("absent.json")).is_empty());
    }

    #[test]
    fn entry_is_fresh_only_at_equal_mod_time() {
        let mut cache = ScanCache::default();
        let at = ModTime { secs: 10, nanos: 5 };
        cache.insert(
            "/m/a.mp3".into(),
            ScanCacheEntry {
                mod_time: at,
                metadata: SongMetadata::default(),
            },
        );
        assert!(cache.fresh("/m/a.mp3", at).is_some());
        assert!(cache.fresh("/m/a.mp3", ModTime { secs: 10, nanos: 6 }).is_none());
        assert!(cache.fresh("/m/b.mp3", at).is_none());
    }
}
