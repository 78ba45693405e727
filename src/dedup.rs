//! Identity index of clips already present in the archive.
//!
//! Built once per run, before any download is dispatched, by walking the
//! archive directory and reading the identity frame of every audio file.
//! Workers then only ever insert, and only after a clip is fully archived.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use walkdir::WalkDir;

use crate::archive::is_archive_audio;
use crate::metadata::IdentityReader;

#[derive(Debug, Default)]
pub struct DedupIndex {
    ids: Mutex<HashSet<String>>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: Mutex::new(ids.into_iter().map(Into::into).collect()),
        }
    }

    /// Scan `directory` recursively. Files without an identity are ignored;
    /// a missing directory yields an empty index.
    pub fn build(directory: &Path, reader: &dyn IdentityReader) -> Self {
        let mut ids = HashSet::new();
        if !directory.exists() {
            return Self::from_ids(ids);
        }

        for entry in WalkDir::new(directory) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_archive_audio(entry.path()) {
                continue;
            }
            if let Some(id) = reader.read_identity(entry.path()) {
                ids.insert(id);
            }
        }

        log::info!(
            "Dedup index: {} identities under {}",
            ids.len(),
            directory.display()
        );
        Self::from_ids(ids)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains(id)
    }

    /// Record a completed clip. Returns `false` if it was already present.
    pub fn insert(&self, id: &str) -> bool {
        self.lock().insert(id.to_string())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // Insert-only set; a poisoned guard still holds a consistent set.
        self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
