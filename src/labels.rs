//! User labels for archived songs (keep / trash / star).
//!
//! Labels are keyed by clip identity when the file carries one and by path
//! otherwise, so retagging or renaming a harvested file keeps its label. A key
//! holds at most one label; applying the label it already has clears it.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::Config;
use crate::metadata::{Id3TagStore, SongParser};
use crate::models::SongMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Keep,
    Trash,
    Star,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Keep => "keep",
            Label::Trash => "trash",
            Label::Star => "star",
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Key a song's label is stored under.
pub fn label_key(song: &SongMetadata) -> String {
    match song.identity.as_deref().filter(|id| !id.is_empty()) {
        Some(identity) => identity.to_string(),
        None => song.path.to_string_lossy().to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelStore {
    labels: BTreeMap<String, Label>,
}

impl LabelStore {
    /// Load labels, starting empty when the file is missing or unreadable.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                log::warn!("Ignoring corrupt labels file {}: {}", path.display(), e);
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                log::warn!("Could not read labels file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Write the store as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write labels file {}", path.display()))?;
        Ok(())
    }

    /// The label stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<Label> {
        self.labels.get(key).copied()
    }

    /// Apply `label` to `key`. Re-applying the current label removes it.
    /// Returns the label now in effect.
    pub fn toggle(&mut self, key: &str, label: Label) -> Option<Label> {
        if self.labels.get(key) == Some(&label) {
            self.labels.remove(key);
            None
        } else {
            self.labels.insert(key.to_string(), label);
            Some(label)
        }
    }

    /// Labelled keys in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Label)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// `sunosync label <path> <label>`.
pub fn run_label(config: &Config, path: &Path, label: Label) -> Result<()> {
    if !path.exists() {
        bail!("No such file: {}", path.display());
    }
    // Library scans key untagged files by absolute path.
    let absolute = std::fs::canonicalize(path)
        .with_context(|| format!("Failed to resolve {}", path.display()))?;
    let key = label_key(&Id3TagStore.parse_song(&absolute));
    let labels_path = config.labels_path();
    let mut store = LabelStore::load(&labels_path);
    let now = store.toggle(&key, label);
    if let Err(e) = store.save(&labels_path) {
        log::warn!("Could not save labels: {:#}", e);
    }
    match now {
        Some(label) => println!("{}: {}", path.display(), label),
        None => println!("{}: cleared", path.display()),
    }
    Ok(())
}

/// `sunosync labels`.
pub fn run_list_labels(config: &Config) -> Result<()> {
    let store = LabelStore::load(&config.labels_path());
    for (key, label) in store.iter() {
        println!("{:<5}  {}", label, key);
    }
    println!("{} labelled", store.len());
    Ok(())
}
