//! Core data models used throughout SunoSync.
//!
//! These types represent the catalog clips, archived files, and parsed song
//! metadata that flow through the harvest and library pipelines.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One remote catalog entry, validated at the API-response boundary.
///
/// Optional fields stay `None` when the server omits them or sends an empty
/// string; nothing is silently defaulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipRecord {
    pub id: String,
    pub title: Option<String>,
    pub display_name: Option<String>,
    pub audio_url: Option<String>,
    pub image_url: Option<String>,
    pub created_at: Option<String>,
    pub metadata: ClipMetadata,
}

/// Generation details attached to a clip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClipMetadata {
    pub prompt: Option<String>,
    pub tags: Option<String>,
    /// Lyrics, taken from `lyrics` or, failing that, `text`.
    pub lyrics: Option<String>,
}

impl ClipRecord {
    /// Title used for filenames and progress lines. Falls back to the identity.
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }

    /// Year derived from the first four characters of `created_at`.
    pub fn year(&self) -> Option<&str> {
        self.created_at
            .as_deref()
            .and_then(|created| created.get(..4))
    }

    /// `YYYY-MM` folder name derived from `created_at`.
    pub fn month_folder(&self) -> Option<&str> {
        self.created_at
            .as_deref()
            .and_then(|created| created.get(..7))
    }
}

/// The on-disk result of a successful download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub identity: String,
    pub has_cover: bool,
    pub lyrics_sidecar: Option<PathBuf>,
}

/// Metadata parsed from an archived audio file for the browsing view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongMetadata {
    pub path: PathBuf,
    pub title: String,
    pub artist: String,
    pub duration_secs: u64,
    /// `YYYY-MM-DD` (or whatever the tag holds), falling back to the file's mtime.
    pub date: String,
    pub file_size: u64,
    #[serde(default)]
    pub lyrics: Option<String>,
    #[serde(default)]
    pub identity: Option<String>,
}
