//! Archive layout: filenames, month folders, collision suffixes, sidecars.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::models::ClipRecord;

pub const AUDIO_EXTENSION: &str = "mp3";
pub const LYRICS_EXTENSION: &str = "txt";
/// Stem budget in UTF-8 bytes. Leaves room for `" v99.mp3.part"` under the
/// usual 255-byte filename limit.
pub const MAX_STEM_BYTES: usize = 200;

/// Extensions the library view lists.
pub const LIBRARY_EXTENSIONS: [&str; 2] = ["mp3", "wav"];

/// Files the dedup index reads identities from.
pub fn is_archive_audio(path: &Path) -> bool {
    has_extension(path, &[AUDIO_EXTENSION])
}

pub fn is_library_audio(path: &Path) -> bool {
    has_extension(path, &LIBRARY_EXTENSIONS)
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Replace characters that are unsafe in filenames, trim leading/trailing
/// spaces and dots, and cap the length at `max_bytes` of UTF-8, cutting on a
/// char boundary.
pub fn sanitize_filename(name: &str, max_bytes: usize) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = replaced.trim_matches(|c| c == ' ' || c == '.');
    let mut end = trimmed.len().min(max_bytes);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    let capped = trimmed[..end].trim_end_matches(|c| c == ' ' || c == '.');
    if capped.is_empty() {
        "untitled".to_string()
    } else {
        capped.to_string()
    }
}

/// Directory a clip is archived into.
pub fn target_dir(root: &Path, clip: &ClipRecord, organize_by_month: bool) -> PathBuf {
    match clip.month_folder() {
        Some(month) if organize_by_month => root.join(sanitize_filename(month, 7)),
        _ => root.to_path_buf(),
    }
}

/// Preferred path before collision handling.
pub fn preferred_path(dir: &Path, clip: &ClipRecord) -> PathBuf {
    let stem = sanitize_filename(clip.display_title(), MAX_STEM_BYTES);
    dir.join(format!("{}.{}", stem, AUDIO_EXTENSION))
}

/// `"Song.mp3"` → `"Song v3.mp3"` for `n = 3`.
pub fn versioned_path(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{} v{}.{}", stem, n, ext.to_string_lossy()),
        None => format!("{} v{}", stem, n),
    };
    path.with_file_name(name)
}

/// Temporary download location next to the final path.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

pub fn lyrics_sidecar_path(audio: &Path) -> PathBuf {
    audio.with_extension(LYRICS_EXTENSION)
}

/// Destination paths handed out during one run.
///
/// Two workers whose titles sanitize to the same name must not both pick
/// `Song.mp3`; a claim is atomic over "not on disk and not claimed".
#[derive(Debug, Default)]
pub struct PathClaims {
    claimed: Mutex<HashSet<PathBuf>>,
}

impl PathClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `preferred`, or the first free `" v{n}"` variant (n ≥ 2).
    pub fn claim(&self, preferred: &Path) -> PathBuf {
        let mut claimed = self.lock();
        let mut candidate = preferred.to_path_buf();
        let mut n = 2;
        while candidate.exists() || partial_path(&candidate).exists() || claimed.contains(&candidate) {
            candidate = versioned_path(preferred, n);
            n += 1;
        }
        claimed.insert(candidate.clone());
        candidate
    }

    /// Give a path back after a failed or cancelled transfer.
    pub fn release(&self, path: &Path) {
        self.lock().remove(path);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.claimed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
