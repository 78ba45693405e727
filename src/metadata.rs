//! Tag-container access backed by `lofty`.
//!
//! Three narrow seams sit here so the pipeline never depends on a concrete
//! tagging library:
//! - [`MetadataEmbedder`] writes a clip's descriptive metadata into a file.
//! - [`IdentityReader`] reads back the clip identity (`TXXX:SUNO_UUID`).
//! - [`SongParser`] reads what the library view shows for a file.
//!
//! [`Id3TagStore`] implements all three with ID3v2 tags.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use lofty::config::{ParseOptions, WriteOptions};
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::id3::v2::Id3v2Tag;
use lofty::mpeg::MpegFile;
use lofty::picture::{Picture, PictureType};
use lofty::prelude::Accessor;
use lofty::tag::{ItemKey, Tag, TagExt, TagType};
use std::fs::File;
use std::path::Path;

use crate::models::SongMetadata;

/// Descriptor of the user-text frame that holds the clip identity.
pub const IDENTITY_DESCRIPTOR: &str = "SUNO_UUID";

/// Everything written into an archived file's tag container.
#[derive(Debug, Clone, Default)]
pub struct EmbedRequest {
    pub title: String,
    pub artist: Option<String>,
    pub genre: Option<String>,
    pub year: Option<String>,
    pub comment: Option<String>,
    pub lyrics: Option<String>,
    pub identity: String,
    /// Raw image bytes for the front cover.
    pub cover: Option<Vec<u8>>,
}

pub trait MetadataEmbedder: Send + Sync {
    /// Write `request` into the file, replacing any prior cover and lyrics.
    fn embed(&self, path: &Path, request: &EmbedRequest) -> Result<()>;

    /// Replace only the lyrics frame.
    fn write_lyrics(&self, path: &Path, lyrics: &str) -> Result<()>;
}

pub trait IdentityReader: Send + Sync {
    /// The clip identity stored in the file, if any. Unreadable files and
    /// files without the frame yield `None`.
    fn read_identity(&self, path: &Path) -> Option<String>;
}

pub trait SongParser: Send + Sync {
    fn parse_song(&self, path: &Path) -> SongMetadata;
}

/// ID3v2 implementation of the tag seams.
#[derive(Debug, Clone, Copy, Default)]
pub struct Id3TagStore;

impl MetadataEmbedder for Id3TagStore {
    fn embed(&self, path: &Path, request: &EmbedRequest) -> Result<()> {
        let mut tag = existing_generic_tag(path)?;

        tag.set_title(request.title.clone());
        if let Some(artist) = &request.artist {
            tag.set_artist(artist.clone());
        }
        if let Some(genre) = &request.genre {
            tag.set_genre(genre.clone());
        }
        if let Some(year) = &request.year {
            tag.insert_text(ItemKey::RecordingDate, year.clone());
        }
        if let Some(comment) = &request.comment {
            tag.set_comment(comment.clone());
        }
        if let Some(lyrics) = &request.lyrics {
            tag.remove_key(&ItemKey::Lyrics);
            tag.insert_text(ItemKey::Lyrics, lyrics.clone());
        }
        if let Some(bytes) = &request.cover {
            match Picture::from_reader(&mut bytes.as_slice()) {
                Ok(mut picture) => {
                    picture.set_pic_type(PictureType::CoverFront);
                    tag.remove_picture_type(PictureType::CoverFront);
                    tag.push_picture(picture);
                }
                Err(e) => log::debug!("Ignoring unreadable cover for {}: {}", path.display(), e),
            }
        }

        let mut id3 = Id3v2Tag::from(tag);
        id3.insert_user_text(IDENTITY_DESCRIPTOR.to_string(), request.identity.clone());
        id3.save_to_path(path, WriteOptions::default())
            .with_context(|| format!("Failed to write tags to {}", path.display()))?;
        Ok(())
    }

    fn write_lyrics(&self, path: &Path, lyrics: &str) -> Result<()> {
        let mut id3 = read_id3v2(path)?.unwrap_or_default();
        let identity = id3.get_user_text(IDENTITY_DESCRIPTOR).map(str::to_string);

        let mut tag: Tag = id3.into();
        tag.remove_key(&ItemKey::Lyrics);
        if !lyrics.trim().is_empty() {
            tag.insert_text(ItemKey::Lyrics, lyrics.to_string());
        }

        id3 = Id3v2Tag::from(tag);
        if let Some(identity) = identity {
            id3.insert_user_text(IDENTITY_DESCRIPTOR.to_string(), identity);
        }
        id3.save_to_path(path, WriteOptions::default())
            .with_context(|| format!("Failed to write lyrics to {}", path.display()))?;
        Ok(())
    }
}

impl IdentityReader for Id3TagStore {
    fn read_identity(&self, path: &Path) -> Option<String> {
        match read_id3v2(path) {
            Ok(Some(tag)) => tag
                .get_user_text(IDENTITY_DESCRIPTOR)
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty()),
            Ok(None) => None,
            Err(e) => {
                log::debug!("No identity in {}: {:#}", path.display(), e);
                None
            }
        }
    }
}

impl SongParser for Id3TagStore {
    fn parse_song(&self, path: &Path) -> SongMetadata {
        let fs_meta = std::fs::metadata(path).ok();
        let file_size = fs_meta.as_ref().map(|m| m.len()).unwrap_or(0);
        let mtime_date = fs_meta
            .and_then(|m| m.modified().ok())
            .map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let fallback_title = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut song = SongMetadata {
            path: path.to_path_buf(),
            title: fallback_title,
            artist: "Unknown".to_string(),
            duration_secs: 0,
            date: mtime_date,
            file_size,
            lyrics: None,
            identity: None,
        };

        let tagged = match lofty::read_from_path(path) {
            Ok(tagged) => tagged,
            Err(e) => {
                log::debug!("Could not read tags from {}: {}", path.display(), e);
                return song;
            }
        };

        song.duration_secs = tagged.properties().duration().as_secs();

        if let Some(tag) = tagged.primary_tag().or_else(|| tagged.first_tag()) {
            if let Some(title) = tag.title().filter(|t| !t.trim().is_empty()) {
                song.title = title.trim().to_string();
            }
            if let Some(artist) = tag.artist().filter(|a| !a.trim().is_empty()) {
                song.artist = artist.trim().to_string();
            }
            if let Some(date) = tag
                .get_string(&ItemKey::RecordingDate)
                .or_else(|| tag.get_string(&ItemKey::Year))
                .filter(|d| !d.trim().is_empty())
            {
                song.date = date.trim().to_string();
            }
            song.lyrics = tag
                .get_string(&ItemKey::Lyrics)
                .filter(|l| !l.trim().is_empty())
                .map(str::to_string);
        }

        if tagged.file_type() == lofty::file::FileType::Mpeg {
            song.identity = self.read_identity(path);
        }
        song
    }
}

fn read_id3v2(path: &Path) -> Result<Option<Id3v2Tag>> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mpeg = MpegFile::read_from(&mut file, ParseOptions::new().read_properties(false))
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(mpeg.id3v2().cloned())
}

fn existing_generic_tag(path: &Path) -> Result<Tag> {
    Ok(match read_id3v2(path)? {
        Some(id3) => id3.into(),
        None => Tag::new(TagType::Id3v2),
    })
}

/// Build the tag request for a downloaded clip.
pub fn embed_request_for(
    clip: &crate::models::ClipRecord,
    cover: Option<Vec<u8>>,
) -> EmbedRequest {
    EmbedRequest {
        title: clip.display_title().to_string(),
        artist: clip.display_name.clone(),
        genre: clip.metadata.tags.clone(),
        year: clip.year().map(str::to_string),
        comment: clip.metadata.prompt.clone(),
        lyrics: clip.metadata.lyrics.clone(),
        identity: clip.id.clone(),
        cover,
    }
}
