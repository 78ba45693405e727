//! Small PNG thumbnails for progress events.

use image::{imageops::FilterType, ImageFormat};
use std::io::Cursor;

/// Decode `bytes` and re-encode as a `size`×`size` PNG.
///
/// Returns `None` for anything that does not decode; a missing thumbnail
/// never affects an item's outcome.
pub fn make_thumbnail(bytes: &[u8], size: u32) -> Option<Vec<u8>> {
    if size == 0 {
        return None;
    }
    let decoded = match image::load_from_memory(bytes) {
        Ok(decoded) => decoded,
        Err(e) => {
            log::debug!("Thumbnail decode failed: {}", e);
            return None;
        }
    };
    let resized = decoded.resize_exact(size, size, FilterType::Lanczos3);

    let mut cursor = Cursor::new(Vec::new());
    resized.write_to(&mut cursor, ImageFormat::Png).ok()?;
    Some(cursor.into_inner())
}
