//! On-disk thumbnail formats
//!
//! The extended format is a WebP container holding one losslessly encoded
//! image chunk plus a custom `THUM` chunk whose payload is a sequence of
//! NUL-terminated key/value pairs. The interoperable fallback is a PNG
//! whose `tEXt`/`iTXt` chunks carry the same keys.
//!
//! Readers tolerate unknown chunks, unknown keys and trailing bytes;
//! writers install through a temporary file in the target directory and
//! retry once after creating a missing directory.

use crate::{create_dir_0755, set_file_0600, CacheError};
use image::codecs::webp::WebPEncoder;
use image::ExtendedColorType;
use raster::Raster;
use std::io::Write;
use std::path::Path;
use tracing::debug;

pub const KEY_URI: &str = "Thumb::URI";
pub const KEY_MTIME: &str = "Thumb::MTime";
pub const KEY_SIZE: &str = "Thumb::Size";
pub const KEY_WIDTH: &str = "Thumb::Image::Width";
pub const KEY_HEIGHT: &str = "Thumb::Image::Height";
pub const KEY_COLORSPACE: &str = "Thumb::ColorSpace";
pub const KEY_MIMETYPE: &str = "Thumb::Mimetype";

pub const COLORSPACE_SRGB: &str = "sRGB";

const THUM_FOURCC: &[u8; 4] = b"THUM";

/// Ordered key/value metadata embedded in a cached thumbnail.
///
/// Order and unknown keys are preserved so foreign metadata survives a
/// read/write cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThumbMetadata {
    pairs: Vec<(String, String)>,
}

impl ThumbMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Set a key, replacing an existing value in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(pair) = self.pairs.iter_mut().find(|(k, _)| *k == key) {
            pair.1 = value;
        } else {
            self.pairs.push((key, value));
        }
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn uri(&self) -> Option<&str> {
        self.get(KEY_URI)
    }

    pub fn mtime(&self) -> Option<i64> {
        self.get(KEY_MTIME)?.parse().ok()
    }

    pub fn size(&self) -> Option<u64> {
        self.get(KEY_SIZE)?.parse().ok()
    }

    pub fn image_dimensions(&self) -> Option<(u32, u32)> {
        let w = self.get(KEY_WIDTH)?.parse().ok()?;
        let h = self.get(KEY_HEIGHT)?.parse().ok()?;
        Some((w, h))
    }

    pub fn mimetype(&self) -> Option<&str> {
        self.get(KEY_MIMETYPE)
    }

    /// Whether the pixels are declared color-managed to sRGB. Anything
    /// else (including an absent key) marks the entry low quality.
    pub fn is_srgb(&self) -> bool {
        self.get(KEY_COLORSPACE) == Some(COLORSPACE_SRGB)
    }

    /// Serialize to the THUM payload: `<key>\0<value>\0...`. Keys and
    /// values must not contain NUL.
    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        let mut out = Vec::new();
        for (key, value) in &self.pairs {
            if key.as_bytes().contains(&0) || value.as_bytes().contains(&0) {
                return Err(CacheError::IntegrityFailure(format!(
                    "metadata key/value contains NUL: {key}"
                )));
            }
            out.extend_from_slice(key.as_bytes());
            out.push(0);
            out.extend_from_slice(value.as_bytes());
            out.push(0);
        }
        Ok(out)
    }

    /// Parse a THUM payload. Tolerant by design: an unterminated trailing
    /// token (unknown garbage) is ignored, as is a dangling key.
    pub fn decode(payload: &[u8]) -> Self {
        let mut pairs = Vec::new();
        let mut tokens = payload.split(|b| *b == 0);
        loop {
            let (Some(key), Some(value)) = (tokens.next(), tokens.next()) else {
                break;
            };
            // The payload ends with a terminator, so the final split
            // yields one empty token; a non-empty unpaired key is garbage
            // either way.
            if key.is_empty() {
                continue;
            }
            let (Ok(key), Ok(value)) = (
                std::str::from_utf8(key),
                std::str::from_utf8(value),
            ) else {
                continue;
            };
            pairs.push((key.to_string(), value.to_string()));
        }
        Self { pairs }
    }
}

/// Encode a raster and its metadata into the extended wide format:
/// a lossless WebP with an appended `THUM` chunk.
pub fn encode_wide(raster: &Raster, meta: &ThumbMetadata) -> Result<Vec<u8>, CacheError> {
    let img = raster.to_rgba_image();
    let (width, height) = img.dimensions();

    let mut webp = Vec::new();
    WebPEncoder::new_lossless(&mut webp)
        .encode(img.as_raw(), width, height, ExtendedColorType::Rgba8)
        .map_err(|e| CacheError::DecodeFailure(format!("webp encode: {e}")))?;

    append_thum_chunk(webp, &meta.encode()?)
}

/// Read just the metadata from extended-format bytes.
pub fn read_wide_metadata(bytes: &[u8]) -> Result<ThumbMetadata, CacheError> {
    let payload = find_thum_chunk(bytes)?
        .ok_or_else(|| CacheError::IntegrityFailure("missing THUM chunk".to_string()))?;
    Ok(ThumbMetadata::decode(payload))
}

/// Decode extended-format bytes into the raster plus its metadata.
pub fn decode_wide(bytes: &[u8]) -> Result<(Raster, ThumbMetadata), CacheError> {
    let meta = read_wide_metadata(bytes)?;
    // Hand the decoder a container without our private chunk.
    let clean = strip_thum_chunk(bytes)?;
    let img = image::load_from_memory_with_format(&clean, image::ImageFormat::WebP)
        .map_err(|e| CacheError::DecodeFailure(format!("webp decode: {e}")))?;
    Ok((Raster::from_rgba_image(img.to_rgba8()), meta))
}

/// Decode an interoperable PNG thumbnail: pixels via the image library,
/// metadata from its `tEXt` (Latin-1) and `iTXt` (UTF-8) chunks.
pub fn decode_interop(bytes: &[u8]) -> Result<(Raster, ThumbMetadata), CacheError> {
    let decoder = png::Decoder::new(std::io::Cursor::new(bytes));
    let reader = decoder
        .read_info()
        .map_err(|e| CacheError::DecodeFailure(format!("png info: {e}")))?;
    let info = reader.info();

    let mut meta = ThumbMetadata::new();
    for chunk in &info.uncompressed_latin1_text {
        meta.set(chunk.keyword.clone(), chunk.text.clone());
    }
    for chunk in &info.utf8_text {
        match chunk.get_text() {
            Ok(text) => meta.set(chunk.keyword.clone(), text),
            Err(e) => debug!(keyword = %chunk.keyword, %e, "undecodable iTXt chunk skipped"),
        }
    }

    let img = image::load_from_memory_with_format(bytes, image::ImageFormat::Png)
        .map_err(|e| CacheError::DecodeFailure(format!("png decode: {e}")))?;
    Ok((Raster::from_rgba_image(img.to_rgba8()), meta))
}

/// Install encoded bytes at the target path: write to a temporary file in
/// the same directory, restrict to 0600, then move into place. A missing
/// directory is created (0755) and the write retried once.
pub fn install(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    match write_via_temp(path, bytes) {
        Err(CacheError::IoFailure(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            let dir = parent_dir(path)?;
            create_dir_0755(dir)?;
            write_via_temp(path, bytes)
        }
        other => other,
    }
}

fn parent_dir(path: &Path) -> Result<&Path, CacheError> {
    path.parent().ok_or_else(|| {
        CacheError::Unsupported(format!("no containing directory: {}", path.display()))
    })
}

fn write_via_temp(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let dir = parent_dir(path)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    set_file_0600(tmp.path())?;
    tmp.persist(path).map_err(|e| CacheError::IoFailure(e.error))?;
    Ok(())
}

// -- RIFF container plumbing --

fn check_riff_header(bytes: &[u8]) -> Result<(), CacheError> {
    if bytes.len() < 12 || &bytes[..4] != b"RIFF" || &bytes[8..12] != b"WEBP" {
        return Err(CacheError::IntegrityFailure("not a WebP container".to_string()));
    }
    Ok(())
}

/// Iterate chunks as `(fourcc, payload_range)` pairs. Stops silently at
/// truncated trailing data; readers must tolerate foreign garbage.
fn chunks(bytes: &[u8]) -> impl Iterator<Item = ([u8; 4], std::ops::Range<usize>)> + '_ {
    let mut pos = 12;
    std::iter::from_fn(move || {
        if pos + 8 > bytes.len() {
            return None;
        }
        let fourcc = [bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]];
        let size =
            u32::from_le_bytes([bytes[pos + 4], bytes[pos + 5], bytes[pos + 6], bytes[pos + 7]])
                as usize;
        let start = pos + 8;
        let end = start.checked_add(size)?;
        if end > bytes.len() {
            return None;
        }
        pos = end + (size & 1); // chunks are even-padded
        Some((fourcc, start..end))
    })
}

fn find_thum_chunk(bytes: &[u8]) -> Result<Option<&[u8]>, CacheError> {
    check_riff_header(bytes)?;
    Ok(chunks(bytes)
        .find(|(fourcc, _)| fourcc == THUM_FOURCC)
        .map(|(_, range)| &bytes[range]))
}

/// Append a `THUM` chunk (even-padded) and patch the RIFF size.
fn append_thum_chunk(mut webp: Vec<u8>, payload: &[u8]) -> Result<Vec<u8>, CacheError> {
    check_riff_header(&webp)?;
    if payload.len() > u32::MAX as usize {
        return Err(CacheError::IntegrityFailure("THUM payload too large".to_string()));
    }
    webp.extend_from_slice(THUM_FOURCC);
    webp.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    webp.extend_from_slice(payload);
    if payload.len() % 2 == 1 {
        webp.push(0);
    }
    patch_riff_size(&mut webp);
    Ok(webp)
}

/// Rebuild the container without any `THUM` chunk.
fn strip_thum_chunk(bytes: &[u8]) -> Result<Vec<u8>, CacheError> {
    check_riff_header(bytes)?;
    let mut out = bytes[..12].to_vec();
    for (fourcc, range) in chunks(bytes) {
        if &fourcc == THUM_FOURCC {
            continue;
        }
        out.extend_from_slice(&fourcc);
        out.extend_from_slice(&(range.len() as u32).to_le_bytes());
        out.extend_from_slice(&bytes[range.clone()]);
        if range.len() % 2 == 1 {
            out.push(0);
        }
    }
    patch_riff_size(&mut out);
    Ok(out)
}

fn patch_riff_size(bytes: &mut [u8]) {
    let size = (bytes.len() - 8) as u32;
    bytes[4..8].copy_from_slice(&size.to_le_bytes());
}
