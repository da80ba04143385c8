//! Built-in decoders backed by the `image` crate
//!
//! BMP, GIF and PNG dispatch straight to the in-process decoder library;
//! JPEG additionally runs the APP-segment scanner to surface Exif, ICC and
//! orientation; TIFF and a generic fallback are tried in order when no
//! magic matches. Every decoder guards dimensions before allocating.

use crate::{check_dimensions, jpeg, CodecError, ImageCodec};
use image::{AnimationDecoder, ImageFormat, ImageReader};
use raster::{ImageDocument, Raster};
use std::io::Cursor;
use tracing::warn;

/// The built-in decoder set in dispatch order.
pub fn builtin() -> Vec<Box<dyn ImageCodec>> {
    vec![
        Box::new(BmpCodec),
        Box::new(GifCodec),
        Box::new(PngCodec),
        Box::new(JpegCodec),
        Box::new(WebpCodec),
        Box::new(TiffCodec),
        Box::new(FallbackCodec),
    ]
}

fn decode_error(hint: Option<&str>, err: impl std::fmt::Display) -> CodecError {
    CodecError::DecodeFailure(format!("{}: {err}", hint.unwrap_or("<memory>")))
}

/// Decode a still image of a known format into a single-raster document.
fn decode_still(
    bytes: &[u8],
    format: ImageFormat,
    hint: Option<&str>,
) -> Result<ImageDocument, CodecError> {
    let mut reader = ImageReader::new(Cursor::new(bytes));
    reader.set_format(format);
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| decode_error(hint, e))?;
    check_dimensions(width, height)?;

    let img = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| decode_error(hint, e))?;
    Ok(ImageDocument::single(Raster::from_rgba_image(img.to_rgba8())))
}

pub struct BmpCodec;

impl ImageCodec for BmpCodec {
    fn name(&self) -> &'static str {
        "bmp"
    }

    fn mimetype(&self) -> &'static str {
        "image/bmp"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["bmp"]
    }

    fn sniff(&self, bytes: &[u8]) -> bool {
        bytes.starts_with(b"BM")
    }

    fn decode(&self, bytes: &[u8], hint: Option<&str>) -> Result<ImageDocument, CodecError> {
        decode_still(bytes, ImageFormat::Bmp, hint)
    }
}

pub struct GifCodec;

impl ImageCodec for GifCodec {
    fn name(&self) -> &'static str {
        "gif"
    }

    fn mimetype(&self) -> &'static str {
        "image/gif"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["gif"]
    }

    fn sniff(&self, bytes: &[u8]) -> bool {
        bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a")
    }

    /// Decodes every frame so animations keep their ring structure; the
    /// producer only consumes the primary frame.
    fn decode(&self, bytes: &[u8], hint: Option<&str>) -> Result<ImageDocument, CodecError> {
        let decoder = image::codecs::gif::GifDecoder::new(Cursor::new(bytes))
            .map_err(|e| decode_error(hint, e))?;
        let frames = decoder
            .into_frames()
            .collect_frames()
            .map_err(|e| decode_error(hint, e))?;
        if frames.is_empty() {
            return Err(decode_error(hint, "gif contains no frames"));
        }
        let (w, h) = frames[0].buffer().dimensions();
        check_dimensions(w, h)?;

        let mut doc = ImageDocument::new();
        doc.push_page(
            frames
                .into_iter()
                .map(|f| Raster::from_rgba_image(f.into_buffer())),
        );
        Ok(doc)
    }
}

pub struct PngCodec;

impl ImageCodec for PngCodec {
    fn name(&self) -> &'static str {
        "png"
    }

    fn mimetype(&self) -> &'static str {
        "image/png"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["png"]
    }

    fn sniff(&self, bytes: &[u8]) -> bool {
        bytes.starts_with(b"\x89PNG\r\n\x1a\n")
    }

    fn decode(&self, bytes: &[u8], hint: Option<&str>) -> Result<ImageDocument, CodecError> {
        decode_still(bytes, ImageFormat::Png, hint)
    }
}

pub struct JpegCodec;

impl ImageCodec for JpegCodec {
    fn name(&self) -> &'static str {
        "jpeg"
    }

    fn mimetype(&self) -> &'static str {
        "image/jpeg"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["jpg", "jpeg", "jpe"]
    }

    fn sniff(&self, bytes: &[u8]) -> bool {
        bytes.starts_with(&[0xff, 0xd8, 0xff])
    }

    fn decode(&self, bytes: &[u8], hint: Option<&str>) -> Result<ImageDocument, CodecError> {
        let mut doc = decode_still(bytes, ImageFormat::Jpeg, hint)?;

        // Metadata failures never fail the decode.
        match jpeg::scan_app_segments(bytes) {
            Ok(meta) => {
                if let Some(raster) = doc.primary().and_then(|id| doc.raster_mut(id)) {
                    raster.meta.orientation = meta.orientation;
                    raster.meta.exif = meta.exif;
                    raster.meta.icc_profile = meta.icc_profile;
                }
            }
            Err(err) => {
                warn!(source = hint.unwrap_or("<memory>"), %err, "jpeg metadata scan failed");
            }
        }
        Ok(doc)
    }
}

pub struct WebpCodec;

impl ImageCodec for WebpCodec {
    fn name(&self) -> &'static str {
        "webp"
    }

    fn mimetype(&self) -> &'static str {
        "image/webp"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["webp"]
    }

    fn sniff(&self, bytes: &[u8]) -> bool {
        bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP"
    }

    fn decode(&self, bytes: &[u8], hint: Option<&str>) -> Result<ImageDocument, CodecError> {
        decode_still(bytes, ImageFormat::WebP, hint)
    }
}

pub struct TiffCodec;

impl ImageCodec for TiffCodec {
    fn name(&self) -> &'static str {
        "tiff"
    }

    fn mimetype(&self) -> &'static str {
        "image/tiff"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["tif", "tiff"]
    }

    fn sniff(&self, bytes: &[u8]) -> bool {
        bytes.starts_with(b"II\x2a\x00") || bytes.starts_with(b"MM\x00\x2a")
    }

    fn fallback(&self) -> bool {
        true
    }

    fn decode(&self, bytes: &[u8], hint: Option<&str>) -> Result<ImageDocument, CodecError> {
        // First directory only; remaining pages are irrelevant for previews.
        decode_still(bytes, ImageFormat::Tiff, hint)
    }
}

/// Last-resort decoder: lets the image library guess the format, covering
/// containers without a registered sniffer.
pub struct FallbackCodec;

impl ImageCodec for FallbackCodec {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn mimetype(&self) -> &'static str {
        "application/octet-stream"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["ico", "pnm", "pbm", "pgm", "ppm", "qoi"]
    }

    fn sniff(&self, _bytes: &[u8]) -> bool {
        false
    }

    fn fallback(&self) -> bool {
        true
    }

    fn decode(&self, bytes: &[u8], hint: Option<&str>) -> Result<ImageDocument, CodecError> {
        let format = image::guess_format(bytes)
            .map_err(|_| CodecError::UnsupportedType(hint.unwrap_or("<memory>").to_string()))?;
        let mut doc = decode_still(bytes, format, hint)?;
        if let Some(raster) = doc.primary().and_then(|id| doc.raster_mut(id)) {
            raster.meta.mimetype = Some(format.to_mime_type().to_string());
        }
        Ok(doc)
    }
}
