//! Codec gateway for Glance
//!
//! Dispatches raw image bytes to a concrete decoder based on a magic-number
//! guess, returning an `ImageDocument` (arena of rasters with frame/page
//! structure) plus whatever metadata the container carried: Exif bytes, ICC
//! profile bytes and an orientation code, all attached to the primary
//! raster's metadata.
//!
//! Decoders are registered at startup and iterated magic-match first; when
//! no magic matches, fallback decoders are tried in registration order.
//! Unknown formats cleanly fall through to `UnsupportedType`.

pub mod decoders;
pub mod jpeg;

use raster::ImageDocument;
use thiserror::Error;
use tracing::debug;

/// Error surface of the gateway: exactly one variant per failure class.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported image type: {0}")]
    UnsupportedType(String),
    #[error("decode failed: {0}")]
    DecodeFailure(String),
    #[error("image dimensions overflow: {0}")]
    SizeOverflow(String),
}

/// A concrete decoder: sniffs magic bytes and produces a document.
pub trait ImageCodec: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// MIME type of the format this decoder handles.
    fn mimetype(&self) -> &'static str;

    /// Filename extensions (lowercase, without dot) for model filtering.
    fn extensions(&self) -> &'static [&'static str];

    /// Whether the leading bytes look like this decoder's format.
    fn sniff(&self, bytes: &[u8]) -> bool;

    /// Whether this decoder should be tried when no magic matched.
    fn fallback(&self) -> bool {
        false
    }

    /// Decode the full byte slice. `hint` is the source URI, used only in
    /// error messages and diagnostics.
    fn decode(&self, bytes: &[u8], hint: Option<&str>) -> Result<ImageDocument, CodecError>;
}

/// Registry of decoders, dispatched magic-match first.
pub struct CodecGateway {
    codecs: Vec<Box<dyn ImageCodec>>,
}

impl CodecGateway {
    /// Empty gateway; callers register decoders explicitly.
    pub fn empty() -> Self {
        Self { codecs: Vec::new() }
    }

    /// Gateway with the built-in decoder set in dispatch order.
    pub fn with_builtin() -> Self {
        let mut gateway = Self::empty();
        for codec in decoders::builtin() {
            gateway.register(codec);
        }
        gateway
    }

    pub fn register(&mut self, codec: Box<dyn ImageCodec>) {
        self.codecs.push(codec);
    }

    /// Decode a byte slice into a document. The first decoder whose magic
    /// matches owns the input; its errors propagate. Without a magic match,
    /// fallback decoders are tried in order and the last failure is
    /// reported if none succeeds.
    pub fn decode(&self, bytes: &[u8], hint: Option<&str>) -> Result<ImageDocument, CodecError> {
        let name = hint.unwrap_or("<memory>");
        if bytes.is_empty() {
            return Err(CodecError::DecodeFailure(format!("{name}: empty input")));
        }

        if let Some(codec) = self.codecs.iter().find(|c| c.sniff(bytes)) {
            debug!(codec = codec.name(), source = name, "magic match");
            let mut doc = codec.decode(bytes, hint)?;
            attach_mimetype(&mut doc, codec.mimetype());
            return Ok(doc);
        }

        let mut last_failure: Option<CodecError> = None;
        for codec in self.codecs.iter().filter(|c| c.fallback()) {
            match codec.decode(bytes, hint) {
                Ok(mut doc) => {
                    debug!(codec = codec.name(), source = name, "fallback decode");
                    attach_mimetype(&mut doc, codec.mimetype());
                    return Ok(doc);
                }
                Err(err) => {
                    debug!(codec = codec.name(), source = name, %err, "fallback refused input");
                    last_failure = Some(err);
                }
            }
        }

        Err(match last_failure {
            Some(CodecError::SizeOverflow(msg)) => CodecError::SizeOverflow(msg),
            _ => CodecError::UnsupportedType(format!("{name}: no decoder accepted the input")),
        })
    }

    /// MIME type guessed from magic bytes without decoding.
    pub fn guess_mimetype(&self, bytes: &[u8]) -> Option<&'static str> {
        self.codecs.iter().find(|c| c.sniff(bytes)).map(|c| c.mimetype())
    }

    /// The union of extensions every registered decoder claims, lowercase,
    /// for the filesystem model's filter set.
    pub fn supported_extensions(&self) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = self
            .codecs
            .iter()
            .flat_map(|c| c.extensions().iter().copied())
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}

/// Reject dimensions the platform cannot represent before any allocation.
pub fn check_dimensions(width: u32, height: u32) -> Result<(), CodecError> {
    let max = i32::MAX as u64;
    if width as u64 > max || height as u64 > max || (width as u64) * (height as u64) * 4 > max {
        return Err(CodecError::SizeOverflow(format!("{width}x{height}")));
    }
    Ok(())
}

fn attach_mimetype(doc: &mut ImageDocument, mimetype: &'static str) {
    if let Some(id) = doc.primary() {
        if let Some(raster) = doc.raster_mut(id) {
            if raster.meta.mimetype.is_none() {
                raster.meta.mimetype = Some(mimetype.to_string());
            }
        }
    }
}
