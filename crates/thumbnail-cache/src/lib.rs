//! Persistent thumbnail cache for Glance
//!
//! This crate implements the freedesktop-style on-disk thumbnail store and
//! everything that feeds it: MD5-keyed addressing under
//! `${XDG_CACHE_HOME:-$HOME/.cache}/thumbnails`, the wide WebP format with
//! its embedded `THUM` metadata chunk, the interoperable PNG fallback,
//! multi-resolution lookup with quality downgrade flags, the producer that
//! renders and installs every size, the invalidator that sweeps stale
//! entries, and the production scheduler that drives bulk work with a
//! rayon pool plus one out-of-process child at a time.
//!
//! # Layout
//!
//! - Extended entries: `<cache>/thumbnails/wide-<tag>/<md5(uri)>.webp`
//! - Interop entries (read-only): `<cache>/thumbnails/<tag>/<md5(uri)>.png`
//!
//! A cached entry is valid iff its embedded `Thumb::URI` equals the
//! requesting URI and its embedded `Thumb::MTime` equals the source's
//! current modification time.

pub mod format;
pub mod invalidate;
pub mod lookup;
pub mod produce;
pub mod scheduler;

pub use format::ThumbMetadata;
pub use invalidate::{invalidate, InvalidateStats};
pub use lookup::lookup;
pub use produce::{produce, render_preview};
pub use scheduler::{ProductionScheduler, SourceEntry, ThumbnailEvent};

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use url::Url;

/// Nominal thumbnail sizes, ordered smallest to largest.
///
/// Each size owns a freedesktop directory tag; the project-extended wide
/// format prefixes the tag with `wide-`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ThumbnailSize {
    /// 128px row height, directory `normal`.
    Small,
    /// 256px row height, directory `large`.
    Normal,
    /// 512px row height, directory `x-large`.
    Large,
    /// 1024px row height, directory `xx-large`.
    Huge,
}

impl ThumbnailSize {
    pub const ALL: [ThumbnailSize; 4] = [
        ThumbnailSize::Small,
        ThumbnailSize::Normal,
        ThumbnailSize::Large,
        ThumbnailSize::Huge,
    ];
    pub const COUNT: usize = 4;
    pub const MIN: ThumbnailSize = ThumbnailSize::Small;
    pub const MAX: ThumbnailSize = ThumbnailSize::Huge;

    /// Nominal row height in pixels.
    pub fn pixels(self) -> u32 {
        match self {
            ThumbnailSize::Small => 128,
            ThumbnailSize::Normal => 256,
            ThumbnailSize::Large => 512,
            ThumbnailSize::Huge => 1024,
        }
    }

    /// Interoperable directory tag.
    pub fn tag(self) -> &'static str {
        match self {
            ThumbnailSize::Small => "normal",
            ThumbnailSize::Normal => "large",
            ThumbnailSize::Large => "x-large",
            ThumbnailSize::Huge => "xx-large",
        }
    }

    /// Directory name of the extended wide format.
    pub fn wide_dir_name(self) -> String {
        format!("wide-{}", self.tag())
    }

    pub fn index(self) -> usize {
        match self {
            ThumbnailSize::Small => 0,
            ThumbnailSize::Normal => 1,
            ThumbnailSize::Large => 2,
            ThumbnailSize::Huge => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.tag() == tag)
    }
}

impl fmt::Display for ThumbnailSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for ThumbnailSize {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_tag(s).ok_or_else(|| {
            CacheError::Unsupported(format!(
                "invalid size tag: {s}. Valid options: normal, large, x-large, xx-large"
            ))
        })
    }
}

/// Error kinds of the cache layer. Nothing above the scheduler boundary
/// observes these; the UI only sees "thumbnail available" or not.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unsupported source: {0}")]
    Unsupported(String),
    #[error("decode failed: {0}")]
    DecodeFailure(String),
    #[error("source is {size} bytes, over the {cap} byte cap")]
    Oversize { size: u64, cap: u64 },
    #[error("i/o failure: {0}")]
    IoFailure(#[from] std::io::Error),
    #[error("cache integrity violation: {0}")]
    IntegrityFailure(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl From<codecs::CodecError> for CacheError {
    fn from(err: codecs::CodecError) -> Self {
        match err {
            codecs::CodecError::UnsupportedType(msg) => CacheError::Unsupported(msg),
            codecs::CodecError::DecodeFailure(msg) => CacheError::DecodeFailure(msg),
            codecs::CodecError::SizeOverflow(msg) => {
                CacheError::DecodeFailure(format!("dimensions overflow: {msg}"))
            }
        }
    }
}

/// Tunables for the cache layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cap on bytes read into memory per source file.
    pub max_source_bytes: u64,
    /// Whether decoded pixels are color-managed to sRGB. Controls the
    /// `Thumb::ColorSpace` key and therefore the low-quality flag.
    pub color_managed: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_source_bytes: 10 * 1024 * 1024, // 10 MiB
            color_managed: true,
        }
    }
}

/// Explicit environment threaded into lookup, producer and invalidator:
/// the cache root plus configuration. Constructed once at startup; there
/// is no mutable global state.
#[derive(Debug, Clone)]
pub struct Environment {
    cache_dir: PathBuf,
    config: CacheConfig,
}

impl Environment {
    /// Resolve the XDG cache root: `$XDG_CACHE_HOME` or `$HOME/.cache`,
    /// plus the `thumbnails` subdirectory.
    pub fn new() -> Result<Self, CacheError> {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Result<Self, CacheError> {
        let base = std::env::var_os("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .filter(|p| p.is_absolute())
            .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
            .ok_or_else(|| {
                CacheError::NotFound("cannot determine a cache directory".to_string())
            })?;
        Ok(Self::with_cache_dir(base.join("thumbnails"), config))
    }

    /// Use an explicit thumbnails directory. Intended for tests and tools
    /// operating on foreign roots.
    pub fn with_cache_dir(cache_dir: PathBuf, config: CacheConfig) -> Self {
        Self { cache_dir, config }
    }

    /// The `thumbnails` directory containing the per-size subdirectories.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Extended-format directory for a size.
    pub fn wide_dir(&self, size: ThumbnailSize) -> PathBuf {
        self.cache_dir.join(size.wide_dir_name())
    }

    /// Interoperable directory for a size.
    pub fn interop_dir(&self, size: ThumbnailSize) -> PathBuf {
        self.cache_dir.join(size.tag())
    }

    /// Extended cache path for a URI at a size:
    /// `<cache>/wide-<tag>/<md5(uri)>.webp`.
    pub fn wide_path(&self, uri: &str, size: ThumbnailSize) -> PathBuf {
        self.wide_dir(size).join(format!("{}.webp", thumbnail_key(uri)))
    }

    /// Interoperable cache path for a URI at a size:
    /// `<cache>/<tag>/<md5(uri)>.png`.
    pub fn interop_path(&self, uri: &str, size: ThumbnailSize) -> PathBuf {
        self.interop_dir(size).join(format!("{}.png", thumbnail_key(uri)))
    }

    /// Create every wide directory up front, mode 0755.
    pub fn prepare(&self) -> Result<(), CacheError> {
        for size in ThumbnailSize::ALL {
            create_dir_0755(&self.wide_dir(size))?;
        }
        Ok(())
    }
}

/// Cache key: lowercase 32-hex-digit MD5 of the URI text. A pure function
/// of the URI; two paths denoting the same file yield different keys.
pub fn thumbnail_key(uri: &str) -> String {
    hex::encode(Md5::digest(uri.as_bytes()))
}

/// Percent-encoded absolute `file://` URI for a local path.
pub fn file_uri(path: &Path) -> Result<String, CacheError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Url::from_file_path(&absolute).map(|u| u.to_string()).map_err(|_| {
        CacheError::Unsupported(format!("not a representable path: {}", absolute.display()))
    })
}

/// Local filesystem path of a `file://` URI, if it is one.
pub fn local_path(uri: &str) -> Option<PathBuf> {
    let url = Url::parse(uri).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    url.to_file_path().ok()
}

/// Source modification time in whole seconds since the epoch. Pre-epoch
/// times saturate to zero, matching the textual `Thumb::MTime` encoding.
pub fn file_mtime(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Create a directory (and parents) with mode 0755.
pub(crate) fn create_dir_0755(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        match std::fs::DirBuilder::new().recursive(true).mode(0o755).create(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(path)
    }
}

/// Restrict a freshly written cache file to mode 0600.
pub(crate) fn set_file_0600(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}
