//! Cache invalidation sweep
//!
//! Sequential pass over every `wide-<tag>` directory: each `.webp` entry
//! must carry a well-formed `THUM` chunk, be named after the MD5 of its
//! embedded URI, and reference a source that still exists with a matching
//! modification time. Anything else is deleted. Files with other
//! extensions are left alone; the user may have co-mingled other data.

use crate::{file_mtime, format, local_path, thumbnail_key, Environment, ThumbnailSize};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Counters reported by an invalidation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidateStats {
    /// `.webp` entries inspected.
    pub examined: usize,
    /// Stale or malformed entries removed.
    pub deleted: usize,
    /// Entries still bound to a live source.
    pub kept: usize,
    /// Entries left in place because their source could not be checked.
    pub skipped: usize,
}

enum Verdict {
    Keep,
    Delete(&'static str),
    Skip,
}

/// Sweep every wide directory under the cache root. Never fails: missing
/// directories are fine, per-entry errors are logged and accounted.
pub fn invalidate(env: &Environment) -> InvalidateStats {
    let mut stats = InvalidateStats::default();
    for size in ThumbnailSize::ALL {
        sweep_dir(&env.wide_dir(size), &mut stats);
    }
    stats
}

fn sweep_dir(dir: &Path, stats: &mut InvalidateStats) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
        Err(err) => {
            warn!(dir = %dir.display(), %err, "cannot enumerate cache directory");
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(dir = %dir.display(), %err, "unreadable directory entry");
                continue;
            }
        };
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("webp") {
            continue;
        }
        stats.examined += 1;
        match examine(&path) {
            Verdict::Keep => stats.kept += 1,
            Verdict::Skip => stats.skipped += 1,
            Verdict::Delete(reason) => {
                debug!(path = %path.display(), reason, "deleting stale thumbnail");
                match fs::remove_file(&path) {
                    Ok(()) => stats.deleted += 1,
                    Err(err) => {
                        warn!(path = %path.display(), %err, "failed to delete stale thumbnail");
                        stats.skipped += 1;
                    }
                }
            }
        }
    }
}

fn examine(path: &Path) -> Verdict {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(path = %path.display(), %err, "unreadable cache entry");
            return Verdict::Skip;
        }
    };
    let meta = match format::read_wide_metadata(&bytes) {
        Ok(meta) => meta,
        Err(_) => return Verdict::Delete("missing or malformed THUM chunk"),
    };
    let Some(uri) = meta.uri() else {
        return Verdict::Delete("no embedded URI");
    };
    let Some(claimed_mtime) = meta.mtime() else {
        return Verdict::Delete("no embedded mtime");
    };

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    if stem != thumbnail_key(uri) {
        return Verdict::Delete("filename does not match key of embedded URI");
    }

    // Only local sources can be re-stated; leave the rest alone.
    let Some(source) = local_path(uri) else {
        return Verdict::Skip;
    };
    match fs::metadata(&source) {
        Ok(stat) if file_mtime(&stat) == claimed_mtime => Verdict::Keep,
        Ok(_) => Verdict::Delete("source modification time changed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Verdict::Delete("source no longer exists")
        }
        Err(err) => {
            warn!(source = %source.display(), %err, "cannot stat thumbnail source");
            Verdict::Skip
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ThumbMetadata, KEY_MTIME, KEY_URI};
    use crate::{file_uri, CacheConfig};
    use image::{Rgba, RgbaImage};
    use raster::Raster;

    fn test_env() -> (tempfile::TempDir, Environment) {
        let tmp = tempfile::tempdir().unwrap();
        let env =
            Environment::with_cache_dir(tmp.path().join("thumbnails"), CacheConfig::default());
        (tmp, env)
    }

    fn make_source(dir: &Path, name: &str) -> (String, i64) {
        let path = dir.join(name);
        std::fs::write(&path, b"source bytes").unwrap();
        let stat = std::fs::metadata(&path).unwrap();
        (file_uri(&path).unwrap(), file_mtime(&stat))
    }

    fn install_entry(env: &Environment, uri: &str, mtime: i64, size: ThumbnailSize) {
        let raster =
            Raster::from_rgba_image(RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 255])));
        let mut meta = ThumbMetadata::new();
        meta.set(KEY_URI, uri);
        meta.set(KEY_MTIME, mtime.to_string());
        let bytes = format::encode_wide(&raster, &meta).unwrap();
        format::install(&env.wide_path(uri, size), &bytes).unwrap();
    }

    #[test]
    fn test_valid_entry_kept() {
        let (tmp, env) = test_env();
        let (uri, mtime) = make_source(tmp.path(), "a.png");
        install_entry(&env, &uri, mtime, ThumbnailSize::Normal);

        let stats = invalidate(&env);
        assert_eq!(stats, InvalidateStats { examined: 1, kept: 1, ..Default::default() });
        assert!(env.wide_path(&uri, ThumbnailSize::Normal).is_file());
    }

    #[test]
    fn test_changed_mtime_deleted_everywhere() {
        let (tmp, env) = test_env();
        let (uri, mtime) = make_source(tmp.path(), "a.png");
        // Entries at two sizes, both recorded against an older mtime.
        install_entry(&env, &uri, mtime - 50, ThumbnailSize::Small);
        install_entry(&env, &uri, mtime - 50, ThumbnailSize::Huge);

        let stats = invalidate(&env);
        assert_eq!(stats.deleted, 2);
        for size in ThumbnailSize::ALL {
            assert!(!env.wide_path(&uri, size).exists());
        }
    }

    #[test]
    fn test_missing_source_deleted() {
        let (tmp, env) = test_env();
        let (uri, mtime) = make_source(tmp.path(), "gone.png");
        install_entry(&env, &uri, mtime, ThumbnailSize::Normal);
        std::fs::remove_file(tmp.path().join("gone.png")).unwrap();

        let stats = invalidate(&env);
        assert_eq!(stats.deleted, 1);
    }

    #[test]
    fn test_key_mismatch_deleted() {
        let (tmp, env) = test_env();
        let (uri, mtime) = make_source(tmp.path(), "a.png");
        // Entry stored under a name that is not md5(embedded URI).
        let raster =
            Raster::from_rgba_image(RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 255])));
        let mut meta = ThumbMetadata::new();
        meta.set(KEY_URI, &uri);
        meta.set(KEY_MTIME, mtime.to_string());
        let bytes = format::encode_wide(&raster, &meta).unwrap();
        let path = env.wide_dir(ThumbnailSize::Normal).join(format!("{}.webp", "0".repeat(32)));
        format::install(&path, &bytes).unwrap();

        let stats = invalidate(&env);
        assert_eq!(stats.deleted, 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_malformed_entry_deleted() {
        let (_tmp, env) = test_env();
        let path = env.wide_dir(ThumbnailSize::Normal).join("deadbeef.webp");
        format::install(&path, b"not a webp at all").unwrap();

        let stats = invalidate(&env);
        assert_eq!(stats.deleted, 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_foreign_files_left_alone() {
        let (_tmp, env) = test_env();
        let dir = env.wide_dir(ThumbnailSize::Normal);
        std::fs::create_dir_all(&dir).unwrap();
        let foreign = dir.join("notes.txt");
        std::fs::write(&foreign, b"user data").unwrap();

        let stats = invalidate(&env);
        assert_eq!(stats.examined, 0);
        assert!(foreign.is_file());
    }

    #[test]
    fn test_unstatable_scheme_skipped() {
        let (_tmp, env) = test_env();
        let uri = "https://example.com/remote.png";
        install_entry(&env, uri, 1700000000, ThumbnailSize::Normal);

        let stats = invalidate(&env);
        assert_eq!(stats.skipped, 1);
        assert!(env.wide_path(uri, ThumbnailSize::Normal).is_file());
    }

    #[test]
    fn test_empty_cache_is_a_noop() {
        let (_tmp, env) = test_env();
        assert_eq!(invalidate(&env), InvalidateStats::default());
    }
}
