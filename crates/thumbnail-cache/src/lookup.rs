//! Multi-resolution cache lookup
//!
//! Given a source URI and its current modification time, find the best
//! cached thumbnail. Sizes are visited in reflected order: the requested
//! size first, then upward to the largest (downscaling a bigger entry
//! beats upscaling), then downward as a last resort. At each size the
//! extended wide entry is preferred over the interoperable PNG.
//!
//! Every per-candidate failure is logged and skipped; lookup itself never
//! fails, it only misses.

use crate::{format, Environment, ThumbnailSize};
use raster::Raster;
use std::fs;
use tracing::debug;

/// Find the best cached thumbnail for a source, validated against its
/// current modification time. The returned raster's `low_quality` flag is
/// set when the entry is not color-managed to sRGB, came from a foreign
/// interop PNG, or was cached at a different nominal size.
pub fn lookup(
    env: &Environment,
    uri: &str,
    source_mtime: i64,
    requested: ThumbnailSize,
) -> Option<Raster> {
    for size in search_order(requested) {
        let found =
            try_wide(env, uri, source_mtime, size).or_else(|| try_interop(env, uri, source_mtime, size));
        if let Some(mut raster) = found {
            if size != requested {
                raster.meta.low_quality = true;
            }
            return Some(raster);
        }
    }
    None
}

/// Visit order for a requested size: requested, requested+1, .., MAX,
/// MAX-1, .., MIN, reflected at the top and deduplicated.
pub fn search_order(requested: ThumbnailSize) -> Vec<ThumbnailSize> {
    let mut order = Vec::with_capacity(ThumbnailSize::COUNT);
    for i in 0..ThumbnailSize::COUNT {
        let mut index = requested.index() + i;
        if index >= ThumbnailSize::COUNT {
            index = ThumbnailSize::MAX.index().saturating_sub(i);
        }
        if let Some(size) = ThumbnailSize::from_index(index) {
            if !order.contains(&size) {
                order.push(size);
            }
        }
    }
    order
}

fn try_wide(
    env: &Environment,
    uri: &str,
    source_mtime: i64,
    size: ThumbnailSize,
) -> Option<Raster> {
    let path = env.wide_path(uri, size);
    let bytes = read_candidate(&path)?;
    let (mut raster, meta) = match format::decode_wide(&bytes) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(path = %path.display(), %err, "invalid wide entry skipped");
            return None;
        }
    };
    if !validate(&meta, uri, source_mtime, &path) {
        return None;
    }
    raster.meta.low_quality = !meta.is_srgb();
    Some(raster)
}

/// Interop entries always come back low quality: external producers are
/// outclassed by our own, so the entry stays eligible for replacement.
fn try_interop(
    env: &Environment,
    uri: &str,
    source_mtime: i64,
    size: ThumbnailSize,
) -> Option<Raster> {
    let path = env.interop_path(uri, size);
    let bytes = read_candidate(&path)?;
    let (mut raster, meta) = match format::decode_interop(&bytes) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(path = %path.display(), %err, "invalid interop entry skipped");
            return None;
        }
    };
    if !validate(&meta, uri, source_mtime, &path) {
        return None;
    }
    raster.meta.low_quality = true;
    Some(raster)
}

fn read_candidate(path: &std::path::Path) -> Option<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Some(bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            debug!(path = %path.display(), %err, "unreadable cache entry skipped");
            None
        }
    }
}

/// Mandatory keys must be present and match the requesting source.
fn validate(
    meta: &format::ThumbMetadata,
    uri: &str,
    source_mtime: i64,
    path: &std::path::Path,
) -> bool {
    if meta.uri() != Some(uri) {
        debug!(path = %path.display(), "embedded URI mismatch, entry skipped");
        return false;
    }
    if meta.mtime() != Some(source_mtime) {
        debug!(path = %path.display(), "stale mtime, entry skipped");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{
        ThumbMetadata, COLORSPACE_SRGB, KEY_COLORSPACE, KEY_MTIME, KEY_URI,
    };
    use crate::{CacheConfig, Environment};
    use image::{Rgba, RgbaImage};
    use raster::Raster;

    const URI: &str = "file:///tmp/photo.png";
    const MTIME: i64 = 1700000000;

    fn test_env() -> (tempfile::TempDir, Environment) {
        let tmp = tempfile::tempdir().unwrap();
        let env =
            Environment::with_cache_dir(tmp.path().join("thumbnails"), CacheConfig::default());
        (tmp, env)
    }

    fn raster(width: u32, height: u32) -> Raster {
        Raster::from_rgba_image(RgbaImage::from_pixel(width, height, Rgba([50, 60, 70, 255])))
    }

    fn write_wide(env: &Environment, uri: &str, mtime: i64, size: ThumbnailSize, srgb: bool) {
        let mut meta = ThumbMetadata::new();
        meta.set(KEY_URI, uri);
        meta.set(KEY_MTIME, mtime.to_string());
        if srgb {
            meta.set(KEY_COLORSPACE, COLORSPACE_SRGB);
        }
        // Encode pixel dimensions that identify the nominal size.
        let bytes = format::encode_wide(&raster(size.pixels(), size.pixels()), &meta).unwrap();
        format::install(&env.wide_path(uri, size), &bytes).unwrap();
    }

    fn write_interop(env: &Environment, uri: &str, mtime: i64, size: ThumbnailSize) {
        let img = RgbaImage::from_pixel(size.pixels(), size.pixels(), Rgba([1, 2, 3, 255]));
        let mut bytes = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut bytes, img.width(), img.height());
            encoder.set_color(png::ColorType::Rgba);
            encoder.set_depth(png::BitDepth::Eight);
            encoder.add_text_chunk(KEY_URI.to_string(), uri.to_string()).unwrap();
            encoder
                .add_text_chunk(KEY_MTIME.to_string(), mtime.to_string())
                .unwrap();
            let mut writer = encoder.write_header().unwrap();
            writer.write_image_data(img.as_raw()).unwrap();
        }
        format::install(&env.interop_path(uri, size), &bytes).unwrap();
    }

    #[test]
    fn test_search_order_reflects_at_the_top() {
        use ThumbnailSize::*;
        assert_eq!(search_order(Normal), vec![Normal, Large, Huge, Small]);
        assert_eq!(search_order(Small), vec![Small, Normal, Large, Huge]);
        assert_eq!(search_order(Huge), vec![Huge, Large, Normal, Small]);
        for requested in ThumbnailSize::ALL {
            assert_eq!(search_order(requested).len(), ThumbnailSize::COUNT);
        }
    }

    #[test]
    fn test_exact_match_is_full_quality() {
        let (_tmp, env) = test_env();
        write_wide(&env, URI, MTIME, ThumbnailSize::Normal, true);
        let raster = lookup(&env, URI, MTIME, ThumbnailSize::Normal).unwrap();
        assert!(!raster.meta.low_quality);
        assert_eq!(raster.dimensions(), (256, 256));
    }

    #[test]
    fn test_upgrade_preferred_over_downgrade() {
        // Entries at Small and Large; a Normal request takes the Large one.
        let (_tmp, env) = test_env();
        write_wide(&env, URI, MTIME, ThumbnailSize::Small, true);
        write_wide(&env, URI, MTIME, ThumbnailSize::Large, true);
        let raster = lookup(&env, URI, MTIME, ThumbnailSize::Normal).unwrap();
        assert_eq!(raster.dimensions(), (512, 512));
        // Different nominal size than requested: low quality.
        assert!(raster.meta.low_quality);
    }

    #[test]
    fn test_smaller_size_is_last_resort() {
        let (_tmp, env) = test_env();
        write_wide(&env, URI, MTIME, ThumbnailSize::Small, true);
        let raster = lookup(&env, URI, MTIME, ThumbnailSize::Huge).unwrap();
        assert_eq!(raster.dimensions(), (128, 128));
        assert!(raster.meta.low_quality);
    }

    #[test]
    fn test_stale_mtime_misses() {
        let (_tmp, env) = test_env();
        write_wide(&env, URI, MTIME, ThumbnailSize::Normal, true);
        assert!(lookup(&env, URI, MTIME + 100, ThumbnailSize::Normal).is_none());
    }

    #[test]
    fn test_foreign_uri_misses() {
        // A colliding file claiming a different source never matches.
        let (_tmp, env) = test_env();
        let mut meta = ThumbMetadata::new();
        meta.set(KEY_URI, "file:///tmp/other.png");
        meta.set(KEY_MTIME, MTIME.to_string());
        let bytes = format::encode_wide(&raster(4, 4), &meta).unwrap();
        format::install(&env.wide_path(URI, ThumbnailSize::Normal), &bytes).unwrap();
        assert!(lookup(&env, URI, MTIME, ThumbnailSize::Normal).is_none());
    }

    #[test]
    fn test_missing_mandatory_keys_miss() {
        let (_tmp, env) = test_env();
        let mut meta = ThumbMetadata::new();
        meta.set(KEY_URI, URI); // no MTime
        let bytes = format::encode_wide(&raster(4, 4), &meta).unwrap();
        format::install(&env.wide_path(URI, ThumbnailSize::Normal), &bytes).unwrap();
        assert!(lookup(&env, URI, MTIME, ThumbnailSize::Normal).is_none());
    }

    #[test]
    fn test_non_srgb_entry_is_low_quality() {
        let (_tmp, env) = test_env();
        write_wide(&env, URI, MTIME, ThumbnailSize::Normal, false);
        let raster = lookup(&env, URI, MTIME, ThumbnailSize::Normal).unwrap();
        assert!(raster.meta.low_quality);
    }

    #[test]
    fn test_interop_fallback_is_low_quality() {
        let (_tmp, env) = test_env();
        write_interop(&env, URI, MTIME, ThumbnailSize::Normal);
        let raster = lookup(&env, URI, MTIME, ThumbnailSize::Normal).unwrap();
        assert_eq!(raster.dimensions(), (256, 256));
        assert!(raster.meta.low_quality);
    }

    #[test]
    fn test_wide_beats_interop_at_same_size() {
        let (_tmp, env) = test_env();
        write_interop(&env, URI, MTIME, ThumbnailSize::Normal);
        write_wide(&env, URI, MTIME, ThumbnailSize::Normal, true);
        let raster = lookup(&env, URI, MTIME, ThumbnailSize::Normal).unwrap();
        assert!(!raster.meta.low_quality);
    }

    #[test]
    fn test_corrupt_entry_falls_through() {
        let (_tmp, env) = test_env();
        format::install(&env.wide_path(URI, ThumbnailSize::Normal), b"garbage").unwrap();
        write_wide(&env, URI, MTIME, ThumbnailSize::Large, true);
        let raster = lookup(&env, URI, MTIME, ThumbnailSize::Normal).unwrap();
        assert_eq!(raster.dimensions(), (512, 512));
    }

    #[test]
    fn test_empty_cache_misses() {
        let (_tmp, env) = test_env();
        assert!(lookup(&env, URI, MTIME, ThumbnailSize::Normal).is_none());
    }
}
