//! Thumbnail producer
//!
//! Renders a source image and installs a wide cache entry at every size
//! from the requested maximum down to the smallest, returning the raster
//! at the maximum. Writes are best-effort last-writer-wins; the on-disk
//! validation invariants tolerate concurrent producers.

use crate::{
    file_mtime, format, local_path, CacheError, Environment, ThumbnailSize,
};
use codecs::CodecGateway;
use crate::format::{
    ThumbMetadata, COLORSPACE_SRGB, KEY_COLORSPACE, KEY_HEIGHT, KEY_MIMETYPE, KEY_MTIME,
    KEY_SIZE, KEY_URI, KEY_WIDTH,
};
use raster::{apply_orientation, Raster};
use std::fs;
use tracing::debug;

/// Render a local source and install cache entries at `max_size` and every
/// smaller size. Returns the raster scaled for `max_size`.
pub fn produce(
    env: &Environment,
    gateway: &CodecGateway,
    uri: &str,
    max_size: ThumbnailSize,
) -> Result<Raster, CacheError> {
    let path = local_path(uri)
        .ok_or_else(|| CacheError::Unsupported(format!("not a local file: {uri}")))?;
    let stat = match fs::metadata(&path) {
        Ok(stat) => stat,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(CacheError::NotFound(uri.to_string()));
        }
        Err(err) => return Err(CacheError::IoFailure(err)),
    };
    let source_size = stat.len();
    let source_mtime = file_mtime(&stat);
    check_cap(env, source_size)?;

    let bytes = fs::read(&path)?;
    let upright = decode_upright(env, gateway, uri, &bytes, source_size)?;
    let meta = thumb_metadata(env, uri, source_mtime, source_size, &upright);

    let mut result = None;
    for size in ThumbnailSize::ALL[..=max_size.index()].iter().rev().copied() {
        let scaled = upright.scale_to_row_height(size.pixels());
        let encoded = format::encode_wide(&scaled, &meta)?;
        format::install(&env.wide_path(uri, size), &encoded)?;
        debug!(uri, size = %size, dims = ?scaled.dimensions(), "thumbnail installed");
        if size == max_size {
            result = Some(scaled);
        }
    }
    // max_size is always in the iterated range.
    result.ok_or_else(|| CacheError::IntegrityFailure("no size produced".to_string()))
}

/// Render pre-fetched bytes (non-local sources) to a preview raster at
/// `max_size`, skipping disk persistence entirely.
pub fn render_preview(
    env: &Environment,
    gateway: &CodecGateway,
    uri: &str,
    bytes: &[u8],
    max_size: ThumbnailSize,
) -> Result<Raster, CacheError> {
    check_cap(env, bytes.len() as u64)?;
    let upright = decode_upright(env, gateway, uri, bytes, bytes.len() as u64)?;
    Ok(upright.scale_to_row_height(max_size.pixels()))
}

fn check_cap(env: &Environment, size: u64) -> Result<(), CacheError> {
    let cap = env.config().max_source_bytes;
    if size > cap {
        return Err(CacheError::Oversize { size, cap });
    }
    Ok(())
}

/// Decode the primary frame and bake any pending orientation into the
/// pixels, so cached entries never carry an orientation tag.
fn decode_upright(
    env: &Environment,
    gateway: &CodecGateway,
    uri: &str,
    bytes: &[u8],
    source_size: u64,
) -> Result<Raster, CacheError> {
    let doc = gateway.decode(bytes, Some(uri))?;
    let mut raster = doc
        .into_primary()
        .ok_or_else(|| CacheError::DecodeFailure(format!("{uri}: no frames")))?;
    if let Some(code) = raster.meta.orientation {
        raster = apply_orientation(raster, code);
    }
    raster.meta.source_size = Some(source_size);
    raster.meta.original_dimensions = Some(raster.dimensions());
    raster.meta.low_quality = !env.config().color_managed;
    Ok(raster)
}

fn thumb_metadata(
    env: &Environment,
    uri: &str,
    source_mtime: i64,
    source_size: u64,
    upright: &Raster,
) -> ThumbMetadata {
    let mut meta = ThumbMetadata::new();
    meta.set(KEY_URI, uri);
    meta.set(KEY_MTIME, source_mtime.to_string());
    meta.set(KEY_SIZE, source_size.to_string());
    let (width, height) = upright.dimensions();
    meta.set(KEY_WIDTH, width.to_string());
    meta.set(KEY_HEIGHT, height.to_string());
    if env.config().color_managed {
        meta.set(KEY_COLORSPACE, COLORSPACE_SRGB);
    }
    if let Some(mimetype) = &upright.meta.mimetype {
        meta.set(KEY_MIMETYPE, mimetype);
    }
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{file_uri, lookup::lookup, CacheConfig};
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn test_env() -> (tempfile::TempDir, Environment) {
        let tmp = tempfile::tempdir().unwrap();
        let env =
            Environment::with_cache_dir(tmp.path().join("thumbnails"), CacheConfig::default());
        (tmp, env)
    }

    fn write_png(dir: &std::path::Path, name: &str, width: u32, height: u32) -> String {
        let img = RgbaImage::from_pixel(width, height, Rgba([120, 40, 220, 255]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        file_uri(&path).unwrap()
    }

    #[test]
    fn test_produce_installs_every_size_and_metadata() {
        let (tmp, env) = test_env();
        let uri = write_png(tmp.path(), "x.png", 320, 200);
        let source_path = local_path(&uri).unwrap();
        let stat = std::fs::metadata(&source_path).unwrap();

        let gateway = CodecGateway::with_builtin();
        let raster = produce(&env, &gateway, &uri, ThumbnailSize::Huge).unwrap();
        // 320 < 2*1024: height binds at 1024.
        assert_eq!(raster.dimensions(), (1024, 640));

        for size in ThumbnailSize::ALL {
            let path = env.wide_path(&uri, size);
            assert!(path.is_file(), "missing entry for {size}");
            let meta = format::read_wide_metadata(&std::fs::read(&path).unwrap()).unwrap();
            assert_eq!(meta.uri(), Some(uri.as_str()));
            assert_eq!(meta.mtime(), Some(file_mtime(&stat)));
            assert_eq!(meta.size(), Some(stat.len()));
            assert_eq!(meta.image_dimensions(), Some((320, 200)));
            assert!(meta.is_srgb());
            assert_eq!(meta.mimetype(), Some("image/png"));
        }
    }

    #[test]
    fn test_produce_then_lookup_round_trips() {
        let (tmp, env) = test_env();
        let uri = write_png(tmp.path(), "y.png", 64, 64);
        let stat = std::fs::metadata(local_path(&uri).unwrap()).unwrap();

        let gateway = CodecGateway::with_builtin();
        produce(&env, &gateway, &uri, ThumbnailSize::Normal).unwrap();

        let hit = lookup(&env, &uri, file_mtime(&stat), ThumbnailSize::Normal).unwrap();
        assert!(!hit.meta.low_quality);
        // Reflected search finds the smaller entry for a Huge request.
        let fallback = lookup(&env, &uri, file_mtime(&stat), ThumbnailSize::Huge).unwrap();
        assert!(fallback.meta.low_quality);
    }

    #[test]
    fn test_wide_source_binds_width() {
        let (tmp, env) = test_env();
        let uri = write_png(tmp.path(), "pano.png", 640, 400);
        let gateway = CodecGateway::with_builtin();
        // 640 > 2*128: width binds at 256, height scales to 160.
        let raster = produce(&env, &gateway, &uri, ThumbnailSize::Small).unwrap();
        assert_eq!(raster.dimensions(), (256, 160));
    }

    #[test]
    fn test_max_size_limits_installed_sizes() {
        let (tmp, env) = test_env();
        let uri = write_png(tmp.path(), "z.png", 32, 32);
        let gateway = CodecGateway::with_builtin();
        produce(&env, &gateway, &uri, ThumbnailSize::Normal).unwrap();
        assert!(env.wide_path(&uri, ThumbnailSize::Small).is_file());
        assert!(env.wide_path(&uri, ThumbnailSize::Normal).is_file());
        assert!(!env.wide_path(&uri, ThumbnailSize::Large).exists());
        assert!(!env.wide_path(&uri, ThumbnailSize::Huge).exists());
    }

    #[test]
    fn test_oversize_source_rejected_before_decode() {
        let tmp = tempfile::tempdir().unwrap();
        let env = Environment::with_cache_dir(
            tmp.path().join("thumbnails"),
            CacheConfig { max_source_bytes: 16, ..CacheConfig::default() },
        );
        let uri = write_png(tmp.path(), "big.png", 50, 50);
        let gateway = CodecGateway::with_builtin();
        let err = produce(&env, &gateway, &uri, ThumbnailSize::Small).unwrap_err();
        assert!(matches!(err, CacheError::Oversize { cap: 16, .. }));
    }

    #[test]
    fn test_missing_source_is_not_found() {
        let (_tmp, env) = test_env();
        let gateway = CodecGateway::with_builtin();
        let err =
            produce(&env, &gateway, "file:///nonexistent/a.png", ThumbnailSize::Small)
                .unwrap_err();
        assert!(matches!(err, CacheError::NotFound(_)));
    }

    #[test]
    fn test_remote_uri_unsupported_by_produce() {
        let (_tmp, env) = test_env();
        let gateway = CodecGateway::with_builtin();
        let err = produce(&env, &gateway, "https://example.com/a.png", ThumbnailSize::Small)
            .unwrap_err();
        assert!(matches!(err, CacheError::Unsupported(_)));
    }

    #[test]
    fn test_render_preview_skips_persistence() {
        let (_tmp, env) = test_env();
        let img = RgbaImage::from_pixel(40, 20, Rgba([9, 9, 9, 255]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();

        let gateway = CodecGateway::with_builtin();
        let uri = "https://example.com/remote.png";
        let raster =
            render_preview(&env, &gateway, uri, &bytes, ThumbnailSize::Small).unwrap();
        // Landscape 2:1 under the width cap: long edge becomes 128.
        assert_eq!(raster.dimensions(), (128, 64));
        assert!(!env.wide_path(uri, ThumbnailSize::Small).exists());
    }

    #[test]
    fn test_jpeg_orientation_baked_into_pixels() {
        // An 8x4 JPEG claiming orientation 6 (rotate 90 CW) comes out
        // upright as 4x8, and the cached entry carries the upright dims.
        let (tmp, env) = test_env();
        let img = RgbaImage::from_pixel(8, 4, Rgba([200, 10, 10, 255]));
        let mut jpeg = Vec::new();
        // The image crate's JPEG encoder does not accept RGBA8 input.
        image::DynamicImage::ImageRgba8(img)
            .to_rgb8()
            .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
            .unwrap();
        let spliced = splice_app1_after_soi(&jpeg, &exif_orientation_segment(6));
        let path = tmp.path().join("rot.jpg");
        std::fs::write(&path, spliced).unwrap();
        let uri = file_uri(&path).unwrap();

        let gateway = CodecGateway::with_builtin();
        let raster = produce(&env, &gateway, &uri, ThumbnailSize::Small).unwrap();
        // Portrait after rotation: height binds at 128.
        assert_eq!(raster.dimensions(), (64, 128));
        assert_eq!(raster.meta.orientation, None);

        let entry = std::fs::read(env.wide_path(&uri, ThumbnailSize::Small)).unwrap();
        let meta = format::read_wide_metadata(&entry).unwrap();
        assert_eq!(meta.image_dimensions(), Some((4, 8)));
    }

    fn exif_orientation_segment(orientation: u16) -> Vec<u8> {
        let mut tiff = Vec::new();
        tiff.extend_from_slice(b"II\x2a\x00");
        tiff.extend_from_slice(&8u32.to_le_bytes());
        tiff.extend_from_slice(&1u16.to_le_bytes());
        tiff.extend_from_slice(&0x0112u16.to_le_bytes());
        tiff.extend_from_slice(&3u16.to_le_bytes());
        tiff.extend_from_slice(&1u32.to_le_bytes());
        tiff.extend_from_slice(&orientation.to_le_bytes());
        tiff.extend_from_slice(&[0, 0]);
        tiff.extend_from_slice(&0u32.to_le_bytes());

        let mut seg = vec![0xff, 0xe1];
        seg.extend_from_slice(&((2 + 6 + tiff.len()) as u16).to_be_bytes());
        seg.extend_from_slice(b"Exif\0\0");
        seg.extend_from_slice(&tiff);
        seg
    }

    fn splice_app1_after_soi(jpeg: &[u8], segment: &[u8]) -> Vec<u8> {
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
        let mut out = jpeg[..2].to_vec();
        out.extend_from_slice(segment);
        out.extend_from_slice(&jpeg[2..]);
        out
    }
}
