//! In-memory raster model for Glance
//!
//! This crate defines the pixel object shared by the codec gateway and the
//! thumbnail cache: a `Raster` with an explicit pixel format and stride, a
//! typed metadata record (`RasterMeta`) that carries orientation, ICC/Exif
//! bytes and quality flags forward, arena-owned frame/page chains for
//! animated and multi-page containers, and the aspect-preserving scaling
//! rule that produces the wide thumbnail shape.

pub mod arena;
pub mod orient;
pub mod scale;

pub use arena::{ImageDocument, RasterArena, RasterId};
pub use orient::apply_orientation;
pub use scale::scaled_dimensions;

use image::RgbaImage;
use thiserror::Error;

/// Pixel format of a raster buffer.
///
/// `Argb32Premul` is the canonical working format; the remaining variants
/// exist for high-bit-depth originals handed over by decoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8 bits per channel with premultiplied alpha, 4 bytes per pixel.
    Argb32Premul,
    /// 8 bits per channel, no alpha, 3 bytes per pixel.
    Rgb24,
    /// 10 bits per channel packed in 32 bits, no alpha.
    Rgb30,
    /// 32-bit float per channel, 16 bytes per pixel.
    Rgba128F,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Argb32Premul => 4,
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgb30 => 4,
            PixelFormat::Rgba128F => 16,
        }
    }
}

/// Typed metadata attached to a raster.
///
/// Replaces the opaque key-to-pointer user-data table of classic pixel
/// buffers with an owned record: the last owner of the raster frees all
/// attached bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RasterMeta {
    /// Baseline TIFF orientation code (1..8) still pending application.
    pub orientation: Option<u8>,
    /// Raw ICC profile bytes from the source container.
    pub icc_profile: Option<Vec<u8>>,
    /// Raw Exif payload (TIFF header onward) from the source container.
    pub exif: Option<Vec<u8>>,
    /// Set when the raster's provenance or resolution is below the
    /// requester's ideal and the entry is eligible for replacement.
    pub low_quality: bool,
    /// Byte size of the source file, when known.
    pub source_size: Option<u64>,
    /// Pixel dimensions of the original image, when known.
    pub original_dimensions: Option<(u32, u32)>,
    /// MIME type reported by the decoder that produced this raster.
    pub mimetype: Option<String>,
}

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("raster dimensions {0}x{1} overflow")]
    DimensionOverflow(u32, u32),
    #[error("pixel buffer length {got} does not match {expected}")]
    BufferMismatch { got: usize, expected: usize },
}

/// An owned image buffer with explicit format, stride and metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    width: u32,
    height: u32,
    format: PixelFormat,
    stride: usize,
    pixels: Vec<u8>,
    pub meta: RasterMeta,
}

impl Raster {
    /// Allocate a zeroed raster, rejecting dimensions whose byte size
    /// cannot be represented.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Result<Self, RasterError> {
        let stride = (width as usize)
            .checked_mul(format.bytes_per_pixel())
            .ok_or(RasterError::DimensionOverflow(width, height))?;
        let len = stride
            .checked_mul(height as usize)
            .ok_or(RasterError::DimensionOverflow(width, height))?;
        Ok(Self {
            width,
            height,
            format,
            stride,
            pixels: vec![0; len],
            meta: RasterMeta::default(),
        })
    }

    /// Wrap an existing buffer. The buffer must be exactly
    /// `height * width * bytes_per_pixel` bytes with a packed stride.
    pub fn from_buffer(
        width: u32,
        height: u32,
        format: PixelFormat,
        pixels: Vec<u8>,
    ) -> Result<Self, RasterError> {
        let mut raster = Self::new(width, height, format)?;
        if pixels.len() != raster.pixels.len() {
            return Err(RasterError::BufferMismatch {
                got: pixels.len(),
                expected: raster.pixels.len(),
            });
        }
        raster.pixels = pixels;
        Ok(raster)
    }

    /// Convert a straight-alpha RGBA image into the canonical
    /// premultiplied format.
    pub fn from_rgba_image(img: RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        let mut pixels = img.into_raw();
        premultiply_in_place(&mut pixels);
        // Dimensions came from an existing allocation, so they cannot overflow.
        Self::from_buffer(width, height, PixelFormat::Argb32Premul, pixels)
            .unwrap_or_else(|_| unreachable!("buffer produced from image of same size"))
    }

    /// Convert back to a straight-alpha RGBA image for encoding or scaling.
    pub fn to_rgba_image(&self) -> RgbaImage {
        let mut pixels = match self.format {
            PixelFormat::Argb32Premul => self.pixels.clone(),
            // Alternative formats only appear on decode paths that never
            // reach the encoders; expand them channel-wise.
            PixelFormat::Rgb24 => {
                let mut out = Vec::with_capacity(self.pixels.len() / 3 * 4);
                for px in self.pixels.chunks_exact(3) {
                    out.extend_from_slice(&[px[0], px[1], px[2], 0xff]);
                }
                out
            }
            PixelFormat::Rgb30 | PixelFormat::Rgba128F => {
                // Lossy narrow to 8-bit; acceptable for thumbnail output.
                narrow_to_rgba8(&self.pixels, self.format)
            }
        };
        if self.format == PixelFormat::Argb32Premul {
            unpremultiply_in_place(&mut pixels);
        }
        RgbaImage::from_raw(self.width, self.height, pixels)
            .unwrap_or_else(|| unreachable!("buffer length validated at construction"))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Rescale to the wide-thumbnail shape for a nominal row height,
    /// preserving metadata.
    pub fn scale_to_row_height(&self, row_height: u32) -> Raster {
        let (tw, th) = scale::scaled_dimensions(self.width, self.height, row_height);
        if (tw, th) == (self.width, self.height) && self.format == PixelFormat::Argb32Premul {
            return self.clone();
        }
        let resized = image::imageops::resize(
            &self.to_rgba_image(),
            tw,
            th,
            image::imageops::FilterType::Lanczos3,
        );
        let mut out = Raster::from_rgba_image(resized);
        out.meta = self.meta.clone();
        out
    }
}

fn premultiply_in_place(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(4) {
        let a = px[3] as u16;
        if a == 255 {
            continue;
        }
        px[0] = ((px[0] as u16 * a + 127) / 255) as u8;
        px[1] = ((px[1] as u16 * a + 127) / 255) as u8;
        px[2] = ((px[2] as u16 * a + 127) / 255) as u8;
    }
}

fn unpremultiply_in_place(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(4) {
        let a = px[3] as u16;
        if a == 255 || a == 0 {
            continue;
        }
        px[0] = ((px[0] as u16 * 255 + a / 2) / a).min(255) as u8;
        px[1] = ((px[1] as u16 * 255 + a / 2) / a).min(255) as u8;
        px[2] = ((px[2] as u16 * 255 + a / 2) / a).min(255) as u8;
    }
}

fn narrow_to_rgba8(pixels: &[u8], format: PixelFormat) -> Vec<u8> {
    match format {
        PixelFormat::Rgb30 => pixels
            .chunks_exact(4)
            .flat_map(|px| {
                let packed = u32::from_le_bytes([px[0], px[1], px[2], px[3]]);
                let r = ((packed >> 20) & 0x3ff) >> 2;
                let g = ((packed >> 10) & 0x3ff) >> 2;
                let b = (packed & 0x3ff) >> 2;
                [r as u8, g as u8, b as u8, 0xff]
            })
            .collect(),
        PixelFormat::Rgba128F => pixels
            .chunks_exact(16)
            .flat_map(|px| {
                let ch = |i: usize| {
                    let v = f32::from_le_bytes([px[i], px[i + 1], px[i + 2], px[i + 3]]);
                    (v.clamp(0.0, 1.0) * 255.0).round() as u8
                };
                [ch(0), ch(4), ch(8), ch(12)]
            })
            .collect(),
        _ => pixels.to_vec(),
    }
}
