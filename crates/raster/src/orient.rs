//! Baseline TIFF orientation transforms
//!
//! Orientation codes 1..8 describe the rotation/mirroring needed to display
//! a stored image upright. `apply_orientation` performs that transform on
//! pixel data so cached thumbnails never carry an orientation tag.

use crate::Raster;
use image::imageops;

/// Apply a Baseline TIFF orientation code to a raster, returning an upright
/// copy with the pending orientation cleared from its metadata. Codes
/// outside 2..8 (including invalid ones) return the input unchanged apart
/// from the cleared tag.
pub fn apply_orientation(raster: Raster, code: u8) -> Raster {
    if !(2..=8).contains(&code) {
        let mut out = raster;
        out.meta.orientation = None;
        return out;
    }
    let img = raster.to_rgba_image();
    let upright = match code {
        2 => imageops::flip_horizontal(&img),
        3 => imageops::rotate180(&img),
        4 => imageops::flip_vertical(&img),
        5 => imageops::flip_horizontal(&imageops::rotate90(&img)),
        6 => imageops::rotate90(&img),
        7 => imageops::flip_vertical(&imageops::rotate90(&img)),
        8 => imageops::rotate270(&img),
        _ => unreachable!("range checked above"),
    };
    let mut out = Raster::from_rgba_image(upright);
    out.meta = raster.meta;
    out.meta.orientation = None;
    out
}
