//! Wide-thumbnail scaling rule
//!
//! Thumbnails target a nominal row height `H` but may be up to `2*H` wide,
//! producing the "wide" shape: very wide originals bind at width `2*H`,
//! everything else scales its long edge to `H`.

/// Compute the output dimensions for a source of `width`x`height` at the
/// nominal row height `row_height`. Aspect ratio is preserved; dimensions
/// round to nearest and never drop below 1.
pub fn scaled_dimensions(width: u32, height: u32, row_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 || row_height == 0 {
        return (width.max(1), height.max(1));
    }
    let w = width as u64;
    let h = height as u64;
    let target = row_height as u64;

    let (tw, th) = if w > 2 * target {
        // Width-bound: clamp to twice the row height.
        (2 * target, scale_axis(h, 2 * target, w))
    } else if w >= h {
        // Landscape or square: long edge becomes the row height.
        (target, scale_axis(h, target, w))
    } else {
        // Portrait: height becomes the row height.
        (scale_axis(w, target, h), target)
    };
    (tw.min(u32::MAX as u64) as u32, th.min(u32::MAX as u64) as u32)
}

fn scale_axis(value: u64, numerator: u64, denominator: u64) -> u64 {
    ((value * numerator + denominator / 2) / denominator).max(1)
}
