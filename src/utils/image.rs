//! Image utility functions

use image::{DynamicImage, Rgb, RgbImage};
use ndarray::Array2;

use crate::error::Result;

/// Z-scores at or above this value saturate the heatmap
pub const HEATMAP_Z_CEILING: f32 = 5.0;

const INPUT_WEIGHT: f32 = 0.6;
const HEATMAP_WEIGHT: f32 = 0.4;

/// Encode image to PNG bytes
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    image.write_to(&mut buffer, image::ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

/// JET colormap lookup for an 8-bit intensity
pub fn jet(value: u8) -> Rgb<u8> {
    let v = value as f32 / 255.0;
    let channel = |center: f32| {
        let c = (1.5 - (4.0 * v - center).abs()).clamp(0.0, 1.0);
        (c * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// Blend a JET rendering of `z_map` over `input`.
///
/// `z_map` is indexed `[row, col]` and must match the input dimensions.
pub fn heatmap_overlay(input: &RgbImage, z_map: &Array2<f32>) -> RgbImage {
    let (width, height) = input.dimensions();
    debug_assert_eq!(z_map.dim(), (height as usize, width as usize));

    RgbImage::from_fn(width, height, |x, y| {
        let z = z_map[[y as usize, x as usize]];
        let z = if z.is_nan() { 0.0 } else { z.clamp(0.0, HEATMAP_Z_CEILING) };
        let heat = jet((z / HEATMAP_Z_CEILING * 255.0) as u8);
        let base = input.get_pixel(x, y);

        let mut out = [0u8; 3];
        for c in 0..3 {
            let v = base[c] as f32 * INPUT_WEIGHT + heat[c] as f32 * HEATMAP_WEIGHT;
            out[c] = v.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(out)
    })
}
