//! Image preprocessing for anomaly scoring

use image::{DynamicImage, Rgb, RgbImage};
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use ndarray::Array4;
use rayon::prelude::*;
use tracing::debug;

use crate::config::ModelConfig;
use crate::error::{EngineError, Result};

/// Bring an input image to the model input size.
///
/// With `affine_points` configured the quad is rectified onto the full input
/// size. Without them the image must already have that size; nothing is
/// cropped or padded.
pub fn prepare_input(image: &DynamicImage, config: &ModelConfig) -> Result<RgbImage> {
    let (width, height) = config.image_size;
    let rgb = image.to_rgb8();

    match &config.affine_points {
        Some(quad) => rectify(&rgb, quad, width, height),
        None => {
            if rgb.dimensions() != (width, height) {
                return Err(EngineError::ShapeMismatch {
                    expected: (height as usize, width as usize),
                    got: (rgb.height() as usize, rgb.width() as usize),
                });
            }
            Ok(rgb)
        }
    }
}

/// Convert image to NCHW tensor, RGB order scaled to [0, 1]
pub fn image_to_nchw(image: &RgbImage) -> Array4<f32> {
    let (width, height) = image.dimensions();

    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }

    tensor
}

/// Warp the quad `(TL, TR, BR, BL)` of `src` onto a `width x height` image.
pub fn rectify(src: &RgbImage, quad: &[[f32; 2]; 4], width: u32, height: u32) -> Result<RgbImage> {
    if quad_area(quad) < 1.0 {
        return Err(EngineError::InvalidConfig(
            "affine_points form a degenerate quad".to_string(),
        ));
    }

    let (w, h) = (width as f32, height as f32);
    let target = [[0.0, 0.0], [w, 0.0], [w, h], [0.0, h]];

    let forward = perspective_transform(quad, &target)?;
    let inverse = forward.try_inverse().ok_or_else(|| {
        EngineError::InvalidConfig("affine_points form a degenerate quad".to_string())
    })?;

    debug!("Rectifying {:?} to {}x{}", src.dimensions(), width, height);

    let mut dst = RgbImage::new(width, height);
    let row_len = width as usize * 3;
    let buffer: &mut [u8] = &mut dst;
    buffer
        .par_chunks_mut(row_len)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..width as usize {
                let p = inverse * Vector3::new(x as f32, y as f32, 1.0);
                let pixel = if p.z.abs() > f32::EPSILON {
                    sample_bilinear(src, p.x / p.z, p.y / p.z)
                } else {
                    Rgb([0, 0, 0])
                };
                row[x * 3..x * 3 + 3].copy_from_slice(&pixel.0);
            }
        });

    Ok(dst)
}

/// Shoelace area of the quad
fn quad_area(quad: &[[f32; 2]; 4]) -> f32 {
    let mut twice = 0.0;
    for i in 0..4 {
        let [x0, y0] = quad[i];
        let [x1, y1] = quad[(i + 1) % 4];
        twice += x0 * y1 - x1 * y0;
    }
    (twice / 2.0).abs()
}

/// Solve the 8 unknowns of the homography mapping `from` onto `to`.
fn perspective_transform(from: &[[f32; 2]; 4], to: &[[f32; 2]; 4]) -> Result<Matrix3<f32>> {
    let mut a = DMatrix::<f32>::zeros(8, 8);
    let mut b = DVector::<f32>::zeros(8);

    for (i, (src, dst)) in from.iter().zip(to.iter()).enumerate() {
        let (x, y) = (src[0], src[1]);
        let (u, v) = (dst[0], dst[1]);

        let rx = [x, y, 1.0, 0.0, 0.0, 0.0, -x * u, -y * u];
        let ry = [0.0, 0.0, 0.0, x, y, 1.0, -x * v, -y * v];
        for col in 0..8 {
            a[(2 * i, col)] = rx[col];
            a[(2 * i + 1, col)] = ry[col];
        }
        b[2 * i] = u;
        b[2 * i + 1] = v;
    }

    let h = a.lu().solve(&b).ok_or_else(|| {
        EngineError::InvalidConfig("affine_points do not define a perspective transform".to_string())
    })?;

    Ok(Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0))
}

/// Bilinear sample with a black border outside the source
fn sample_bilinear(src: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = src.dimensions();
    if x < 0.0 || y < 0.0 || x > (w - 1) as f32 || y > (h - 1) as f32 {
        return Rgb([0, 0, 0]);
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = src.get_pixel(x0, y0);
    let p10 = src.get_pixel(x1, y0);
    let p01 = src.get_pixel(x0, y1);
    let p11 = src.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Decode image from bytes with EXIF orientation handling
pub fn decode_image(data: &[u8]) -> Result<DynamicImage> {
    let image = image::load_from_memory(data)?;

    Ok(apply_exif_orientation(data, image))
}

/// Apply EXIF orientation to correct image rotation
fn apply_exif_orientation(data: &[u8], image: DynamicImage) -> DynamicImage {
    use std::io::Cursor;

    let orientation = match exif::Reader::new().read_from_container(&mut Cursor::new(data)) {
        Ok(exif_data) => exif_data
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1) as u8,
        Err(_) => 1,
    };

    // See: https://exiftool.org/TagNames/EXIF.html (Orientation)
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}
