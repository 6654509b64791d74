//! Face alignment to the canonical 112×112 ArcFace crop.
//!
//! The five detected landmarks are mapped onto the ArcFace reference
//! positions with a similarity transform (scale, rotation, translation)
//! estimated in closed form, then the face is resampled bilinearly.

use image::{Rgb, RgbImage};

use super::Landmarks;

/// ArcFace reference landmarks for a 112×112 output
pub const REFERENCE_LANDMARKS_112: Landmarks = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Umeyama's closed-form similarity estimate, specialised to 2D.
///
/// Returns `[a, -b, tx, b, a, ty]`, i.e. the matrix
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
/// For 2×2 covariances the SVD step reduces to an angle: the optimal proper
/// rotation and scale come straight from the covariance entries, and the
/// reflection correction is implicit because only rotations are produced.
fn umeyama(src: &Landmarks, dst: &Landmarks) -> [f32; 6] {
    let n = src.len() as f64;

    let mean = |pts: &Landmarks| {
        let (sx, sy) = pts
            .iter()
            .fold((0.0f64, 0.0f64), |(ax, ay), &(x, y)| (ax + x as f64, ay + y as f64));
        (sx / n, sy / n)
    };
    let (msx, msy) = mean(src);
    let (mdx, mdy) = mean(dst);

    // Source variance and dst×src covariance over centred points
    let mut var_src = 0.0f64;
    let (mut c_xx, mut c_xy, mut c_yx, mut c_yy) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (sx as f64 - msx, sy as f64 - msy);
        let (dx, dy) = (dx as f64 - mdx, dy as f64 - mdy);
        var_src += sx * sx + sy * sy;
        c_xx += dx * sx;
        c_xy += dx * sy;
        c_yx += dy * sx;
        c_yy += dy * sy;
    }
    var_src /= n;
    let (c_xx, c_xy, c_yx, c_yy) = (c_xx / n, c_xy / n, c_yx / n, c_yy / n);

    if var_src < 1e-12 {
        // Degenerate landmarks: translate only
        return [1.0, 0.0, (mdx - msx) as f32, 0.0, 1.0, (mdy - msy) as f32];
    }

    // R = rot(theta) maximises trace(R^T C); scale = trace(S D) / var_src
    let cos_part = c_xx + c_yy;
    let sin_part = c_yx - c_xy;
    let theta = sin_part.atan2(cos_part);
    let scale = cos_part.hypot(sin_part) / var_src;

    let a = scale * theta.cos();
    let b = scale * theta.sin();
    let tx = mdx - (a * msx - b * msy);
    let ty = mdy - (b * msx + a * msy);

    [a as f32, -b as f32, tx as f32, b as f32, a as f32, ty as f32]
}

/// Resample an RGB frame through the inverse of `matrix` into a square
/// output. Out-of-frame samples are black.
fn warp_affine(frame: &RgbImage, matrix: &[f32; 6], out_size: u32) -> RgbImage {
    let (a, tx) = (matrix[0], matrix[2]);
    let (b, ty) = (matrix[3], matrix[5]);
    let mut output = RgbImage::new(out_size, out_size);

    // Inverse of [[a, -b], [b, a]] is [[a, b], [-b, a]] / (a^2 + b^2)
    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return output;
    }
    let ia = a / det;
    let ib = b / det;

    let (width, height) = (frame.width() as i32, frame.height() as i32);
    let sample = |x: i32, y: i32, c: usize| -> f32 {
        if x >= 0 && x < width && y >= 0 && y < height {
            frame.get_pixel(x as u32, y as u32)[c] as f32
        } else {
            0.0
        }
    };

    for oy in 0..out_size {
        for ox in 0..out_size {
            let dx = ox as f32 - tx;
            let dy = oy as f32 - ty;
            let sx = ia * dx + ib * dy;
            let sy = -ib * dx + ia * dy;

            let x0 = sx.floor() as i32;
            let y0 = sy.floor() as i32;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let mut pixel = [0u8; 3];
            for (c, channel) in pixel.iter_mut().enumerate() {
                let val = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                    + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                    + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                    + sample(x0 + 1, y0 + 1, c) * fx * fy;
                *channel = val.round().clamp(0.0, 255.0) as u8;
            }
            output.put_pixel(ox, oy, Rgb(pixel));
        }
    }

    output
}

/// Warp the face described by `landmarks` (frame coordinates) into a
/// 112×112 ArcFace-aligned crop
pub fn align_face(frame: &RgbImage, landmarks: &Landmarks) -> RgbImage {
    let matrix = umeyama(landmarks, &REFERENCE_LANDMARKS_112);
    warp_affine(frame, &matrix, ALIGNED_SIZE)
}
