//! Face alignment via 4-DOF similarity transform.
//!
//! Aligns detected faces to a canonical square crop using the five InsightFace
//! reference landmarks and least-squares estimation, and pastes processed
//! crops back into the original image.

use image::RgbImage;

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// Width of the blended border on paste-back, as a fraction of the crop size.
const PASTE_FEATHER_RATIO: f32 = 0.1;

/// Reference landmark positions for a `size`×`size` aligned crop.
///
/// Sizes that are a multiple of 112 scale the ArcFace template directly.
/// Other sizes scale by `size / 128` and shift right by `8 * ratio`, which is
/// the layout the 128×128 swap network was trained on.
pub fn reference_landmarks(size: usize) -> [(f32, f32); 5] {
    let (ratio, diff_x) = if size % 112 == 0 {
        (size as f32 / 112.0, 0.0)
    } else {
        let ratio = size as f32 / 128.0;
        (ratio, 8.0 * ratio)
    };
    REFERENCE_LANDMARKS_112.map(|(x, y)| (x * ratio + diff_x, y * ratio))
}

/// Estimate a 2×3 similarity transform (4-DOF: scale, rotation, translation)
/// from `src` landmarks to `dst` landmarks using least-squares.
///
/// Returns [a, -b, tx, b, a, ty] representing the matrix:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
pub fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    // Overdetermined system A * [a, b, tx, ty]^T = B, one row pair per point:
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [0.0f32; 16];
    let mut atb = [0.0f32; 4];

    for ((sx, sy), (dx, dy)) in src.iter().copied().zip(dst.iter().copied()) {
        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j * 4 + k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let x = solve_4x4(&ata, &atb);
    let (a, b, tx, ty) = (x[0], x[1], x[2], x[3]);

    [a, -b, tx, b, a, ty]
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: &[f32; 16], atb: &[f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = ata[i * 4 + j];
        }
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut max_row = col;
        let mut max_val = m[col][col].abs();
        for row in (col + 1)..4 {
            if m[row][col].abs() > max_val {
                max_val = m[row][col].abs();
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0];
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    x
}

/// Map a source-space point into aligned space.
fn apply(matrix: &[f32; 6], x: f32, y: f32) -> (f32, f32) {
    (
        matrix[0] * x + matrix[1] * y + matrix[2],
        matrix[3] * x + matrix[4] * y + matrix[5],
    )
}

/// Map an aligned-space point back into source space. `None` for a degenerate matrix.
fn apply_inverse(matrix: &[f32; 6], x: f32, y: f32) -> Option<(f32, f32)> {
    let (a, tx) = (matrix[0], matrix[2]);
    let (b, ty) = (matrix[3], matrix[5]);

    // M = [[a, -b], [b, a]], det = a^2 + b^2
    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return None;
    }
    let ia = a / det;
    let ib = b / det;

    let dx = x - tx;
    let dy = y - ty;
    Some((ia * dx + ib * dy, -ib * dx + ia * dy))
}

/// Bilinear sample of channel `c` from an interleaved buffer. Out-of-bounds taps read 0.
fn sample_bilinear(
    pixels: &[u8],
    channels: usize,
    width: usize,
    height: usize,
    x: f32,
    y: f32,
    c: usize,
) -> f32 {
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let tap = |x: i32, y: i32| -> f32 {
        if x >= 0 && x < width as i32 && y >= 0 && y < height as i32 {
            pixels[(y as usize * width + x as usize) * channels + c] as f32
        } else {
            0.0
        }
    };

    tap(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + tap(x0 + 1, y0) * fx * (1.0 - fy)
        + tap(x0, y0 + 1) * (1.0 - fx) * fy
        + tap(x0 + 1, y0 + 1) * fx * fy
}

/// Apply a 2×3 similarity warp to an interleaved image, producing an
/// `out_size`×`out_size` crop with the same channel count.
///
/// Uses bilinear interpolation. Out-of-bounds pixels are filled with 0 (black).
pub fn warp_affine(
    pixels: &[u8],
    channels: usize,
    src_width: usize,
    src_height: usize,
    matrix: &[f32; 6],
    out_size: usize,
) -> Vec<u8> {
    let mut output = vec![0u8; out_size * out_size * channels];

    for oy in 0..out_size {
        for ox in 0..out_size {
            let Some((sx, sy)) = apply_inverse(matrix, ox as f32, oy as f32) else {
                return output;
            };
            for c in 0..channels {
                let val = sample_bilinear(pixels, channels, src_width, src_height, sx, sy, c);
                output[(oy * out_size + ox) * channels + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    output
}

/// Align a detected face to a canonical `size`×`size` RGB crop.
///
/// Returns the interleaved RGB crop together with the transform that maps
/// image coordinates into crop coordinates, for use with [`paste_back`].
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5], size: usize) -> (Vec<u8>, [f32; 6]) {
    let matrix = estimate_similarity_transform(landmarks, &reference_landmarks(size));
    let crop = warp_affine(
        image.as_raw(),
        3,
        image.width() as usize,
        image.height() as usize,
        &matrix,
        size,
    );
    (crop, matrix)
}

/// Blend a processed `size`×`size` RGB crop back into `target`.
///
/// `matrix` is the image → crop transform returned by [`align_face`]. Pixels
/// near the crop border are feathered into the original so no seam shows.
pub fn paste_back(target: &mut RgbImage, crop: &[u8], size: usize, matrix: &[f32; 6]) {
    let (width, height) = target.dimensions();
    if width == 0 || height == 0 || crop.len() < size * size * 3 {
        return;
    }

    // Region of the target covered by the crop.
    let edge = (size - 1) as f32;
    let mut corners = Vec::with_capacity(4);
    for (cx, cy) in [(0.0, 0.0), (edge, 0.0), (0.0, edge), (edge, edge)] {
        match apply_inverse(matrix, cx, cy) {
            Some(p) => corners.push(p),
            None => return,
        }
    }
    let min_x = corners.iter().map(|p| p.0).fold(f32::INFINITY, f32::min);
    let max_x = corners.iter().map(|p| p.0).fold(f32::NEG_INFINITY, f32::max);
    let min_y = corners.iter().map(|p| p.1).fold(f32::INFINITY, f32::min);
    let max_y = corners.iter().map(|p| p.1).fold(f32::NEG_INFINITY, f32::max);

    let x0 = min_x.floor().max(0.0) as u32;
    let y0 = min_y.floor().max(0.0) as u32;
    let x1 = (max_x.ceil().max(0.0) as u32).min(width - 1);
    let y1 = (max_y.ceil().max(0.0) as u32).min(height - 1);

    let feather = (size as f32 * PASTE_FEATHER_RATIO).max(1.0);

    for y in y0..=y1 {
        for x in x0..=x1 {
            let (ax, ay) = apply(matrix, x as f32, y as f32);
            if ax < 0.0 || ay < 0.0 || ax > edge || ay > edge {
                continue;
            }
            let border = ax.min(ay).min(edge - ax).min(edge - ay);
            let alpha = (border / feather).clamp(0.0, 1.0);
            if alpha <= 0.0 {
                continue;
            }

            let pixel = target.get_pixel_mut(x, y);
            for c in 0..3 {
                let swapped = sample_bilinear(crop, 3, size, size, ax, ay, c);
                let blended = alpha * swapped + (1.0 - alpha) * pixel[c] as f32;
                pixel[c] = blended.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}
