//! Grayscale image primitives shared by the detector and descriptor builder:
//! cropping, bilinear resize and Canny edge detection.
//!
//! Images are row-major `u8` buffers of `width * height` bytes.

use crate::types::FaceRegion;

/// Value written for edge pixels in a Canny edge map.
pub const EDGE: u8 = 255;

/// tan(22.5°) and tan(67.5°), for quantizing gradient direction.
const TAN_22_5: f32 = 0.414_213_57;
const TAN_67_5: f32 = 2.414_213_6;

/// Copy `region` out of a `width`-wide image.
pub fn crop(gray: &[u8], width: u32, region: &FaceRegion) -> Vec<u8> {
    let w = width as usize;
    let (x0, y0) = (region.x as usize, region.y as usize);
    let (rw, rh) = (region.width as usize, region.height as usize);

    let mut out = Vec::with_capacity(rw * rh);
    for y in y0..y0 + rh {
        out.extend_from_slice(&gray[y * w + x0..y * w + x0 + rw]);
    }
    out
}

/// Resize with bilinear interpolation using pixel-center alignment.
///
/// Deterministic for a given input, so enrollment and query crops resample
/// identically.
pub fn resize_bilinear(src: &[u8], width: usize, height: usize, new_w: usize, new_h: usize) -> Vec<u8> {
    if width == 0 || height == 0 || new_w == 0 || new_h == 0 {
        return vec![0u8; new_w * new_h];
    }

    let scale_x = width as f32 / new_w as f32;
    let scale_y = height as f32 / new_h as f32;

    let mut resized = vec![0u8; new_w * new_h];
    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = src[y0 * width + x0] as f32;
            let tr = src[y0 * width + x1] as f32;
            let bl = src[y1 * width + x0] as f32;
            let br = src[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            resized[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    resized
}

/// Two-threshold Canny edge detector.
///
/// 3×3 Sobel gradients (replicated border), L1 magnitude `|gx| + |gy|`,
/// non-maximum suppression along the quantized gradient direction, then
/// hysteresis: pixels above `high` seed edges, pixels above `low` join an
/// edge when 8-connected to one. Output is 0 or [`EDGE`] per pixel.
pub fn canny(gray: &[u8], width: usize, height: usize, low: f32, high: f32) -> Vec<u8> {
    let n = width * height;
    let mut edges = vec![0u8; n];
    if width == 0 || height == 0 {
        return edges;
    }

    let (gx, gy) = sobel(gray, width, height);
    let mag: Vec<f32> = gx.iter().zip(&gy).map(|(x, y)| (x.abs() + y.abs()) as f32).collect();
    let mag_at = |x: i64, y: i64| -> f32 {
        if x < 0 || y < 0 || x >= width as i64 || y >= height as i64 {
            0.0
        } else {
            mag[y as usize * width + x as usize]
        }
    };

    // 0 = not an edge, 1 = weak candidate, 2 = edge.
    let mut state = vec![0u8; n];
    let mut stack: Vec<usize> = Vec::new();

    for y in 0..height {
        for x in 0..width {
            let i = y * width + x;
            let m = mag[i];
            if m <= low {
                continue;
            }

            let ax = gx[i].abs() as f32;
            let ay = gy[i].abs() as f32;
            let (xi, yi) = (x as i64, y as i64);

            let is_max = if ay < ax * TAN_22_5 {
                m > mag_at(xi - 1, yi) && m >= mag_at(xi + 1, yi)
            } else if ay > ax * TAN_67_5 {
                m > mag_at(xi, yi - 1) && m >= mag_at(xi, yi + 1)
            } else {
                let s: i64 = if (gx[i] < 0) != (gy[i] < 0) { -1 } else { 1 };
                m > mag_at(xi - s, yi - 1) && m > mag_at(xi + s, yi + 1)
            };

            if !is_max {
                continue;
            }

            if m > high {
                state[i] = 2;
                stack.push(i);
            } else {
                state[i] = 1;
            }
        }
    }

    while let Some(i) = stack.pop() {
        let (x, y) = ((i % width) as i64, (i / width) as i64);
        for dy in -1..=1i64 {
            for dx in -1..=1i64 {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                    continue;
                }
                let j = ny as usize * width + nx as usize;
                if state[j] == 1 {
                    state[j] = 2;
                    stack.push(j);
                }
            }
        }
    }

    for (e, s) in edges.iter_mut().zip(&state) {
        if *s == 2 {
            *e = EDGE;
        }
    }
    edges
}

/// 3×3 Sobel derivatives with a replicated border.
fn sobel(gray: &[u8], width: usize, height: usize) -> (Vec<i32>, Vec<i32>) {
    let px = |x: i64, y: i64| -> i32 {
        let cx = x.clamp(0, width as i64 - 1) as usize;
        let cy = y.clamp(0, height as i64 - 1) as usize;
        gray[cy * width + cx] as i32
    };

    let mut gx = vec![0i32; width * height];
    let mut gy = vec![0i32; width * height];

    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let i = y as usize * width + x as usize;
            gx[i] = (px(x + 1, y - 1) + 2 * px(x + 1, y) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2 * px(x - 1, y) + px(x - 1, y + 1));
            gy[i] = (px(x - 1, y + 1) + 2 * px(x, y + 1) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2 * px(x, y - 1) + px(x + 1, y - 1));
        }
    }

    (gx, gy)
}
