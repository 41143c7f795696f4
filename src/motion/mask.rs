//! Binary-mask helpers for frame differencing.

use std::collections::VecDeque;

use image::{imageops, GrayImage, Luma};

pub const ON: u8 = 255;

/// Sigma OpenCV derives for a Gaussian kernel of size `ksize`.
pub fn gaussian_sigma(ksize: u32) -> f32 {
    let k = ksize.max(1) as f32;
    0.3 * ((k - 1.0) * 0.5 - 1.0) + 0.8
}

pub fn blur(gray: &GrayImage, ksize: u32) -> GrayImage {
    if ksize <= 1 {
        return gray.clone();
    }
    imageops::blur(gray, gaussian_sigma(ksize))
}

/// Pixels whose absolute difference exceeds `threshold` are set to [`ON`].
pub fn diff_mask(reference: &GrayImage, current: &GrayImage, threshold: u8) -> GrayImage {
    let (w, h) = current.dimensions();
    GrayImage::from_fn(w, h, |x, y| {
        let a = reference.get_pixel(x, y).0[0];
        let b = current.get_pixel(x, y).0[0];
        if a.abs_diff(b) > threshold {
            Luma([ON])
        } else {
            Luma([0])
        }
    })
}

/// 3x3 dilation applied `iterations` times.
pub fn dilate(mask: &GrayImage, iterations: u32) -> GrayImage {
    let mut current = mask.clone();
    let (w, h) = mask.dimensions();

    for _ in 0..iterations {
        let src = current;
        current = GrayImage::from_fn(w, h, |x, y| {
            let x0 = x.saturating_sub(1);
            let y0 = y.saturating_sub(1);
            let x1 = (x + 1).min(w - 1);
            let y1 = (y + 1).min(h - 1);
            for ny in y0..=y1 {
                for nx in x0..=x1 {
                    if src.get_pixel(nx, ny).0[0] == ON {
                        return Luma([ON]);
                    }
                }
            }
            Luma([0])
        });
    }
    current
}

/// True as soon as one 8-connected region reaches `min_area` pixels.
///
/// The scan stops at the first qualifying region.
pub fn has_region_at_least(mask: &GrayImage, min_area: u32) -> bool {
    let (w, h) = (mask.width() as usize, mask.height() as usize);
    let raw = mask.as_raw();
    let mut visited = vec![false; w * h];
    let mut queue = VecDeque::new();

    for start in 0..w * h {
        if visited[start] || raw[start] != ON {
            continue;
        }

        visited[start] = true;
        queue.clear();
        queue.push_back(start);
        let mut area = 0u32;

        while let Some(idx) = queue.pop_front() {
            area += 1;
            if area >= min_area {
                return true;
            }

            let (x, y) = ((idx % w) as isize, (idx / w) as isize);
            for dy in -1..=1isize {
                for dx in -1..=1isize {
                    let (nx, ny) = (x + dx, y + dy);
                    if nx < 0 || ny < 0 || nx >= w as isize || ny >= h as isize {
                        continue;
                    }
                    let n = ny as usize * w + nx as usize;
                    if !visited[n] && raw[n] == ON {
                        visited[n] = true;
                        queue.push_back(n);
                    }
                }
            }
        }
    }
    false
}
