//! Greyscale morphology and edge primitives used by the threshold chains.

use std::collections::VecDeque;

use image::{GrayImage, Luma};

/// `255` where `v > thresh`, else `0`.
pub fn threshold_binary(src: &GrayImage, thresh: f64) -> GrayImage {
    map_pixels(src, |v| if v as f64 > thresh { 255 } else { 0 })
}

/// Keeps `v` where `v > thresh`, else `0`.
pub fn threshold_to_zero(src: &GrayImage, thresh: f64) -> GrayImage {
    map_pixels(src, |v| if v as f64 > thresh { v } else { 0 })
}

pub fn invert(src: &GrayImage) -> GrayImage {
    map_pixels(src, |v| 255 - v)
}

fn map_pixels(src: &GrayImage, f: impl Fn(u8) -> u8) -> GrayImage {
    let (w, h) = src.dimensions();
    let data = src.as_raw().iter().map(|&v| f(v)).collect();
    GrayImage::from_raw(w, h, data).unwrap_or_else(|| GrayImage::new(w, h))
}

/// Median over a `ksize` x `ksize` window with replicated borders, using a
/// sliding histogram per row.
pub fn median_blur(src: &GrayImage, ksize: u32) -> GrayImage {
    let (w, h) = src.dimensions();
    if w == 0 || h == 0 || ksize < 3 {
        return src.clone();
    }
    let r = (ksize / 2) as i64;
    let half = (ksize * ksize / 2) as u32;
    let at = |x: i64, y: i64| -> u8 {
        let x = x.clamp(0, w as i64 - 1) as u32;
        let y = y.clamp(0, h as i64 - 1) as u32;
        src.get_pixel(x, y).0[0]
    };

    let mut out = GrayImage::new(w, h);
    for y in 0..h as i64 {
        let mut hist = [0u32; 256];
        for dy in -r..=r {
            for dx in -r..=r {
                hist[at(dx, y + dy) as usize] += 1;
            }
        }
        for x in 0..w as i64 {
            if x > 0 {
                for dy in -r..=r {
                    hist[at(x - r - 1, y + dy) as usize] -= 1;
                    hist[at(x + r, y + dy) as usize] += 1;
                }
            }
            let mut seen = 0u32;
            let mut median = 0u8;
            for (v, &count) in hist.iter().enumerate() {
                seen += count;
                if seen > half {
                    median = v as u8;
                    break;
                }
            }
            out.put_pixel(x as u32, y as u32, Luma([median]));
        }
    }
    out
}

/// Canny edge detection: 3x3 Sobel, L1 magnitude, non-maximum suppression
/// and hysteresis between `low` and `high`.
pub fn canny(src: &GrayImage, low: f32, high: f32) -> GrayImage {
    let (w, h) = src.dimensions();
    let mut out = GrayImage::new(w, h);
    if w == 0 || h == 0 {
        return out;
    }
    let (wi, hi) = (w as i64, h as i64);
    let px = |x: i64, y: i64| -> i32 {
        src.get_pixel(x.clamp(0, wi - 1) as u32, y.clamp(0, hi - 1) as u32).0[0] as i32
    };

    let n = (w * h) as usize;
    let mut gx = vec![0i32; n];
    let mut gy = vec![0i32; n];
    let mut mag = vec![0i32; n];
    for y in 0..hi {
        for x in 0..wi {
            let dx = (px(x + 1, y - 1) + 2 * px(x + 1, y) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2 * px(x - 1, y) + px(x - 1, y + 1));
            let dy = (px(x - 1, y + 1) + 2 * px(x, y + 1) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2 * px(x, y - 1) + px(x + 1, y - 1));
            let i = (y * wi + x) as usize;
            gx[i] = dx;
            gy[i] = dy;
            mag[i] = dx.abs() + dy.abs();
        }
    }
    let m = |x: i64, y: i64| -> i32 {
        if x < 0 || y < 0 || x >= wi || y >= hi {
            0
        } else {
            mag[(y * wi + x) as usize]
        }
    };

    // 0 = suppressed, 1 = weak, 2 = strong
    let mut class = vec![0u8; n];
    let tan22 = 0.414_213_56f32;
    let tan67 = 2.414_213_6f32;
    let mut stack = Vec::new();
    for y in 0..hi {
        for x in 0..wi {
            let i = (y * wi + x) as usize;
            let v = mag[i];
            if (v as f32) <= low {
                continue;
            }
            let (ax, ay) = (gx[i].abs() as f32, gy[i].abs() as f32);
            let is_max = if ay < ax * tan22 {
                v > m(x - 1, y) && v >= m(x + 1, y)
            } else if ay > ax * tan67 {
                v > m(x, y - 1) && v >= m(x, y + 1)
            } else {
                let s = if (gx[i] < 0) != (gy[i] < 0) { -1 } else { 1 };
                v > m(x - s, y - 1) && v > m(x + s, y + 1)
            };
            if !is_max {
                continue;
            }
            if v as f32 > high {
                class[i] = 2;
                stack.push((x, y));
            } else {
                class[i] = 1;
            }
        }
    }

    while let Some((x, y)) = stack.pop() {
        out.put_pixel(x as u32, y as u32, Luma([255]));
        for dy in -1..=1 {
            for dx in -1..=1 {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= wi || ny >= hi {
                    continue;
                }
                let j = (ny * wi + nx) as usize;
                if class[j] == 1 {
                    class[j] = 2;
                    stack.push((nx, ny));
                }
            }
        }
    }
    out
}

/// Dilation by the 3x3 elliptical (cross-shaped) structuring element.
pub fn dilate_ellipse3(src: &GrayImage) -> GrayImage {
    let (w, h) = src.dimensions();
    let mut out = src.clone();
    for y in 0..h {
        for x in 0..w {
            let mut v = src.get_pixel(x, y).0[0];
            if x > 0 {
                v = v.max(src.get_pixel(x - 1, y).0[0]);
            }
            if x + 1 < w {
                v = v.max(src.get_pixel(x + 1, y).0[0]);
            }
            if y > 0 {
                v = v.max(src.get_pixel(x, y - 1).0[0]);
            }
            if y + 1 < h {
                v = v.max(src.get_pixel(x, y + 1).0[0]);
            }
            out.put_pixel(x, y, Luma([v]));
        }
    }
    out
}

/// 4-connected fill of the region sharing the seed's value.
pub fn flood_fill(img: &mut GrayImage, seed: (u32, u32), value: u8) {
    let (w, h) = img.dimensions();
    if seed.0 >= w || seed.1 >= h {
        return;
    }
    let target = img.get_pixel(seed.0, seed.1).0[0];
    if target == value {
        return;
    }
    let mut queue = VecDeque::from([seed]);
    img.put_pixel(seed.0, seed.1, Luma([value]));
    while let Some((x, y)) = queue.pop_front() {
        let neighbours = [
            (x.wrapping_sub(1), y),
            (x + 1, y),
            (x, y.wrapping_sub(1)),
            (x, y + 1),
        ];
        for (nx, ny) in neighbours {
            if nx < w && ny < h && img.get_pixel(nx, ny).0[0] == target {
                img.put_pixel(nx, ny, Luma([value]));
                queue.push_back((nx, ny));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_are_strict() {
        let img = GrayImage::from_raw(3, 1, vec![99, 100, 101]).unwrap();
        assert_eq!(threshold_binary(&img, 100.0).as_raw(), &vec![0, 0, 255]);
        assert_eq!(threshold_to_zero(&img, 100.0).as_raw(), &vec![0, 0, 101]);
    }

    #[test]
    fn median_removes_salt_noise() {
        let mut img = GrayImage::from_pixel(9, 9, Luma([10]));
        img.put_pixel(4, 4, Luma([255]));
        let out = median_blur(&img, 7);
        assert!(out.pixels().all(|p| p.0[0] == 10));
    }

    #[test]
    fn canny_finds_step_edge() {
        let img = GrayImage::from_fn(16, 8, |x, _| Luma([if x < 8 { 0 } else { 255 }]));
        let edges = canny(&img, 120.0, 120.0);
        let on: Vec<u32> = (0..16).filter(|&x| edges.get_pixel(x, 4).0[0] == 255).collect();
        assert!(!on.is_empty());
        assert!(on.iter().all(|&x| x == 7 || x == 8));
    }

    #[test]
    fn dilate_grows_a_cross() {
        let mut img = GrayImage::new(3, 3);
        img.put_pixel(1, 1, Luma([255]));
        let out = dilate_ellipse3(&img);
        assert_eq!(out.get_pixel(1, 0).0[0], 255);
        assert_eq!(out.get_pixel(0, 1).0[0], 255);
        assert_eq!(out.get_pixel(0, 0).0[0], 0);
    }

    #[test]
    fn flood_fill_stops_at_walls() {
        // Ring of 255 around a 0 centre
        let mut img = GrayImage::from_fn(5, 5, |x, y| {
            let ring = x == 1 || x == 3 || y == 1 || y == 3;
            let inside = (1..=3).contains(&x) && (1..=3).contains(&y);
            Luma([if inside && ring { 255 } else { 0 }])
        });
        flood_fill(&mut img, (0, 0), 255);
        assert_eq!(img.get_pixel(2, 2).0[0], 0);
        assert_eq!(img.get_pixel(4, 4).0[0], 255);
    }
}
