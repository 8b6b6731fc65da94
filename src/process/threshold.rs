//! Threshold selection: Yen's criterion, CLAHE equalization, mean + 2 sigma.

use image::GrayImage;

pub const CLAHE_CLIP_LIMIT: f32 = 2.7;
pub const CLAHE_TILES: u32 = 8;

/// 256-bin intensity histogram.
pub fn histogram(img: &GrayImage) -> [u32; 256] {
    let mut hist = [0u32; 256];
    for &v in img.as_raw() {
        hist[v as usize] += 1;
    }
    hist
}

/// Yen's maximum-correlation threshold.
///
/// Yen J.C., Chang F.J., Chang S. (1995) "A New Criterion for Automatic
/// Multilevel Thresholding", IEEE Trans. Image Processing 4(3).
pub fn yen_threshold(hist: &[u32; 256]) -> u8 {
    let total: u64 = hist.iter().map(|&c| c as u64).sum();
    if total == 0 {
        return 0;
    }
    let norm: Vec<f64> = hist.iter().map(|&c| c as f64 / total as f64).collect();

    let mut p1 = [0f64; 256];
    let mut p1_sq = [0f64; 256];
    p1[0] = norm[0];
    p1_sq[0] = norm[0] * norm[0];
    for i in 1..256 {
        p1[i] = p1[i - 1] + norm[i];
        p1_sq[i] = p1_sq[i - 1] + norm[i] * norm[i];
    }

    let mut p2_sq = [0f64; 256];
    for i in (0..255).rev() {
        p2_sq[i] = p2_sq[i + 1] + norm[i + 1] * norm[i + 1];
    }

    let mut best = 0u8;
    let mut max_crit = f64::NEG_INFINITY;
    for i in 0..256 {
        let sq = p1_sq[i] * p2_sq[i];
        let spread = p1[i] * (1.0 - p1[i]);
        let crit = -(if sq > 0.0 { sq.ln() } else { 0.0 })
            + 2.0 * (if spread > 0.0 { spread.ln() } else { 0.0 });
        if crit > max_crit {
            max_crit = crit;
            best = i as u8;
        }
    }
    best
}

/// Mean and population standard deviation of the intensities.
pub fn mean_std_dev(img: &GrayImage) -> (f64, f64) {
    let px = img.as_raw();
    if px.is_empty() {
        return (0.0, 0.0);
    }
    let n = px.len() as f64;
    let mean = px.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = px
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (mean, var.sqrt())
}

/// Contrast-limited adaptive histogram equalization over a `tiles` x `tiles`
/// grid, bilinearly blending the per-tile lookup tables.
pub fn clahe(src: &GrayImage, clip_limit: f32, tiles: u32) -> GrayImage {
    let (w, h) = src.dimensions();
    if w == 0 || h == 0 {
        return src.clone();
    }
    let tx = tiles.clamp(1, w);
    let ty = tiles.clamp(1, h);
    let tile_w = w as f32 / tx as f32;
    let tile_h = h as f32 / ty as f32;

    let mut luts = vec![[0u8; 256]; (tx * ty) as usize];
    for j in 0..ty {
        for i in 0..tx {
            let x0 = i * w / tx;
            let x1 = (i + 1) * w / tx;
            let y0 = j * h / ty;
            let y1 = (j + 1) * h / ty;
            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[src.get_pixel(x, y).0[0] as usize] += 1;
                }
            }
            let area = (x1 - x0) * (y1 - y0);
            luts[(j * tx + i) as usize] = clipped_lut(&mut hist, area, clip_limit);
        }
    }

    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        let fy = (y as f32 + 0.5) / tile_h - 0.5;
        let j0 = (fy.floor().max(0.0) as u32).min(ty - 1);
        let j1 = (j0 + 1).min(ty - 1);
        let ay = (fy - j0 as f32).clamp(0.0, 1.0);
        for x in 0..w {
            let fx = (x as f32 + 0.5) / tile_w - 0.5;
            let i0 = (fx.floor().max(0.0) as u32).min(tx - 1);
            let i1 = (i0 + 1).min(tx - 1);
            let ax = (fx - i0 as f32).clamp(0.0, 1.0);

            let v = src.get_pixel(x, y).0[0] as usize;
            let lut = |i: u32, j: u32| luts[(j * tx + i) as usize][v] as f32;
            let top = lut(i0, j0) * (1.0 - ax) + lut(i1, j0) * ax;
            let bottom = lut(i0, j1) * (1.0 - ax) + lut(i1, j1) * ax;
            let value = top * (1.0 - ay) + bottom * ay;
            out.put_pixel(x, y, image::Luma([value.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

fn clipped_lut(hist: &mut [u32; 256], area: u32, clip_limit: f32) -> [u8; 256] {
    let mut lut = [0u8; 256];
    if area == 0 {
        return lut;
    }
    if clip_limit > 0.0 {
        let clip = ((clip_limit * area as f32 / 256.0) as u32).max(1);
        let mut excess = 0u32;
        for bin in hist.iter_mut() {
            if *bin > clip {
                excess += *bin - clip;
                *bin = clip;
            }
        }
        let batch = excess / 256;
        let residual = (excess % 256) as usize;
        for bin in hist.iter_mut() {
            *bin += batch;
        }
        if residual > 0 {
            let step = (256 / residual).max(1);
            for bin in hist.iter_mut().step_by(step).take(residual) {
                *bin += 1;
            }
        }
    }
    let scale = 255.0 / area as f32;
    let mut sum = 0u32;
    for (v, &bin) in hist.iter().enumerate() {
        sum += bin;
        lut[v] = (sum as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }
    lut
}
