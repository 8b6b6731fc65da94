use image::{GrayImage, RgbImage};
use once_cell::sync::Lazy;

/// JET lookup: dark blue at 0 through cyan, yellow, to dark red at 255.
static JET: Lazy<[[u8; 3]; 256]> = Lazy::new(|| {
    let mut lut = [[0u8; 3]; 256];
    for (i, entry) in lut.iter_mut().enumerate() {
        let v = i as f32 / 255.0;
        let ramp = |centre: f32| ((1.5 - (4.0 * v - centre).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
        *entry = [ramp(3.0), ramp(2.0), ramp(1.0)];
    }
    lut
});

pub fn jet(v: u8) -> [u8; 3] {
    JET[v as usize]
}

pub fn apply_jet(src: &GrayImage) -> RgbImage {
    let (w, h) = src.dimensions();
    RgbImage::from_fn(w, h, |x, y| image::Rgb(jet(src.get_pixel(x, y).0[0])))
}

/// Stretch `[floor, 255]` onto `[0, 255]`, saturating below the floor.
pub fn remap_from(src: &GrayImage, floor: u8) -> GrayImage {
    let span = 255.0 - floor as f32;
    let scale = if span > 0.0 { 255.0 / span } else { 255.0 };
    let (w, h) = src.dimensions();
    GrayImage::from_fn(w, h, |x, y| {
        let v = src.get_pixel(x, y).0[0] as f32 - floor as f32;
        image::Luma([(v * scale).round().clamp(0.0, 255.0) as u8])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jet_endpoints() {
        let lo = jet(0);
        let hi = jet(255);
        assert_eq!(lo[0], 0);
        assert!(lo[2] > 100, "low end is blue");
        assert!(hi[0] > 100, "high end is red");
        assert_eq!(hi[2], 0);
    }

    #[test]
    fn remap_stretches_upper_range() {
        let img = GrayImage::from_raw(3, 1, vec![100, 177, 255]).unwrap();
        let out = remap_from(&img, 100);
        assert_eq!(out.as_raw(), &vec![0, 127, 255]);
    }
}
