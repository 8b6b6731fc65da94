//! Snapshot caption burn-in with a built-in 5x7 bitmap font.

use image::RgbImage;

use crate::capture::{Frame, PixelFormat};

const GLYPH_W: u32 = 5;
const GLYPH_H: u32 = 7;
const SCALE: u32 = 2;
const ADVANCE: u32 = (GLYPH_W + 1) * SCALE;

/// Left edge of the caption.
pub const CAPTION_X: u32 = 20;
/// Distance from the bottom edge to the caption baseline.
pub const CAPTION_BOTTOM: u32 = 30;
pub const CAPTION_RGB: [u8; 3] = [0xFF, 0x00, 0xFF];

/// Rows of a glyph, top first, low five bits used. Lowercase letters share
/// the uppercase shapes; anything unknown draws as `?`.
fn glyph(c: char) -> [u8; 7] {
    match c.to_ascii_uppercase() {
        ' ' => [0; 7],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        'A' => [0x0E, 0x11, 0x11, 0x11, 0x1F, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        ',' => [0x00, 0x00, 0x00, 0x00, 0x0C, 0x04, 0x08],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        ';' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x04, 0x08],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        '/' => [0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x00],
        '(' => [0x02, 0x04, 0x08, 0x08, 0x08, 0x04, 0x02],
        ')' => [0x08, 0x04, 0x02, 0x02, 0x02, 0x04, 0x08],
        '[' => [0x0E, 0x08, 0x08, 0x08, 0x08, 0x08, 0x0E],
        ']' => [0x0E, 0x02, 0x02, 0x02, 0x02, 0x02, 0x0E],
        '!' => [0x04, 0x04, 0x04, 0x04, 0x04, 0x00, 0x04],
        '+' => [0x00, 0x04, 0x04, 0x1F, 0x04, 0x04, 0x00],
        '=' => [0x00, 0x00, 0x1F, 0x00, 0x1F, 0x00, 0x00],
        '#' => [0x0A, 0x0A, 0x1F, 0x0A, 0x1F, 0x0A, 0x0A],
        '%' => [0x18, 0x19, 0x02, 0x04, 0x08, 0x13, 0x03],
        '*' => [0x00, 0x04, 0x15, 0x0E, 0x15, 0x04, 0x00],
        '<' => [0x02, 0x04, 0x08, 0x10, 0x08, 0x04, 0x02],
        '>' => [0x08, 0x04, 0x02, 0x01, 0x02, 0x04, 0x08],
        '&' => [0x0C, 0x12, 0x14, 0x08, 0x15, 0x12, 0x0D],
        '@' => [0x0E, 0x11, 0x01, 0x0D, 0x15, 0x15, 0x0E],
        '\'' => [0x04, 0x04, 0x08, 0x00, 0x00, 0x00, 0x00],
        '"' => [0x0A, 0x0A, 0x00, 0x00, 0x00, 0x00, 0x00],
        _ => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x00, 0x04],
    }
}

/// Calls `plot(x, y)` for every lit pixel of `text` laid out at the caption
/// position of a `width` x `height` image. Pixels off the image are skipped.
fn for_each_lit(text: &str, width: u32, height: u32, mut plot: impl FnMut(u32, u32)) {
    let top = height as i64 - CAPTION_BOTTOM as i64 - (GLYPH_H * SCALE) as i64;
    let mut left = CAPTION_X as i64;
    for c in text.chars() {
        if left >= width as i64 {
            break;
        }
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_W {
                if bits & (0x10 >> col) == 0 {
                    continue;
                }
                for sy in 0..SCALE {
                    for sx in 0..SCALE {
                        let x = left + (col * SCALE + sx) as i64;
                        let y = top + (row as u32 * SCALE + sy) as i64;
                        if x >= 0 && y >= 0 && x < width as i64 && y < height as i64 {
                            plot(x as u32, y as u32);
                        }
                    }
                }
            }
        }
        left += ADVANCE as i64;
    }
}

/// Draw `text` in place. Used on the video path, where the buffer is
/// already a private conversion.
pub fn burn_rgb(img: &mut RgbImage, text: &str) {
    if text.is_empty() {
        return;
    }
    let (w, h) = img.dimensions();
    for_each_lit(text, w, h, |x, y| img.put_pixel(x, y, image::Rgb(CAPTION_RGB)));
}

/// A captioned copy of `frame`. The shared frame is left untouched.
/// Greyscale frames get the caption in white.
pub fn captioned(frame: &Frame, text: &str) -> Frame {
    if text.is_empty() || frame.is_empty() {
        return frame.clone();
    }
    let (w, h) = frame.dimensions();
    let seq = frame.meta.sequence;
    match frame.format() {
        PixelFormat::Gray8 => match frame.to_luma8() {
            Some(mut grey) => {
                for_each_lit(text, w, h, |x, y| grey.put_pixel(x, y, image::Luma([255])));
                Frame::from_gray(grey, seq)
            }
            None => frame.clone(),
        },
        PixelFormat::Rgba32 => {
            let mut px = frame.data[..(w * h * 4) as usize].to_vec();
            for_each_lit(text, w, h, |x, y| {
                let i = ((y * w + x) * 4) as usize;
                px[i..i + 4].copy_from_slice(&[CAPTION_RGB[0], CAPTION_RGB[1], CAPTION_RGB[2], 255]);
            });
            Frame::from_pixels(px, w, h, PixelFormat::Rgba32, seq)
        }
        _ => match frame.to_rgb8() {
            Some(mut rgb) => {
                burn_rgb(&mut rgb, text);
                Frame::from_rgb(rgb, seq)
            }
            None => frame.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    #[test]
    fn caption_lands_above_bottom_margin() {
        let mut img = RgbImage::new(200, 100);
        burn_rgb(&mut img, "A");
        let lit: Vec<(u32, u32)> = img
            .enumerate_pixels()
            .filter(|(_, _, p)| p.0 == CAPTION_RGB)
            .map(|(x, y, _)| (x, y))
            .collect();
        assert!(!lit.is_empty());
        assert!(lit.iter().all(|&(x, y)| x >= CAPTION_X && y < 100 - CAPTION_BOTTOM));
    }

    #[test]
    fn captioned_copy_leaves_source_alone() {
        let frame = Frame::from_gray(GrayImage::from_pixel(120, 80, Luma([0])), 4);
        let before = frame.data.clone();
        let out = captioned(&frame, "CAM 1");
        assert_eq!(frame.data, before);
        assert_ne!(out.data, frame.data);
        assert_eq!(out.meta.sequence, 4);
    }

    #[test]
    fn tiny_frames_do_not_panic() {
        let mut img = RgbImage::new(4, 4);
        burn_rgb(&mut img, "overflowing caption");
        let frame = Frame::from_gray(GrayImage::new(3, 3), 0);
        let _ = captioned(&frame, "x");
    }
}
