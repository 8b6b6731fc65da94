use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};

use super::frame::{Frame, PixelFormat};
use crate::error::CaptureError;

/// Decode a raw device buffer into a packed frame the pipeline can process.
///
/// MJPEG and YUYV are expanded to RGB; packed formats pass through.
pub fn decode_frame(
    data: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
    sequence: u64,
) -> Result<Frame, CaptureError> {
    match format {
        PixelFormat::Mjpeg => {
            let mut decoder = Decoder::new(data);
            let pixels = decoder
                .decode()
                .map_err(|e| CaptureError::Decode(e.to_string()))?;
            let info = decoder
                .info()
                .ok_or_else(|| CaptureError::Decode("missing JPEG header".into()))?;
            let (w, h) = (info.width as u32, info.height as u32);
            match info.pixel_format {
                JpegPixelFormat::L8 => Ok(Frame::from_pixels(pixels, w, h, PixelFormat::Gray8, sequence)),
                JpegPixelFormat::RGB24 => Ok(Frame::from_pixels(pixels, w, h, PixelFormat::Rgb24, sequence)),
                other => Err(CaptureError::Decode(format!(
                    "unsupported JPEG pixel format {:?}",
                    other
                ))),
            }
        }
        PixelFormat::Yuyv4 => {
            let expected = (width * height * 2) as usize;
            if data.len() < expected {
                return Err(CaptureError::Decode(format!(
                    "YUYV buffer holds {} bytes, expected {}",
                    data.len(),
                    expected
                )));
            }
            let rgb = yuyv_to_rgb(&data[..expected], width, height);
            Ok(Frame::from_pixels(rgb, width, height, PixelFormat::Rgb24, sequence))
        }
        PixelFormat::Gray8 | PixelFormat::Rgb24 | PixelFormat::Rgba32 => {
            // Already packed
            Ok(Frame::from_pixels(data.to_vec(), width, height, format, sequence))
        }
    }
}

/// YUYV 4:2:2 to RGB24 using integer BT.601 coefficients.
pub fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let pixels = (width * height) as usize;
    let mut rgb = Vec::with_capacity(pixels * 3);
    for quad in data.chunks_exact(4).take(pixels / 2) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    rgb
}

#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

/// Mirror a packed frame buffer in place.
pub fn flip_in_place(data: &mut [u8], width: u32, height: u32, bpp: u32, horiz: bool, vert: bool) {
    let (w, h, bpp) = (width as usize, height as usize, bpp as usize);
    let row = w * bpp;
    if data.len() < row * h {
        return;
    }
    if horiz {
        for y in 0..h {
            let line = &mut data[y * row..(y + 1) * row];
            for x in 0..w / 2 {
                let (a, b) = (x * bpp, (w - 1 - x) * bpp);
                for c in 0..bpp {
                    line.swap(a + c, b + c);
                }
            }
        }
    }
    if vert {
        for y in 0..h / 2 {
            let (top, bottom) = data.split_at_mut((h - 1 - y) * row);
            top[y * row..(y + 1) * row].swap_with_slice(&mut bottom[..row]);
        }
    }
}

/// Apply the configured mirroring to a decoded frame.
pub fn flip_frame(frame: Frame, horiz: bool, vert: bool) -> Frame {
    if !horiz && !vert {
        return frame;
    }
    let Some(bpp) = frame.format().bytes_per_pixel() else {
        return frame;
    };
    let (w, h) = frame.dimensions();
    let mut px = frame.data.to_vec();
    flip_in_place(&mut px, w, h, bpp, horiz, vert);
    Frame::from_pixels(px, w, h, frame.format(), frame.meta.sequence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_grey_maps_to_grey() {
        // Y=128, U=V=128 is mid grey
        let data = [128u8, 128, 128, 128];
        let rgb = yuyv_to_rgb(&data, 2, 1);
        assert_eq!(rgb.len(), 6);
        assert!(rgb.iter().all(|&c| (128..=132).contains(&c)));
    }

    #[test]
    fn short_yuyv_buffer_is_rejected() {
        let err = decode_frame(&[0u8; 4], 4, 4, PixelFormat::Yuyv4, 0);
        assert!(err.is_err());
    }

    #[test]
    fn flips_mirror_pixels() {
        // 2x2 grey: [1 2; 3 4]
        let mut px = vec![1u8, 2, 3, 4];
        flip_in_place(&mut px, 2, 2, 1, true, false);
        assert_eq!(px, vec![2, 1, 4, 3]);
        flip_in_place(&mut px, 2, 2, 1, false, true);
        assert_eq!(px, vec![4, 3, 2, 1]);
    }

    #[test]
    fn flip_frame_mirrors_rgb() {
        let frame = Frame::from_pixels(vec![1, 1, 1, 2, 2, 2], 2, 1, PixelFormat::Rgb24, 0);
        let flipped = flip_frame(frame, true, false);
        assert_eq!(&flipped.data[..], &[2, 2, 2, 1, 1, 1]);
    }
}
