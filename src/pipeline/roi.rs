//! Region-of-interest math for blitting a source centered onto a canvas.
//!
//! The blend loop indexes pixels directly, so the destination and source
//! regions are clipped here and always come out the same size and in
//! bounds of their images.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub x: i64,
    pub y: i64,
    pub w: i64,
    pub h: i64,
}

impl Roi {
    pub fn new(x: i64, y: i64, w: i64, h: i64) -> Self {
        Self { x, y, w, h }
    }

    pub fn right(&self) -> i64 {
        self.x + self.w
    }

    pub fn bottom(&self) -> i64 {
        self.y + self.h
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }
}

/// Where a `src_w` x `src_h` image lands when centered on a
/// `canvas_w` x `canvas_h` canvas: `(dst, src)` regions of equal size, or
/// `None` when nothing overlaps.
pub fn centered(canvas_w: u32, canvas_h: u32, src_w: u32, src_h: u32) -> Option<(Roi, Roi)> {
    let canvas = Roi::new(0, 0, canvas_w as i64, canvas_h as i64);
    let (sw, sh) = (src_w as i64, src_h as i64);
    let mut dst = Roi::new((canvas.w - sw) / 2, (canvas.h - sh) / 2, sw, sh);
    let mut src = Roi::new(0, 0, sw, sh);

    // Moving an edge of dst moves the same edge of src.
    if dst.x < 0 {
        src.x -= dst.x;
        dst.w += dst.x;
        src.w = dst.w;
        dst.x = 0;
    }
    if dst.y < 0 {
        src.y -= dst.y;
        dst.h += dst.y;
        src.h = dst.h;
        dst.y = 0;
    }
    if dst.right() > canvas.right() {
        let over = dst.right() - canvas.right();
        dst.w -= over;
        src.w -= over;
    }
    if dst.bottom() > canvas.bottom() {
        let over = dst.bottom() - canvas.bottom();
        dst.h -= over;
        src.h -= over;
    }

    if dst.is_empty() || src.is_empty() {
        return None;
    }
    Some((dst, src))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_bounds(r: &Roi, w: u32, h: u32) -> bool {
        r.x >= 0 && r.y >= 0 && r.right() <= w as i64 && r.bottom() <= h as i64
    }

    #[test]
    fn smaller_source_is_centered_unclipped() {
        let (dst, src) = centered(100, 50, 40, 20).unwrap();
        assert_eq!(dst, Roi::new(30, 15, 40, 20));
        assert_eq!(src, Roi::new(0, 0, 40, 20));
    }

    #[test]
    fn taller_source_is_cropped_evenly() {
        // Full-width source that's taller than the canvas
        let (dst, src) = centered(1920, 1080, 1920, 1440).unwrap();
        assert_eq!(dst, Roi::new(0, 0, 1920, 1080));
        assert_eq!(src, Roi::new(0, 180, 1920, 1080));
        assert!(in_bounds(&src, 1920, 1440));
    }

    #[test]
    fn larger_source_on_both_axes() {
        let (dst, src) = centered(10, 10, 15, 13).unwrap();
        assert!(in_bounds(&dst, 10, 10));
        assert!(in_bounds(&src, 15, 13));
        assert_eq!((dst.w, dst.h), (src.w, src.h));
        assert_eq!((dst.w, dst.h), (10, 10));
    }

    #[test]
    fn empty_inputs_do_not_blit() {
        assert!(centered(0, 0, 10, 10).is_none());
        assert!(centered(10, 10, 0, 5).is_none());
    }
}
