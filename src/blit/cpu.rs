//! CPU blit path.
//!
//! Samples the source directly with nearest-neighbor or bilinear filtering,
//! applying rotation through a forward mapping from destination-normalized
//! coordinates back into the source.

use crate::config::{Quality, Rotation};
use crate::frame::FrameView;

use super::{DstView, Rect, OPAQUE_BLACK};

/// Transforms `src_rect` of the source into `dst_rect` of the destination.
/// Destination pixels outside `dst_rect` are cleared to opaque black.
pub fn blit(
    src: &FrameView,
    src_rect: Rect,
    dst: &mut DstView<'_>,
    dst_rect: Rect,
    rotation: Rotation,
    quality: Quality,
) {
    for dst_y in 0..dst.height {
        for dst_x in 0..dst.width {
            let pixel = if dst_rect.contains(dst_x, dst_y) {
                let rx = dst_x - dst_rect.x;
                let ry = dst_y - dst_rect.y;
                match quality {
                    Quality::Fast => {
                        sample_nearest(src, src_rect, rx, ry, dst_rect.w, dst_rect.h, rotation)
                    }
                    Quality::Good => {
                        sample_bilinear(src, src_rect, rx, ry, dst_rect.w, dst_rect.h, rotation)
                    }
                }
            } else {
                OPAQUE_BLACK
            };
            dst.put_pixel(dst_x, dst_y, pixel);
        }
    }
}

/// Nearest-neighbor sampling in exact integer arithmetic, so that
/// `out(x', y') = in(floor(x'·W/W'), floor(y'·H/H'))` holds without float
/// rounding surprises, with the analogous laws under rotation.
#[inline]
fn sample_nearest(
    src: &FrameView,
    src_rect: Rect,
    rx: u32,
    ry: u32,
    region_w: u32,
    region_h: u32,
    rotation: Rotation,
) -> u32 {
    let (w, h) = (u64::from(src_rect.w), u64::from(src_rect.h));
    let (rx, ry) = (u64::from(rx), u64::from(ry));
    let (rw, rh) = (u64::from(region_w), u64::from(region_h));

    let (sx, sy) = match rotation {
        Rotation::Rot0 => (rx * w / rw, ry * h / rh),
        Rotation::Rot90 => (ry * w / rh, h - 1 - rx * h / rw),
        Rotation::Rot180 => (w - 1 - rx * w / rw, h - 1 - ry * h / rh),
        Rotation::Rot270 => (w - 1 - ry * w / rh, rx * h / rw),
    };

    src.pixel(src_rect.x + sx as u32, src_rect.y + sy as u32)
}

/// Bilinear sampling. At the right/bottom source edges this degrades to
/// nearest-neighbor so it never reads past the source extent; destination
/// pixels whose back-projected coordinate falls outside the source become
/// opaque black.
#[inline]
fn sample_bilinear(
    src: &FrameView,
    src_rect: Rect,
    rx: u32,
    ry: u32,
    region_w: u32,
    region_h: u32,
    rotation: Rotation,
) -> u32 {
    let (w, h) = (src_rect.w as f32, src_rect.h as f32);
    let nx = rx as f32 / region_w as f32;
    let ny = ry as f32 / region_h as f32;

    let (sx_f, sy_f) = match rotation {
        Rotation::Rot0 => (nx * w, ny * h),
        Rotation::Rot90 => (ny * w, (1.0 - nx) * h),
        Rotation::Rot180 => ((1.0 - nx) * w, (1.0 - ny) * h),
        Rotation::Rot270 => ((1.0 - ny) * w, nx * h),
    };

    let sx = sx_f as u32;
    let sy = sy_f as u32;

    if sx + 1 < src_rect.w && sy + 1 < src_rect.h {
        let fx = sx_f - sx as f32;
        let fy = sy_f - sy as f32;

        let p00 = src.pixel(src_rect.x + sx, src_rect.y + sy);
        let p01 = src.pixel(src_rect.x + sx + 1, src_rect.y + sy);
        let p10 = src.pixel(src_rect.x + sx, src_rect.y + sy + 1);
        let p11 = src.pixel(src_rect.x + sx + 1, src_rect.y + sy + 1);

        let lerp = |shift: u32| {
            let c00 = (p00 >> shift & 0xFF) as f32;
            let c01 = (p01 >> shift & 0xFF) as f32;
            let c10 = (p10 >> shift & 0xFF) as f32;
            let c11 = (p11 >> shift & 0xFF) as f32;
            let value = c00 * (1.0 - fx) * (1.0 - fy)
                + c01 * fx * (1.0 - fy)
                + c10 * (1.0 - fx) * fy
                + c11 * fx * fy;
            value as u32 & 0xFF
        };

        OPAQUE_BLACK | lerp(16) << 16 | lerp(8) << 8 | lerp(0)
    } else if sx < src_rect.w && sy < src_rect.h {
        src.pixel(src_rect.x + sx, src_rect.y + sy)
    } else {
        OPAQUE_BLACK
    }
}

#[cfg(test)]
mod tests {
    use drm::buffer::DrmFourcc;

    use super::*;
    use crate::blit::scaled_region;
    use crate::config::ScaleMode;

    fn patterned_frame(width: u32, height: u32) -> FrameView {
        let mut frame = FrameView::new(width, height, DrmFourcc::Xrgb8888);
        for y in 0..height {
            for x in 0..width {
                frame.put_pixel(x, y, 0xFF00_0000 | x << 12 | y);
            }
        }
        frame
    }

    struct DstBuffer {
        bytes: Vec<u8>,
        width: u32,
        height: u32,
    }

    impl DstBuffer {
        fn new(width: u32, height: u32) -> Self {
            Self {
                bytes: vec![0; (width * height * 4) as usize],
                width,
                height,
            }
        }

        fn view(&mut self) -> DstView<'_> {
            DstView {
                width: self.width,
                height: self.height,
                pitch: self.width * 4,
                pixels: &mut self.bytes,
            }
        }

        fn pixel(&self, x: u32, y: u32) -> u32 {
            let offset = (y * self.width * 4 + x * 4) as usize;
            u32::from_le_bytes(self.bytes[offset..offset + 4].try_into().unwrap())
        }
    }

    fn run(
        src: &FrameView,
        dst: &mut DstBuffer,
        rotation: Rotation,
        scale_mode: ScaleMode,
        quality: Quality,
    ) {
        let src_rect = Rect::new(0, 0, src.width(), src.height());
        let dst_rect = scaled_region(
            src.width(),
            src.height(),
            dst.width,
            dst.height,
            rotation,
            scale_mode,
        );
        blit(src, src_rect, &mut dst.view(), dst_rect, rotation, quality);
    }

    #[test]
    fn stretch_fast_matches_floor_law() {
        let src = patterned_frame(7, 5);
        let mut dst = DstBuffer::new(13, 9);
        run(&src, &mut dst, Rotation::Rot0, ScaleMode::Stretch, Quality::Fast);

        for y in 0..9u32 {
            for x in 0..13u32 {
                let expected = src.pixel(x * 7 / 13, y * 5 / 9);
                assert_eq!(dst.pixel(x, y), expected, "mismatch at ({x}, {y})");
            }
        }
    }

    #[test]
    fn rotate_90_law() {
        let (w, h) = (6u32, 4u32);
        let src = patterned_frame(w, h);
        let (dw, dh) = (8u32, 12u32);
        let mut dst = DstBuffer::new(dw, dh);
        run(&src, &mut dst, Rotation::Rot90, ScaleMode::Stretch, Quality::Fast);

        for y in 0..dh {
            for x in 0..dw {
                let expected = src.pixel(y * w / dh, h - 1 - x * h / dw);
                assert_eq!(dst.pixel(x, y), expected, "mismatch at ({x}, {y})");
            }
        }
    }

    #[test]
    fn rotate_180_law() {
        let (w, h) = (6u32, 4u32);
        let src = patterned_frame(w, h);
        let (dw, dh) = (9u32, 5u32);
        let mut dst = DstBuffer::new(dw, dh);
        run(&src, &mut dst, Rotation::Rot180, ScaleMode::Stretch, Quality::Fast);

        for y in 0..dh {
            for x in 0..dw {
                let expected = src.pixel(w - 1 - x * w / dw, h - 1 - y * h / dh);
                assert_eq!(dst.pixel(x, y), expected, "mismatch at ({x}, {y})");
            }
        }
    }

    #[test]
    fn rotate_270_law() {
        let (w, h) = (6u32, 4u32);
        let src = patterned_frame(w, h);
        let (dw, dh) = (8u32, 12u32);
        let mut dst = DstBuffer::new(dw, dh);
        run(&src, &mut dst, Rotation::Rot270, ScaleMode::Stretch, Quality::Fast);

        for y in 0..dh {
            for x in 0..dw {
                let expected = src.pixel(w - 1 - y * w / dh, x * h / dw);
                assert_eq!(dst.pixel(x, y), expected, "mismatch at ({x}, {y})");
            }
        }
    }

    #[test]
    fn vertical_stripes_turn_horizontal_under_90() {
        // A portrait 1080x1920 primary with vertical stripes, mirrored onto
        // a landscape 1920x1080 sink at 90°.
        let (sw, sh) = (1080u32, 1920u32);
        let mut src = FrameView::new(sw, sh, DrmFourcc::Xrgb8888);
        for y in 0..sh {
            for x in 0..sw {
                let stripe = if (x / 8) % 2 == 0 { 0xFFFF_FFFF } else { 0xFF00_0000 };
                src.put_pixel(x, y, stripe);
            }
        }

        let mut dst = DstBuffer::new(1920, 1080);
        run(&src, &mut dst, Rotation::Rot90, ScaleMode::Stretch, Quality::Fast);

        // Vertical stripes become horizontal: rows are constant.
        for y in [0u32, 271, 540, 1033] {
            let first = dst.pixel(0, y);
            for x in [1u32, 480, 960, 1919] {
                assert_eq!(dst.pixel(x, y), first, "row {y} is not constant");
            }
        }

        // Center pixel of the sink matches the center pixel of the source.
        assert_eq!(dst.pixel(960, 540), src.pixel(540, 960));
    }

    #[test]
    fn keep_aspect_margins_are_opaque_black() {
        let src = patterned_frame(100, 100);
        let mut dst = DstBuffer::new(200, 100);
        run(&src, &mut dst, Rotation::Rot0, ScaleMode::KeepAspect, Quality::Fast);

        let region = scaled_region(100, 100, 200, 100, Rotation::Rot0, ScaleMode::KeepAspect);
        assert_eq!(region.w, 100);
        assert_eq!(region.x, 50);

        for y in 0..100u32 {
            for x in 0..200u32 {
                if x < region.x || x >= region.x + region.w {
                    assert_eq!(dst.pixel(x, y), OPAQUE_BLACK, "margin at ({x}, {y})");
                } else {
                    assert_eq!(dst.pixel(x, y), src.pixel(x - region.x, y));
                }
            }
        }
    }

    #[test]
    fn bilinear_interpolates_between_neighbors() {
        let mut src = FrameView::new(2, 2, DrmFourcc::Xrgb8888);
        for y in 0..2 {
            src.put_pixel(0, y, 0xFF00_0000);
            src.put_pixel(1, y, 0xFF00_00FF);
        }

        let mut dst = DstBuffer::new(4, 2);
        run(&src, &mut dst, Rotation::Rot0, ScaleMode::Stretch, Quality::Good);

        // x = 1 back-projects to source x 0.5: halfway between the columns.
        let mid = dst.pixel(1, 0) & 0xFF;
        assert!((126..=129).contains(&mid), "expected ~127, got {mid}");
        // All outputs stay opaque.
        for x in 0..4u32 {
            assert_eq!(dst.pixel(x, 0) & 0xFF00_0000, 0xFF00_0000);
        }
    }

    #[test]
    fn bilinear_90_left_column_back_projects_outside() {
        // Under 90° rotation the x' = 0 column maps to source row H, which
        // is outside the source; bilinear writes opaque black there.
        let src = patterned_frame(6, 4);
        let mut dst = DstBuffer::new(8, 12);
        run(&src, &mut dst, Rotation::Rot90, ScaleMode::Stretch, Quality::Good);

        for y in 0..12u32 {
            assert_eq!(dst.pixel(0, y), OPAQUE_BLACK);
        }
    }
}
