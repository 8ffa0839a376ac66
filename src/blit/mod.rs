//! Frame transforms: scaling, rotation and format handling on the way from
//! the captured primary frame to a sink's back buffer.
//!
//! Two implementations share one contract: the 2-D accelerator path
//! (feature `rga`) and the CPU sampling path. The accelerator is preferred;
//! any failure falls back to the CPU for that frame.

pub mod cpu;
#[cfg(feature = "rga")]
pub mod rga;

use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{DisplayConfig, Rotation, ScaleMode};
use crate::frame::FrameView;

/// Pixels outside the scaled region, and destination pixels whose
/// back-projected source coordinate falls outside the source, are this.
pub const OPAQUE_BLACK: u32 = 0xFF00_0000;

/// A pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.x + self.w && y >= self.y && y < self.y + self.h
    }
}

/// A writable view over a sink's mapped back buffer.
pub struct DstView<'a> {
    pub pixels: &'a mut [u8],
    pub width: u32,
    pub height: u32,
    /// Row stride in bytes.
    pub pitch: u32,
}

impl DstView<'_> {
    #[inline]
    pub fn put_pixel(&mut self, x: u32, y: u32, value: u32) {
        let offset = y as usize * self.pitch as usize + x as usize * 4;
        self.pixels[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Computes the destination rectangle the scaled image occupies.
///
/// Under `Stretch` that is the whole destination. Under `KeepAspect` the
/// scale factor is `min(dst_w / eff_w, dst_h / eff_h)` over the effective
/// (post-rotation-swap) source dimensions and the region is centered.
pub fn scaled_region(
    src_w: u32,
    src_h: u32,
    dst_w: u32,
    dst_h: u32,
    rotation: Rotation,
    scale_mode: ScaleMode,
) -> Rect {
    let (eff_w, eff_h) = if rotation.swaps_axes() {
        (src_h, src_w)
    } else {
        (src_w, src_h)
    };

    match scale_mode {
        ScaleMode::Stretch => Rect::new(0, 0, dst_w, dst_h),
        ScaleMode::KeepAspect => {
            let factor = (dst_w as f32 / eff_w as f32).min(dst_h as f32 / eff_h as f32);
            let scaled_w = ((eff_w as f32 * factor) as u32).min(dst_w).max(1);
            let scaled_h = ((eff_h as f32 * factor) as u32).min(dst_h).max(1);
            Rect::new(
                (dst_w - scaled_w) / 2,
                (dst_h - scaled_h) / 2,
                scaled_w,
                scaled_h,
            )
        }
    }
}

static HW_FAILURE_LOGGED: AtomicBool = AtomicBool::new(false);

/// Transforms the captured frame into a sink's back buffer according to the
/// display configuration.
pub fn blit_frame(src: &FrameView, dst: &mut DstView<'_>, config: &DisplayConfig) {
    let src_rect = Rect::new(0, 0, src.width(), src.height());
    let dst_rect = scaled_region(
        src.width(),
        src.height(),
        dst.width,
        dst.height,
        config.rotation,
        config.scale_mode,
    );

    #[cfg(feature = "rga")]
    {
        match rga::blit(src, src_rect, dst, dst_rect, config.rotation) {
            Ok(()) => return,
            Err(err) => {
                if !HW_FAILURE_LOGGED.swap(true, Ordering::Relaxed) {
                    tracing::warn!("2-D accelerator blit failed, falling back to CPU: {err}");
                }
            }
        }
    }

    cpu::blit(src, src_rect, dst, dst_rect, config.rotation, config.quality);
}

/// Marker so the "hardware failed once" log fires again after a topology
/// change brings new sinks.
pub fn reset_failure_log() {
    HW_FAILURE_LOGGED.store(false, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stretch_fills_the_destination() {
        let rect = scaled_region(1080, 1920, 1920, 1080, Rotation::Rot0, ScaleMode::Stretch);
        assert_eq!(rect, Rect::new(0, 0, 1920, 1080));
    }

    #[test]
    fn keep_aspect_centers_and_zeroes_one_axis() {
        // 1080x1920 source rotated 90° has effective dims 1920x1080, which
        // matches a 1920x1080 sink exactly.
        let rect = scaled_region(1080, 1920, 1920, 1080, Rotation::Rot90, ScaleMode::KeepAspect);
        assert_eq!(rect, Rect::new(0, 0, 1920, 1080));

        // Unrotated, the same source letterboxes horizontally.
        let rect = scaled_region(1080, 1920, 1920, 1080, Rotation::Rot0, ScaleMode::KeepAspect);
        assert_eq!(rect.h, 1080);
        assert_eq!(rect.y, 0);
        let scaled_w = 1080 * 1080 / 1920;
        assert!(rect.w.abs_diff(scaled_w) <= 1);
        // Margins are centered within a pixel.
        assert!(rect.x.abs_diff((1920 - rect.w) / 2) <= 1);
    }

    #[test]
    fn keep_aspect_margins_balance_within_one_pixel() {
        for (sw, sh, dw, dh) in [(640, 480, 1920, 1080), (800, 600, 1024, 768), (1080, 1920, 3840, 2160)] {
            let rect = scaled_region(sw, sh, dw, dh, Rotation::Rot0, ScaleMode::KeepAspect);
            let margin_x = dw - rect.w;
            let margin_y = dh - rect.h;
            // Exactly one axis may carry a margin (up to a rounding pixel on
            // the other).
            assert!(margin_x <= 1 || margin_y <= 1, "margins on both axes for {sw}x{sh} -> {dw}x{dh}");
            assert!(rect.x.abs_diff(margin_x - rect.x) <= 1);
            assert!(rect.y.abs_diff(margin_y - rect.y) <= 1);
        }
    }

    #[test]
    fn rect_contains_is_half_open() {
        let rect = Rect::new(10, 20, 5, 5);
        assert!(rect.contains(10, 20));
        assert!(rect.contains(14, 24));
        assert!(!rect.contains(15, 24));
        assert!(!rect.contains(9, 20));
    }
}
