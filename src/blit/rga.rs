//! Rockchip RGA 2-D accelerator path, linked against the vendor `librga`
//! im2d API. Only compiled with the `rga` feature; any failure here makes
//! the caller fall back to the CPU path for the frame.

use anyhow::{bail, ensure};
use drm::buffer::DrmFourcc;

use crate::config::Rotation;
use crate::frame::FrameView;

use super::{DstView, Rect};

// im2d_type.h, librga 1.9.
const IM_STATUS_SUCCESS: i32 = 1;
const IM_HAL_TRANSFORM_ROT_90: i32 = 1 << 0;
const IM_HAL_TRANSFORM_ROT_180: i32 = 1 << 1;
const IM_HAL_TRANSFORM_ROT_270: i32 = 1 << 2;
const IM_SYNC: i32 = 1 << 10;

const RK_FORMAT_RGBA_8888: i32 = 0x0 << 8;
const RK_FORMAT_RGB_888: i32 = 0x2 << 8;
const RK_FORMAT_BGRA_8888: i32 = 0x5 << 8;
const RK_FORMAT_RGB_565: i32 = 0x4 << 8;
const RK_FORMAT_BGR_888: i32 = 0x3 << 8;
const RK_FORMAT_YCBCR_420_SP: i32 = 0xe << 8;
const RK_FORMAT_YCRCB_420_SP: i32 = 0x10 << 8;

#[repr(C)]
#[derive(Clone, Copy)]
struct RgaBuffer {
    vir_addr: *mut libc::c_void,
    phy_addr: *mut libc::c_void,
    fd: i32,
    handle: i32,
    width: i32,
    height: i32,
    wstride: i32,
    hstride: i32,
    format: i32,
    color_space_mode: i32,
    global_alpha: i32,
    rd_mode: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ImRect {
    x: i32,
    y: i32,
    width: i32,
    height: i32,
}

#[link(name = "rga")]
extern "C" {
    fn improcess(
        src: RgaBuffer,
        dst: RgaBuffer,
        pat: RgaBuffer,
        srect: ImRect,
        drect: ImRect,
        prect: ImRect,
        usage: i32,
    ) -> i32;
}

/// Fourcc → RGA format codes. Unknown formats fall back to 32-bit RGBA.
const FORMAT_TABLE: &[(DrmFourcc, i32)] = &[
    (DrmFourcc::Argb8888, RK_FORMAT_BGRA_8888),
    (DrmFourcc::Xrgb8888, RK_FORMAT_BGRA_8888),
    (DrmFourcc::Abgr8888, RK_FORMAT_RGBA_8888),
    (DrmFourcc::Xbgr8888, RK_FORMAT_RGBA_8888),
    (DrmFourcc::Rgb888, RK_FORMAT_RGB_888),
    (DrmFourcc::Bgr888, RK_FORMAT_BGR_888),
    (DrmFourcc::Rgb565, RK_FORMAT_RGB_565),
    (DrmFourcc::Nv12, RK_FORMAT_YCBCR_420_SP),
    (DrmFourcc::Nv21, RK_FORMAT_YCRCB_420_SP),
];

fn rga_format(fourcc: DrmFourcc) -> i32 {
    FORMAT_TABLE
        .iter()
        .find(|(f, _)| *f == fourcc)
        .map(|(_, code)| *code)
        .unwrap_or(RK_FORMAT_RGBA_8888)
}

fn wrap_virtual(addr: *mut libc::c_void, width: u32, height: u32, pitch: u32, fourcc: DrmFourcc) -> RgaBuffer {
    RgaBuffer {
        vir_addr: addr,
        phy_addr: std::ptr::null_mut(),
        fd: -1,
        handle: 0,
        width: width as i32,
        height: height as i32,
        wstride: (pitch / 4) as i32,
        hstride: height as i32,
        format: rga_format(fourcc),
        color_space_mode: 0,
        global_alpha: -1,
        rd_mode: 0,
    }
}

/// Executes the transform on the accelerator: resize for 0°, rotate
/// otherwise, synchronized before returning.
pub fn blit(
    src: &FrameView,
    src_rect: Rect,
    dst: &mut DstView<'_>,
    dst_rect: Rect,
    rotation: Rotation,
) -> anyhow::Result<()> {
    // The accelerator reads through its own path; make sure CPU writes to
    // the captured frame are visible first.
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);

    let src_buf = wrap_virtual(
        src.as_bytes().as_ptr() as *mut libc::c_void,
        src.width(),
        src.height(),
        src.stride(),
        src.format(),
    );
    let dst_buf = wrap_virtual(
        dst.pixels.as_mut_ptr() as *mut libc::c_void,
        dst.width,
        dst.height,
        dst.pitch,
        DrmFourcc::Xrgb8888,
    );
    let pat = RgaBuffer {
        vir_addr: std::ptr::null_mut(),
        ..src_buf
    };

    let srect = ImRect {
        x: src_rect.x as i32,
        y: src_rect.y as i32,
        width: src_rect.w as i32,
        height: src_rect.h as i32,
    };
    let drect = ImRect {
        x: dst_rect.x as i32,
        y: dst_rect.y as i32,
        width: dst_rect.w as i32,
        height: dst_rect.h as i32,
    };
    let prect = ImRect { x: 0, y: 0, width: 0, height: 0 };

    let usage = IM_SYNC
        | match rotation {
            Rotation::Rot0 => 0,
            Rotation::Rot90 => IM_HAL_TRANSFORM_ROT_90,
            Rotation::Rot180 => IM_HAL_TRANSFORM_ROT_180,
            Rotation::Rot270 => IM_HAL_TRANSFORM_ROT_270,
        };

    ensure!(dst_rect.w > 0 && dst_rect.h > 0, "empty destination region");

    let status = unsafe { improcess(src_buf, dst_buf, pat, srect, drect, prect, usage) };
    if status != IM_STATUS_SUCCESS {
        bail!("improcess returned {status} (rotation {rotation})");
    }

    // The destination was written by a separate hardware unit.
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);

    Ok(())
}
