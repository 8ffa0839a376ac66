//! KMS gateway.
//!
//! Owns the DRM device handle and the displays table. Everything that talks
//! to the kernel mode-setting API goes through here: topology scans,
//! framebuffer registration, mode-sets, page flips, the flip-event drain,
//! and the primary scanout capture.

pub mod display;

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{fence, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{bail, ensure, Context};
use drm::buffer::{Buffer as _, DrmFourcc};
use drm::control::dumbbuffer::{DumbBuffer, DumbMapping};
use drm::control::{connector, framebuffer, Device as ControlDevice, Event, PageFlipFlags};
use drm::{Device, DriverCapability, VblankWaitFlags, VblankWaitTarget};
use tracing::{debug, info, trace, warn};

use crate::frame::FrameView;
use display::{connector_name, pick_mode, Display, Role};

/// Capture mapping retries, 1 ms apart.
const CAPTURE_MAP_RETRIES: u32 = 3;

struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

/// The open display device plus the live topology model.
pub struct KmsDevice {
    card: Card,
    displays: Vec<Display>,
    primary_match: String,
}

impl KmsDevice {
    /// Opens the device read-write with close-on-exec and refuses to proceed
    /// unless it supports CPU-mappable dumb buffers.
    pub fn open(path: &Path, primary_match: &str) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .with_context(|| format!("error opening DRM device {path:?}"))?;

        let mut device = Self {
            card: Card(file),
            displays: Vec::new(),
            primary_match: primary_match.to_owned(),
        };

        let has_dumb = device
            .card
            .get_driver_capability(DriverCapability::DumbBuffer)
            .context("error querying dumb-buffer capability")?;
        ensure!(has_dumb != 0, "DRM device {path:?} doesn't support dumb buffers");

        device.scan().context("initial display scan failed")?;
        Ok(device)
    }

    /// Rebuilds the displays table in place. Existing records are refreshed
    /// by connector id and never removed; connectors that disappeared keep
    /// their row with `connected = false`. Purely reads from the kernel, so
    /// CRTC programming of unaffected displays is not disturbed.
    pub fn scan(&mut self) -> anyhow::Result<()> {
        let res = self
            .card
            .resource_handles()
            .context("error getting DRM resources")?;

        // CRTCs handed out during this scan, so two connectors can't pick
        // the same free CRTC.
        let mut claimed: Vec<u32> = Vec::new();
        let mut seen: Vec<u32> = Vec::new();

        for &conn in res.connectors() {
            let info = match self.card.get_connector(conn, true) {
                Ok(info) => info,
                Err(err) => {
                    warn!("error getting connector {conn:?}: {err}");
                    continue;
                }
            };

            let connector_id: u32 = conn.into();
            let name = connector_name(info.interface(), info.interface_id());
            let connected = info.state() == connector::State::Connected;
            let mode = pick_mode(info.modes());

            let mut encoder_id = 0;
            let mut crtc = None;
            if let Some(enc) = info.current_encoder() {
                if let Ok(enc_info) = self.card.get_encoder(enc) {
                    if let Some(bound) = enc_info.crtc() {
                        encoder_id = enc.into();
                        crtc = Some(bound);
                    }
                }
            }

            if crtc.is_none() {
                // No encoder currently bound; look for a free CRTC among the
                // connector's candidate encoders.
                'candidates: for &enc in info.encoders() {
                    let Ok(enc_info) = self.card.get_encoder(enc) else {
                        continue;
                    };
                    for candidate in res.filter_crtcs(enc_info.possible_crtcs()) {
                        let id: u32 = candidate.into();
                        if !claimed.contains(&id) {
                            encoder_id = enc.into();
                            crtc = Some(candidate);
                            break 'candidates;
                        }
                    }
                }
            }

            if let Some(crtc) = crtc {
                claimed.push(crtc.into());
            }

            let record = Display {
                connector_id,
                encoder_id,
                crtc_id: crtc.map(Into::into).unwrap_or(0),
                name,
                mode,
                connected,
                role: Role::Secondary,
                handle: conn,
                crtc,
            };

            seen.push(connector_id);
            match self.displays.iter_mut().find(|d| d.connector_id == connector_id) {
                Some(existing) => *existing = record,
                None => self.displays.push(record),
            }
        }

        // Connectors that vanished from the enumeration stay in the table as
        // disconnected.
        for display in &mut self.displays {
            if !seen.contains(&display.connector_id) {
                display.connected = false;
            }
        }

        assign_primary_role(&mut self.displays, &self.primary_match);

        info!("found {} displays:", self.displays.len());
        for disp in &self.displays {
            info!(
                "  {} ({}x{}) - {}{}",
                disp.name,
                disp.width(),
                disp.height(),
                if disp.connected { "connected" } else { "disconnected" },
                if disp.is_primary() { " [PRIMARY]" } else { "" },
            );
        }

        Ok(())
    }

    pub fn displays(&self) -> &[Display] {
        &self.displays
    }

    pub fn display(&self, connector_id: u32) -> Option<&Display> {
        self.displays.iter().find(|d| d.connector_id == connector_id)
    }

    pub fn primary(&self) -> Option<&Display> {
        self.displays.iter().find(|d| d.is_primary())
    }

    // === Scanout buffers and framebuffers ===

    /// Allocates a linear, CPU-mappable scanout buffer in 32-bit XRGB.
    pub fn create_scanout_buffer(&self, width: u32, height: u32) -> anyhow::Result<DumbBuffer> {
        self.card
            .create_dumb_buffer((width, height), DrmFourcc::Xrgb8888, 32)
            .with_context(|| format!("error creating {width}x{height} dumb buffer"))
    }

    pub fn destroy_scanout_buffer(&self, buffer: DumbBuffer) {
        if let Err(err) = self.card.destroy_dumb_buffer(buffer) {
            warn!("error destroying dumb buffer: {err}");
        }
    }

    pub fn map_scanout_buffer<'a>(
        &self,
        buffer: &'a mut DumbBuffer,
    ) -> anyhow::Result<DumbMapping<'a>> {
        self.card
            .map_dumb_buffer(buffer)
            .context("error mapping dumb buffer")
    }

    /// Registers a framebuffer for a scanout buffer, returning its id.
    pub fn create_framebuffer(&self, buffer: &DumbBuffer) -> anyhow::Result<framebuffer::Handle> {
        self.card
            .add_framebuffer(buffer, 24, 32)
            .context("error creating framebuffer")
    }

    pub fn destroy_framebuffer(&self, fb: framebuffer::Handle) {
        if let Err(err) = self.card.destroy_framebuffer(fb) {
            warn!("error destroying framebuffer {}: {err}", u32::from(fb));
        }
    }

    /// Exports the scanout buffer as a DMA file descriptor for the 2-D
    /// accelerator.
    pub fn export_dma_fd(&self, buffer: &DumbBuffer) -> anyhow::Result<OwnedFd> {
        self.card
            .buffer_to_prime_fd(buffer.handle(), libc::O_CLOEXEC as u32)
            .context("error exporting prime fd")
    }

    // === Mode-set and page flip ===

    /// Programs the display's CRTC with its mode and the given framebuffer.
    pub fn set_crtc(&self, display: &Display, fb: framebuffer::Handle) -> anyhow::Result<()> {
        let Some(crtc) = display.crtc else {
            bail!("{} has no CRTC assigned", display.name);
        };
        ensure!(display.connected, "{} is not connected", display.name);
        let mode = display
            .mode
            .with_context(|| format!("{} has no usable mode", display.name))?;

        self.card
            .set_crtc(crtc, Some(fb), (0, 0), &[display.handle], Some(mode.raw))
            .with_context(|| format!("error setting CRTC for {}", display.name))
    }

    /// Blanks the display's CRTC: null framebuffer, no connectors.
    pub fn disable(&self, display: &Display) -> anyhow::Result<()> {
        let Some(crtc) = display.crtc else {
            bail!("{} has no CRTC assigned", display.name);
        };
        self.card
            .set_crtc(crtc, None, (0, 0), &[], None)
            .with_context(|| format!("error disabling CRTC for {}", display.name))
    }

    /// Submits an asynchronous page flip requesting a completion event.
    pub fn page_flip(&self, display: &Display, fb: framebuffer::Handle) -> anyhow::Result<()> {
        let Some(crtc) = display.crtc else {
            bail!("{} has no CRTC bound", display.name);
        };
        self.card
            .page_flip(crtc, fb, PageFlipFlags::EVENT, None)
            .with_context(|| format!("error page flipping {}", display.name))
    }

    /// Waits up to `timeout_ms` for pending flip-completion events and
    /// dispatches them. Returns whether any event was processed.
    pub fn drain_events(&self, timeout_ms: i32) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.card.as_fd().as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret <= 0 || pfd.revents & libc::POLLIN == 0 {
            return false;
        }

        let events = match self.card.receive_events() {
            Ok(events) => events,
            Err(err) => {
                warn!("error draining DRM events: {err}");
                return false;
            }
        };

        let mut processed = false;
        for event in events {
            if let Event::PageFlip(flip) = event {
                trace!("page flip completed on {:?} (frame {})", flip.crtc, flip.frame);
                processed = true;
            }
        }
        processed
    }

    /// Blocks for one vblank interval so a following capture reads a frame
    /// that was just scanned out.
    pub fn await_vblank(&self) {
        if let Err(err) = self.card.wait_vblank(
            VblankWaitTarget::Relative(1),
            VblankWaitFlags::empty(),
            0,
            0,
        ) {
            trace!("vblank wait failed: {err}");
        }
    }

    // === Primary capture ===

    /// Copies the primary display's current scanout into a fresh
    /// [`FrameView`]. If the framebuffer cannot be mapped after retries, the
    /// view is filled with a diagnostic gradient instead so the pipeline
    /// keeps flowing; the boolean reports whether real content was captured.
    pub fn capture_primary(&self, display: &Display) -> anyhow::Result<(FrameView, bool)> {
        let mode = display
            .mode
            .with_context(|| format!("{} has no mode to capture at", display.name))?;

        let mut frame = FrameView::new(mode.width, mode.height, DrmFourcc::Xrgb8888);

        let captured = self.capture_into(display, &mut frame);
        if !captured {
            frame.fill_diagnostic_gradient();
        }

        Ok((frame, captured))
    }

    fn capture_into(&self, disp: &Display, frame: &mut FrameView) -> bool {
        let Some(crtc) = disp.crtc else {
            return false;
        };

        let crtc_info = match self.card.get_crtc(crtc) {
            Ok(info) => info,
            Err(err) => {
                debug!("error getting CRTC for {}: {err}", disp.name);
                return false;
            }
        };
        let Some(fb) = crtc_info.framebuffer() else {
            debug!("{} has no framebuffer bound", disp.name);
            return false;
        };
        let fb_info = match self.card.get_framebuffer(fb) {
            Ok(info) => info,
            Err(err) => {
                debug!("error getting framebuffer for {}: {err}", disp.name);
                return false;
            }
        };
        let Some(buffer) = fb_info.buffer() else {
            debug!("{} framebuffer exposes no buffer handle", disp.name);
            return false;
        };

        let (fb_width, fb_height) = fb_info.size();
        let pitch = fb_info.pitch();
        let len = pitch as usize * fb_height as usize;

        for retry in 0..CAPTURE_MAP_RETRIES {
            let mapping = match self.map_foreign_buffer(buffer.into(), len) {
                Ok(mapping) => mapping,
                Err(err) => {
                    trace!("capture map attempt {} failed: {err}", retry + 1);
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }
            };

            // The scanout producer is a separate hardware unit; make sure we
            // read what it last wrote.
            fence(Ordering::SeqCst);

            let bytes = mapping.as_slice();
            let copy_width = frame.width().min(fb_width) as usize * 4;
            let copy_height = frame.height().min(fb_height);
            for y in 0..copy_height {
                let src_start = y as usize * pitch as usize;
                frame.row_mut(y)[..copy_width]
                    .copy_from_slice(&bytes[src_start..src_start + copy_width]);
            }
            return true;
        }

        false
    }

    /// Maps a framebuffer's backing dumb buffer read-only by handle. The
    /// high-level crate only maps buffers it allocated itself, so this goes
    /// through the raw map-request ioctl.
    fn map_foreign_buffer(&self, handle: u32, len: usize) -> anyhow::Result<ReadMapping> {
        let map_info = drm_ffi::mode::dumbbuffer::map(self.card.as_fd(), handle, 0, 0)
            .context("dumb-buffer map request failed")?;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                self.card.as_fd().as_raw_fd(),
                map_info.offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            bail!("mmap failed: {}", std::io::Error::last_os_error());
        }

        Ok(ReadMapping { ptr, len })
    }
}

/// Reassigns roles across the whole table: the first display whose name
/// contains `primary_match` becomes the primary, every other display a
/// secondary. Run after each rescan so a stale primary never survives a
/// topology change.
fn assign_primary_role(displays: &mut [Display], primary_match: &str) {
    let mut have_primary = false;
    for display in displays.iter_mut() {
        if !have_primary && display.name.contains(primary_match) {
            display.role = Role::Primary;
            have_primary = true;
        } else {
            display.role = Role::Secondary;
        }
    }
}

/// A read-only mapping of a foreign scanout buffer, unmapped on drop.
struct ReadMapping {
    ptr: *mut libc::c_void,
    len: usize,
}

impl ReadMapping {
    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for ReadMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use super::*;

    fn display(connector_id: u32, name: &str) -> Display {
        Display {
            connector_id,
            encoder_id: 0,
            crtc_id: 0,
            name: name.to_owned(),
            mode: None,
            connected: true,
            role: Role::Secondary,
            handle: connector::Handle::from(NonZeroU32::new(connector_id).unwrap()),
            crtc: None,
        }
    }

    fn roles(displays: &[Display]) -> Vec<Role> {
        displays.iter().map(|d| d.role).collect()
    }

    #[test]
    fn no_matching_connector_means_no_primary() {
        let mut displays = vec![
            display(1, "card0-HDMIA-1"),
            display(2, "card0-DisplayPort-1"),
        ];
        assign_primary_role(&mut displays, "DSI-1");
        assert_eq!(roles(&displays), vec![Role::Secondary, Role::Secondary]);
    }

    #[test]
    fn the_matching_connector_becomes_primary() {
        let mut displays = vec![
            display(1, "card0-HDMIA-1"),
            display(2, "card0-DSI-1"),
            display(3, "card0-DisplayPort-1"),
        ];
        assign_primary_role(&mut displays, "DSI-1");
        assert_eq!(
            roles(&displays),
            vec![Role::Secondary, Role::Primary, Role::Secondary],
        );
    }

    #[test]
    fn at_most_one_primary_when_several_names_match() {
        // Both names contain the substring; only the first one wins.
        let mut displays = vec![
            display(1, "card0-DSI-1"),
            display(2, "card0-DSI-12"),
        ];
        assign_primary_role(&mut displays, "DSI-1");
        assert_eq!(roles(&displays), vec![Role::Primary, Role::Secondary]);
        assert_eq!(displays.iter().filter(|d| d.is_primary()).count(), 1);
    }

    #[test]
    fn rescan_demotes_a_stale_primary() {
        let mut displays = vec![
            display(1, "card0-DSI-1"),
            display(2, "card0-HDMIA-1"),
        ];
        displays[1].role = Role::Primary;
        assign_primary_role(&mut displays, "DSI-1");
        assert_eq!(roles(&displays), vec![Role::Primary, Role::Secondary]);
    }
}
