//! The mirror loop.
//!
//! Owns the KMS gateway and the sink buffer pool (strict tree ownership;
//! other components see borrows for the duration of one call). A dedicated
//! worker thread captures the primary scanout once per vblank-bounded
//! period, blits it into every active sink's back buffer, commits the page
//! flips and paces itself to the primary's frame interval.
//!
//! Hot-plug handling is reconciliation-based, not event-authoritative: a
//! transition event only tells the loop *when* to rescan; what to enable or
//! disable falls out of diffing the scanned topology against the previous
//! one.

use std::collections::BTreeSet;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::blit::{self, DstView};
use crate::config::DisplayConfig;
use crate::frame::FrameView;
use crate::hotplug::{HotplugEvent, HotplugReactor};
use crate::kms::display::{is_secondary_name, Display};
use crate::kms::KmsDevice;
use crate::pool::SinkBufferPool;

/// Sleep while no secondary is connected.
const IDLE_SLEEP: Duration = Duration::from_millis(100);
/// Settle time between blanking a CRTC and reprogramming it.
const SETTLE_DELAY: Duration = Duration::from_millis(100);
const SET_CRTC_RETRIES: u32 = 3;
const SET_CRTC_RETRY_DELAY: Duration = Duration::from_millis(50);
const PAGE_FLIP_RETRIES: u32 = 3;
/// Event drain budget per frame; must never stall the loop.
const EVENT_DRAIN_BUDGET_MS: i32 = 1;
const FALLBACK_REFRESH_HZ: u32 = 60;
const FPS_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Frame interval the loop paces itself to, derived from the primary's
/// refresh rate.
fn target_frame_interval(refresh_hz: u32) -> Duration {
    let refresh_hz = if refresh_hz == 0 { FALLBACK_REFRESH_HZ } else { refresh_hz };
    Duration::from_micros(1_000_000 / u64::from(refresh_hz))
}

/// A sink transition produced by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkAction {
    /// Newly connected, previously inactive.
    Enable(u32),
    /// Previously active, no longer connected.
    Disable(u32),
    /// Still connected across a topology event; some sinks need to relearn.
    Refresh(u32),
}

/// Diffs the freshly scanned connected-secondary set against the active
/// set. Disables come first so CRTCs are released before new claims; the
/// rest follows connector-id order.
fn diff_secondaries(
    active: &BTreeSet<u32>,
    connected: &BTreeSet<u32>,
    refresh_reconnected: bool,
) -> Vec<SinkAction> {
    let mut actions = Vec::new();
    for &id in active.difference(connected) {
        actions.push(SinkAction::Disable(id));
    }
    for &id in connected {
        if !active.contains(&id) {
            actions.push(SinkAction::Enable(id));
        } else if refresh_reconnected {
            actions.push(SinkAction::Refresh(id));
        }
    }
    actions
}

/// Everything guarded by the topology mutex.
struct Topology {
    kms: KmsDevice,
    pool: SinkBufferPool,
    /// Connector ids of sinks that are enabled and mirrored.
    active: BTreeSet<u32>,
}

struct Shared {
    topology: Mutex<Topology>,
    /// Rough permission bit for the worker: at least one secondary is
    /// connected and enabled.
    copy_enabled: AtomicBool,
    /// Cooperative stop signal for the worker threads.
    running: AtomicBool,
    config: DisplayConfig,
}

/// The top-level daemon object. Owns the worker threads and, through the
/// topology mutex, the KMS gateway and buffer pool.
pub struct Daemon {
    shared: Arc<Shared>,
    reactor: HotplugReactor,
    events: Option<Receiver<HotplugEvent>>,
    worker: Option<JoinHandle<()>>,
}

impl Daemon {
    pub fn new(config: DisplayConfig) -> anyhow::Result<Self> {
        let kms = KmsDevice::open(&config.device_path, &config.primary_match)?;
        let (reactor, events) = HotplugReactor::new();

        info!(
            "display configuration: scale={:?}, rotation={}, quality={:?}, debug={}",
            config.scale_mode, config.rotation, config.quality, config.enable_debug,
        );

        Ok(Self {
            shared: Arc::new(Shared {
                topology: Mutex::new(Topology {
                    kms,
                    pool: SinkBufferPool::new(),
                    active: BTreeSet::new(),
                }),
                copy_enabled: AtomicBool::new(false),
                running: AtomicBool::new(false),
                config,
            }),
            reactor,
            events: Some(events),
            worker: None,
        })
    }

    /// Brings up the hot-plug reactor, enables already-connected sinks and
    /// starts the mirror worker. Idempotent.
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        self.shared.running.store(true, Ordering::SeqCst);

        // After a stop the old receiver went away with the worker; rebuild
        // the reactor and channel as a pair.
        let events = match self.events.take() {
            Some(events) => events,
            None => {
                let (reactor, events) = HotplugReactor::new();
                self.reactor = reactor;
                events
            }
        };
        self.reactor.start()?;

        {
            let mut topology = lock_topology(&self.shared);
            reconcile(&mut topology, &self.shared.config, &self.shared.copy_enabled);
        }

        let shared = Arc::clone(&self.shared);
        let worker = thread::Builder::new()
            .name("mirror".to_owned())
            .spawn(move || mirror_loop(&shared, &events))
            .expect("error spawning mirror thread");
        self.worker = Some(worker);

        info!("display manager started");
        Ok(())
    }

    /// Stops the workers, joins them and tears the output state down:
    /// sinks blanked, pool entries destroyed. The device itself closes when
    /// the daemon drops.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);

        self.reactor.stop();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("mirror thread panicked");
            }
        }

        let mut topology = lock_topology(&self.shared);
        let Topology { kms, pool, active } = &mut *topology;
        for &id in active.iter() {
            if let Some(disp) = kms.display(id).cloned() {
                if let Err(err) = kms.disable(&disp) {
                    debug!("error blanking {} on shutdown: {err:#}", disp.name);
                }
            }
        }
        active.clear();
        pool.destroy_all(kms);
        self.shared.copy_enabled.store(false, Ordering::SeqCst);

        info!("display manager stopped");
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock_topology(shared: &Shared) -> MutexGuard<'_, Topology> {
    shared
        .topology
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Capture-health and frame-rate bookkeeping for the worker.
#[derive(Debug)]
struct LoopStats {
    frames: u32,
    window_start: Instant,
    first_capture_logged: bool,
    last_checksum: u32,
    unchanged_frames: u32,
    gradient_frames: u64,
}

impl LoopStats {
    fn new() -> Self {
        Self {
            frames: 0,
            window_start: Instant::now(),
            first_capture_logged: false,
            last_checksum: 0,
            unchanged_frames: 0,
            gradient_frames: 0,
        }
    }

    fn record_capture(&mut self, frame: &FrameView, captured_real: bool) {
        if !captured_real {
            self.gradient_frames += 1;
            if self.gradient_frames % 30 == 0 {
                warn!(
                    "primary capture failing, mirroring diagnostic gradient (frame {})",
                    self.gradient_frames,
                );
            }
            return;
        }

        if !self.first_capture_logged {
            info!("primary capture started, frame mirroring active");
            self.first_capture_logged = true;
        }

        let checksum = frame.content_checksum();
        if checksum == self.last_checksum {
            self.unchanged_frames += 1;
            if self.unchanged_frames == 300 {
                warn!("no content variation detected in recent captured frames");
                self.unchanged_frames = 0;
            }
        } else {
            self.unchanged_frames = 0;
        }
        self.last_checksum = checksum;
    }

    fn record_frame(&mut self) {
        self.frames += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed >= FPS_REPORT_INTERVAL {
            let fps = f64::from(self.frames) / elapsed.as_secs_f64();
            info!("frame rate: {fps:.1} FPS (avg over {}s)", elapsed.as_secs());
            self.frames = 0;
            self.window_start = Instant::now();
        }
    }
}

fn mirror_loop(shared: &Shared, events: &Receiver<HotplugEvent>) {
    info!("frame copy loop started");

    let mut stats = LoopStats::new();

    while shared.running.load(Ordering::SeqCst) {
        let frame_start = Instant::now();

        // Reconciliation point: hotplug transitions arrive on the channel
        // and are answered with one rescan, never re-entrantly.
        let mut topology_dirty = false;
        while let Ok(event) = events.try_recv() {
            info!(
                "processing hotplug event: {} {}",
                event.connector,
                if event.connected { "connected" } else { "disconnected" },
            );
            topology_dirty = true;
        }
        if topology_dirty {
            let mut topology = lock_topology(shared);
            reconcile(&mut topology, &shared.config, &shared.copy_enabled);
        }

        if !shared.copy_enabled.load(Ordering::SeqCst) {
            thread::sleep(IDLE_SLEEP);
            continue;
        }

        let interval = {
            let mut topology = lock_topology(shared);
            mirror_iteration(&mut topology, &shared.config, &mut stats)
        };

        let Some(interval) = interval else {
            thread::sleep(IDLE_SLEEP);
            continue;
        };

        stats.record_frame();

        let elapsed = frame_start.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
    }

    info!("frame copy loop stopped");
}

/// One capture-and-commit pass over all active sinks. Returns the frame
/// interval to pace to, or `None` when there was nothing to mirror.
fn mirror_iteration(
    topology: &mut Topology,
    config: &DisplayConfig,
    stats: &mut LoopStats,
) -> Option<Duration> {
    let Topology { kms, pool, active } = topology;

    let primary = kms.primary().cloned()?;
    if !primary.connected || active.is_empty() {
        return None;
    }

    // Capture right after a vblank so the frame is one that was just
    // scanned out.
    kms.await_vblank();

    let (frame, captured_real) = match kms.capture_primary(&primary) {
        Ok(result) => result,
        Err(err) => {
            debug!("capture skipped: {err:#}");
            return None;
        }
    };
    stats.record_capture(&frame, captured_real);

    // BTreeSet iteration gives connector-id order, which fixes the flip
    // submission order across sinks within a frame.
    for &id in active.iter() {
        let Some(disp) = kms.display(id).cloned() else {
            continue;
        };
        if !disp.connected {
            // Disconnected mid-frame; the next rescan will disable it.
            trace!("skipping {}: no longer connected", disp.name);
            continue;
        }

        let Some(ring) = pool.ensure(kms, &disp) else {
            continue;
        };

        let slot = ring.back_mut();
        let fb = slot.fb;
        let (width, height, pitch) = (slot.width, slot.height, slot.pitch);
        {
            let mut mapping = match kms.map_scanout_buffer(&mut slot.buffer) {
                Ok(mapping) => mapping,
                Err(err) => {
                    warn!("error mapping back buffer of {}: {err:#}", disp.name);
                    continue;
                }
            };
            let mut dst = DstView {
                pixels: &mut mapping,
                width,
                height,
                pitch,
            };
            blit::blit_frame(&frame, &mut dst, config);
        }
        // The CRTC reads through a separate path; flush our writes first.
        fence(Ordering::SeqCst);

        let mut flipped = false;
        for _ in 0..PAGE_FLIP_RETRIES {
            match kms.page_flip(&disp, fb) {
                Ok(()) => {
                    flipped = true;
                    break;
                }
                Err(err) => trace!("page flip failed on {}: {err:#}", disp.name),
            }
        }
        if flipped {
            ring.advance();
        } else {
            warn!("page flip failed on {}, dropping its frame", disp.name);
        }
    }

    kms.drain_events(EVENT_DRAIN_BUDGET_MS);

    Some(target_frame_interval(primary.mode.map_or(0, |m| m.refresh)))
}

/// Rescans the topology and walks the connected-secondary set against the
/// active one, enabling, disabling or refreshing sinks as needed. Also
/// republishes `copy_enabled`.
fn reconcile(topology: &mut Topology, config: &DisplayConfig, copy_enabled: &AtomicBool) {
    let Topology { kms, pool, active } = topology;

    if let Err(err) = kms.scan() {
        warn!("topology rescan failed: {err:#}");
        return;
    }

    let connected: BTreeSet<u32> = kms
        .displays()
        .iter()
        .filter(|d| !d.is_primary() && is_secondary_name(&d.name) && d.connected)
        .map(|d| d.connector_id)
        .collect();

    let actions = diff_secondaries(active, &connected, config.refresh_reconnected);
    for action in actions {
        match action {
            SinkAction::Disable(id) => {
                if let Some(display) = kms.display(id).cloned() {
                    disable_sink(kms, pool, &display);
                } else {
                    pool.destroy(kms, id);
                }
                active.remove(&id);
            }
            SinkAction::Enable(id) => {
                let Some(display) = kms.display(id).cloned() else {
                    continue;
                };
                if enable_sink(kms, pool, &display) {
                    active.insert(id);
                }
            }
            SinkAction::Refresh(id) => {
                let Some(disp) = kms.display(id).cloned() else {
                    continue;
                };
                info!("display still connected, refreshing: {}", disp.name);
                disable_sink(kms, pool, &disp);
                active.remove(&id);
                if enable_sink(kms, pool, &disp) {
                    active.insert(id);
                }
            }
        }
    }

    let should_copy = !active.is_empty();
    let was_copying = copy_enabled.swap(should_copy, Ordering::SeqCst);
    if should_copy && !was_copying {
        info!("frame copying enabled - secondary displays connected");
    } else if !should_copy && was_copying {
        info!("frame copying disabled - no secondary displays connected");
    }

    info!("updated displays: {} active secondary displays", active.len());
}

/// Enable sequence for a sink: blank the CRTC, give the hardware time to
/// settle, allocate the buffer ring, then program the CRTC with the back
/// slot's framebuffer, retrying a few times before giving up and releasing
/// the ring.
fn enable_sink(kms: &KmsDevice, pool: &mut SinkBufferPool, disp: &Display) -> bool {
    if !disp.connected {
        return false;
    }

    info!("enabling secondary display: {}", disp.name);
    debug!(
        "display details: connector_id={}, encoder_id={}, crtc_id={}, mode={}x{}@{}Hz",
        disp.connector_id,
        disp.encoder_id,
        disp.crtc_id,
        disp.width(),
        disp.height(),
        disp.mode.map_or(0, |m| m.refresh),
    );

    // Clear whatever state the CRTC was left in.
    if let Err(err) = kms.disable(disp) {
        debug!("pre-enable blank of {} failed: {err:#}", disp.name);
    }
    thread::sleep(SETTLE_DELAY);

    if let Err(err) = pool.create(kms, disp) {
        warn!("error creating buffers for {}: {err:#}", disp.name);
        return false;
    }
    let Some(fb) = pool.ring(disp.connector_id).map(|ring| ring.back().fb) else {
        return false;
    };

    let mut enabled = false;
    for retry in 0..SET_CRTC_RETRIES {
        match kms.set_crtc(disp, fb) {
            Ok(()) => {
                enabled = true;
                break;
            }
            Err(err) => {
                warn!(
                    "failed to enable display {} (attempt {}/{SET_CRTC_RETRIES}): {err:#}",
                    disp.name,
                    retry + 1,
                );
                thread::sleep(SET_CRTC_RETRY_DELAY);
            }
        }
    }

    if !enabled {
        warn!("failed to enable display {} after {SET_CRTC_RETRIES} attempts", disp.name);
        pool.destroy(kms, disp.connector_id);
        return false;
    }

    // The mode-set committed the back slot; it is the on-screen buffer now.
    if let Some(ring) = pool.ring_mut(disp.connector_id) {
        ring.advance();
    }

    blit::reset_failure_log();
    info!("successfully enabled disp {}", disp.name);
    true
}

fn disable_sink(kms: &KmsDevice, pool: &mut SinkBufferPool, disp: &Display) {
    info!("disabling secondary disp: {}", disp.name);

    if let Err(err) = kms.disable(disp) {
        debug!("error blanking {}: {err:#}", disp.name);
    }
    pool.destroy(kms, disp.connector_id);

    info!("successfully disabled disp {}", disp.name);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[u32]) -> BTreeSet<u32> {
        ids.iter().copied().collect()
    }

    #[test]
    fn new_connection_enables() {
        let actions = diff_secondaries(&set(&[]), &set(&[42]), false);
        assert_eq!(actions, vec![SinkAction::Enable(42)]);
    }

    #[test]
    fn repeated_connect_is_a_noop_by_default() {
        // The same connect event twice produces exactly one enable
        // transition: the second reconciliation sees the sink already
        // active.
        let first = diff_secondaries(&set(&[]), &set(&[42]), false);
        assert_eq!(first, vec![SinkAction::Enable(42)]);

        let second = diff_secondaries(&set(&[42]), &set(&[42]), false);
        assert!(second.is_empty());
    }

    #[test]
    fn still_connected_refreshes_when_configured() {
        let actions = diff_secondaries(&set(&[42]), &set(&[42]), true);
        assert_eq!(actions, vec![SinkAction::Refresh(42)]);
    }

    #[test]
    fn disconnect_disables() {
        let actions = diff_secondaries(&set(&[42]), &set(&[]), false);
        assert_eq!(actions, vec![SinkAction::Disable(42)]);
    }

    #[test]
    fn disables_come_before_enables_in_connector_order() {
        let actions = diff_secondaries(&set(&[7, 9]), &set(&[3, 9, 12]), false);
        assert_eq!(
            actions,
            vec![
                SinkAction::Disable(7),
                SinkAction::Enable(3),
                SinkAction::Enable(12),
            ],
        );
    }

    #[test]
    fn failed_enable_is_retried_on_the_next_event() {
        // A sink whose enable failed is not recorded as active, so the next
        // reconciliation proposes the enable again.
        let actions = diff_secondaries(&set(&[]), &set(&[42]), false);
        assert_eq!(actions, vec![SinkAction::Enable(42)]);
        // ... enable fails; active stays empty ...
        let actions = diff_secondaries(&set(&[]), &set(&[42]), false);
        assert_eq!(actions, vec![SinkAction::Enable(42)]);
    }

    #[test]
    fn sixty_hertz_paces_within_tolerance() {
        let interval = target_frame_interval(60);
        // 58..62 iterations per second.
        assert!(interval <= Duration::from_secs_f64(1.0 / 58.0));
        assert!(interval >= Duration::from_secs_f64(1.0 / 62.0));
        assert_eq!(interval, Duration::from_micros(16_666));
    }

    #[test]
    fn unknown_refresh_falls_back_to_sixty() {
        assert_eq!(target_frame_interval(0), target_frame_interval(60));
    }
}
