//! Hot-plug reactor.
//!
//! A worker thread subscribes to kernel uevents for the drm subsystem. A
//! matching event carries no connector identity, only "something changed";
//! the reactor answers it by reading the sysfs `status` file of every
//! secondary connector of interest and emitting a transition event when the
//! recorded state differs. Transitions go onto a bounded channel that the
//! mirror loop drains at its reconciliation point; no lock is held while
//! emitting.

use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context;
use tracing::{debug, info, trace, warn};

/// Secondary connectors watched for hot-plug. Extending coverage is a table
/// entry, not new logic.
pub const WATCHED_CONNECTORS: &[&str] = &["card0-HDMI-A-1", "card0-DP-1"];

const MONITOR_POLL_MS: i32 = 1000;
const EVENT_QUEUE_DEPTH: usize = 16;

/// One observed connect/disconnect transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugEvent {
    pub connector: String,
    pub connected: bool,
}

/// Remembers the last observed state per connector and reports only
/// transitions, so repeated identical events collapse into one.
#[derive(Debug, Default)]
pub struct StatusTracker {
    states: HashMap<String, bool>,
}

impl StatusTracker {
    /// Records `connected` for `connector` and returns the event to emit if
    /// this is a transition. Unknown connectors start as disconnected.
    pub fn update(&mut self, connector: &str, connected: bool) -> Option<HotplugEvent> {
        let previous = self.states.insert(connector.to_owned(), connected);
        let previous = previous.unwrap_or(false);
        (previous != connected).then(|| HotplugEvent {
            connector: connector.to_owned(),
            connected,
        })
    }
}

/// Reads a connector's sysfs status file. The body is `connected` or
/// `disconnected` followed by a newline.
pub fn read_connector_status(sysfs_root: &Path, connector: &str) -> Option<bool> {
    let path = sysfs_root.join(connector).join("status");
    let body = std::fs::read_to_string(&path).ok()?;
    match body.trim_end() {
        "connected" => Some(true),
        "disconnected" => Some(false),
        other => {
            trace!("unexpected status {other:?} in {path:?}");
            None
        }
    }
}

pub struct HotplugReactor {
    sysfs_root: PathBuf,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    tx: SyncSender<HotplugEvent>,
}

impl HotplugReactor {
    /// Creates the reactor and the receiving end of its event channel.
    pub fn new() -> (Self, Receiver<HotplugEvent>) {
        let (tx, rx) = std::sync::mpsc::sync_channel(EVENT_QUEUE_DEPTH);
        let reactor = Self {
            sysfs_root: PathBuf::from("/sys/class/drm"),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            tx,
        };
        (reactor, rx)
    }

    /// Starts the monitor thread. Idempotent; fails if the kernel device
    /// event monitor cannot be constructed.
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);

        let running = Arc::clone(&self.running);
        let tx = self.tx.clone();
        let sysfs_root = self.sysfs_root.clone();

        // The udev handles live entirely on the worker thread; initialization
        // failure is reported back before start() returns.
        let (init_tx, init_rx) = std::sync::mpsc::sync_channel::<anyhow::Result<()>>(1);
        let thread = std::thread::Builder::new()
            .name("hotplug".to_owned())
            .spawn(move || {
                let socket = udev::MonitorBuilder::new()
                    .and_then(|builder| builder.match_subsystem("drm"))
                    .and_then(|builder| builder.listen());
                let socket = match socket {
                    Ok(socket) => {
                        let _ = init_tx.send(Ok(()));
                        socket
                    }
                    Err(err) => {
                        let _ = init_tx.send(Err(err).context("error creating udev monitor"));
                        return;
                    }
                };
                monitor_loop(socket, &running, &tx, &sysfs_root);
            })
            .context("error spawning hotplug thread")?;

        match init_rx.recv() {
            Ok(Ok(())) => {
                self.thread = Some(thread);
                info!("hotplug monitoring started");
                Ok(())
            }
            Ok(Err(err)) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = thread.join();
                Err(anyhow::anyhow!("hotplug thread died during init"))
            }
        }
    }

    /// Stops the monitor thread and joins it. Idempotent. The thread
    /// observes the flag within its next poll timeout (≤ 1 s).
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("hotplug thread panicked");
            } else {
                info!("hotplug monitoring stopped");
            }
        }
    }
}

impl Drop for HotplugReactor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn monitor_loop(
    socket: udev::MonitorSocket,
    running: &AtomicBool,
    tx: &SyncSender<HotplugEvent>,
    sysfs_root: &Path,
) {
    let mut tracker = StatusTracker::default();

    while running.load(Ordering::SeqCst) {
        let mut pfd = libc::pollfd {
            fd: socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, MONITOR_POLL_MS) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                warn!("hotplug poll error: {err}");
                break;
            }
            continue;
        }
        if ret == 0 || pfd.revents & libc::POLLIN == 0 {
            continue;
        }

        let mut relevant = false;
        for event in socket.iter() {
            if is_card0_change(&event) {
                relevant = true;
            }
        }
        if !relevant {
            continue;
        }

        debug!("drm change event for card0, checking watched connectors");
        for connector in WATCHED_CONNECTORS {
            let Some(connected) = read_connector_status(sysfs_root, connector) else {
                continue;
            };
            if let Some(event) = tracker.update(connector, connected) {
                info!(
                    "hotplug detected: {} -> {}",
                    event.connector,
                    if event.connected { "connected" } else { "disconnected" },
                );
                match tx.try_send(event) {
                    Ok(()) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Disconnected(_)) => return,
                }
            }
        }
    }
}

/// A relevant event is a `change` on the drm subsystem whose sysfs path
/// belongs to card0.
fn is_card0_change(event: &udev::Event) -> bool {
    if event.event_type() != udev::EventType::Change {
        return false;
    }
    if event.subsystem().map_or(true, |s| s != "drm") {
        return false;
    }
    event
        .syspath()
        .to_str()
        .is_some_and(|path| path.contains("/drm/card0"))
}
