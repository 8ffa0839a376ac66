//! Startup precondition checks.
//!
//! The daemon owns the physical outputs, so it refuses to start when a
//! desktop session could be running: the default systemd target must be
//! `multi-user.target`, `graphical.target` must not be active, and a DSI
//! panel must actually be connected.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context};
use tracing::{debug, info, warn};

/// Runs all startup condition checks; any failure aborts startup.
pub fn check_startup_conditions() -> anyhow::Result<()> {
    info!("checking system startup conditions");

    if !is_multi_user_target()? {
        bail!("system default target is not multi-user.target");
    }
    if systemd_unit_active("graphical.target")? {
        bail!("graphical.target is active, not suitable for display mirroring");
    }
    if !has_connected_dsi(Path::new("/sys/class/drm"))? {
        bail!("no connected DSI display found");
    }

    info!("all startup conditions satisfied");
    Ok(())
}

fn is_multi_user_target() -> anyhow::Result<bool> {
    let mut target = run_systemctl(&["get-default"])?;
    if target.is_empty() {
        // Some images report no default target; fall back to whichever
        // multi-user/graphical target is currently active.
        let listing = run_systemctl(&["list-units", "--type=target", "--state=active"])?;
        target = first_active_target(&listing).unwrap_or_default().to_owned();
    }
    info!("current default target: {target}");
    Ok(target.contains("multi-user.target"))
}

/// Picks the unit name out of a `systemctl list-units` listing: the first
/// column of the first line naming a multi-user or graphical target.
fn first_active_target(listing: &str) -> Option<&str> {
    listing
        .lines()
        .find(|line| line.contains("multi-user") || line.contains("graphical"))
        .and_then(|line| line.split_whitespace().next())
}

fn systemd_unit_active(unit: &str) -> anyhow::Result<bool> {
    let state = run_systemctl(&["is-active", unit])?;
    debug!("unit {unit} status: {state}");
    Ok(state == "active")
}

fn run_systemctl(args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new("systemctl")
        .args(args)
        .output()
        .with_context(|| format!("error running systemctl {args:?}"))?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

/// Scans `/sys/class/drm` for a `card0-DSI*` connector reporting
/// `connected`.
fn has_connected_dsi(sysfs_root: &Path) -> anyhow::Result<bool> {
    let entries = std::fs::read_dir(sysfs_root)
        .with_context(|| format!("cannot open DRM directory {sysfs_root:?}"))?;

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("error reading {sysfs_root:?} entry: {err}");
                continue;
            }
        };

        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with("card0-DSI") {
            continue;
        }

        let status_path = entry.path().join("status");
        match std::fs::read_to_string(&status_path) {
            Ok(body) if body.trim_end() == "connected" => {
                info!("found connected DSI display: {name}");
                return Ok(true);
            }
            Ok(_) => {}
            Err(err) => debug!("cannot read {status_path:?}: {err}"),
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_connector(root: &Path, name: &str, status: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("status"), status).unwrap();
    }

    #[test]
    fn finds_a_connected_dsi_panel() {
        let dir = tempfile::tempdir().unwrap();
        write_connector(dir.path(), "card0-HDMI-A-1", "connected\n");
        write_connector(dir.path(), "card0-DSI-1", "connected\n");
        assert!(has_connected_dsi(dir.path()).unwrap());
    }

    #[test]
    fn disconnected_dsi_does_not_count() {
        let dir = tempfile::tempdir().unwrap();
        write_connector(dir.path(), "card0-DSI-1", "disconnected\n");
        assert!(!has_connected_dsi(dir.path()).unwrap());
    }

    #[test]
    fn hdmi_only_system_has_no_dsi() {
        let dir = tempfile::tempdir().unwrap();
        write_connector(dir.path(), "card0-HDMI-A-1", "connected\n");
        assert!(!has_connected_dsi(dir.path()).unwrap());
    }

    #[test]
    fn missing_sysfs_root_is_an_error() {
        assert!(has_connected_dsi(Path::new("/nonexistent-sysfs-root")).is_err());
    }

    #[test]
    fn active_target_listing_yields_the_unit_name() {
        let listing = "\
basic.target    loaded active active Basic System
multi-user.target loaded active active Multi-User System
sockets.target  loaded active active Sockets";
        assert_eq!(first_active_target(listing), Some("multi-user.target"));
    }

    #[test]
    fn graphical_target_is_also_recognized() {
        let listing = "graphical.target loaded active active Graphical Interface";
        assert_eq!(first_active_target(listing), Some("graphical.target"));
    }

    #[test]
    fn listing_without_relevant_targets_yields_none() {
        let listing = "sockets.target loaded active active Sockets";
        assert_eq!(first_active_target(listing), None);
    }
}
