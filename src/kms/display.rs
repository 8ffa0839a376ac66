//! Display records and connector identity.
//!
//! A display's name is the identity the rest of the daemon uses; it follows
//! the kernel's `card0-<TYPE>-<index>` shape with TYPE drawn from a fixed
//! table so that names survive re-enumeration.

use drm::control::{connector, crtc, Mode, ModeTypeFlags};

/// Whether a display is the mirroring source or one of the mirrored sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
}

/// The mode chosen for a connector together with the raw descriptor the
/// kernel wants back for mode-setting.
#[derive(Debug, Clone, Copy)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub refresh: u32,
    pub raw: Mode,
}

/// One output endpoint, keyed by its connector id. Records are refreshed in
/// place on every rescan and never removed; a connector that went away keeps
/// its row with `connected = false`.
#[derive(Debug, Clone)]
pub struct Display {
    pub connector_id: u32,
    pub encoder_id: u32,
    /// 0 means no CRTC could be assigned; the record is then unusable for
    /// scanout until a future rescan succeeds.
    pub crtc_id: u32,
    pub name: String,
    pub mode: Option<DisplayMode>,
    pub connected: bool,
    pub role: Role,
    /// Kernel-typed handles backing the ids above. Kept private to the KMS
    /// layer; everything outside refers to displays by connector id.
    pub(crate) handle: connector::Handle,
    pub(crate) crtc: Option<crtc::Handle>,
}

impl Display {
    pub fn width(&self) -> u32 {
        self.mode.map_or(0, |m| m.width)
    }

    pub fn height(&self) -> u32 {
        self.mode.map_or(0, |m| m.height)
    }

    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }
}

/// Canonical connector-type names. New connector types are additions here,
/// not edits elsewhere.
const CONNECTOR_TYPE_NAMES: &[(connector::Interface, &str)] = &[
    (connector::Interface::Unknown, "Unknown"),
    (connector::Interface::VGA, "VGA"),
    (connector::Interface::DVII, "DVII"),
    (connector::Interface::DVID, "DVID"),
    (connector::Interface::DVIA, "DVIA"),
    (connector::Interface::Composite, "Composite"),
    (connector::Interface::SVideo, "SVIDEO"),
    (connector::Interface::LVDS, "LVDS"),
    (connector::Interface::Component, "Component"),
    (connector::Interface::NinePinDIN, "9PinDIN"),
    (connector::Interface::DisplayPort, "DisplayPort"),
    (connector::Interface::HDMIA, "HDMIA"),
    (connector::Interface::HDMIB, "HDMIB"),
    (connector::Interface::TV, "TV"),
    (connector::Interface::EmbeddedDisplayPort, "eDP"),
    (connector::Interface::Virtual, "VIRTUAL"),
    (connector::Interface::DSI, "DSI"),
    (connector::Interface::DPI, "DPI"),
    (connector::Interface::Writeback, "WRITEBACK"),
    (connector::Interface::SPI, "SPI"),
];

fn interface_name(interface: connector::Interface) -> &'static str {
    CONNECTOR_TYPE_NAMES
        .iter()
        .find(|(i, _)| *i == interface)
        .map(|(_, name)| *name)
        .unwrap_or("Unknown")
}

/// Composes `card0-<TYPE>-<index>` for a connector.
pub fn connector_name(interface: connector::Interface, type_id: u32) -> String {
    format!("card0-{}-{}", interface_name(interface), type_id)
}

/// Inverse of [`connector_name`]. Returns the `(type, index)` pair a name
/// was composed from.
pub fn parse_connector_name(name: &str) -> Option<(connector::Interface, u32)> {
    let rest = name.strip_prefix("card0-")?;
    let (type_name, index) = rest.rsplit_once('-')?;
    let index = index.parse().ok()?;
    let interface = CONNECTOR_TYPE_NAMES
        .iter()
        .find(|(_, n)| *n == type_name)
        .map(|(i, _)| *i)?;
    Some((interface, index))
}

/// Secondary outputs we mirror to are the HDMI and DisplayPort connectors.
pub fn is_secondary_name(name: &str) -> bool {
    name.contains("HDMI") || name.contains("DisplayPort")
}

/// Picks the mode a display will be driven with: the connector's preferred
/// mode if one is flagged, otherwise the highest-resolution mode, ties
/// broken by enumeration order.
pub fn pick_mode(modes: &[Mode]) -> Option<DisplayMode> {
    let preferred = modes
        .iter()
        .find(|m| m.mode_type().contains(ModeTypeFlags::PREFERRED));

    let best = preferred.or_else(|| {
        let mut best: Option<&Mode> = None;
        for mode in modes {
            let area = |m: &Mode| {
                let (w, h) = m.size();
                u32::from(w) * u32::from(h)
            };
            match best {
                Some(current) if area(mode) <= area(current) => {}
                _ => best = Some(mode),
            }
        }
        best
    })?;

    let (width, height) = best.size();
    Some(DisplayMode {
        width: width.into(),
        height: height.into(),
        refresh: best.vrefresh(),
        raw: *best,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_mode(width: u16, height: u16, vrefresh: u32, preferred: bool) -> Mode {
        Mode::from(drm_ffi::drm_mode_modeinfo {
            clock: 0,
            hdisplay: width,
            hsync_start: width + 16,
            hsync_end: width + 32,
            htotal: width + 48,
            hskew: 0,
            vdisplay: height,
            vsync_start: height + 3,
            vsync_end: height + 6,
            vtotal: height + 9,
            vscan: 0,
            vrefresh,
            flags: 0,
            type_: if preferred { drm_ffi::DRM_MODE_TYPE_PREFERRED } else { 0 },
            name: [0; 32],
        })
    }

    #[test]
    fn preferred_mode_wins() {
        let modes = [
            make_mode(3840, 2160, 30, false),
            make_mode(1920, 1080, 60, true),
            make_mode(1280, 720, 60, false),
        ];
        let picked = pick_mode(&modes).unwrap();
        assert_eq!((picked.width, picked.height, picked.refresh), (1920, 1080, 60));
    }

    #[test]
    fn without_preferred_the_largest_mode_wins() {
        let modes = [
            make_mode(1280, 720, 60, false),
            make_mode(3840, 2160, 30, false),
            make_mode(1920, 1080, 60, false),
        ];
        let picked = pick_mode(&modes).unwrap();
        assert_eq!((picked.width, picked.height), (3840, 2160));
    }

    #[test]
    fn area_ties_break_by_enumeration_order() {
        let modes = [
            make_mode(1920, 1080, 50, false),
            make_mode(1920, 1080, 60, false),
        ];
        let picked = pick_mode(&modes).unwrap();
        assert_eq!(picked.refresh, 50);
    }

    #[test]
    fn empty_mode_list_yields_none() {
        assert!(pick_mode(&[]).is_none());
    }

    #[test]
    fn names_follow_the_fixed_table() {
        assert_eq!(connector_name(connector::Interface::HDMIA, 1), "card0-HDMIA-1");
        assert_eq!(
            connector_name(connector::Interface::DisplayPort, 1),
            "card0-DisplayPort-1"
        );
        assert_eq!(connector_name(connector::Interface::DSI, 1), "card0-DSI-1");
        assert_eq!(connector_name(connector::Interface::Unknown, 3), "card0-Unknown-3");
    }

    #[test]
    fn parse_round_trips_every_table_entry() {
        for (interface, _) in CONNECTOR_TYPE_NAMES {
            for index in [1, 2, 17] {
                let name = connector_name(*interface, index);
                assert_eq!(parse_connector_name(&name), Some((*interface, index)));
            }
        }
    }

    #[test]
    fn parse_rejects_foreign_names() {
        assert_eq!(parse_connector_name("card1-HDMIA-1"), None);
        assert_eq!(parse_connector_name("card0-HDMIA"), None);
        assert_eq!(parse_connector_name("card0-NOPE-1"), None);
        assert_eq!(parse_connector_name("card0-HDMIA-x"), None);
    }

    #[test]
    fn hdmi_and_dp_are_secondaries() {
        assert!(is_secondary_name("card0-HDMIA-1"));
        assert!(is_secondary_name("card0-HDMIB-2"));
        assert!(is_secondary_name("card0-DisplayPort-1"));
        assert!(!is_secondary_name("card0-DSI-1"));
        assert!(!is_secondary_name("card0-eDP-1"));
    }
}
