//! Runtime configuration for the mirroring pipeline and the logger.

use std::fmt;
use std::path::PathBuf;

/// How a captured frame is fitted into a sink that has a different size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleMode {
    /// Fill the whole sink, ignoring the source aspect ratio.
    #[default]
    Stretch,
    /// Uniform scale, centered, with black bars on one axis.
    KeepAspect,
}

/// Clockwise rotation applied on the way to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Rot0,
    Rot90,
    Rot180,
    Rot270,
}

impl Rotation {
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees {
            0 => Some(Self::Rot0),
            90 => Some(Self::Rot90),
            180 => Some(Self::Rot180),
            270 => Some(Self::Rot270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Self::Rot0 => 0,
            Self::Rot90 => 90,
            Self::Rot180 => 180,
            Self::Rot270 => 270,
        }
    }

    /// Whether this rotation swaps the effective source width and height.
    pub fn swaps_axes(self) -> bool {
        matches!(self, Self::Rot90 | Self::Rot270)
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

/// Interpolation used by the CPU blit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quality {
    /// Nearest neighbor.
    Fast,
    /// Bilinear.
    #[default]
    Good,
}

/// User-visible knobs, applied read-only once per frame.
#[derive(Debug, Clone)]
pub struct DisplayConfig {
    pub scale_mode: ScaleMode,
    pub rotation: Rotation,
    pub quality: Quality,
    pub enable_debug: bool,
    /// Substring that identifies the primary connector name.
    pub primary_match: String,
    /// Re-run the disable/enable dance for sinks that stay connected across
    /// a topology event. Some panels need it; defaults to off.
    pub refresh_reconnected: bool,
    /// DRM device node to open.
    pub device_path: PathBuf,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            scale_mode: ScaleMode::default(),
            rotation: Rotation::Rot90,
            quality: Quality::default(),
            enable_debug: false,
            primary_match: "DSI-1".to_owned(),
            refresh_reconnected: false,
            device_path: PathBuf::from("/dev/dri/card0"),
        }
    }
}

/// Logger configuration, filled in by the CLI layer.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// 0=trace, 1=debug, 2=info, 3=warn, 4=error, 5=critical.
    pub log_level: u8,
    pub log_file_path: PathBuf,
    pub enable_console: bool,
    pub enable_file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: 2,
            log_file_path: PathBuf::from("./dsimirror.log"),
            enable_console: true,
            enable_file: true,
        }
    }
}
