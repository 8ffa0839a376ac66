//! Command-line surface. Parsing happens here; the daemon core only ever
//! sees the resulting [`DisplayConfig`] and [`LogConfig`].

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::{DisplayConfig, LogConfig, Quality, Rotation, ScaleMode};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ScaleModeArg {
    Stretch,
    KeepAspect,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum QualityArg {
    Fast,
    Good,
}

#[derive(Parser, Debug)]
#[command(name = "dsimirror", version, disable_version_flag = true)]
#[command(about = "Mirrors the DSI panel to HDMI and DP outputs when they are connected")]
pub struct Cli {
    /// Show version information.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Scaling mode for secondary outputs.
    #[arg(long, value_enum, default_value = "stretch")]
    pub scale_mode: ScaleModeArg,

    /// Clockwise rotation in degrees: 0, 90, 180 or 270.
    #[arg(long, default_value_t = 90, value_parser = parse_rotation)]
    pub rotation: u32,

    /// Interpolation quality of the CPU blit path.
    #[arg(long, value_enum, default_value = "good")]
    pub quality: QualityArg,

    /// Enable debug mode.
    #[arg(long)]
    pub debug: bool,

    /// Detach from the controlling terminal.
    #[arg(short, long)]
    pub daemon: bool,

    /// Substring identifying the primary connector.
    #[arg(long, value_name = "NAME", default_value = "DSI-1")]
    pub primary_connector: String,

    /// Disable and re-enable sinks that stay connected across a topology
    /// event instead of leaving them alone.
    #[arg(long)]
    pub refresh_reconnected: bool,

    /// DRM device node.
    #[arg(long, value_name = "PATH", default_value = "/dev/dri/card0")]
    pub device: PathBuf,

    /// Log level: 0=trace, 1=debug, 2=info, 3=warn, 4=error, 5=critical.
    #[arg(long, value_name = "N", default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=5))]
    pub log_level: u8,

    /// Log file path.
    #[arg(long, value_name = "PATH", default_value = "./dsimirror.log")]
    pub log_file: PathBuf,

    /// Disable console output.
    #[arg(long)]
    pub no_console: bool,

    /// Disable file logging.
    #[arg(long)]
    pub no_file_log: bool,

    /// Skip the systemd/DSI startup precondition checks.
    #[arg(long, hide = true)]
    pub skip_checks: bool,
}

fn parse_rotation(arg: &str) -> Result<u32, String> {
    let degrees: u32 = arg.parse().map_err(|_| format!("invalid rotation angle: {arg}"))?;
    if Rotation::from_degrees(degrees).is_none() {
        return Err(format!("invalid rotation angle: {degrees}"));
    }
    Ok(degrees)
}

impl Cli {
    pub fn display_config(&self) -> DisplayConfig {
        DisplayConfig {
            scale_mode: match self.scale_mode {
                ScaleModeArg::Stretch => ScaleMode::Stretch,
                ScaleModeArg::KeepAspect => ScaleMode::KeepAspect,
            },
            rotation: Rotation::from_degrees(self.rotation).unwrap_or_default(),
            quality: match self.quality {
                QualityArg::Fast => Quality::Fast,
                QualityArg::Good => Quality::Good,
            },
            enable_debug: self.debug,
            primary_match: self.primary_connector.clone(),
            refresh_reconnected: self.refresh_reconnected,
            device_path: self.device.clone(),
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            log_level: self.log_level,
            log_file_path: self.log_file.clone(),
            enable_console: !self.no_console,
            enable_file: !self.no_file_log,
        }
    }
}
