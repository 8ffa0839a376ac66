//! Tracing setup driven by [`LogConfig`].

use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::Context;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogConfig;

fn level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::TRACE,
        1 => LevelFilter::DEBUG,
        2 => LevelFilter::INFO,
        3 => LevelFilter::WARN,
        // tracing has no separate critical level; 5 collapses into error.
        _ => LevelFilter::ERROR,
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the numeric level.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level_filter(config.log_level).into()));

    let console = config.enable_console.then(|| fmt::layer().with_writer(std::io::stderr));

    let file = if config.enable_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_file_path)
            .with_context(|| format!("error opening log file {:?}", config.log_file_path))?;
        Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("error installing the tracing subscriber")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_levels_map_to_tracing_levels() {
        assert_eq!(level_filter(0), LevelFilter::TRACE);
        assert_eq!(level_filter(2), LevelFilter::INFO);
        assert_eq!(level_filter(4), LevelFilter::ERROR);
        assert_eq!(level_filter(5), LevelFilter::ERROR);
    }
}
