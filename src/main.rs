//! dsimirror: mirrors a DSI primary panel onto hot-pluggable HDMI and
//! DisplayPort outputs over DRM/KMS.

mod blit;
mod cli;
mod config;
mod frame;
mod hotplug;
mod kms;
mod logging;
mod mirror;
mod pool;
mod preflight;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info};

use crate::cli::Cli;
use crate::mirror::Daemon;

/// Set by the signal handler, observed by the main thread. The handler
/// itself does nothing else.
static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signal: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }
}

/// Detaches from the controlling terminal: fork, parent exits, child starts
/// a new session with stdio pointed at /dev/null (stdout/stderr only when
/// console logging is off, so `--log-file`-less runs stay observable).
fn daemonize(keep_console: bool) -> anyhow::Result<()> {
    unsafe {
        match libc::fork() {
            -1 => bail!("fork failed: {}", std::io::Error::last_os_error()),
            0 => {}
            pid => {
                info!("daemon started with PID: {pid}");
                std::process::exit(0);
            }
        }

        libc::setsid();

        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if devnull >= 0 {
            libc::dup2(devnull, libc::STDIN_FILENO);
            if !keep_console {
                libc::dup2(devnull, libc::STDOUT_FILENO);
                libc::dup2(devnull, libc::STDERR_FILENO);
            }
            if devnull > 2 {
                libc::close(devnull);
            }
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        error!("{err:#}");
        eprintln!("dsimirror: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let log_config = cli.log_config();
    logging::init(&log_config)?;

    info!("starting dsimirror v{}", env!("CARGO_PKG_VERSION"));

    if cli.skip_checks {
        info!("skipping startup condition checks");
    } else {
        preflight::check_startup_conditions().context("system startup conditions not met")?;
    }

    let mut daemon =
        Daemon::new(cli.display_config()).context("failed to initialize display manager")?;

    if cli.daemon {
        daemonize(log_config.enable_console)?;
    }

    install_signal_handlers();

    daemon.start().context("failed to start display manager")?;
    info!("display manager is running");

    while !STOP.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(1));
    }

    info!("received stop signal, shutting down");
    daemon.stop();
    Ok(())
}
