use anyhow::Result;
use clap::Args;
use std::sync::Arc;
use tracing::{info, warn};

use super::MonitorArgs;
use usbkill::concurrency::InstanceLock;
use usbkill::config::Config;
use usbkill::device::LsusbEnumerator;
use usbkill::monitor::{Mode, Monitor, MonitorState};
use usbkill::paths::Paths;
use usbkill::trigger::HostRunner;

#[derive(Args)]
pub struct WatchArgs {
    #[command(flatten)]
    pub monitor: MonitorArgs,
}

pub async fn run(args: WatchArgs, paths: &Paths) -> Result<()> {
    let config = Config::load_from(&paths.config_file)?;
    let _lock = InstanceLock::new(paths)?.acquire_or_bail()?;

    patrol(config, &args.monitor).await
}

/// Arm a monitor against the real host and poll until triggered or stopped.
pub async fn patrol(config: Config, args: &MonitorArgs) -> Result<()> {
    let mode = args.mode();

    #[cfg(unix)]
    if mode == Mode::Live && unsafe { libc::geteuid() } != 0 {
        warn!("Not running as root: removal, kill commands and power-off may fail");
    }

    let enumerator = Arc::new(LsusbEnumerator::new(config.monitor.lsusb_command.clone()));
    let mut monitor = Monitor::new(enumerator, Arc::new(HostRunner), mode).with_settings(config);
    if args.no_shut_down {
        monitor = monitor.without_power_off();
    }

    let armed = monitor.start()?;

    println!(
        "Patrolling USB ports every {} ms ({} baseline device(s), {} whitelisted)",
        armed.interval().as_millis(),
        armed.policy().baseline().len(),
        armed.policy().whitelist().len()
    );
    if mode == Mode::Test {
        println!("Test mode: changes are reported, nothing is destroyed.");
        println!("Use --disable-test-mode to arm the kill sequence.");
    }

    tokio::select! {
        result = armed.run() => {
            if result? == MonitorState::Triggered {
                info!("Kill sequence finished, monitor will not re-arm");
                shutdown_signal().await?;
            }
        }
        signal = shutdown_signal() => {
            signal?;
            println!("\nStopping monitor...");
        }
    }

    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix (sent by `daemon stop`).
pub async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = term.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}
