pub mod config;
pub mod daemon;
pub mod devices;
pub mod watch;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use usbkill::monitor::Mode;
use usbkill::paths::Paths;

#[derive(Parser)]
#[command(name = "usbkill")]
#[command(
    author,
    version,
    about = "Shut the computer down when its USB devices change"
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to settings file
    #[arg(short, long, global = true, env = "USBKILL_CONFIG")]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Resolved locations, with `--config` applied.
    pub fn paths(&self) -> Paths {
        Paths::resolve().with_config_file(self.config.as_deref())
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch the USB ports in the foreground
    Watch(watch::WatchArgs),

    /// Manage the background monitor
    Daemon(daemon::DaemonArgs),

    /// List connected devices (useful for building a whitelist)
    Devices(devices::DevicesArgs),

    /// Settings file management
    Config(config::ConfigArgs),
}

/// Flags shared by every command that arms a monitor.
#[derive(Args, Debug, Clone, Default)]
pub struct MonitorArgs {
    /// Run the kill sequence on a violation instead of only reporting it
    #[arg(long)]
    pub disable_test_mode: bool,

    /// Never power off, even when `shut_down` is set
    #[arg(long)]
    pub no_shut_down: bool,
}

impl MonitorArgs {
    pub fn mode(&self) -> Mode {
        if self.disable_test_mode {
            Mode::Live
        } else {
            Mode::Test
        }
    }
}

/// RUST_LOG wins, then `--verbose`, then the settings' `logging.level`.
pub fn log_filter(verbose: bool, configured: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose {
            "debug"
        } else {
            configured.unwrap_or("info")
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}
