use anyhow::Result;
use clap::Args;

use usbkill::config::Config;
use usbkill::device::{DeviceEnumerator, LsusbEnumerator};
use usbkill::paths::Paths;

#[derive(Args)]
pub struct DevicesArgs {
    /// Also print the raw listing
    #[arg(short, long)]
    pub raw: bool,
}

pub async fn run(args: DevicesArgs, paths: &Paths) -> Result<()> {
    // Settings are optional here; only the listing command is taken from them.
    let enumerator = match Config::load_from(&paths.config_file) {
        Ok(config) => LsusbEnumerator::new(config.monitor.lsusb_command),
        Err(e) => {
            tracing::debug!("Using default listing command: {}", e);
            LsusbEnumerator::default()
        }
    };

    let snapshot = tokio::task::spawn_blocking(move || enumerator.enumerate()).await??;

    if args.raw {
        print!("{}", snapshot.raw);
        println!();
    }

    for id in snapshot.devices.iter() {
        println!("{}", id);
    }

    println!("\n# {} device(s). To trust all of them:", snapshot.devices.len());
    println!("{}", whitelist_line(&snapshot.devices));

    Ok(())
}

/// A `whitelist = [...]` line; repeated devices repeat their pair.
fn whitelist_line(devices: &usbkill::device::DeviceSet) -> String {
    let entries: Vec<String> = devices
        .iter()
        .map(|id| format!("\"{:04x}:{:04x}\"", id.vendor(), id.product()))
        .collect();
    format!("whitelist = [{}]", entries.join(", "))
}
