use anyhow::Result;
use clap::Parser;

mod cli;

use cli::{Cli, Commands};
use usbkill::config::Config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Background start must fork BEFORE starting Tokio
    #[cfg(unix)]
    if let Commands::Daemon(ref args) = cli.command
        && let cli::daemon::DaemonCommands::Start(ref start) = args.command
        && !start.foreground
    {
        return cli::daemon::daemonize_and_run(start, &cli.paths(), cli.verbose);
    }

    // For all other commands, start the async runtime normally
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let paths = cli.paths();

    // Settings may be absent (config init, devices); fall back to defaults.
    let level = Config::load_from(&paths.config_file)
        .ok()
        .map(|c| c.logging.level);
    tracing_subscriber::fmt()
        .with_env_filter(cli::log_filter(cli.verbose, level.as_deref()))
        .init();

    match cli.command {
        Commands::Watch(args) => cli::watch::run(args, &paths).await,
        Commands::Daemon(args) => cli::daemon::run(args, &paths).await,
        Commands::Devices(args) => cli::devices::run(args, &paths).await,
        Commands::Config(args) => cli::config::run(args, &paths).await,
    }
}
