use anyhow::Result;
use clap::{Args, Subcommand};
use std::fs;
use std::path::Path;

#[cfg(unix)]
use daemonize::Daemonize;

use super::MonitorArgs;
use super::watch::patrol;
use usbkill::concurrency::InstanceLock;
use usbkill::config::Config;
use usbkill::paths::Paths;

#[derive(Args)]
pub struct DaemonArgs {
    #[command(subcommand)]
    pub command: DaemonCommands,
}

#[derive(Args, Debug, Clone)]
pub struct StartArgs {
    /// Run in foreground (don't daemonize)
    #[arg(short, long)]
    pub foreground: bool,

    #[command(flatten)]
    pub monitor: MonitorArgs,
}

#[derive(Subcommand)]
pub enum DaemonCommands {
    /// Start the monitor in the background
    Start(StartArgs),

    /// Stop the background monitor
    Stop,

    /// Show daemon status
    Status,
}

pub async fn run(args: DaemonArgs, paths: &Paths) -> Result<()> {
    match args.command {
        DaemonCommands::Start(start) => start_daemon(&start, paths).await,
        DaemonCommands::Stop => stop_daemon(paths).await,
        DaemonCommands::Status => show_status(paths),
    }
}

/// Fork and daemonize BEFORE starting the Tokio runtime.
#[cfg(unix)]
pub fn daemonize_and_run(args: &StartArgs, paths: &Paths, verbose: bool) -> Result<()> {
    // Settings errors must surface here, not in a detached log.
    let config = Config::load_from(&paths.config_file)?;

    paths.ensure_runtime_dir()?;
    let pid_file = paths.pid_file();
    check_not_running(&pid_file)?;

    // Probe the lock so a running foreground monitor is reported now.
    let lock = InstanceLock::new(paths)?;
    drop(lock.acquire_or_bail()?);

    let log_file = paths.daemon_log();

    println!("Starting usbkill daemon in background ({})...", mode_label(&args.monitor));
    println!("  PID file: {}", pid_file.display());
    println!("  Log file: {}", log_file.display());
    println!("  Kill log: {}", config.logging.file.display());
    println!("\nUse 'usbkill daemon status' to check status");
    println!("Use 'usbkill daemon stop' to stop\n");

    let stdout = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)?;
    let stderr = stdout.try_clone()?;

    let daemonize = Daemonize::new()
        .pid_file(&pid_file)
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr);

    match daemonize.start() {
        Ok(_) => {
            // Now in the child process - safe to start Tokio
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(run_daemon_monitor(config, args, paths, verbose))
        }
        Err(e) => anyhow::bail!("Failed to daemonize: {}", e),
    }
}

/// Body of the forked child.
#[cfg(unix)]
async fn run_daemon_monitor(
    config: Config,
    args: &StartArgs,
    paths: &Paths,
    verbose: bool,
) -> Result<()> {
    // Disable ANSI colors since we're writing to a file
    tracing_subscriber::fmt()
        .with_env_filter(super::log_filter(verbose, Some(&config.logging.level)))
        .with_ansi(false)
        .init();

    let result: Result<()> = async {
        let _lock = InstanceLock::new(paths)?.acquire_or_bail()?;
        println!("Daemon started successfully");
        patrol(config, &args.monitor).await
    }
    .await;

    if let Err(ref e) = result {
        tracing::error!("Daemon stopped: {:#}", e);
    }
    println!("\nShutting down...");
    fs::remove_file(paths.pid_file()).ok();

    result
}

async fn start_daemon(args: &StartArgs, paths: &Paths) -> Result<()> {
    let config = Config::load_from(&paths.config_file)?;

    paths.ensure_runtime_dir()?;
    let pid_file = paths.pid_file();
    check_not_running(&pid_file)?;

    // Background mode on Unix is handled by daemonize_and_run() before Tokio starts
    #[cfg(unix)]
    if !args.foreground {
        anyhow::bail!("Background mode should be handled before Tokio starts");
    }

    #[cfg(not(unix))]
    if !args.foreground {
        println!(
            "Note: Background daemonization not supported on this platform. Running in foreground."
        );
    }

    let _lock = InstanceLock::new(paths)?.acquire_or_bail()?;

    println!("Starting usbkill daemon in foreground ({})...", mode_label(&args.monitor));
    fs::write(&pid_file, std::process::id().to_string())?;

    let result = patrol(config, &args.monitor).await;

    println!("\nShutting down...");
    fs::remove_file(&pid_file).ok();

    result
}

async fn stop_daemon(paths: &Paths) -> Result<()> {
    let pid_file = paths.pid_file();

    let Some(pid) = read_pid(&pid_file)? else {
        println!("Daemon is not running");
        return Ok(());
    };

    if !is_process_running(pid) {
        println!("Daemon is not running (stale PID file)");
        fs::remove_file(&pid_file)?;
        return Ok(());
    }

    println!("Stopping daemon (PID: {})...", pid);
    terminate(pid)?;

    // Wait for process to stop (up to 5 seconds)
    for _ in 0..50 {
        if !is_process_running(pid) {
            break;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }

    if is_process_running(pid) {
        anyhow::bail!("Failed to stop daemon (PID: {})", pid);
    }

    println!("Daemon stopped");
    fs::remove_file(&pid_file).ok();

    Ok(())
}

fn show_status(paths: &Paths) -> Result<()> {
    let pid_file = paths.pid_file();
    let running = read_pid(&pid_file)?.filter(|pid| is_process_running(*pid));

    println!("usbkill Daemon Status");
    println!("---------------------");
    println!("Running: {}", if running.is_some() { "yes" } else { "no" });
    if let Some(pid) = running {
        println!("PID: {}", pid);
    }
    println!("Daemon log: {}", paths.daemon_log().display());

    println!("\nSettings ({}):", paths.config_file.display());
    match Config::load_from(&paths.config_file) {
        Ok(config) => {
            println!("  Kill log: {}", config.logging.file.display());
            println!("  Poll interval: {} ms", config.monitor.sleep_time_ms);
            println!("  Whitelisted devices: {}", config.monitor.whitelist.len());
            println!(
                "  Enumeration failures tolerated: {}",
                config.monitor.enumeration_failure_threshold.saturating_sub(1)
            );
            println!("  Melt: {}", config.kill.melt_usbkill);
            println!("  Folders to remove: {}", config.kill.folders_to_remove.len());
            println!("  Kill commands: {}", config.kill.kill_commands.len());
            println!("  Sync: {}", config.kill.do_sync);
            println!("  Wipe RAM: {}", config.kill.do_wipe_ram);
            println!("  Wipe swap: {}", config.kill.do_wipe_swap);
            println!("  Shut down: {}", config.kill.shut_down);
        }
        Err(e) => println!("  Not usable: {}", e),
    }

    Ok(())
}

fn mode_label(args: &MonitorArgs) -> &'static str {
    match (args.disable_test_mode, args.no_shut_down) {
        (false, _) => "test mode",
        (true, false) => "armed",
        (true, true) => "armed, no shut down",
    }
}

fn check_not_running(pid_file: &Path) -> Result<()> {
    if let Some(pid) = read_pid(pid_file)? {
        if is_process_running(pid) {
            anyhow::bail!("Daemon already running (PID: {})", pid);
        }
        fs::remove_file(pid_file)?;
    }
    Ok(())
}

/// `None` if there is no PID file. An unparseable file counts as stale.
fn read_pid(pid_file: &Path) -> Result<Option<i32>> {
    if !pid_file.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(pid_file)?;
    Ok(Some(content.trim().parse().unwrap_or(0)))
}

fn is_process_running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        // EPERM still means the process exists.
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(errno) => errno == nix::errno::Errno::EPERM,
        }
    }

    #[cfg(windows)]
    {
        use std::process::Command;
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid)])
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }
}

fn terminate(pid: i32) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid), Signal::SIGTERM)?;
    }

    #[cfg(windows)]
    {
        use std::process::Command;
        Command::new("taskkill")
            .args(["/PID", &pid.to_string()])
            .status()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_pid_file_means_not_running() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(read_pid(&tmp.path().join("usbkill.pid")).unwrap(), None);
    }

    #[test]
    fn garbage_pid_file_is_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_file = tmp.path().join("usbkill.pid");
        fs::write(&pid_file, "not a pid").unwrap();

        assert_eq!(read_pid(&pid_file).unwrap(), Some(0));
        check_not_running(&pid_file).unwrap();
        assert!(!pid_file.exists());
    }

    #[cfg(unix)]
    #[test]
    fn own_process_counts_as_running() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_file = tmp.path().join("usbkill.pid");
        fs::write(&pid_file, format!("{}\n", std::process::id())).unwrap();

        assert!(is_process_running(std::process::id() as i32));
        assert!(check_not_running(&pid_file).is_err());
        assert!(pid_file.exists());
    }

    #[test]
    fn mode_label_reflects_flags() {
        assert_eq!(mode_label(&MonitorArgs::default()), "test mode");
        let live = MonitorArgs {
            disable_test_mode: true,
            no_shut_down: true,
        };
        assert_eq!(mode_label(&live), "armed, no shut down");
    }
}
