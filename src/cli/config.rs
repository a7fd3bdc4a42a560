use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};

use usbkill::config::Config;
use usbkill::paths::Paths;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the loaded settings
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Show settings file path
    Path,

    /// Write the commented default settings file
    Init {
        /// Overwrite existing settings
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a settings file and install it at the settings location
    Copy {
        /// Settings file to install
        source: PathBuf,

        /// Overwrite existing settings
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run(args: ConfigArgs, paths: &Paths) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format } => show_config(&paths.config_file, &format),
        ConfigCommands::Path => show_path(&paths.config_file),
        ConfigCommands::Init { force } => init_config(&paths.config_file, force),
        ConfigCommands::Copy { source, force } => {
            copy_config(&source, &paths.config_file, force)
        }
    }
}

fn show_config(path: &Path, format: &str) -> Result<()> {
    let config = Config::load_from(path)?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
        }
        _ => {
            let toml = toml::to_string_pretty(&config)?;
            println!("{}", toml);
        }
    }

    Ok(())
}

fn show_path(path: &Path) -> Result<()> {
    println!("{}", path.display());
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    refuse_overwrite(path, force)?;

    Config::write_template(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    restrict_permissions(path)?;

    println!("Created settings file at {}", path.display());
    Ok(())
}

fn copy_config(source: &Path, target: &Path, force: bool) -> Result<()> {
    // Never install something the monitor would refuse to start with.
    Config::load_from(source)?;
    refuse_overwrite(target, force)?;

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, target).with_context(|| {
        format!("Failed to copy {} to {}", source.display(), target.display())
    })?;
    restrict_permissions(target)?;

    println!("Installed {} at {}", source.display(), target.display());
    Ok(())
}

fn refuse_overwrite(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Settings file already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }
    Ok(())
}

/// Settings name commands that run as root; keep them owner-only.
fn restrict_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
