//! autochroot - rescue chroot script generator.
//!
//! Reads the installed system's fstab and block-device layout, resolves every
//! entry to a concrete device (unlocking order, btrfs subvolumes included)
//! and installs an idempotent shell script that rebuilds the mount hierarchy
//! and enters it with arch-chroot.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use autochroot::config::{Config, DEFAULT_CONFIG_PATH};
use autochroot::engine::{self, Mode};
use autochroot::inventory::SystemInventory;
use autochroot::process;

#[derive(Parser)]
#[command(name = "autochroot")]
#[command(about = "Generate a rescue chroot script from the system's mount configuration")]
#[command(
    after_help = "A plain invocation reads /etc/fstab and installs the script.\n\
                  Use --dry-run to inspect the plan without writing anything."
)]
struct Cli {
    /// Resolve and plan, print the would-be script, write nothing
    #[arg(long)]
    dry_run: bool,

    /// Verbose debug logging
    #[arg(long)]
    debug: bool,

    /// Alternate configuration file (default: /etc/autochroot.conf)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the mount table path from the configuration
    #[arg(long, value_name = "PATH")]
    fstab: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            // Logging is not up yet; this goes straight to stderr.
            eprintln!("autochroot: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(fstab) = cli.fstab {
        config.general.fstab_path = fstab;
    }

    init_logging(&config, cli.debug);

    let mode = if cli.dry_run {
        Mode::DryRun
    } else {
        Mode::Generate
    };

    if !process::exists("lsblk") {
        error!(
            class = "ResolutionError",
            "required tool 'lsblk' not found in PATH"
        );
        std::process::exit(1);
    }

    let inventory =
        match SystemInventory::scan(Duration::from_secs(config.mount.lookup_timeout)) {
            Ok(inventory) => inventory,
            Err(e) => {
                error!(class = "ResolutionError", "{}", e);
                std::process::exit(1);
            }
        };

    match engine::run(&config, &inventory, mode) {
        Ok(outcome) => {
            for warning in &outcome.warnings {
                info!("skipped: {}", warning);
            }
            if mode == Mode::DryRun {
                println!("# Plan ({} steps):", outcome.plan_lines.len());
                for line in &outcome.plan_lines {
                    println!("#   {}", line);
                }
                println!();
                print!("{}", outcome.script_text);
            } else if let Some(report) = &outcome.installed {
                info!(
                    script = %report.written_to.display(),
                    "generation complete"
                );
            }
            Ok(())
        }
        Err(e) => {
            error!(class = e.class(), "{}", e);
            std::process::exit(1);
        }
    }
}

/// Stderr always; the configured log file too when it can be opened
/// (generation must still work from a read-only rescue environment).
fn init_logging(config: &Config, debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else {
        config.general.log_level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.general.log_file)
        .ok();

    match log_file {
        Some(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr.and(Arc::new(file)))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}
