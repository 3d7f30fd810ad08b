//! OnuBank CLI - operator tool for dual-bank firmware management.
//!
//! Thin front end over the `onubank` library: it loads the device
//! configuration, brings up an [`ImageManager`] over the [`UbusShell`]
//! transport and maps each subcommand onto one management operation.

mod error;
mod ubus;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use onubank::{BankId, ConfigFile, ImageManager};

use crate::error::CliError;
use crate::ubus::UbusShell;

/// CLI arguments for `onubank`.
#[derive(Parser)]
#[command(name = "onubank")]
#[command(about = "Dual-bank firmware image management for PON optical network units")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v: info, -vv: debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Subcommands for `onubank`.
#[derive(Subcommand)]
enum Command {
    /// Show both banks' active, committed, valid and version state
    Status {
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Flash a firmware image into a bank
    Upgrade {
        /// Image file to flash
        #[arg(short, long, value_name = "IMAGE")]
        filename: PathBuf,
        /// Target bank (defaults to the inactive bank)
        #[arg(long)]
        bank: Option<BankId>,
        /// Flash only, without activating the bank afterwards
        #[arg(long)]
        no_activate: bool,
    },
    /// Make a bank the one booted next
    Activate { bank: BankId },
    /// Permanently select a bank across future activations
    Commit { bank: BankId },
    /// Reboot the device
    Reboot,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("onubank: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = match &cli.config {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::load_or_default(),
    };

    let manager = ImageManager::start(Arc::new(UbusShell::new()), config)?;

    match cli.command {
        Command::Status { json } => status(&manager, json),
        Command::Upgrade {
            filename,
            bank,
            no_activate,
        } => upgrade(&manager, &filename, bank, no_activate),
        Command::Activate { bank } => activate(&manager, bank),
        Command::Commit { bank } => commit(&manager, bank),
        Command::Reboot => reboot(&manager),
    }
}

fn status(manager: &ImageManager, json: bool) -> Result<(), CliError> {
    let report = manager.report()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }
    Ok(())
}

fn upgrade(
    manager: &ImageManager,
    filename: &Path,
    bank: Option<BankId>,
    no_activate: bool,
) -> Result<(), CliError> {
    let bank = match bank {
        Some(bank) => bank,
        None => pick_inactive(manager)?,
    };

    println!("Flashing {} into bank {}...", filename.display(), bank);
    manager.upgrade(bank, filename)?;
    println!("Bank {} flashed.", bank);

    if no_activate {
        return Ok(());
    }
    activate(manager, bank)
}

fn activate(manager: &ImageManager, bank: BankId) -> Result<(), CliError> {
    manager.active_set(bank)?;
    println!("Bank {} activated.", bank);
    println!("Reboot the system to boot the new image.");
    Ok(())
}

fn commit(manager: &ImageManager, bank: BankId) -> Result<(), CliError> {
    manager.commit_set(bank)?;
    println!("Bank {} committed.", bank);
    Ok(())
}

fn reboot(manager: &ImageManager) -> Result<(), CliError> {
    println!("Rebooting the device...");
    manager.reboot()?;
    Ok(())
}

/// The bank not booted next; upgrades default to overwriting it.
fn pick_inactive(manager: &ImageManager) -> Result<BankId, CliError> {
    for bank in [BankId::A, BankId::B] {
        if manager.active_get(bank)? {
            return Ok(bank.other());
        }
    }
    // The shared variable names at most one active bank.
    Ok(BankId::A)
}
