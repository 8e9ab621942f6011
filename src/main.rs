//! Inspect and edit a light-fs filesystem from the command line.
use std::path::PathBuf;

use clap::Parser;
use tracing::error;

mod app_config;
mod cli;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(
    version,
    about = "In-memory POSIX-like filesystem with lazy durable persistence."
)]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a light-fs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[arg(short, long, help = "Filesystem name, overriding the configured one.")]
    name: Option<String>,

    #[command(subcommand)]
    command: cli::Command,
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let mut config = Config::load_or_default(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Some(name) = args.name {
        config.name = name;
    }
    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    if let Err(e) = Trc::default().init() {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    if let Err(e) = cli::spawn(config, args.command) {
        error!("{e}");
        eprintln!("light-fs: {e}");
        std::process::exit(e.exit_code());
    }
}
