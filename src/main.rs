// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "scancap")]
#[command(about = "Frame acquisition engine for structured-light 3D scanning")]
#[command(version = env!("GIT_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available capture devices
    List,

    /// Show the parameters a device exposes
    Params {
        /// Device index (from 'scancap list') or device id
        #[arg(short, long, default_value = "0")]
        device: String,
    },

    /// Stream frames from a device
    Stream {
        /// Device index (from 'scancap list') or device id
        #[arg(short, long, default_value = "0")]
        device: String,

        /// Stop after this many frames (0 = until Ctrl-C)
        #[arg(short, long, default_value = "0")]
        count: u64,

        /// Save delivered frames as PNG into this directory
        #[arg(short, long)]
        save_dir: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set RUST_LOG to control log level, e.g. RUST_LOG=scancap=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List => cli::list_devices(),
        Commands::Params { device } => cli::show_params(&device),
        Commands::Stream {
            device,
            count,
            save_dir,
        } => cli::stream(&device, count, save_dir),
    }
}
