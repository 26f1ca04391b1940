use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use shinesniff::capture;
use shinesniff::config::Config;

#[derive(Parser)]
#[command(
    name = "shinesniff",
    version,
    about = "Passive sniffer and message decoder for the Shine game protocol"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture and decode Shine traffic until interrupted
    Capture {
        /// Path to the TOML configuration file
        #[arg(short, long, default_value = "shinesniff.toml")]
        config: PathBuf,

        /// Read from a pcap file instead of capturing live
        #[arg(short = 'I', long)]
        input: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Capture { config, input } => {
            let config = Config::from_file(&config)?;
            config.validate_strict()?;

            // First Ctrl+C asks the capture loop to wind down; a second one
            // force-exits.
            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            if let Err(e) = ctrlc::set_handler(move || {
                if stop_clone.load(Ordering::Relaxed) {
                    std::process::exit(1);
                }
                stop_clone.store(true, Ordering::Relaxed);
            }) {
                eprintln!("Warning: failed to install Ctrl+C handler: {}", e);
            }

            capture::run_capture(&config, input.as_deref(), &stop)
        }
    }
}
