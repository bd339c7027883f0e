//! CLI entrypoint for the Hapax gateway.
//!
//! Grounded on this codebase's own CLI shell (`claw-cli`'s `Cli::run`):
//! load config, resolve the log level/format from it, initialize
//! `tracing-subscriber`, then dispatch to a subcommand. Narrowed down to
//! the gateway's own surface — there is no interactive chat, channel, or
//! plugin subsystem here, just `serve`, `check`, and `version`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "hapax", version, about = "Hapax LLM gateway", long_about = None)]
struct Cli {
    /// Path to the config file. Falls back to `$HAPAX_CONFIG`, then `./hapax.toml`.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (debug, info, warn, error).
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway: HTTP/1, HTTP/2, and (if configured) HTTP/3 listeners.
    Serve {
        /// Override the config's `logging.format` (json or text).
        #[arg(long)]
        log_format: Option<String>,
    },
    /// Load and validate the config file, then exit (0 valid, 1 invalid).
    Check,
    /// Print version information.
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = hapax_config::resolve_path(cli.config.as_deref());

    let log_format_override = match &cli.command {
        Commands::Version => {
            println!("hapax {}", env!("CARGO_PKG_VERSION"));
            return;
        }
        Commands::Check => {
            init_tracing(cli.log_level.as_deref(), "text");
            match hapax_config::load_and_validate(&config_path) {
                Ok(_) => {
                    println!("{} is valid", config_path.display());
                }
                Err(e) => {
                    eprintln!("{}: {e}", config_path.display());
                    std::process::exit(1);
                }
            }
            return;
        }
        Commands::Serve { log_format } => log_format.clone(),
    };

    let log_format = log_format_override.unwrap_or_else(|| {
        hapax_config::load_or_default(&config_path)
            .map(|c| c.logging.format)
            .unwrap_or_default()
    });
    init_tracing(cli.log_level.as_deref(), &log_format);

    if let Err(e) = hapax_server::run(config_path).await {
        tracing::error!(error = %e, "fatal error, shutting down");
        std::process::exit(1);
    }
}

/// Initialize `tracing-subscriber` with the resolved level and the config's
/// `logging.format` (json or text), matching the teacher's `Cli::run`.
fn init_tracing(log_level: Option<&str>, format: &str) {
    let level = log_level.unwrap_or("info");
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}
