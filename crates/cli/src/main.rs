mod config;
mod serve;

use std::path::{Path, PathBuf};
use std::process;

use broker_core::StaticCatalog;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "info,broker=debug";

/// Service broker lifecycle server.
#[derive(Parser)]
#[command(name = "broker", version, about = "Service broker lifecycle server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the broker HTTP API server
    Serve {
        /// Path to a broker TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Port to listen on (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
        /// Catalog file to serve (overrides the config file)
        #[arg(long)]
        catalog: Option<PathBuf>,
        /// Path to TLS certificate PEM file (requires --tls-key)
        #[arg(long)]
        tls_cert: Option<PathBuf>,
        /// Path to TLS private key PEM file (requires --tls-cert)
        #[arg(long)]
        tls_key: Option<PathBuf>,
    },

    /// Validate a catalog file and print it as published by the server
    Catalog {
        /// Path to a TOML or JSON catalog file
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            port,
            catalog,
            tls_cert,
            tls_key,
        } => {
            // Validate TLS flags: both must be provided or neither
            if tls_cert.is_some() != tls_key.is_some() {
                eprintln!("error: --tls-cert and --tls-key must both be provided");
                process::exit(1);
            }
            let mut config = match config::load_config(config.as_deref()) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("error: {}", e);
                    process::exit(1);
                }
            };
            if let Some(port) = port {
                config.port = port;
            }
            if catalog.is_some() {
                config.catalog = catalog;
            }

            init_tracing();
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("error: failed to create tokio runtime: {}", e);
                    process::exit(1);
                }
            };
            if let Err(e) = rt.block_on(serve::start_server(config, tls_cert, tls_key)) {
                eprintln!("Server error: {}", e);
                process::exit(1);
            }
        }
        Commands::Catalog { file } => cmd_catalog(&file),
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_catalog(file: &Path) {
    let catalog = match config::read_catalog(file) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    };
    let catalog = match StaticCatalog::new(catalog) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: invalid catalog '{}': {}", file.display(), e);
            process::exit(1);
        }
    };
    match serde_json::to_string_pretty(catalog.catalog()) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    }
}
