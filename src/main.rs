use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use adscrub::ca::CertAuthority;
use adscrub::config::{CliOverrides, Config, MitmConfig};
use adscrub::error::ProxyError;

#[derive(Debug, Parser)]
#[command(name = "adscrub", version, about = "content-aware ad-blocking forward proxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the proxy until SIGINT/SIGTERM.
    Run {
        /// JSON configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Explicit proxy listen address (overrides the file).
        #[arg(long)]
        listen: Option<String>,
    },
    /// Generate the CA certificate and key used for TLS interception.
    GenCa {
        /// Overwrite existing CA files.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        cert: Option<PathBuf>,
        #[arg(long)]
        key: Option<PathBuf>,
    },
}

fn gen_ca(force: bool, cert: Option<PathBuf>, key: Option<PathBuf>) -> Result<(), ProxyError> {
    let defaults = MitmConfig::default();
    let cert = cert.unwrap_or(defaults.ca_cert);
    let key = key.unwrap_or(defaults.ca_key);
    let ca = CertAuthority::generate(&cert, &key, force)?;
    println!("CA certificate: {}", cert.display());
    println!("CA private key: {}", key.display());
    println!("SHA-256 fingerprint: {}", ca.fingerprint());
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run { config, listen } => {
            match Config::load(config.as_deref(), CliOverrides { listen }) {
                Ok(cfg) => adscrub::proxy::run_until_signal(cfg).await,
                Err(e) => Err(e),
            }
        }
        Command::GenCa { force, cert, key } => gen_ca(force, cert, key),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
