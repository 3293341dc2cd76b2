mod cert_issuer;
mod config;
mod error;
mod key_store;
mod leap_client;
mod progress;
mod provisioner;
mod serve;
mod state;
mod storage;
mod trust_bootstrap;
mod web;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::cert_issuer::IssueOutcome;
use crate::provisioner::Provisioner;

#[derive(Parser)]
#[command(name = "caseta-cert", about = "Obtain Lutron Caseta bridge certificates for LEAP clients")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "caseta-cert.toml")]
    config: PathBuf,
    /// Override the certificate directory from the config file
    #[arg(long)]
    ssl_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the Lutron login URL to visit in a browser
    AuthorizeUrl,
    /// Exchange the redirect URL (or bare code) from the login page for a certificate
    Login {
        /// URL the login page redirected to, or just the code
        redirected_url: String,
    },
    /// Connect to the bridge with the issued certificate and save its CA
    Pair {
        /// Bridge IP address or hostname
        host: String,
    },
    /// Show which provisioning step is next and which files exist
    Status,
    /// Delete the key, certificate and CA files
    Reset,
    /// Write the default configuration to a file
    InitConfig {
        /// Destination (defaults to --config)
        path: Option<PathBuf>,
    },
    /// Run the setup wizard web API
    Serve {
        /// Web server port (defaults to the config file's web.port)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    let mut cfg = config::Config::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(dir) = cli.ssl_dir {
        cfg.storage.dir = dir;
    }

    let cfg = Arc::new(cfg);
    let provisioner = || Provisioner::new(cfg.clone());

    match cli.command {
        Commands::AuthorizeUrl => {
            println!("{}", provisioner()?.authorize_url()?);
        }
        Commands::Login { redirected_url } => {
            match provisioner()?.issue_certificate(&redirected_url).await? {
                IssueOutcome::Issued => info!("Certificate issued, next: pair with the bridge"),
                IssueOutcome::AlreadyIssued => {
                    info!("A certificate already exists; run `reset` to start over")
                }
            }
        }
        Commands::Pair { host } => {
            let bridge = provisioner()?.bootstrap_trust(&host).await?;
            println!(
                "Successfully connected to bridge, running LEAP Server version {}",
                bridge.leap_version
            );
            println!("Bridge CA saved to {}", bridge.ca_path.display());
        }
        Commands::Status => {
            let provisioner = provisioner()?;
            println!("Next step: {:?}", provisioner.current_step());
            for a in provisioner.artifacts() {
                let mark = if a.present { "present" } else { "missing" };
                println!("  {:<8} {}", mark, a.path.display());
            }
        }
        Commands::Reset => {
            provisioner()?.reset()?;
            info!("The certificate files have been deleted");
        }
        Commands::InitConfig { path } => {
            let path = path.unwrap_or(cli.config);
            if path.exists() {
                anyhow::bail!("{} already exists", path.display());
            }
            cfg.save(&path)?;
            info!("Wrote {}", path.display());
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(cfg.web.port);
            serve::serve(provisioner()?, port).await?;
        }
    }

    Ok(())
}
