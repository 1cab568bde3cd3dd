use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use neopkg_server::{serve, PkgManager, ServerConfig};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "neopkg")]
#[command(about = "Package manager for add-on packages and their backends", long_about = None)]
struct Cli {
    /// TOML config file; defaults to $NEOPKG_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Serve,
    Sync,
    Search {
        name: String,
        #[arg(long, default_value_t = 5)]
        possibles: usize,
    },
    Install {
        name: String,
    },
    Uninstall {
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = ServerConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => serve(config).await?,
        Commands::Sync => {
            let manager = PkgManager::new(&config)?;
            print_json(&manager.sync().await?)?;
        }
        Commands::Search { name, possibles } => {
            let manager = PkgManager::new(&config)?;
            print_json(&manager.search(&name, possibles).await?)?;
        }
        Commands::Install { name } => {
            let manager = PkgManager::new(&config)?;
            let mut stderr = tokio::io::stderr();
            let cache = manager.install(&name, &mut stderr).await?;
            manager.stop().await;
            print_json(&cache)?;
        }
        Commands::Uninstall { name } => {
            let manager = PkgManager::new(&config)?;
            let mut stderr = tokio::io::stderr();
            manager.uninstall(&name, &mut stderr).await?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "neopkg={level},neopkg_server={level},neopkg_backend={level},neopkg_installer={level},neopkg_registry={level},neopkg_resolver={level}"
        ))
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed rendering json output")?;
    println!("{rendered}");
    Ok(())
}
