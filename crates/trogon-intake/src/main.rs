use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trogon_intake::env::SystemEnv;
use trogon_intake::signal::shutdown_signal;
use trogon_intake::{IntakeConfig, ProductCatalog, scaffold};

/// Authenticated artifact intake server
#[derive(Parser, Debug)]
#[command(name = "trogon-intake", version, about, long_about = None)]
struct Args {
    /// Path to a directory containing configuration of this app (overrides INTAKE_CONFIG_DIR)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Options for product manipulation.
    #[command(alias = "p")]
    Product {
        #[command(subcommand)]
        action: ProductCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ProductCommand {
    /// Creates a new product template.
    New {
        /// Product name, also the upload URL segment
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trogon_intake=info,tower_http=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = IntakeConfig::from_env(&SystemEnv);
    if let Some(dir) = args.config_dir {
        config = config.with_config_dir(dir);
    }

    match args.command {
        Some(Command::Product {
            action: ProductCommand::New { name },
        }) => {
            let path = scaffold::new_product(&config.config_dir, &name)?;
            println!("Configuration for new product {name} scaffolded successfully.");
            println!("It has been saved in {}.", path.display());
            Ok(())
        }
        None => serve(config).await,
    }
}

async fn serve(config: IntakeConfig) -> Result<()> {
    info!(config_dir = %config.config_dir.display(), "Loading products");
    let catalog = ProductCatalog::load(&config.config_dir, &SystemEnv, config.pipeline_timeout)
        .context("Cannot load product configuration")?;

    for product in catalog.iter() {
        info!(
            product = product.name(),
            token_strategy = product.token().kind(),
            script = ?product.script(),
            "Loaded product"
        );
    }

    let shutdown = async {
        let signal = shutdown_signal().await;
        info!(%signal, "Shutdown signal received");
    };

    if let Err(e) = trogon_intake::run(&config, catalog, shutdown).await {
        error!(error = %e, "Server stopped with error");
        return Err(e.into());
    }

    info!("Server exited");
    Ok(())
}
