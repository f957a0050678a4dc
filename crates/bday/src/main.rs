mod birthday;
mod config;
mod discord;
mod store;
mod version;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::info;

use crate::{
    config::{open_config, write_default_config},
    store::Storage,
    version::{long_version, short_version},
};

#[derive(Parser)]
#[command(version = short_version())]
struct Args {
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    if args.init {
        write_default_config(&args.config)?;
        info!(path = ?args.config, "Created default configuration");
        return Ok(());
    }

    info!(version = long_version(), "bday version");

    let config = open_config(&args.config).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    info!(
        guild_id = config.discord.guild_id,
        admins = config.discord.admins.len(),
        "Configuration loaded"
    );

    let store = Storage::open(&config.storage)
        .await
        .context("Failed to open storage")?;

    discord::run(config, Arc::new(store)).await
}
