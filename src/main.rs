// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use bus_recorder::config::load_config_with_env;
use bus_recorder::logging::init_tracing;
use bus_recorder::{BusFactory, ControlInterface, Player, Recorder, StorageFactory};

/// Bus Recorder - Record MQTT traffic to SQLite and replay it
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.yaml")]
    config: PathBuf,

    /// Listen address (overrides config file)
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration from file
    let mut config = load_config_with_env(&args.config)?;

    // Apply CLI overrides
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }

    init_tracing(&config.logging)?;

    info!("Starting Bus Recorder");
    info!("Loaded configuration from: {:?}", args.config);
    info!("Bus backend: {}", config.bus.backend);
    info!("Storage backend: {}", config.storage.backend);

    // Create storage backend
    let store = StorageFactory::create(&config.storage)?;
    store
        .initialize()
        .await
        .context("Failed to initialize storage")?;
    info!("Storage backend initialized: {}", store.backend_type());

    let bus = BusFactory::create(&config.bus)?;

    let recorder = Arc::new(Recorder::new(
        store.clone(),
        bus.clone(),
        config.recorder.clone(),
    ));
    let player = Arc::new(Player::new(store.clone(), bus));

    let control_interface = ControlInterface::new(
        store,
        recorder.clone(),
        player.clone(),
        config.playback.default_topic_prefix.clone(),
    );

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen))?;

    let shutdown = CancellationToken::new();
    let server = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { control_interface.run(listener, shutdown).await })
    };

    // Run until Ctrl+C
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    shutdown.cancel();

    // Cleanup: engines flush and close before the process exits
    if let Err(e) = recorder.stop().await {
        error!("Recorder stopped with error: {}", e);
    }
    if let Err(e) = player.stop().await {
        error!("Player stopped with error: {}", e);
    }

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Control interface error: {}", e),
        Err(e) => error!("Control interface task failed: {}", e),
    }

    info!("Bus Recorder shut down successfully");
    Ok(())
}
