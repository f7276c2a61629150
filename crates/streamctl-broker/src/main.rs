// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! streamctl Broker - Kafka Cluster Provisioning Server
//!
//! An HTTP server responsible for:
//! - Service catalog and parameter validation
//! - Cluster lifecycle (provision, update, deprovision, last operation)
//! - Cleanup of leaked resources after failed operations
//! - Provider backends (container, orchestrator, infra-as-code)

use tracing::{info, warn};

use streamctl_broker::catalog::Catalog;
use streamctl_broker::cleanup_scheduler::CleanupSchedulerConfig;
use streamctl_broker::config::Config;
use streamctl_broker::registry::ProviderRegistry;
use streamctl_broker::runtime::BrokerRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamctl_broker=info,streamctl_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        default_provider = %config.default_provider,
        providers = ?config.providers,
        "Starting streamctl broker"
    );

    // Connect to database and apply migrations
    let persistence = streamctl_core::persistence::connect(&config.database_url).await?;

    info!("Connected to database");

    let registry = ProviderRegistry::from_config(&config);
    for validation in registry.validate_all().await {
        if validation.available {
            info!(provider = %validation.provider, "Provider available");
        } else {
            warn!(
                provider = %validation.provider,
                message = validation.message.as_deref().unwrap_or(""),
                "Provider backend unavailable, requests will fail until it is reachable"
            );
        }
    }

    let catalog = match &config.catalog_path {
        Some(path) => {
            info!(path = %path.display(), "Loading service catalog");
            Catalog::from_file(path)?
        }
        None => Catalog::default_for(&config.providers),
    };

    // Start the runtime
    let runtime = BrokerRuntime::builder()
        .persistence(persistence)
        .registry(registry)
        .catalog(catalog)
        .bind_addr(config.http_addr)
        .default_provider(config.default_provider)
        .probe_timeout(config.probe_timeout)
        .cleanup_config(CleanupSchedulerConfig::from_env())
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.local_addr(), "Broker server ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("streamctl broker shut down");

    Ok(())
}
