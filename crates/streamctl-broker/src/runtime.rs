// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for streamctl-broker.
//!
//! This module provides [`BrokerRuntime`], which runs the HTTP surface, the
//! lifecycle engine and the cleanup scheduler inside an existing tokio
//! application instead of the standalone binary.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use streamctl_broker::provider::MockProvider;
//! use streamctl_broker::registry::ProviderRegistry;
//! use streamctl_broker::runtime::BrokerRuntime;
//! use streamctl_core::{ProviderKind, persistence};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = persistence::connect("sqlite::memory:").await?;
//!     let registry = ProviderRegistry::new()
//!         .with(Arc::new(MockProvider::new(ProviderKind::Container)));
//!
//!     let runtime = BrokerRuntime::builder()
//!         .persistence(persistence)
//!         .registry(registry)
//!         .bind_addr("127.0.0.1:0".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... serve requests on runtime.local_addr() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use streamctl_core::{OperationTracker, Persistence, ProviderKind};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::audit::{AuditSink, PersistentAuditSink};
use crate::catalog::Catalog;
use crate::cleanup_scheduler::{CleanupScheduler, CleanupSchedulerConfig};
use crate::engine::{EngineConfig, LifecycleEngine};
use crate::metrics::OperationMetrics;
use crate::registry::ProviderRegistry;
use crate::server::{self, AppState};

/// Builder for creating a [`BrokerRuntime`].
pub struct BrokerRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    registry: Option<ProviderRegistry>,
    audit: Option<Arc<dyn AuditSink>>,
    catalog: Option<Catalog>,
    bind_addr: SocketAddr,
    default_provider: ProviderKind,
    probe_timeout: Duration,
    cleanup_config: CleanupSchedulerConfig,
}

impl Default for BrokerRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            registry: None,
            audit: None,
            catalog: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            default_provider: ProviderKind::Container,
            probe_timeout: Duration::from_secs(5),
            cleanup_config: CleanupSchedulerConfig::from_env(),
        }
    }
}

impl BrokerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence backend (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the provider registry (required).
    pub fn registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the audit sink.
    ///
    /// Default: [`PersistentAuditSink`] over the configured persistence
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Set the service catalog.
    ///
    /// Default: [`Catalog::default_for`] the registered providers
    pub fn catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Set the bind address for the HTTP server.
    ///
    /// Default: `0.0.0.0:8080`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the provider used when a provision request names none.
    ///
    /// Default: `container`
    pub fn default_provider(mut self, provider: ProviderKind) -> Self {
        self.default_provider = provider;
        self
    }

    /// Set the upper bound on status probes made while answering `last_operation`.
    ///
    /// Default: 5 seconds
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set the cleanup scheduler configuration.
    ///
    /// Default: Loaded from environment variables via [`CleanupSchedulerConfig::from_env()`].
    pub fn cleanup_config(mut self, config: CleanupSchedulerConfig) -> Self {
        self.cleanup_config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or the default provider
    /// is not registered.
    pub fn build(self) -> Result<BrokerRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;

        if !registry.contains(self.default_provider) {
            return Err(anyhow::anyhow!(
                "default provider '{}' is not registered",
                self.default_provider
            ));
        }

        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(PersistentAuditSink::new(persistence.clone())));
        let catalog = self
            .catalog
            .unwrap_or_else(|| Catalog::default_for(&registry.kinds()));

        Ok(BrokerRuntimeConfig {
            persistence,
            registry,
            audit,
            catalog,
            bind_addr: self.bind_addr,
            default_provider: self.default_provider,
            probe_timeout: self.probe_timeout,
            cleanup_config: self.cleanup_config,
        })
    }
}

/// Configuration for a [`BrokerRuntime`].
pub struct BrokerRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    registry: ProviderRegistry,
    audit: Arc<dyn AuditSink>,
    catalog: Catalog,
    bind_addr: SocketAddr,
    default_provider: ProviderKind,
    probe_timeout: Duration,
    cleanup_config: CleanupSchedulerConfig,
}

impl BrokerRuntimeConfig {
    /// Start the runtime: re-attach in-flight operations, then spawn the
    /// cleanup scheduler and the HTTP server.
    pub async fn start(self) -> Result<BrokerRuntime> {
        let engine = LifecycleEngine::new(
            OperationTracker::new(self.persistence.clone()),
            Arc::new(self.registry),
            self.audit,
            Arc::new(OperationMetrics::new()),
            EngineConfig {
                probe_timeout: self.probe_timeout,
                cleanup_max_retries: self.cleanup_config.max_retries,
            },
        );

        // Operations left in progress by a previous process
        match engine
            .reattach_in_flight(self.cleanup_config.batch_size)
            .await
        {
            Ok(0) => {}
            Ok(count) => info!(count, "Resumed supervision of in-flight operations"),
            Err(e) => warn!(error = %e, "Failed to re-attach in-flight operations"),
        }

        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        // Create cleanup scheduler
        let scheduler = CleanupScheduler::new(engine.clone(), self.cleanup_config);
        let scheduler_shutdown = scheduler.shutdown_handle();

        let scheduler_handle = tokio::spawn(async move {
            scheduler.run().await;
        });

        // Start HTTP server task
        let server_shutdown = Arc::new(Notify::new());
        let state = AppState::new(engine.clone(), self.catalog, self.default_provider);
        let shutdown = server_shutdown.clone();
        let server_handle = tokio::spawn(async move {
            server::serve(listener, state, shutdown)
                .await
                .map_err(anyhow::Error::from)
        });

        info!(
            local_addr = %local_addr,
            providers = ?engine.registry().kinds(),
            default_provider = %self.default_provider,
            "BrokerRuntime started"
        );

        Ok(BrokerRuntime {
            server_handle,
            scheduler_handle,
            server_shutdown,
            scheduler_shutdown,
            engine,
            local_addr,
        })
    }
}

/// A running broker that can be embedded in an application.
///
/// The runtime manages:
/// - HTTP server for broker and operator requests
/// - Lifecycle engine with one supervisor task per in-flight operation
/// - Cleanup scheduler for expiry, crash recovery, cleanup jobs and pruning
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct BrokerRuntime {
    server_handle: JoinHandle<Result<()>>,
    scheduler_handle: JoinHandle<()>,
    server_shutdown: Arc<Notify>,
    scheduler_shutdown: Arc<Notify>,
    engine: LifecycleEngine,
    local_addr: SocketAddr,
}

impl BrokerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> BrokerRuntimeBuilder {
        BrokerRuntimeBuilder::new()
    }

    /// Address the HTTP server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get a reference to the lifecycle engine.
    pub fn engine(&self) -> &LifecycleEngine {
        &self.engine
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the HTTP server and the cleanup scheduler and aborts local
    /// supervisors. In-flight operations stay in progress in the store and are
    /// re-attached by the next runtime.
    pub async fn shutdown(self) -> Result<()> {
        info!("BrokerRuntime shutting down...");

        // Signal server shutdown
        self.server_shutdown.notify_one();

        // Signal cleanup scheduler shutdown
        self.scheduler_shutdown.notify_one();

        // Wait for cleanup scheduler
        if let Err(e) = self.scheduler_handle.await {
            error!("Cleanup scheduler task panicked: {}", e);
        }

        self.engine.shutdown();

        // Wait for server
        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("BrokerRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("BrokerRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("BrokerRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }

    /// Check if the HTTP server is still running. A disabled cleanup scheduler
    /// returns immediately and does not count.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }
}
