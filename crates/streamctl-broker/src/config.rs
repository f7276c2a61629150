// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for streamctl-broker.
//!
//! Driver and scheduler settings live next to the code they configure
//! ([`ContainerConfig`](crate::provider::container::ContainerConfig),
//! [`CleanupSchedulerConfig`](crate::cleanup_scheduler::CleanupSchedulerConfig), ...).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use streamctl_core::ProviderKind;

/// Broker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL; the scheme selects the backend
    pub database_url: String,
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Provider used when a request does not name one
    pub default_provider: ProviderKind,
    /// Providers registered at startup
    pub providers: Vec<ProviderKind>,
    /// Optional JSON catalog replacing the built-in one
    pub catalog_path: Option<PathBuf>,
    /// Upper bound on a synchronous status probe made while serving `last_operation`
    pub probe_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://.data/streamctl.db".to_string(),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            default_provider: ProviderKind::Container,
            providers: ProviderKind::ALL.to_vec(),
            catalog_path: None,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = std::env::var("STREAMCTL_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .unwrap_or(defaults.database_url);

        let http_addr = match std::env::var("STREAMCTL_HTTP_ADDR") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidAddress(raw.clone()))?,
            Err(_) => defaults.http_addr,
        };

        let default_provider = match std::env::var("STREAMCTL_DEFAULT_PROVIDER") {
            Ok(raw) => parse_provider(&raw)?,
            Err(_) => defaults.default_provider,
        };

        let providers = match std::env::var("STREAMCTL_PROVIDERS") {
            Ok(raw) => parse_provider_list(&raw)?,
            Err(_) => defaults.providers,
        };

        if !providers.contains(&default_provider) {
            return Err(ConfigError::DefaultProviderNotRegistered(default_provider));
        }

        let catalog_path = std::env::var("STREAMCTL_CATALOG_PATH")
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        let probe_timeout_secs = std::env::var("STREAMCTL_PROBE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        Ok(Self {
            database_url,
            http_addr,
            default_provider,
            providers,
            catalog_path,
            probe_timeout: Duration::from_secs(probe_timeout_secs),
        })
    }
}

fn parse_provider(raw: &str) -> Result<ProviderKind, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigError::InvalidProvider(raw.to_string()))
}

/// Parse a comma-separated provider list, dropping duplicates.
pub(crate) fn parse_provider_list(raw: &str) -> Result<Vec<ProviderKind>, ConfigError> {
    let mut providers = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let kind = parse_provider(part)?;
        if !providers.contains(&kind) {
            providers.push(kind);
        }
    }
    if providers.is_empty() {
        return Err(ConfigError::NoProviders);
    }
    Ok(providers)
}

/// Read a duration given in whole seconds, falling back to `default`.
pub(crate) fn env_secs(var: &str, default: Duration) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Read a string variable, falling back to `default`.
pub(crate) fn env_string(var: &str, default: &str) -> String {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The listen address could not be parsed.
    #[error("Invalid listen address: {0}")]
    InvalidAddress(String),
    /// A provider name is not recognised.
    #[error("Unknown provider: {0}")]
    InvalidProvider(String),
    /// `STREAMCTL_PROVIDERS` named no provider.
    #[error("At least one provider must be enabled")]
    NoProviders,
    /// The default provider is not in the enabled list.
    #[error("Default provider '{0}' is not enabled")]
    DefaultProviderNotRegistered(ProviderKind),
    /// The catalog file could not be read or parsed.
    #[error("Invalid catalog {path}: {message}")]
    InvalidCatalog {
        /// Catalog file.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },
}
