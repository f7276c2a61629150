// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! streamctl Broker - Kafka Cluster Provisioning Control Plane
//!
//! This crate turns provisioning requests into tracked asynchronous
//! operations, drives one of three backends to convergence, and reconciles
//! whatever a failed operation leaves behind.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                   Platform / operators (HTTP, OSB style)              │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                  streamctl-broker (This Crate)                        │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐   │
//! │  │  Lifecycle  │  │  Provider   │  │   Cleanup   │  │    Audit    │   │
//! │  │   Engine    │──│  Registry   │  │  Scheduler  │  │    Sink     │   │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘   │
//! └──────────────────────────────────────────────────────────────────────┘
//!        │ claims                │ drivers
//!        ▼                       ▼
//! ┌────────────────┐   ┌──────────────┬────────────────┬───────────────┐
//! │ streamctl-core │   │  container   │  orchestrator  │ infra-as-code │
//! │ (SQLite / PG)  │   │   (docker)   │   (kubectl)    │  (terraform)  │
//! └────────────────┘   └──────────────┴────────────────┴───────────────┘
//! ```
//!
//! # Operation State Machine
//!
//! ```text
//!     claim ──► IN_PROGRESS ──► SUCCEEDED
//!                   │
//!                   ├──► FAILED (provider error) ──► cleanup job
//!                   └──► FAILED (deadline)       ──► cleanup job
//! ```
//!
//! Claims are rejected synchronously with `NotFound`, `Conflict` or
//! `OperationInProgress`. Provider failures and timeouts are only visible
//! through `last_operation`.
//!
//! # Providers
//!
//! | Provider | Backend | Default deadline |
//! |----------|---------|------------------|
//! | `container` | docker CLI | 5 minutes |
//! | `orchestrator` | kubectl CLI | 15 minutes |
//! | `infra-as-code` | terraform CLI | 45 minutes |
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `STREAMCTL_DATABASE_URL` | `sqlite://.data/streamctl.db` | store URL (`DATABASE_URL` fallback) |
//! | `STREAMCTL_HTTP_ADDR` | `0.0.0.0:8080` | HTTP listen address |
//! | `STREAMCTL_DEFAULT_PROVIDER` | `container` | provider for requests that name none |
//! | `STREAMCTL_PROVIDERS` | all three | comma-separated enabled providers |
//! | `STREAMCTL_CATALOG_PATH` | - | JSON catalog replacing the built-in one |
//! | `STREAMCTL_PROBE_TIMEOUT_SECS` | `5` | bound on probes made by `last_operation` |
//! | `STREAMCTL_CLEANUP_*` | see [`cleanup_scheduler`] | scheduler settings |
//!
//! # Modules
//!
//! - [`engine`]: provision, update, deprovision and last-operation entry points
//! - [`provider`]: driver contract, the three drivers and a mock
//! - [`registry`]: provider lookup and validation
//! - [`cleanup_scheduler`]: expiry, crash recovery, cleanup jobs and pruning
//! - [`server`]: HTTP surface
//! - [`runtime`]: embeddable runtime wiring everything together

/// Audit events for lifecycle transitions.
pub mod audit;

/// Service catalog.
pub mod catalog;

/// Background reconciler for leaked resources and stale records.
pub mod cleanup_scheduler;

/// Broker configuration loaded from environment variables.
pub mod config;

/// Lifecycle engine.
pub mod engine;

/// Error types for broker operations.
pub mod error;

/// Operation outcome counters.
pub mod metrics;

/// Provider driver contract and implementations.
pub mod provider;

/// Provider registry.
pub mod registry;

/// Embeddable runtime for streamctl-broker.
pub mod runtime;

/// HTTP surface.
pub mod server;

mod supervisor;

pub use config::Config;
pub use engine::{EngineConfig, LifecycleEngine, OperationHandle, OperationStatus};
pub use error::Error;
pub use registry::ProviderRegistry;
