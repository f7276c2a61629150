// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! streamctl Core - Service Instance State and Operation Claims
//!
//! This crate owns the durable state of the streamctl control plane: service
//! instances, their lifecycle operations, the cleanup jobs that reclaim leaked
//! resources, and the audit trail. The broker crate drives providers; everything
//! it knows about an instance comes from here.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       streamctl-broker                        │
//! │     (OSB HTTP API, Lifecycle Engine, Cleanup Scheduler)       │
//! └──────────────────────────────────────────────────────────────┘
//!                 │ claim / complete            │ jobs / audit
//!                 ▼                             ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 streamctl-core (This Crate)                   │
//! │  OperationTracker ── plan_* claim rules ── Persistence trait   │
//! └──────────────────────────────────────────────────────────────┘
//!                 │                             │
//!                 ▼                             ▼
//!        ┌────────────────┐            ┌────────────────┐
//!        │     SQLite     │            │   PostgreSQL   │
//!        └────────────────┘            └────────────────┘
//! ```
//!
//! # Claim Rules
//!
//! | Request | Instance | Outcome |
//! |---------|----------|---------|
//! | Provision | absent or soft-deleted | new operation |
//! | Provision | same spec, succeeded | existing operation (replay) |
//! | Provision | different spec | `Conflict` |
//! | Provision | same spec, failed | new operation, unless cleanup is pending |
//! | Update | succeeded, new parameters | new operation |
//! | Deprovision | live | new operation |
//! | Any | operation in flight | `OperationInProgress` |
//! | Update, Deprovision | absent or soft-deleted | `NotFound` |
//!
//! At most one operation per instance is ever `in_progress`. The rule is decided
//! inside the claim transaction and backed by a partial unique index.
//!
//! # Storage Backends
//!
//! | Backend | URL | Notes |
//! |---------|-----|-------|
//! | [`SqlitePersistence`] | `sqlite://path` or `sqlite::memory:` | embedded and tests |
//! | [`PostgresPersistence`] | `postgres://...` | multi-connection deployments |
//!
//! [`persistence::connect`] picks the backend from the URL and runs migrations.

/// Error types for claims and persistence.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Service instance, operation, cleanup job and audit records.
pub mod model;

/// The persistence trait and its SQLite and PostgreSQL backends.
pub mod persistence;

/// Claim rules and the operation tracker.
pub mod tracker;

pub use error::{CoreError, Result};
pub use model::{
    AuditEvent, CleanupJob, CleanupJobState, CleanupJobType, FailureKind, InstanceFilter,
    LifecycleState, NewCleanupJob, Operation, OperationType, OrphanCandidate, ProviderKind,
    ServiceInstance,
};
pub use persistence::{
    CleanupJobFilter, CleanupJobFinish, Persistence, PostgresPersistence, SqlitePersistence,
};
pub use tracker::{
    ClaimOutcome, NewOperation, OperationCompletion, OperationTracker, ProvisionRequest,
};
