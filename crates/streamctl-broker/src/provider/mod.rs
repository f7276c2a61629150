// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider drivers.
//!
//! One contract ([`ProviderDriver`]) with an implementation per backend.

pub(crate) mod command;
pub mod container;
pub mod iac;
pub mod mock;
pub mod orchestrator;
pub mod spec;
mod traits;

pub use container::{ContainerConfig, ContainerDriver};
pub use iac::{IacConfig, IacDriver};
pub use mock::MockProvider;
pub use orchestrator::{OrchestratorConfig, OrchestratorDriver};
pub use spec::{CloudProvider, ClusterSpec};
pub use traits::*;
