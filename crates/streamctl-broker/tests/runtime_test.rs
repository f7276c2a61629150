// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded runtime start and shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use streamctl_broker::audit::MemoryAuditSink;
use streamctl_broker::cleanup_scheduler::CleanupSchedulerConfig;
use streamctl_broker::provider::MockProvider;
use streamctl_broker::registry::ProviderRegistry;
use streamctl_broker::runtime::BrokerRuntime;
use streamctl_core::{ProviderKind, persistence};

#[tokio::test]
async fn test_runtime_serves_health_and_shuts_down() {
    let persistence = persistence::connect("sqlite::memory:").await.unwrap();
    let registry =
        ProviderRegistry::new().with(Arc::new(MockProvider::new(ProviderKind::Container)));

    let runtime = BrokerRuntime::builder()
        .persistence(persistence)
        .registry(registry)
        .audit(Arc::new(MemoryAuditSink::new()))
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .cleanup_config(CleanupSchedulerConfig {
            poll_interval: Duration::from_millis(50),
            ..CleanupSchedulerConfig::default()
        })
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert!(runtime.is_running());
    assert_ne!(runtime.local_addr().port(), 0);

    let mut stream = TcpStream::connect(runtime.local_addr()).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("healthy"));

    tokio::time::timeout(Duration::from_secs(5), runtime.shutdown())
        .await
        .expect("shutdown should finish")
        .unwrap();
}

#[tokio::test]
async fn test_builder_rejects_unregistered_default_provider() {
    let persistence = persistence::connect("sqlite::memory:").await.unwrap();
    let registry =
        ProviderRegistry::new().with(Arc::new(MockProvider::new(ProviderKind::Container)));

    let result = BrokerRuntime::builder()
        .persistence(persistence)
        .registry(registry)
        .default_provider(ProviderKind::Orchestrator)
        .build();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_builder_requires_persistence() {
    let registry =
        ProviderRegistry::new().with(Arc::new(MockProvider::new(ProviderKind::Container)));
    assert!(BrokerRuntime::builder().registry(registry).build().is_err());
}
