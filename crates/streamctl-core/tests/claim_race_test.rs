// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Concurrent claims against a shared store.

mod common;

use common::{TestStore, default_parameters, new_operation, provision_request};
use futures::future::join_all;
use serde_json::json;

use streamctl_core::{
    ClaimOutcome, CoreError, LifecycleState, OperationCompletion, OperationType,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_provisions_claim_exactly_once() {
    let store = TestStore::new().await;

    let attempts = (0..8).map(|_| {
        let tracker = store.tracker.clone();
        tokio::spawn(async move {
            tracker
                .claim_provision(
                    &provision_request("race-1", default_parameters()),
                    &new_operation(OperationType::Provision),
                )
                .await
        })
    });

    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.expect("task panicked"))
        .collect();

    let accepted = results
        .iter()
        .filter(|r| matches!(r, Ok(ClaimOutcome::Accepted(_))))
        .count();
    assert_eq!(accepted, 1, "results: {:?}", results);

    for result in &results {
        match result {
            Ok(ClaimOutcome::Accepted(_)) => {}
            Err(CoreError::OperationInProgress { .. }) => {}
            other => panic!("unexpected claim result: {:?}", other),
        }
    }

    let operations = store.tracker.operations("race-1").await.unwrap();
    assert_eq!(operations.len(), 1);
    assert_eq!(operations[0].state, LifecycleState::InProgress);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_provision_and_deprovision_serialize() {
    let store = TestStore::new().await;

    let claimed = store
        .tracker
        .claim_provision(
            &provision_request("race-2", default_parameters()),
            &new_operation(OperationType::Provision),
        )
        .await
        .unwrap();
    store
        .tracker
        .complete(&OperationCompletion::succeeded(
            &claimed.operation().operation_id,
            "ready",
            Some(json!({ "bootstrap_servers": "localhost:29092" })),
        ))
        .await
        .unwrap();

    let deprovisions = (0..4).map(|_| {
        let tracker = store.tracker.clone();
        tokio::spawn(async move {
            tracker
                .claim_deprovision("race-2", &new_operation(OperationType::Deprovision))
                .await
        })
    });

    let results: Vec<_> = join_all(deprovisions)
        .await
        .into_iter()
        .map(|r| r.expect("task panicked"))
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, CoreError::OperationInProgress { .. }))
    );

    let instance = store.tracker.instance("race-2").await.unwrap().unwrap();
    assert_eq!(instance.state, LifecycleState::InProgress);
    assert!(instance.connection_info.is_none());
}

#[tokio::test]
async fn test_concurrent_completions_first_writer_wins() {
    let store = TestStore::new().await;

    let claimed = store
        .tracker
        .claim_provision(
            &provision_request("race-3", default_parameters()),
            &new_operation(OperationType::Provision),
        )
        .await
        .unwrap();
    let op_id = claimed.operation().operation_id.clone();

    let success = OperationCompletion::succeeded(&op_id, "ready", None);
    let timeout = OperationCompletion::failed(
        &op_id,
        streamctl_core::FailureKind::ProviderTimeout,
        "deadline exceeded",
        "provision timed out",
    );

    let (a, b) = tokio::join!(store.tracker.complete(&success), store.tracker.complete(&timeout));
    let applied = [a.unwrap(), b.unwrap()]
        .into_iter()
        .filter(Option::is_some)
        .count();
    assert_eq!(applied, 1);

    let op = store.persistence.get_operation(&op_id).await.unwrap().unwrap();
    assert!(op.state.is_terminal());
}
