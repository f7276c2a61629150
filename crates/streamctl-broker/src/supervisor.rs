// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deadline supervision for provider work.
//!
//! Provider work runs on its own task. The supervisor races it against the
//! operation deadline and aborts it when the deadline wins or when the
//! supervisor itself is dropped. Drivers spawn CLI children with
//! `kill_on_drop`, so aborting the task also stops backend processes; work the
//! backend already accepted may still continue on its side.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::provider::ProviderError;

/// How supervised work ended.
#[derive(Debug)]
pub(crate) enum Supervised<T> {
    /// The driver returned before the deadline.
    Completed(Result<T, ProviderError>),
    /// The deadline passed first; the work was aborted.
    TimedOut,
    /// The driver task panicked or was cancelled.
    Panicked(String),
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Await `work` for at most `remaining`.
pub(crate) async fn run_until_deadline<T>(
    work: JoinHandle<Result<T, ProviderError>>,
    remaining: Duration,
) -> Supervised<T> {
    let mut guard = AbortOnDrop(work);

    tokio::select! {
        joined = &mut guard.0 => match joined {
            Ok(result) => Supervised::Completed(result),
            Err(e) if e.is_panic() => Supervised::Panicked("provider task panicked".to_string()),
            Err(e) => Supervised::Panicked(e.to_string()),
        },
        _ = tokio::time::sleep(remaining) => Supervised::TimedOut,
    }
}

/// Time left until `deadline`, zero once it has passed.
pub(crate) fn remaining_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_before_deadline() {
        let work = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, ProviderError>(7)
        });

        match run_until_deadline(work, Duration::from_secs(10)).await {
            Supervised::Completed(Ok(value)) => assert_eq!(value, 7),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_aborts_work() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = SetOnDrop(dropped.clone());
        let work = tokio::spawn(async move {
            let _flag = flag;
            std::future::pending::<()>().await;
            Ok::<_, ProviderError>(())
        });

        let outcome = run_until_deadline(work, Duration::from_secs(5)).await;
        assert!(matches!(outcome, Supervised::TimedOut));

        for _ in 0..10 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panicking_work_is_reported() {
        let work = tokio::spawn(async {
            if true {
                panic!("driver bug");
            }
            Ok::<(), ProviderError>(())
        });

        let outcome = run_until_deadline(work, Duration::from_secs(5)).await;
        assert!(matches!(outcome, Supervised::Panicked(_)));
    }

    #[test]
    fn test_remaining_until_saturates() {
        let now = Utc::now();
        assert_eq!(
            remaining_until(now - chrono::Duration::seconds(5), now),
            Duration::ZERO
        );
        assert_eq!(
            remaining_until(now + chrono::Duration::seconds(5), now),
            Duration::from_secs(5)
        );
    }
}
