// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded fire-and-forget background work.
//!
//! Trigger bookkeeping that must not delay the API response, audit snapshots
//! and counters, runs here. Failures are logged and dropped; the triggered
//! build is already on its way.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{error, warn};

use crate::error::Result;

/// Spawns background tasks with a concurrency ceiling.
#[derive(Clone)]
pub struct BackgroundTasks {
    semaphore: Arc<Semaphore>,
}

impl BackgroundTasks {
    /// Create a runner allowing `limit` tasks in flight.
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Run `work` in the background.
    ///
    /// When the ceiling is reached the task waits for a slot inside its own
    /// spawn, so the caller never blocks. Errors are logged under `label`.
    pub fn spawn<F>(&self, label: &'static str, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(task = label, "task runner shut down, dropping task");
                    return;
                }
            };
            if let Err(err) = work.await {
                error!(task = label, error = %err, "background task failed");
            }
        });
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new(16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawned_work_runs() {
        let tasks = BackgroundTasks::new(2);
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..5 {
            let counter = counter.clone();
            tasks.spawn("count", async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while counter.load(Ordering::SeqCst) < 5 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_failures_do_not_propagate() {
        let tasks = BackgroundTasks::new(1);
        tasks.spawn("fail", async {
            Err(crate::error::CoreError::ValidationError {
                field: "x".to_string(),
                message: "boom".to_string(),
            })
        });
        tokio::task::yield_now().await;
    }
}
