//! Task-parallel worker pool with fail-fast batch joining
//!
//! Mapper and reducer work items are independent within a phase, so the
//! pool only bounds concurrency; ordering comes from the hard barrier the
//! orchestrator places between phases. The first task error aborts the
//! remaining handles and is surfaced unchanged so the failing partition
//! stays identifiable.

use crate::error::{MarginError, MarginResult};
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Semaphore-bounded spawner for one phase's work items
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
        }
    }

    /// Spawn a work item once a worker slot frees up
    ///
    /// The permit travels into the task, so the slot is held for the
    /// task's whole lifetime.
    pub async fn spawn<T, F>(&self, task: F) -> JoinHandle<MarginResult<T>>
    where
        F: Future<Output = MarginResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("worker pool semaphore is never closed");
        tokio::spawn(async move {
            let _permit = permit;
            task.await
        })
    }
}

/// Block until every handle resolves; on the first failure, abort the
/// rest and propagate that error unchanged
///
/// `on_complete` fires once per successful task, in completion order,
/// for progress reporting.
pub async fn join_all_fail_fast<T>(
    handles: Vec<JoinHandle<MarginResult<T>>>,
    mut on_complete: impl FnMut(),
) -> MarginResult<Vec<T>> {
    let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
    let mut pending: FuturesUnordered<_> = handles.into_iter().collect();
    let mut results = Vec::with_capacity(abort_handles.len());

    while let Some(joined) = pending.next().await {
        match joined {
            Ok(Ok(value)) => {
                results.push(value);
                on_complete();
            }
            Ok(Err(err)) => {
                warn!("Task failed, aborting {} remaining", pending.len());
                for handle in &abort_handles {
                    handle.abort();
                }
                return Err(err);
            }
            Err(join_err) => {
                for handle in &abort_handles {
                    handle.abort();
                }
                return Err(MarginError::TaskPanicked {
                    details: join_err.to_string(),
                });
            }
        }
    }

    debug!("Batch of {} tasks completed", results.len());
    Ok(results)
}
