//! Bounded worker pool
//!
//! Each slot runs one part at a time. Completions come back in whatever
//! order the network finishes them; callers restore stream order. Parts
//! are never cancelled once spawned: callers drain the pool to idle.

use crate::error::TransferError;
use std::future::Future;
use tokio::task::JoinSet;
use tracing::error;

/// A fixed number of concurrent part slots
pub struct WorkerPool<T> {
    tasks: JoinSet<Result<(u64, T), TransferError>>,
    capacity: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            tasks: JoinSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.tasks.len() < self.capacity
    }

    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Start work for one part. Callers check [`has_capacity`](Self::has_capacity) first.
    pub fn spawn<F>(&mut self, sequence: u64, work: F)
    where
        F: Future<Output = Result<T, TransferError>> + Send + 'static,
    {
        debug_assert!(self.has_capacity(), "worker pool over capacity");
        self.tasks
            .spawn(async move { work.await.map(|value| (sequence, value)) });
    }

    /// Wait for the next part to finish; `None` when nothing is in flight
    pub async fn next_completion(&mut self) -> Option<Result<(u64, T), TransferError>> {
        let joined = self.tasks.join_next().await?;
        Some(match joined {
            Ok(result) => result,
            Err(e) => {
                error!("Part worker panicked: {}", e);
                Err(TransferError::Internal(format!("part worker panicked: {}", e)))
            }
        })
    }
}
