// kvrestore/src/utils/worker_pool.rs
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Fixed-capacity dispatcher for restore tasks.
///
/// `apply` waits only while every slot is taken. Tasks run with no ordering guarantee and
/// release their slot when they finish; callers collect results through their own channel.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: String,
    limit: usize,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(limit: usize, name: impl Into<String>) -> Self {
        let limit = limit.max(1);
        Self {
            name: name.into(),
            limit,
            permits: Arc::new(Semaphore::new(limit)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of slots currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Spawns `task` once a slot frees up.
    pub async fn apply<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .with_context(|| format!("worker pool '{}' is closed", self.name))?;
        tracing::trace!(pool = %self.name, available = self.available(), "dispatching task");
        tokio::spawn(async move {
            let _permit = permit;
            task.await;
        });
        Ok(())
    }
}
