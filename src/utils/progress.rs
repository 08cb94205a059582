use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counter advanced once per finished unit of work (segment, table).
#[derive(Debug, Clone)]
pub struct ProgressCounter {
    name: Arc<str>,
    total: u64,
    done: Arc<AtomicU64>,
}

impl ProgressCounter {
    pub fn new(name: &str, total: u64) -> Self {
        Self {
            name: Arc::from(name),
            total,
            done: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn inc(&self) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(progress = %self.name, done, total = self.total, "progress");
    }

    pub fn count(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}
