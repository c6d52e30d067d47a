use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{JoinedError, ScanError};

/// A thread-safe, append-only error list. Used by sources that do not want
/// per-job fatal-propagation semantics; `JobProgress` (in `sourcescan-engine`)
/// is an independent aggregator with its own hook dispatch.
#[derive(Debug, Default)]
pub struct ScanErrorAggregator {
    count: AtomicU64,
    errors: Mutex<Vec<ScanError>>,
}

impl ScanErrorAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Add(nil)` is a no-op.
    pub fn add(&self, err: Option<ScanError>) {
        let Some(err) = err else { return };
        self.count.fetch_add(1, Ordering::Relaxed);
        self.errors.lock().expect("aggregator mutex poisoned").push(err);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> Option<JoinedError> {
        let guard = self.errors.lock().expect("aggregator mutex poisoned");
        JoinedError::from_errors(guard.iter())
    }

    /// Snapshot of the raw error list, newest last.
    pub fn snapshot(&self) -> Vec<ScanError> {
        self.errors.lock().expect("aggregator mutex poisoned").clone()
    }
}

impl std::fmt::Display for ScanErrorAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.errors() {
            Some(joined) => write!(f, "{joined}"),
            None => write!(f, ""),
        }
    }
}
