//! Process-wide, additive, lock-free metrics counters (spec §5, §2's
//! "Metrics surface" component). These are coarse aggregate counters only —
//! per-unit detail lives in `sourcescan-engine`'s `UnitHook`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

#[derive(Debug, Default)]
pub struct ScanMetrics {
    chunks_total: AtomicU64,
    bytes_total: AtomicU64,
    units_total: AtomicU64,
    errors_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub chunks_total: u64,
    pub bytes_total: u64,
    pub units_total: u64,
    pub errors_total: u64,
}

impl ScanMetrics {
    /// The process-wide instance. Per spec §5 and §9, this is additive and
    /// lock-free, and is the only global mutable state in the system — a
    /// per-manager `id_issuer` field is not process-global.
    pub fn global() -> &'static ScanMetrics {
        static INSTANCE: OnceLock<ScanMetrics> = OnceLock::new();
        INSTANCE.get_or_init(ScanMetrics::default)
    }

    pub fn record_chunk(&self, bytes: u64) {
        self.chunks_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_unit(&self) {
        self.units_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            chunks_total: self.chunks_total.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
            units_total: self.units_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
        }
    }
}
