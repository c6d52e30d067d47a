//! Unit Hook: the per-`(job, unit)` telemetry aggregator (spec §4.3).

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use lru::LruCache;
use tokio::sync::mpsc;
use tracing::warn;

use sourcescan_core::{Chunk, JobId, ScanError, SourceHandle, SourceUnit};

use crate::progress::{ProgressHooks, ProgressSnapshot};

/// Default bound on the number of live `(source, job, unit)` accumulators.
pub const DEFAULT_LRU_CAPACITY: usize = 1024;

/// Default buffered capacity of the finished-metrics channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Per-unit record exported to the telemetry sink on unit completion.
#[derive(Debug, Clone)]
pub struct UnitMetrics {
    pub source_id: SourceHandle,
    pub job_id: JobId,
    /// `None` identifies the monolithic source's single implicit unit.
    pub unit: Option<SourceUnit>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub chunks: u64,
    pub bytes: u64,
    pub errors: Vec<ScanError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    source_id: SourceHandle,
    job_id: JobId,
    unit_id: String,
}

impl Key {
    fn for_unit(source_id: SourceHandle, job_id: JobId, unit: Option<&SourceUnit>) -> Self {
        Self {
            source_id,
            job_id,
            unit_id: unit.map(|u| u.id.clone()).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
struct Record {
    unit: Option<SourceUnit>,
    start: DateTime<Utc>,
    chunks: u64,
    bytes: u64,
    errors: Vec<ScanError>,
    /// Already flushed through the finished channel; eviction of a handled
    /// entry is a no-op, eviction of a live entry only loses bookkeeping
    /// (correctness is preserved: a later `EndUnitChunking` finds nothing
    /// and becomes a no-op itself).
    handled: bool,
}

impl Record {
    fn fresh(unit: Option<&SourceUnit>, start: DateTime<Utc>) -> Self {
        Self {
            unit: unit.cloned(),
            start,
            chunks: 0,
            bytes: 0,
            errors: Vec::new(),
            handled: false,
        }
    }
}

struct Inner {
    source_id: SourceHandle,
    job_id: JobId,
    lru: Mutex<LruCache<Key, Record>>,
    tx: mpsc::Sender<UnitMetrics>,
    logged_first_block: AtomicBool,
}

/// Maintains a bounded LRU of per-unit accumulators and emits a finished
/// `UnitMetrics` record through a buffered channel whenever a unit
/// completes, a job finishes, or an entry is handled.
pub struct UnitHook {
    inner: Inner,
}

impl UnitHook {
    pub fn new(source_id: SourceHandle, job_id: JobId) -> (Self, mpsc::Receiver<UnitMetrics>) {
        Self::with_capacity(source_id, job_id, DEFAULT_LRU_CAPACITY, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(
        source_id: SourceHandle,
        job_id: JobId,
        lru_capacity: usize,
        channel_capacity: usize,
    ) -> (Self, mpsc::Receiver<UnitMetrics>) {
        let cap = NonZeroUsize::new(lru_capacity.max(1)).expect("capacity must be non-zero");
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        (
            Self {
                inner: Inner {
                    source_id,
                    job_id,
                    lru: Mutex::new(LruCache::new(cap)),
                    tx,
                    logged_first_block: AtomicBool::new(false),
                },
            },
            rx,
        )
    }

    /// Sends the finished metric, blocking the calling thread while the
    /// buffer is full. Backpressure on this channel is intentional: a
    /// consumer that cannot keep up slows scanning down (spec §4.3).
    fn emit(&self, metrics: UnitMetrics) {
        let mut pending = Some(metrics);
        loop {
            match self.inner.tx.try_send(pending.take().expect("metrics present")) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(metrics)) => {
                    if !self.inner.logged_first_block.swap(true, Ordering::SeqCst) {
                        warn!(
                            source_id = self.inner.source_id.0,
                            job_id = self.inner.job_id.0,
                            "finished-metrics channel full; blocking (backpressure is intentional)"
                        );
                    }
                    pending = Some(metrics);
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    }

    /// Point-in-time copy of all live (not yet handled) metrics.
    pub fn in_progress_snapshot(&self) -> Vec<UnitMetrics> {
        let lru = self.inner.lru.lock().expect("hook lru poisoned");
        lru.iter()
            .filter(|(_, r)| !r.handled)
            .map(|(k, r)| UnitMetrics {
                source_id: k.source_id,
                job_id: k.job_id,
                unit: r.unit.clone(),
                start: r.start,
                end: Utc::now(),
                chunks: r.chunks,
                bytes: r.bytes,
                errors: r.errors.clone(),
            })
            .collect()
    }
}

impl ProgressHooks for UnitHook {
    fn on_start_unit_chunking(&self, unit: Option<&SourceUnit>, at: DateTime<Utc>) {
        let key = Key::for_unit(self.inner.source_id, self.inner.job_id, unit);
        let mut lru = self.inner.lru.lock().expect("hook lru poisoned");
        if let Some((evicted_key, evicted)) = lru.push(key, Record::fresh(unit, at)) {
            if !evicted.handled {
                warn!(
                    unit = %evicted_key.unit_id,
                    "unit metrics evicted from LRU before completion; bookkeeping lost, correctness unaffected"
                );
            }
        }
    }

    fn on_report_chunk(&self, unit: Option<&SourceUnit>, chunk: &Chunk) {
        let key = Key::for_unit(self.inner.source_id, self.inner.job_id, unit);
        let mut lru = self.inner.lru.lock().expect("hook lru poisoned");
        if let Some(record) = lru.get_mut(&key) {
            record.chunks += 1;
            record.bytes += chunk.len() as u64;
            return;
        }
        if unit.is_none() {
            // Synthesize the monolithic nil-unit record the first time a
            // chunk arrives without a preceding `StartUnitChunking`.
            lru.push(key, Record::fresh(None, Utc::now()));
        }
    }

    fn on_report_error(&self, err: &ScanError) {
        let mut lru = self.inner.lru.lock().expect("hook lru poisoned");
        if let Some(unit) = err.chunk_unit() {
            let key = Key::for_unit(self.inner.source_id, self.inner.job_id, Some(unit));
            if let Some(record) = lru.get_mut(&key) {
                record.errors.push(err.clone());
            }
        }
        // Always append to the nil-unit record, if present, so monolithic
        // sources see every job error in one bucket.
        let nil_key = Key::for_unit(self.inner.source_id, self.inner.job_id, None);
        if let Some(record) = lru.get_mut(&nil_key) {
            record.errors.push(err.clone());
        }
    }

    fn on_end_unit_chunking(&self, unit: Option<&SourceUnit>, at: DateTime<Utc>) {
        let key = Key::for_unit(self.inner.source_id, self.inner.job_id, unit);
        let record = {
            let mut lru = self.inner.lru.lock().expect("hook lru poisoned");
            lru.pop(&key)
        };
        let Some(mut record) = record else {
            // Evicted earlier or never started; a no-op by design.
            return;
        };
        record.handled = true;
        self.emit(UnitMetrics {
            source_id: self.inner.source_id,
            job_id: self.inner.job_id,
            unit: record.unit,
            start: record.start,
            end: at,
            chunks: record.chunks,
            bytes: record.bytes,
            errors: record.errors,
        });
    }

    fn on_finish(&self, snapshot: &ProgressSnapshot) {
        let nil_key = Key::for_unit(self.inner.source_id, self.inner.job_id, None);
        let record = {
            let mut lru = self.inner.lru.lock().expect("hook lru poisoned");
            lru.pop(&nil_key)
        };
        // Sweep the nil-unit record only if one is still live: a job that
        // ended its implicit unit normally already emitted through
        // `EndUnitChunking`, and a purely unit-aware job never creates one.
        // This is the orphan-sweep `UnitMetrics` calls out: it catches a
        // monolithic run that errored or was cancelled before its explicit
        // end call, guaranteeing that run still produces one metric.
        let Some(record) = record else {
            return;
        };
        self.emit(UnitMetrics {
            source_id: self.inner.source_id,
            job_id: self.inner.job_id,
            unit: None,
            start: record.start,
            end: snapshot.end.unwrap_or_else(Utc::now),
            chunks: record.chunks,
            bytes: record.bytes,
            errors: record.errors,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn chunk(bytes: &[u8]) -> Chunk {
        Chunk {
            source_id: SourceHandle(1),
            source_name: "t".into(),
            job_id: JobId(1),
            source_type: "t".into(),
            metadata: sourcescan_core::SourceMetadata::Filesystem { path: "x".into() },
            payload: Arc::from(bytes),
            verify: false,
        }
    }

    #[tokio::test]
    async fn unit_lifecycle_emits_exactly_one_metric() {
        let (hook, mut rx) = UnitHook::new(SourceHandle(1), JobId(1));
        let unit = SourceUnit::new("a", "file");
        let now = Utc::now();
        hook.on_start_unit_chunking(Some(&unit), now);
        hook.on_report_chunk(Some(&unit), &chunk(b"hello"));
        hook.on_report_chunk(Some(&unit), &chunk(b"world"));
        hook.on_end_unit_chunking(Some(&unit), now);

        let metrics = rx.try_recv().expect("metric emitted");
        assert_eq!(metrics.chunks, 2);
        assert_eq!(metrics.bytes, 10);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn monolithic_chunk_synthesizes_nil_record() {
        let (hook, _rx) = UnitHook::new(SourceHandle(1), JobId(1));
        hook.on_report_chunk(None, &chunk(b"abcd"));
        let live = hook.in_progress_snapshot();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].bytes, 4);
        assert!(live[0].unit.is_none());
    }

    #[tokio::test]
    async fn end_unit_chunking_without_start_is_noop() {
        let (hook, mut rx) = UnitHook::new(SourceHandle(1), JobId(1));
        let unit = SourceUnit::new("missing", "file");
        hook.on_end_unit_chunking(Some(&unit), Utc::now());
        assert!(rx.try_recv().is_err());
    }
}
