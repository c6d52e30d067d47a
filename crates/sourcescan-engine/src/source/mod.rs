//! Source Adapter surface: the capability interfaces sources implement,
//! and the cancellable reporter shims the Manager hands them (spec §4.6).

pub mod filesystem;
pub mod json_bundle_source;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use sourcescan_core::{Chunk, JobId, ScanError, SourceHandle, SourceUnit};

use crate::cancel::CancelToken;
use crate::progress::JobProgress;

/// Parameters a source is configured with before its run starts.
#[derive(Debug, Clone)]
pub struct SourceInit {
    pub name: String,
    pub job_id: JobId,
    pub source_id: SourceHandle,
    pub verify: bool,
    pub concurrency: usize,
}

/// Shared surface both source styles implement.
#[async_trait]
pub trait SourceMeta: Send + Sync {
    /// Stable source-type identifier, e.g. `"filesystem"`, `"json-bundle"`.
    fn type_tag(&self) -> &str;

    async fn init(&mut self, init: &SourceInit) -> Result<(), ScanError>;
}

/// A source that emits chunks directly without an enumerate phase; the
/// Manager treats its whole run as one implicit unit.
#[async_trait]
pub trait MonolithicSource: SourceMeta {
    async fn chunks(&mut self, cancel: CancelToken, sink: ChunkReporter) -> Result<(), ScanError>;
}

/// A source that enumerates discrete units up front, then chunks each
/// independently (and, from the Manager's point of view, concurrently).
#[async_trait]
pub trait UnitAwareSource: SourceMeta {
    async fn enumerate(&mut self, cancel: CancelToken, reporter: UnitReporter) -> Result<(), ScanError>;
    async fn chunk_unit(&mut self, cancel: CancelToken, unit: SourceUnit, reporter: ChunkReporter) -> Result<(), ScanError>;
}

/// The sum-type capability check the Manager performs on enrollment: a
/// source is exactly one of these two profiles, never both, never neither.
pub enum SourceCapability {
    Monolithic(Box<dyn MonolithicSource>),
    UnitAware(Box<dyn UnitAwareSource>),
}

/// Constructs a fresh, uninitialized source instance for one run.
pub type SourceFactory = Box<dyn Fn() -> SourceCapability + Send + Sync>;

fn nil_unit() -> SourceUnit {
    SourceUnit::new("", "")
}

/// Cancellable shim a source uses to report enumerated units. `ok` forwards
/// to the Manager's per-job unit channel; `err` records a transient error
/// on the job without aborting enumeration.
pub struct UnitReporter {
    tx: mpsc::Sender<SourceUnit>,
    progress: Arc<JobProgress>,
    cancel: CancelToken,
}

impl UnitReporter {
    pub fn new(tx: mpsc::Sender<SourceUnit>, progress: Arc<JobProgress>, cancel: CancelToken) -> Self {
        Self { tx, progress, cancel }
    }

    pub async fn ok(&self, unit: SourceUnit) -> Result<(), ScanError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ScanError::cancelled("unit reporter cancelled")),
            result = self.tx.send(unit) => result.map_err(|_| ScanError::cancelled("unit channel closed")),
        }
    }

    pub fn err(&self, err: ScanError) {
        self.progress.report_error(err);
    }
}

/// Cancellable shim a source uses to emit chunks for one unit (or, for a
/// monolithic source, for the implicit nil unit). `ok` writes into the
/// unit's chunk channel; `err` records a chunk-scoped error attributed to
/// the owning unit.
pub struct ChunkReporter {
    tx: mpsc::Sender<Chunk>,
    unit: Option<SourceUnit>,
    progress: Arc<JobProgress>,
    cancel: CancelToken,
}

impl ChunkReporter {
    pub fn new(tx: mpsc::Sender<Chunk>, unit: Option<SourceUnit>, progress: Arc<JobProgress>, cancel: CancelToken) -> Self {
        Self { tx, unit, progress, cancel }
    }

    pub async fn ok(&self, chunk: Chunk) -> Result<(), ScanError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ScanError::cancelled("chunk reporter cancelled")),
            result = self.tx.send(chunk) => result.map_err(|_| ScanError::cancelled("chunk channel closed")),
        }
    }

    pub fn err(&self, message: impl Into<String>) {
        let unit = self.unit.clone().unwrap_or_else(nil_unit);
        self.progress.report_error(ScanError::chunk(unit, message));
    }
}
