use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use sourcescan_core::{Chunk, JobId, JoinedError, ResumeCursor, ScanError, ScanMetrics, SourceHandle, SourceUnit};

use crate::cancel::CancelToken;

/// Observer notified on each lifecycle event of a `JobProgress`. Hooks are
/// invoked synchronously and sequentially — a slow hook blocks the job, by
/// design, so backpressure reaches the source (spec §4.2).
///
/// Every parameter that may refer to a unit is `Option<&SourceUnit>`: `None`
/// marks the monolithic source's single implicit unit.
pub trait ProgressHooks: Send + Sync {
    fn on_start(&self, _at: DateTime<Utc>) {}
    fn on_start_enumerating(&self, _at: DateTime<Utc>) {}
    fn on_end_enumerating(&self, _at: DateTime<Utc>) {}
    fn on_report_unit(&self, _unit: Option<&SourceUnit>) {}
    fn on_start_unit_chunking(&self, _unit: Option<&SourceUnit>, _at: DateTime<Utc>) {}
    fn on_end_unit_chunking(&self, _unit: Option<&SourceUnit>, _at: DateTime<Utc>) {}
    fn on_report_chunk(&self, _unit: Option<&SourceUnit>, _chunk: &Chunk) {}
    fn on_report_error(&self, _err: &ScanError) {}
    fn on_end(&self, _at: DateTime<Utc>) {}
    fn on_finish(&self, _snapshot: &ProgressSnapshot) {}
}

struct State {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    enumeration_start: Option<DateTime<Utc>>,
    enumeration_end: Option<DateTime<Utc>>,
    done_enumerating: bool,
    enumerated_units: u64,
    finished_units: u64,
    chunks_total: u64,
    errors: Vec<ScanError>,
    cursor: ResumeCursor,
}

impl State {
    fn new() -> Self {
        Self {
            start: None,
            end: None,
            enumeration_start: None,
            enumeration_end: None,
            done_enumerating: false,
            enumerated_units: 0,
            finished_units: 0,
            chunks_total: 0,
            errors: Vec::new(),
            cursor: ResumeCursor::new(),
        }
    }
}

/// Immutable point-in-time copy of a job's progress (spec §3 `JobProgress`,
/// §6 progress snapshot).
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub source_id: SourceHandle,
    pub job_id: JobId,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub enumeration_start: Option<DateTime<Utc>>,
    pub enumeration_end: Option<DateTime<Utc>>,
    pub done_enumerating: bool,
    pub enumerated_units: u64,
    pub finished_units: u64,
    pub chunks_total: u64,
    pub errors: Vec<ScanError>,
    pub encoded_resume_info: String,
}

impl ProgressSnapshot {
    pub fn fatal_error(&self) -> Option<&ScanError> {
        self.errors.iter().find(|e| e.is_fatal())
    }

    pub fn fatal_errors(&self) -> Option<JoinedError> {
        JoinedError::from_errors(self.errors.iter().filter(|e| e.is_fatal()))
    }

    pub fn chunk_error(&self) -> Option<JoinedError> {
        JoinedError::from_errors(self.errors.iter().filter(|e| e.is_chunk_scoped()))
    }

    pub fn enumeration_error(&self) -> Option<JoinedError> {
        JoinedError::from_errors(self.errors.iter().filter(|e| !e.is_chunk_scoped()))
    }

    pub fn errors_for(&self, unit: &SourceUnit) -> Vec<&ScanError> {
        self.errors
            .iter()
            .filter(|e| e.chunk_unit() == Some(unit))
            .collect()
    }

    pub fn percent_complete(&self) -> f64 {
        if self.enumerated_units == 0 {
            return 0.0;
        }
        100.0 * (self.finished_units as f64) / (self.enumerated_units as f64)
    }
}

/// Per-run aggregate state, hook fan-out, and cancellation token (spec §4.2).
///
/// `JobProgress` is the sole owner of the state guarded by its internal
/// mutex; hook fan-out always happens after the guard is dropped, matching
/// "each atomic under one internal mutex ... hook fan-out occurs outside the
/// lock."
pub struct JobProgress {
    pub source_id: SourceHandle,
    pub job_id: JobId,
    state: Mutex<State>,
    hooks: Vec<Arc<dyn ProgressHooks>>,
    cancel: CancelToken,
    finished: AtomicBool,
    finished_notify: Notify,
}

impl JobProgress {
    /// `cancel` is the job's single authoritative cancellation token: the
    /// same handle the manager threads into the running source, its
    /// reporters, and its forwarders, so that `finish`/`JobRef::cancel_run`
    /// actually reach the in-flight job instead of cancelling a token
    /// nothing observes.
    pub fn new(source_id: SourceHandle, job_id: JobId, hooks: Vec<Arc<dyn ProgressHooks>>, cancel: CancelToken) -> Arc<Self> {
        Arc::new(Self {
            source_id,
            job_id,
            state: Mutex::new(State::new()),
            hooks,
            cancel,
            finished: AtomicBool::new(false),
            finished_notify: Notify::new(),
        })
    }

    fn dispatch(&self, f: impl Fn(&dyn ProgressHooks)) {
        for hook in &self.hooks {
            f(hook.as_ref());
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn start(&self, at: DateTime<Utc>) {
        self.state.lock().expect("progress mutex poisoned").start = Some(at);
        self.dispatch(|h| h.on_start(at));
    }

    pub fn start_enumerating(&self, at: DateTime<Utc>) {
        self.state.lock().expect("progress mutex poisoned").enumeration_start = Some(at);
        self.dispatch(|h| h.on_start_enumerating(at));
    }

    pub fn end_enumerating(&self, at: DateTime<Utc>) {
        {
            let mut s = self.state.lock().expect("progress mutex poisoned");
            s.enumeration_end = Some(at);
            s.done_enumerating = true;
        }
        self.dispatch(|h| h.on_end_enumerating(at));
    }

    pub fn report_unit(&self, unit: Option<&SourceUnit>) {
        {
            let mut s = self.state.lock().expect("progress mutex poisoned");
            s.enumerated_units += 1;
            if let Some(unit) = unit {
                s.cursor.insert(unit.id.clone());
            }
        }
        ScanMetrics::global().record_unit();
        self.dispatch(|h| h.on_report_unit(unit));
    }

    pub fn start_unit_chunking(&self, unit: Option<&SourceUnit>, at: DateTime<Utc>) {
        self.dispatch(|h| h.on_start_unit_chunking(unit, at));
    }

    pub fn end_unit_chunking(&self, unit: Option<&SourceUnit>, at: DateTime<Utc>) {
        {
            let mut s = self.state.lock().expect("progress mutex poisoned");
            s.finished_units += 1;
            if let Some(unit) = unit {
                s.cursor.remove(&unit.id);
            }
        }
        self.dispatch(|h| h.on_end_unit_chunking(unit, at));
    }

    /// Fires the `ReportChunk` hook *before* the chunk is written downstream,
    /// per spec §4.2.
    pub fn report_chunk(&self, unit: Option<&SourceUnit>, chunk: &Chunk) {
        {
            let mut s = self.state.lock().expect("progress mutex poisoned");
            s.chunks_total += 1;
        }
        self.dispatch(|h| h.on_report_chunk(unit, chunk));
        ScanMetrics::global().record_chunk(chunk.len() as u64);
    }

    pub fn report_error(&self, err: ScanError) {
        {
            let mut s = self.state.lock().expect("progress mutex poisoned");
            s.errors.push(err.clone());
        }
        ScanMetrics::global().record_error();
        self.dispatch(|h| h.on_report_error(&err));
    }

    pub fn end(&self, at: DateTime<Utc>) {
        self.state.lock().expect("progress mutex poisoned").end = Some(at);
        self.dispatch(|h| h.on_end(at));
    }

    /// Cancels the job's context and fires the `Finish` hook. Idempotent.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let snapshot = self.snapshot();
        self.dispatch(|h| h.on_finish(&snapshot));
        self.finished_notify.notify_waiters();
    }

    pub async fn done(&self) {
        loop {
            if self.finished.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.finished_notify.notified();
            tokio::pin!(notified);
            if self.finished.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let s = self.state.lock().expect("progress mutex poisoned");
        ProgressSnapshot {
            source_id: self.source_id,
            job_id: self.job_id,
            start: s.start,
            end: s.end,
            enumeration_start: s.enumeration_start,
            enumeration_end: s.enumeration_end,
            done_enumerating: s.done_enumerating,
            enumerated_units: s.enumerated_units,
            finished_units: s.finished_units,
            chunks_total: s.chunks_total,
            errors: s.errors.clone(),
            encoded_resume_info: s.cursor.encode(),
        }
    }

    pub fn job_ref(self: &Arc<Self>) -> JobRef {
        JobRef {
            inner: Arc::clone(self),
        }
    }
}

/// A read-capability handle to a running or completed job. Holds a plain
/// `Arc` rather than a weak back-reference: unlike the cyclic
/// `JobProgress`/`JobRef` pointer pair spec §9 warns about, nothing on the
/// `JobProgress` side points back at a `JobRef`, so there is no cycle to
/// break.
#[derive(Clone)]
pub struct JobRef {
    inner: Arc<JobProgress>,
}

impl JobRef {
    pub fn job_id(&self) -> JobId {
        self.inner.job_id
    }

    pub fn source_id(&self) -> SourceHandle {
        self.inner.source_id
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.inner.snapshot()
    }

    pub async fn wait(&self) {
        self.inner.done().await;
    }

    /// Sets the job's fatal error and cancels the job's context. The error
    /// is surfaced as the job's first fatal error.
    pub fn cancel_run(&self, err: ScanError) {
        self.inner.report_error(err);
        self.inner.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn monolithic_job_reaches_100_percent() {
        let progress = JobProgress::new(SourceHandle(1), JobId(1), Vec::new(), CancelToken::new());
        let now = Utc::now();
        progress.start(now);
        progress.start_enumerating(now);
        progress.report_unit(None);
        progress.end_enumerating(now);
        progress.start_unit_chunking(None, now);
        let chunk = Chunk {
            source_id: SourceHandle(1),
            source_name: "test".into(),
            job_id: JobId(1),
            source_type: "test".into(),
            metadata: sourcescan_core::SourceMetadata::Filesystem { path: "x".into() },
            payload: Arc::from(&b"0"[..]),
            verify: false,
        };
        progress.report_chunk(None, &chunk);
        progress.end_unit_chunking(None, now);
        progress.end(now);
        progress.finish();

        let snap = progress.snapshot();
        assert_eq!(snap.enumerated_units, 1);
        assert_eq!(snap.finished_units, 1);
        assert_eq!(snap.chunks_total, 1);
        assert_eq!(snap.percent_complete(), 100.0);
        assert!(snap.fatal_error().is_none());
    }

    #[tokio::test]
    async fn finish_is_idempotent_and_wakes_waiters() {
        let progress = JobProgress::new(SourceHandle(1), JobId(2), Vec::new(), CancelToken::new());
        progress.finish();
        progress.finish();
        progress.done().await;
    }

    #[tokio::test]
    async fn cancel_run_surfaces_as_first_fatal() {
        let progress = JobProgress::new(SourceHandle(1), JobId(3), Vec::new(), CancelToken::new());
        let job_ref = progress.job_ref();
        job_ref.cancel_run(ScanError::cancelled("stop"));
        assert!(progress.cancel_token().is_cancelled());
        let snap = job_ref.snapshot();
        assert!(snap.fatal_error().is_some());
    }
}
