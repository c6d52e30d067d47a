//! Source Manager: owns the source registry, job scheduling, cancellation
//! propagation, and the single output chunk channel (spec §4.1).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinSet;

use sourcescan_core::{Chunk, JobId, ScanError, SourceHandle, SourceUnit};

use crate::cancel::CancelToken;
use crate::hooks::{UnitHook, UnitMetrics};
use crate::progress::{JobProgress, JobRef, ProgressHooks};
use crate::source::{ChunkReporter, MonolithicSource, SourceCapability, SourceFactory, SourceInit, UnitAwareSource, UnitReporter};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("manager is already done")]
    AlreadyDone,
    #[error("source handle already in use")]
    HandleInUse,
    #[error("unknown source handle")]
    UnknownHandle,
    #[error("cancelled before scheduling")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub source_concurrency: usize,
    pub unit_concurrency: usize,
    pub unit_hook_lru_capacity: usize,
    pub unit_hook_channel_capacity: usize,
    pub chunk_channel_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            source_concurrency: 4,
            unit_concurrency: 8,
            unit_hook_lru_capacity: crate::hooks::DEFAULT_LRU_CAPACITY,
            unit_hook_channel_capacity: crate::hooks::DEFAULT_CHANNEL_CAPACITY,
            chunk_channel_capacity: 256,
        }
    }
}

struct Enrolled {
    name: String,
    #[allow(dead_code)]
    kind: String,
    factory: SourceFactory,
    hooks: Vec<Arc<dyn ProgressHooks>>,
}

struct State {
    next_handle: u64,
    next_job_id: u64,
    sources: HashMap<SourceHandle, Arc<Enrolled>>,
    terminated: bool,
}

/// Enrolls sources, schedules their runs under two nested bounded pools,
/// and multiplexes every job's chunks into one output stream.
pub struct Manager {
    config: ManagerConfig,
    state: Mutex<State>,
    source_pool: Arc<Semaphore>,
    output_tx: Mutex<Option<mpsc::Sender<Chunk>>>,
    output_rx: Mutex<Option<mpsc::Receiver<Chunk>>>,
    jobs: AsyncMutex<JoinSet<()>>,
    job_metrics: Mutex<HashMap<JobId, mpsc::Receiver<UnitMetrics>>>,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let (output_tx, output_rx) = mpsc::channel(config.chunk_channel_capacity.max(1));
        Arc::new(Self {
            source_pool: Arc::new(Semaphore::new(config.source_concurrency.max(1))),
            config,
            state: Mutex::new(State {
                next_handle: 0,
                next_job_id: 0,
                sources: HashMap::new(),
                terminated: false,
            }),
            output_tx: Mutex::new(Some(output_tx)),
            output_rx: Mutex::new(Some(output_rx)),
            jobs: AsyncMutex::new(JoinSet::new()),
            job_metrics: Mutex::new(HashMap::new()),
        })
    }

    pub fn enroll(
        &self,
        name: impl Into<String>,
        kind: impl Into<String>,
        factory: SourceFactory,
        hooks: Vec<Arc<dyn ProgressHooks>>,
    ) -> Result<SourceHandle, ManagerError> {
        let mut state = self.state.lock().expect("manager state poisoned");
        if state.terminated {
            return Err(ManagerError::AlreadyDone);
        }
        let handle = SourceHandle(state.next_handle);
        state.next_handle += 1;
        if state.sources.contains_key(&handle) {
            return Err(ManagerError::HandleInUse);
        }
        state.sources.insert(
            handle,
            Arc::new(Enrolled { name: name.into(), kind: kind.into(), factory, hooks }),
        );
        Ok(handle)
    }

    /// Runs the source and blocks until the job completes. Blocks earlier,
    /// before scheduling, only if the source pool is saturated.
    pub async fn run(&self, handle: SourceHandle, cancel: CancelToken) -> Result<JobRef, ManagerError> {
        let job_ref = self.schedule_run(handle, cancel).await?;
        job_ref.wait().await;
        Ok(job_ref)
    }

    /// Schedules the source's run and returns as soon as it has been
    /// dispatched to a manager-owned task.
    pub async fn schedule_run(&self, handle: SourceHandle, cancel: CancelToken) -> Result<JobRef, ManagerError> {
        let enrolled = {
            let state = self.state.lock().expect("manager state poisoned");
            if state.terminated {
                return Err(ManagerError::AlreadyDone);
            }
            state.sources.get(&handle).cloned().ok_or(ManagerError::UnknownHandle)?
        };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ManagerError::Cancelled),
            permit = Arc::clone(&self.source_pool).acquire_owned() => {
                permit.expect("source pool semaphore is never closed")
            }
        };

        let job_id = {
            let mut state = self.state.lock().expect("manager state poisoned");
            let id = JobId(state.next_job_id);
            state.next_job_id += 1;
            id
        };

        let (unit_hook, metrics_rx) =
            UnitHook::with_capacity(handle, job_id, self.config.unit_hook_lru_capacity, self.config.unit_hook_channel_capacity);
        self.job_metrics.lock().expect("manager state poisoned").insert(job_id, metrics_rx);

        let mut progress_hooks: Vec<Arc<dyn ProgressHooks>> = vec![Arc::new(unit_hook)];
        progress_hooks.extend(enrolled.hooks.iter().cloned());

        let progress = JobProgress::new(handle, job_id, progress_hooks, cancel.clone());
        let job_ref = progress.job_ref();

        let output_tx = self.output_sender();
        let unit_concurrency = self.config.unit_concurrency;
        let chunk_channel_capacity = self.config.chunk_channel_capacity;
        let name = enrolled.name.clone();

        let mut jobs = self.jobs.lock().await;
        jobs.spawn(async move {
            let _permit = permit;
            run_job(enrolled, handle, job_id, name, progress, cancel, output_tx, unit_concurrency, chunk_channel_capacity).await;
        });

        Ok(job_ref)
    }

    /// The manager's output stream. Must be taken at most once.
    pub fn chunks(&self) -> mpsc::Receiver<Chunk> {
        self.output_rx.lock().expect("manager state poisoned").take().expect("chunks() called more than once")
    }

    /// Takes the finished-unit-metrics receiver for one job, if it hasn't
    /// already been taken.
    pub fn take_job_metrics(&self, job_id: JobId) -> Option<mpsc::Receiver<UnitMetrics>> {
        self.job_metrics.lock().expect("manager state poisoned").remove(&job_id)
    }

    pub fn available_capacity(&self) -> usize {
        self.source_pool.available_permits()
    }

    /// Blocks until every enrolled run completes, then closes `chunks()`.
    /// Idempotent; never cancels in-flight jobs itself.
    pub async fn wait(&self) {
        {
            let mut jobs = self.jobs.lock().await;
            while jobs.join_next().await.is_some() {}
        }
        self.output_tx.lock().expect("manager state poisoned").take();
        self.state.lock().expect("manager state poisoned").terminated = true;
    }

    fn output_sender(&self) -> mpsc::Sender<Chunk> {
        self.output_tx
            .lock()
            .expect("manager state poisoned")
            .as_ref()
            .expect("manager already waited")
            .clone()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_job(
    enrolled: Arc<Enrolled>,
    source_id: SourceHandle,
    job_id: JobId,
    name: String,
    progress: Arc<JobProgress>,
    cancel: CancelToken,
    output_tx: mpsc::Sender<Chunk>,
    unit_concurrency: usize,
    chunk_channel_capacity: usize,
) {
    progress.start(Utc::now());

    let init = SourceInit { name, job_id, source_id, verify: true, concurrency: unit_concurrency };

    match (enrolled.factory)() {
        SourceCapability::Monolithic(mut source) => {
            progress.start_enumerating(Utc::now());
            progress.report_unit(None);
            progress.end_enumerating(Utc::now());

            match source.init(&init).await {
                Ok(()) => run_monolithic(source, Arc::clone(&progress), cancel.clone(), output_tx, chunk_channel_capacity).await,
                Err(err) => {
                    progress.report_error(err);
                    cancel.cancel();
                }
            }
        }
        SourceCapability::UnitAware(mut source) => {
            progress.start_enumerating(Utc::now());
            match source.init(&init).await {
                Ok(()) => {
                    run_unit_aware(source, Arc::clone(&progress), cancel.clone(), output_tx, unit_concurrency, chunk_channel_capacity).await
                }
                Err(err) => {
                    progress.report_error(err);
                    cancel.cancel();
                }
            }
            progress.end_enumerating(Utc::now());
        }
    }

    progress.end(Utc::now());
    progress.finish();
}

async fn run_monolithic(
    mut source: Box<dyn MonolithicSource>,
    progress: Arc<JobProgress>,
    cancel: CancelToken,
    output_tx: mpsc::Sender<Chunk>,
    chunk_channel_capacity: usize,
) {
    progress.start_unit_chunking(None, Utc::now());

    let (chunk_tx, chunk_rx) = mpsc::channel(chunk_channel_capacity.max(1));
    let forwarder = spawn_forwarder(None, Arc::clone(&progress), cancel.clone(), chunk_rx, output_tx);

    let reporter = ChunkReporter::new(chunk_tx, None, Arc::clone(&progress), cancel.clone());
    if let Err(err) = source.chunks(cancel.clone(), reporter).await {
        progress.report_error(err);
        cancel.cancel();
    }

    let _ = forwarder.await;
    progress.end_unit_chunking(None, Utc::now());
}

#[allow(clippy::too_many_arguments)]
async fn run_unit_aware(
    source: Box<dyn UnitAwareSource>,
    progress: Arc<JobProgress>,
    cancel: CancelToken,
    output_tx: mpsc::Sender<Chunk>,
    unit_concurrency: usize,
    chunk_channel_capacity: usize,
) {
    let source = Arc::new(AsyncMutex::new(source));
    let unit_pool = Arc::new(Semaphore::new(unit_concurrency.max(1)));
    let (unit_tx, mut unit_rx) = mpsc::channel(unit_concurrency.max(1) * 2);

    let unit_reporter = UnitReporter::new(unit_tx, Arc::clone(&progress), cancel.clone());
    let enumerate_handle = {
        let source = Arc::clone(&source);
        let progress = Arc::clone(&progress);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut guard = source.lock().await;
            if let Err(err) = guard.enumerate(cancel.clone(), unit_reporter).await {
                progress.report_error(err);
                cancel.cancel();
            }
        })
    };

    let mut unit_tasks: JoinSet<()> = JoinSet::new();
    while let Some(unit) = unit_rx.recv().await {
        progress.report_unit(Some(&unit));

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&unit_pool).acquire_owned() => {
                match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                }
            }
        };

        let task_source = Arc::clone(&source);
        let task_progress = Arc::clone(&progress);
        let task_cancel = cancel.clone();
        let task_output = output_tx.clone();
        let task_capacity = chunk_channel_capacity;
        unit_tasks.spawn(async move {
            let _permit = permit;
            run_unit(task_source, unit, task_progress, task_cancel, task_output, task_capacity).await;
        });
    }

    let _ = enumerate_handle.await;
    while unit_tasks.join_next().await.is_some() {}
}

async fn run_unit(
    source: Arc<AsyncMutex<Box<dyn UnitAwareSource>>>,
    unit: SourceUnit,
    progress: Arc<JobProgress>,
    cancel: CancelToken,
    output_tx: mpsc::Sender<Chunk>,
    chunk_channel_capacity: usize,
) {
    progress.start_unit_chunking(Some(&unit), Utc::now());

    let (chunk_tx, chunk_rx) = mpsc::channel(chunk_channel_capacity.max(1));
    let forwarder = spawn_forwarder(Some(unit.clone()), Arc::clone(&progress), cancel.clone(), chunk_rx, output_tx);

    let reporter = ChunkReporter::new(chunk_tx, Some(unit.clone()), Arc::clone(&progress), cancel.clone());
    let result = {
        let mut guard = source.lock().await;
        guard.chunk_unit(cancel.clone(), unit.clone(), reporter).await
    };
    if let Err(err) = result {
        // Fatal to this job (no further units are scheduled once cancel
        // fires) but still surfaced through the error list, per §4.1.
        progress.report_error(err);
        cancel.cancel();
    }

    let _ = forwarder.await;
    progress.end_unit_chunking(Some(&unit), Utc::now());
}

/// Drains a unit's chunk channel, annotating each chunk through the hook
/// fan-out *before* forwarding it to the manager's single output stream.
/// Awaited to completion before the unit's `EndUnitChunking` hook fires, so
/// every chunk is observable downstream before `FinishedUnits` increments.
fn spawn_forwarder(
    unit: Option<SourceUnit>,
    progress: Arc<JobProgress>,
    cancel: CancelToken,
    mut chunk_rx: mpsc::Receiver<Chunk>,
    output_tx: mpsc::Sender<Chunk>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(chunk) = chunk_rx.recv().await {
            progress.report_chunk(unit.as_ref(), &chunk);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = output_tx.send(chunk) => {
                    if result.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::source::SourceMeta;

    fn test_chunk(n: u8) -> Chunk {
        Chunk {
            source_id: SourceHandle(0),
            source_name: "t".into(),
            job_id: JobId(0),
            source_type: "t".into(),
            metadata: sourcescan_core::SourceMetadata::Filesystem { path: "x".into() },
            payload: Arc::from(vec![n]),
            verify: false,
        }
    }

    struct FixedMonolithic {
        count: u8,
    }

    #[async_trait]
    impl SourceMeta for FixedMonolithic {
        fn type_tag(&self) -> &str {
            "fixed"
        }
        async fn init(&mut self, _init: &SourceInit) -> Result<(), ScanError> {
            Ok(())
        }
    }

    #[async_trait]
    impl MonolithicSource for FixedMonolithic {
        async fn chunks(&mut self, _cancel: CancelToken, sink: ChunkReporter) -> Result<(), ScanError> {
            for n in 0..self.count {
                sink.ok(test_chunk(n)).await?;
            }
            Ok(())
        }
    }

    /// Scenario: a 4-chunk monolithic run reaches one nil-unit at 100%.
    #[tokio::test]
    async fn monolithic_job_delivers_all_chunks_and_completes() {
        let manager = Manager::new(ManagerConfig::default());
        let handle = manager
            .enroll("fixed", "fixed", Box::new(|| SourceCapability::Monolithic(Box::new(FixedMonolithic { count: 4 }))), Vec::new())
            .unwrap();

        let mut rx = manager.chunks();
        let job_ref = manager.run(handle, CancelToken::new()).await.unwrap();
        manager.wait().await;

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 4);

        let snap = job_ref.snapshot();
        assert_eq!(snap.enumerated_units, 1);
        assert_eq!(snap.finished_units, 1);
        assert_eq!(snap.chunks_total, 4);
        assert_eq!(snap.percent_complete(), 100.0);
    }

    struct UnitAwareFixed {
        units: Vec<(String, u8)>,
    }

    #[async_trait]
    impl SourceMeta for UnitAwareFixed {
        fn type_tag(&self) -> &str {
            "unit-fixed"
        }
        async fn init(&mut self, _init: &SourceInit) -> Result<(), ScanError> {
            Ok(())
        }
    }

    #[async_trait]
    impl UnitAwareSource for UnitAwareFixed {
        async fn enumerate(&mut self, _cancel: CancelToken, reporter: UnitReporter) -> Result<(), ScanError> {
            for (id, _) in &self.units {
                reporter.ok(SourceUnit::new(id.clone(), "test")).await?;
            }
            Ok(())
        }

        async fn chunk_unit(&mut self, _cancel: CancelToken, unit: SourceUnit, reporter: ChunkReporter) -> Result<(), ScanError> {
            let count = self.units.iter().find(|(id, _)| *id == unit.id).map(|(_, c)| *c).unwrap_or(0);
            for n in 0..count {
                reporter.ok(test_chunk(n)).await?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn unit_aware_job_delivers_chunks_across_units() {
        let manager = Manager::new(ManagerConfig::default());
        let handle = manager
            .enroll(
                "units",
                "unit-fixed",
                Box::new(|| {
                    SourceCapability::UnitAware(Box::new(UnitAwareFixed {
                        units: vec![("a".into(), 2), ("b".into(), 3)],
                    }))
                }),
                Vec::new(),
            )
            .unwrap();

        let mut rx = manager.chunks();
        let job_ref = manager.run(handle, CancelToken::new()).await.unwrap();
        manager.wait().await;

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 5);

        let snap = job_ref.snapshot();
        assert_eq!(snap.enumerated_units, 2);
        assert_eq!(snap.finished_units, 2);
        assert_eq!(snap.percent_complete(), 100.0);
    }

    struct InfiniteMonolithic {
        emitted: Arc<AtomicU64>,
    }

    #[async_trait]
    impl SourceMeta for InfiniteMonolithic {
        fn type_tag(&self) -> &str {
            "infinite"
        }
        async fn init(&mut self, _init: &SourceInit) -> Result<(), ScanError> {
            Ok(())
        }
    }

    #[async_trait]
    impl MonolithicSource for InfiniteMonolithic {
        async fn chunks(&mut self, cancel: CancelToken, sink: ChunkReporter) -> Result<(), ScanError> {
            let mut n = 0u8;
            loop {
                if cancel.is_cancelled() {
                    return Err(ScanError::cancelled("infinite source cancelled"));
                }
                sink.ok(test_chunk(n)).await?;
                self.emitted.fetch_add(1, Ordering::SeqCst);
                n = n.wrapping_add(1);
            }
        }
    }

    /// Scenario: cancellation mid-flight surfaces as the job's fatal error.
    #[tokio::test]
    async fn cancel_run_stops_an_infinite_source() {
        let manager = Manager::new(ManagerConfig::default());
        let emitted = Arc::new(AtomicU64::new(0));
        let emitted_for_factory = Arc::clone(&emitted);
        let handle = manager
            .enroll(
                "infinite",
                "infinite",
                Box::new(move || SourceCapability::Monolithic(Box::new(InfiniteMonolithic { emitted: Arc::clone(&emitted_for_factory) }))),
                Vec::new(),
            )
            .unwrap();

        let mut rx = manager.chunks();
        let job_ref = manager.schedule_run(handle, CancelToken::new()).await.unwrap();

        let mut drained = 0;
        while drained < 50 {
            if rx.recv().await.is_some() {
                drained += 1;
            }
        }
        job_ref.cancel_run(ScanError::cancelled("caller stopped the run"));

        tokio::time::timeout(Duration::from_secs(2), job_ref.wait()).await.expect("job ends promptly after cancellation");
        manager.wait().await;

        let snap = job_ref.snapshot();
        assert!(snap.fatal_error().is_some());
    }
}
