//! The processing manager.
//!
//! Owns one priority queue and one rate limiter per stage, a pool of workers
//! per stage, a population loop that scans the store for episodes with
//! pending work, and a metrics loop. Shared through an `Arc`; `start` runs
//! until `stop` is called from elsewhere.

pub mod queue;


use crate::config::{ProcessingConfig, RATE_LIMIT_WINDOW_SECS};
use crate::database::{EpisodeStore, Stage};
use crate::error::{PipelineError, Result};
use crate::events::{EventSink, PipelineEvent};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::rate_limiter::RateLimiter;
use crate::worker::{Outcome, RetryPolicy, StageAction, Worker};
use chrono::{DateTime, Utc};
use queue::{QueueItem, WorkQueues};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Episodes fetched from the store per population pass.
pub const SCAN_BATCH_SIZE: usize = 100;

/// Failed tasks kept for status reporting.
pub const FAILED_TASK_LOG_SIZE: usize = 100;

/// Lower runs first. Fixed when the episode is enqueued.
pub fn priority_score(age_hours: f64, retry_count: u32) -> f64 {
    age_hours + retry_count as f64 * 24.0
}

/// One action per stage.
pub struct StageActions {
    pub download: Arc<dyn StageAction>,
    pub transcribe: Arc<dyn StageAction>,
    pub analyze: Arc<dyn StageAction>,
}

impl StageActions {
    fn into_array(self) -> Result<[Arc<dyn StageAction>; 3]> {
        let actions = [self.download, self.transcribe, self.analyze];
        for (expected, action) in Stage::ALL.iter().zip(&actions) {
            if action.stage() != *expected {
                return Err(PipelineError::Config(format!(
                    "{} slot holds a {} action",
                    expected,
                    action.stage()
                )));
            }
        }
        Ok(actions)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedTask {
    pub episode_id: i64,
    pub stage: Stage,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub download: usize,
    pub transcribe: usize,
    pub analyze: usize,
}

impl StageCounts {
    fn from_fn(f: impl Fn(Stage) -> usize) -> Self {
        Self {
            download: f(Stage::Download),
            transcribe: f(Stage::Transcribe),
            analyze: f(Stage::Analyze),
        }
    }

    pub fn total(&self) -> usize {
        self.download + self.transcribe + self.analyze
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub is_running: bool,
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: f64,
    pub total_processed: u64,
    pub failed_tasks: u64,
    pub recent_failures: Vec<FailedTask>,
    /// Items waiting per stage
    pub queues: StageCounts,
    /// Items held by a worker per stage
    pub active: StageCounts,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Copy)]
struct RunInfo {
    id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
}

pub struct ProcessingManager {
    config: ProcessingConfig,
    store: Arc<dyn EpisodeStore>,
    actions: [Arc<dyn StageAction>; 3],
    limiters: [Arc<RateLimiter>; 3],
    queues: WorkQueues,
    metrics: Arc<MetricsCollector>,
    events: Arc<dyn EventSink>,

    running: AtomicBool,
    run: Mutex<Option<RunInfo>>,
    shutdown: Mutex<CancellationToken>,
    /// Cancelled once the population loop has exited.
    scan_stopped: Mutex<CancellationToken>,
    total_processed: AtomicU64,
    failed_count: AtomicU64,
    failed_log: Mutex<VecDeque<FailedTask>>,
}

fn cancelled_token() -> CancellationToken {
    let token = CancellationToken::new();
    token.cancel();
    token
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProcessingManager {
    pub fn new(
        config: ProcessingConfig,
        store: Arc<dyn EpisodeStore>,
        actions: StageActions,
        metrics: Arc<MetricsCollector>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        let actions = actions.into_array()?;
        let window = Duration::from_secs_f64(RATE_LIMIT_WINDOW_SECS);
        let limiters = [
            config.download_rate_limit,
            config.transcribe_rate_limit,
            config.analyze_rate_limit,
        ]
        .map(|limit| Arc::new(RateLimiter::new(limit, window)));

        Ok(Self {
            config,
            store,
            actions,
            limiters,
            queues: WorkQueues::new(),
            metrics,
            events,
            running: AtomicBool::new(false),
            run: Mutex::new(None),
            shutdown: Mutex::new(CancellationToken::new()),
            scan_stopped: Mutex::new(cancelled_token()),
            total_processed: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
            failed_log: Mutex::new(VecDeque::with_capacity(FAILED_TASK_LOG_SIZE)),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn queues(&self) -> &WorkQueues {
        &self.queues
    }

    fn worker_count(&self, stage: Stage) -> usize {
        match stage {
            Stage::Download => self.config.num_download_workers,
            Stage::Transcribe => self.config.num_transcribe_workers,
            Stage::Analyze => self.config.num_analyze_workers,
        }
    }

    fn worker(&self, stage: Stage) -> Worker {
        Worker::new(
            self.actions[stage.index()].clone(),
            self.store.clone(),
            self.limiters[stage.index()].clone(),
            self.metrics.clone(),
            self.events.clone(),
            RetryPolicy::new(self.config.max_retries, self.config.retry_delay()),
        )
    }

    /// Run the pipeline until [`stop`](Self::stop) is called.
    ///
    /// Returns an error only when one of the supervised tasks dies (a panic
    /// outside a stage action); the remaining tasks are aborted in that case.
    /// Calling `start` while already running is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            log::warn!("Processing manager already running");
            return Ok(());
        }

        let token = CancellationToken::new();
        let scan_stopped = CancellationToken::new();
        *lock(&self.shutdown) = token.clone();
        *lock(&self.scan_stopped) = scan_stopped.clone();
        let run = RunInfo {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            started: Instant::now(),
        };
        *lock(&self.run) = Some(run);

        self.events.emit(PipelineEvent::ManagerStarted {
            run_id: run.id.to_string(),
            workers: Stage::ALL.map(|stage| self.worker_count(stage)),
        });

        let mut tasks = JoinSet::new();
        for stage in Stage::ALL {
            for _ in 0..self.worker_count(stage) {
                tasks.spawn(self.clone().worker_loop(stage, scan_stopped.clone()));
            }
        }
        tasks.spawn(self.clone().population_loop(token.clone(), scan_stopped));
        tasks.spawn(self.clone().metrics_loop(token.clone()));

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                log::error!("Supervised pipeline task terminated: {}", e);
                self.running.store(false, Ordering::SeqCst);
                token.cancel();
                tasks.abort_all();
                return Err(PipelineError::Other(format!(
                    "pipeline task terminated unexpectedly: {}",
                    e
                )));
            }
        }
        Ok(())
    }

    /// Stop accepting new work and wait until every queued and in-flight
    /// item has been processed. Returns immediately if not running.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.events.emit(PipelineEvent::ManagerStopping);
        lock(&self.shutdown).cancel();

        // A pass already in flight may still push work
        let scan_stopped = lock(&self.scan_stopped).clone();
        scan_stopped.cancelled().await;
        self.queues.join().await;

        self.collect_metrics();
        self.events.emit(PipelineEvent::ManagerStopped {
            total_processed: self.total_processed.load(Ordering::SeqCst),
            failed_tasks: self.failed_count.load(Ordering::SeqCst),
        });
    }

    async fn worker_loop(self: Arc<Self>, stage: Stage, scan_stopped: CancellationToken) {
        let worker = self.worker(stage);
        loop {
            // Once no more work can arrive, drain what is queued and exit
            let item = tokio::select! {
                biased;
                item = self.queues.pop(stage) => item,
                _ = scan_stopped.cancelled() => match self.queues.try_pop(stage) {
                    Some(item) => item,
                    None => break,
                },
            };
            self.handle_item(&worker, stage, item).await;
        }
        log::debug!("{} worker exiting", stage);
    }

    async fn handle_item(&self, worker: &Worker, stage: Stage, item: QueueItem) {
        let outcome = worker.process(item.episode_id).await;
        match outcome {
            Outcome::Completed { .. } => {
                self.total_processed.fetch_add(1, Ordering::SeqCst);
            }
            Outcome::Exhausted { error, .. } => {
                self.failed_count.fetch_add(1, Ordering::SeqCst);
                let mut log = lock(&self.failed_log);
                if log.len() == FAILED_TASK_LOG_SIZE {
                    log.pop_front();
                }
                log.push_back(FailedTask {
                    episode_id: item.episode_id,
                    stage,
                    error,
                    failed_at: Utc::now(),
                });
            }
            Outcome::Rejected { .. } => {}
        }
        self.queues.finish(stage, item.episode_id);
    }

    async fn population_loop(
        self: Arc<Self>,
        token: CancellationToken,
        scan_stopped: CancellationToken,
    ) {
        let _stopped = scan_stopped.drop_guard();
        let interval = self.config.queue_check_interval();
        loop {
            if let Err(e) = self.populate_queues() {
                self.events.emit(PipelineEvent::ScanFailed {
                    error: e.to_string(),
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = token.cancelled() => break,
            }
        }
    }

    async fn metrics_loop(self: Arc<Self>, token: CancellationToken) {
        let interval = self.config.metrics_interval();
        loop {
            self.collect_metrics();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = token.cancelled() => break,
            }
        }
    }

    /// One population pass: enqueue every episode with a ready stage that is
    /// not already queued or active anywhere. Returns how many were added.
    pub fn populate_queues(&self) -> Result<usize> {
        let candidates = self
            .store
            .episodes_needing_work(SCAN_BATCH_SIZE, self.config.max_retries)?;
        let now = Utc::now();
        let mut enqueued = 0;

        for item in &candidates {
            let Some(stage) = item.status.next_stage() else {
                continue;
            };
            let priority = priority_score(item.episode.age_hours(now), item.status.retry_count);
            if self.queues.push(stage, priority, item.episode.id) {
                enqueued += 1;
                self.events.emit(PipelineEvent::Enqueued {
                    stage,
                    episode_id: item.episode.id,
                    priority,
                });
            }
        }

        self.events.emit(PipelineEvent::ScanCompleted {
            found: candidates.len(),
            enqueued,
        });
        Ok(enqueued)
    }

    /// Process everything currently queued for `stage` on the calling task,
    /// one episode at a time. Returns how many items were taken.
    pub async fn drain_stage(&self, stage: Stage) -> usize {
        let worker = self.worker(stage);
        let mut taken = 0;
        while let Some(item) = self.queues.try_pop(stage) {
            self.handle_item(&worker, stage, item).await;
            taken += 1;
        }
        taken
    }

    /// A single pass without background tasks: scan once, then drain the
    /// download, transcribe and analyze queues in that order.
    pub async fn run_once(&self) -> Result<StageCounts> {
        self.populate_queues()?;
        Ok(StageCounts {
            download: self.drain_stage(Stage::Download).await,
            transcribe: self.drain_stage(Stage::Transcribe).await,
            analyze: self.drain_stage(Stage::Analyze).await,
        })
    }

    fn uptime(&self) -> Option<Duration> {
        lock(&self.run).map(|run| run.started.elapsed())
    }

    /// Refresh the manager gauges and emit a metrics event.
    pub fn collect_metrics(&self) {
        let uptime = self.uptime().unwrap_or_default().as_secs_f64();
        let processed = self.total_processed.load(Ordering::SeqCst);
        let rate = if uptime > 0.0 {
            processed as f64 / uptime
        } else {
            0.0
        };

        let mut gauges: Vec<(String, f64)> = vec![
            ("processing_rate".to_string(), rate),
            ("total_processed".to_string(), processed as f64),
            (
                "failed_tasks".to_string(),
                self.failed_count.load(Ordering::SeqCst) as f64,
            ),
        ];
        for stage in Stage::ALL {
            gauges.push((format!("{}_queue_size", stage), self.queues.depth(stage) as f64));
            gauges.push((
                format!("{}_active", stage),
                self.queues.active_count(stage) as f64,
            ));
        }
        self.metrics.update(gauges);

        self.events.emit(PipelineEvent::Metrics {
            snapshot: self.metrics.get_all(),
        });
    }

    pub fn status(&self) -> ManagerStatus {
        let run = *lock(&self.run);
        ManagerStatus {
            is_running: self.is_running(),
            run_id: run.map(|r| r.id),
            started_at: run.map(|r| r.started_at),
            uptime_secs: run.map(|r| r.started.elapsed().as_secs_f64()).unwrap_or(0.0),
            total_processed: self.total_processed.load(Ordering::SeqCst),
            failed_tasks: self.failed_count.load(Ordering::SeqCst),
            recent_failures: lock(&self.failed_log).iter().cloned().collect(),
            queues: StageCounts::from_fn(|stage| self.queues.depth(stage)),
            active: StageCounts::from_fn(|stage| self.queues.active_count(stage)),
            metrics: self.metrics.get_all(),
        }
    }
}
