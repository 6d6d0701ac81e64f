//! Structured pipeline events.
//!
//! The manager and workers never log through a global; they are handed an
//! [`EventSink`] and report what happened as a [`PipelineEvent`]. The
//! default [`LogSink`] turns events into `tracing` records with
//! `episode_id`/`stage` fields.

use crate::database::Stage;
use crate::metrics::MetricsSnapshot;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    ManagerStarted {
        run_id: String,
        workers: [usize; 3],
    },
    ManagerStopping,
    ManagerStopped {
        total_processed: u64,
        failed_tasks: u64,
    },
    ScanCompleted {
        found: usize,
        enqueued: usize,
    },
    ScanFailed {
        error: String,
    },
    Enqueued {
        stage: Stage,
        episode_id: i64,
        priority: f64,
    },
    /// The worker refused the episode before touching its status.
    Rejected {
        stage: Stage,
        episode_id: i64,
        reason: String,
    },
    StageStarted {
        stage: Stage,
        episode_id: i64,
    },
    AttemptFailed {
        stage: Stage,
        episode_id: i64,
        attempt: u32,
        error: String,
        retry_in: Option<Duration>,
    },
    StageCompleted {
        stage: Stage,
        episode_id: i64,
        attempts: u32,
        elapsed: Duration,
    },
    /// Retries exhausted; the episode stays where it is until an operator
    /// resets its retry budget.
    StageExhausted {
        stage: Stage,
        episode_id: i64,
        attempts: u32,
        error: String,
    },
    CommitFailed {
        stage: Stage,
        episode_id: i64,
        error: String,
    },
    Metrics {
        snapshot: MetricsSnapshot,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Writes events to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::ManagerStarted { run_id, workers } => tracing::info!(
                run_id = %run_id,
                download_workers = workers[0],
                transcribe_workers = workers[1],
                analyze_workers = workers[2],
                "Processing pipeline started"
            ),
            PipelineEvent::ManagerStopping => tracing::info!("Stopping processing pipeline"),
            PipelineEvent::ManagerStopped {
                total_processed,
                failed_tasks,
            } => tracing::info!(total_processed, failed_tasks, "Processing pipeline stopped"),
            PipelineEvent::ScanCompleted { found, enqueued } => {
                tracing::debug!(found, enqueued, "Queue scan completed")
            }
            PipelineEvent::ScanFailed { error } => {
                tracing::error!(error = %error, "Error managing queues")
            }
            PipelineEvent::Enqueued {
                stage,
                episode_id,
                priority,
            } => tracing::debug!(episode_id, stage = %stage, priority, "Episode enqueued"),
            PipelineEvent::Rejected {
                stage,
                episode_id,
                reason,
            } => tracing::warn!(episode_id, stage = %stage, reason = %reason, "Episode rejected"),
            PipelineEvent::StageStarted { stage, episode_id } => {
                tracing::info!(episode_id, stage = %stage, "Stage started")
            }
            PipelineEvent::AttemptFailed {
                stage,
                episode_id,
                attempt,
                error,
                retry_in,
            } => match retry_in {
                Some(delay) => tracing::warn!(
                    episode_id,
                    stage = %stage,
                    attempt,
                    error = %error,
                    "Attempt failed, retrying in {:?}",
                    delay
                ),
                None => tracing::warn!(
                    episode_id,
                    stage = %stage,
                    attempt,
                    error = %error,
                    "Attempt failed"
                ),
            },
            PipelineEvent::StageCompleted {
                stage,
                episode_id,
                attempts,
                elapsed,
            } => tracing::info!(
                episode_id,
                stage = %stage,
                attempts,
                elapsed_secs = elapsed.as_secs_f64(),
                "Stage completed"
            ),
            PipelineEvent::StageExhausted {
                stage,
                episode_id,
                attempts,
                error,
            } => tracing::error!(
                episode_id,
                stage = %stage,
                attempts,
                error = %error,
                "Stage failed permanently"
            ),
            PipelineEvent::CommitFailed {
                stage,
                episode_id,
                error,
            } => tracing::error!(
                episode_id,
                stage = %stage,
                error = %error,
                "Failed to commit processing status"
            ),
            PipelineEvent::Metrics { snapshot } => tracing::info!(
                uptime_secs = snapshot.uptime_secs,
                "Processing metrics: {}",
                serde_json::to_string(&snapshot.values).unwrap_or_default()
            ),
        }
    }
}

/// Keeps every event in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    events: std::sync::Mutex<Vec<PipelineEvent>>,
}

#[cfg(test)]
impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, pred: impl Fn(&PipelineEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

#[cfg(test)]
impl EventSink for RecordingSink {
    fn emit(&self, event: PipelineEvent) {
        self.events.lock().unwrap().push(event);
    }
}
