//! Stage workers.
//!
//! A [`Worker`] owns the retry loop around one [`StageAction`]: it loads the
//! episode and its status, checks the stage precondition, stamps the start
//! time, then runs the action up to `max_retries + 1` times with exponential
//! backoff. Each stage (download, transcribe, analyze) only has to supply
//! the action itself.

pub mod analyze;
pub mod download;
pub mod transcribe;

pub use analyze::{AnalyzeStage, Analyzer};
pub use download::{DownloadStage, Downloader, HttpDownloader};
pub use transcribe::{TranscribeStage, Transcriber, WhisperCliTranscriber};

use crate::database::{Episode, EpisodeStore, ProcessingStatus, Stage};
use crate::error::PipelineError;
use crate::events::{EventSink, PipelineEvent};
use crate::metrics::MetricsCollector;
use crate::rate_limiter::RateLimiter;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// The stage-specific part of a worker.
///
/// `execute` may fill in artifact fields on `status` (paths); the worker
/// sets the stage flag and completion timestamp itself once it returns `Ok`.
#[async_trait]
pub trait StageAction: Send + Sync {
    fn stage(&self) -> Stage;

    async fn execute(
        &self,
        episode: &Episode,
        status: &mut ProcessingStatus,
    ) -> Result<(), PipelineError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    /// Total attempts, the first one included.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay after failed attempt `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Completed { attempts: u32 },
    Exhausted { attempts: u32, error: String },
    Rejected { reason: Rejection },
}

/// Why a worker refused an episode without running its action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    EpisodeNotFound,
    StatusNotFound,
    PreconditionUnmet,
    AlreadyComplete,
    Store(String),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EpisodeNotFound => f.write_str("episode not found"),
            Self::StatusNotFound => f.write_str("processing status not found"),
            Self::PreconditionUnmet => f.write_str("previous stage not complete"),
            Self::AlreadyComplete => f.write_str("stage already complete"),
            Self::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

pub struct Worker {
    action: Arc<dyn StageAction>,
    store: Arc<dyn EpisodeStore>,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsCollector>,
    events: Arc<dyn EventSink>,
    policy: RetryPolicy,
}

impl Worker {
    pub fn new(
        action: Arc<dyn StageAction>,
        store: Arc<dyn EpisodeStore>,
        rate_limiter: Arc<RateLimiter>,
        metrics: Arc<MetricsCollector>,
        events: Arc<dyn EventSink>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            action,
            store,
            rate_limiter,
            metrics,
            events,
            policy,
        }
    }

    pub fn stage(&self) -> Stage {
        self.action.stage()
    }

    /// Run this worker's stage for one episode.
    ///
    /// Never panics because of the action and never returns an error: every
    /// failure ends up on the status row and in the returned [`Outcome`].
    pub async fn process(&self, episode_id: i64) -> Outcome {
        let stage = self.stage();

        let episode = match self.store.get_episode(episode_id) {
            Ok(Some(episode)) => episode,
            Ok(None) => return self.reject(episode_id, Rejection::EpisodeNotFound),
            Err(e) => return self.reject(episode_id, Rejection::Store(e.to_string())),
        };
        let mut status = match self.store.get_status(episode_id) {
            Ok(Some(status)) => status,
            Ok(None) => return self.reject(episode_id, Rejection::StatusNotFound),
            Err(e) => return self.reject(episode_id, Rejection::Store(e.to_string())),
        };

        if status.is_complete(stage) {
            return self.reject(episode_id, Rejection::AlreadyComplete);
        }
        if !status.precondition_met(stage) {
            return self.reject(episode_id, Rejection::PreconditionUnmet);
        }

        status.mark_started(stage, Utc::now());
        self.commit(&status);
        self.events.emit(PipelineEvent::StageStarted { stage, episode_id });

        let started = Instant::now();
        let attempts = self.policy.attempts();
        let mut last_error = String::new();

        for attempt in 0..attempts {
            self.rate_limiter.acquire().await;

            match self.attempt(&episode, &mut status).await {
                Ok(()) => {
                    let attempts = attempt + 1;
                    self.events.emit(PipelineEvent::StageCompleted {
                        stage,
                        episode_id,
                        attempts,
                        elapsed: started.elapsed(),
                    });
                    return Outcome::Completed { attempts };
                }
                Err(e) => {
                    last_error = e.to_string();
                    status.record_failure(&last_error);
                    self.commit(&status);
                    self.metrics.increment(&format!("{}_attempt_failures", stage), 1);

                    let retry_in =
                        (attempt + 1 < attempts).then(|| self.policy.backoff(attempt));
                    self.events.emit(PipelineEvent::AttemptFailed {
                        stage,
                        episode_id,
                        attempt: attempt + 1,
                        error: last_error.clone(),
                        retry_in,
                    });
                    if let Some(delay) = retry_in {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        self.events.emit(PipelineEvent::StageExhausted {
            stage,
            episode_id,
            attempts,
            error: last_error.clone(),
        });
        Outcome::Exhausted {
            attempts,
            error: last_error,
        }
    }

    /// One run of the action followed by the completion commit. A failed
    /// commit counts as a failed attempt and leaves `status` without the
    /// completion flag.
    async fn attempt(
        &self,
        episode: &Episode,
        status: &mut ProcessingStatus,
    ) -> Result<(), PipelineError> {
        let stage = self.stage();
        let mut draft = status.clone();

        let run = AssertUnwindSafe(self.action.execute(episode, &mut draft))
            .catch_unwind()
            .await;
        match run {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(panic) => {
                return Err(PipelineError::Action(format!(
                    "{} action panicked: {}",
                    stage,
                    panic_message(panic.as_ref())
                )))
            }
        }

        draft.mark_completed(stage, Utc::now());
        self.store.commit_status(&draft)?;
        *status = draft;
        Ok(())
    }

    fn commit(&self, status: &ProcessingStatus) {
        if let Err(e) = self.store.commit_status(status) {
            self.events.emit(PipelineEvent::CommitFailed {
                stage: self.stage(),
                episode_id: status.episode_id,
                error: e.to_string(),
            });
        }
    }

    fn reject(&self, episode_id: i64, reason: Rejection) -> Outcome {
        self.events.emit(PipelineEvent::Rejected {
            stage: self.stage(),
            episode_id,
            reason: reason.to_string(),
        });
        Outcome::Rejected { reason }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, EpisodeStore};
    use crate::events::RecordingSink;
    use crate::testing::{add_episode, ScriptedAction, Step};
    use tempfile::TempDir;

    struct Harness {
        db: Arc<Database>,
        events: Arc<RecordingSink>,
        metrics: Arc<MetricsCollector>,
        _temp: TempDir,
    }

    fn harness() -> Harness {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&temp.path().join("test.db")).unwrap());
        Harness {
            db,
            events: Arc::new(RecordingSink::default()),
            metrics: Arc::new(MetricsCollector::new()),
            _temp: temp,
        }
    }

    impl Harness {
        fn worker(&self, action: Arc<ScriptedAction>, max_retries: u32, delay_secs: u64) -> Worker {
            self.worker_with_limiter(
                action,
                max_retries,
                delay_secs,
                RateLimiter::new(1000, Duration::from_secs(60)),
            )
        }

        fn worker_with_limiter(
            &self,
            action: Arc<ScriptedAction>,
            max_retries: u32,
            delay_secs: u64,
            limiter: RateLimiter,
        ) -> Worker {
            Worker::new(
                action,
                self.db.clone(),
                Arc::new(limiter),
                self.metrics.clone(),
                self.events.clone(),
                RetryPolicy::new(max_retries, Duration::from_secs(delay_secs)),
            )
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5));
        assert_eq!(policy.attempts(), 4);
        assert_eq!(policy.backoff(0), Duration::from_secs(5));
        assert_eq!(policy.backoff(1), Duration::from_secs(10));
        assert_eq!(policy.backoff(2), Duration::from_secs(20));
        // Saturates instead of overflowing
        assert!(policy.backoff(64) >= policy.backoff(31));
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let h = harness();
        let id = add_episode(&h.db, 1, 5);
        let action = Arc::new(ScriptedAction::new(Stage::Download, vec![Step::Succeed]));

        let outcome = h.worker(action.clone(), 3, 5).process(id).await;
        assert_eq!(outcome, Outcome::Completed { attempts: 1 });
        assert_eq!(action.calls(), 1);

        let status = h.db.get_status(id).unwrap().unwrap();
        assert!(status.is_downloaded);
        assert!(status.download_started_at.is_some());
        assert!(status.download_completed_at.is_some());
        assert_eq!(status.download_path.as_deref(), Some("/scripted/download"));
        assert_eq!(status.retry_count, 0);
        assert_eq!(
            h.events
                .count(|e| matches!(e, PipelineEvent::StageCompleted { attempts: 1, .. })),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_exhausts_with_backoff() {
        let h = harness();
        let id = add_episode(&h.db, 1, 5);
        let action = Arc::new(ScriptedAction::always_failing(Stage::Download, "HTTP 503"));

        let start = Instant::now();
        let outcome = h.worker(action.clone(), 3, 5).process(id).await;

        assert_eq!(
            outcome,
            Outcome::Exhausted {
                attempts: 4,
                error: "HTTP 503".to_string()
            }
        );
        assert_eq!(action.calls(), 4);
        // 5 + 10 + 20, and no sleep after the last attempt
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(35), "waited {:?}", waited);
        assert!(waited < Duration::from_secs(40), "waited {:?}", waited);

        let status = h.db.get_status(id).unwrap().unwrap();
        assert!(!status.is_downloaded);
        assert_eq!(status.retry_count, 4);
        assert_eq!(status.error_message.as_deref(), Some("HTTP 503"));
        assert_eq!(h.metrics.counter("download_attempt_failures"), 4);

        let delays: Vec<Option<Duration>> = h
            .events
            .events()
            .into_iter()
            .filter_map(|e| match e {
                PipelineEvent::AttemptFailed { retry_in, .. } => Some(retry_in),
                _ => None,
            })
            .collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_secs(5)),
                Some(Duration::from_secs(10)),
                Some(Duration::from_secs(20)),
                None
            ]
        );

        // Exhausted episodes are no longer offered for work
        assert!(h.db.episodes_needing_work(100, 3).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_failures() {
        let h = harness();
        let id = add_episode(&h.db, 1, 5);
        let action = Arc::new(ScriptedAction::new(
            Stage::Download,
            vec![Step::Fail("timeout"), Step::Fail("timeout"), Step::Succeed],
        ));

        let outcome = h.worker(action.clone(), 3, 1).process(id).await;
        assert_eq!(outcome, Outcome::Completed { attempts: 3 });

        let status = h.db.get_status(id).unwrap().unwrap();
        assert!(status.is_downloaded);
        assert_eq!(status.retry_count, 2);
        assert_eq!(status.error_message.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_zero_retries_means_single_attempt() {
        let h = harness();
        let id = add_episode(&h.db, 1, 5);
        let action = Arc::new(ScriptedAction::always_failing(Stage::Download, "boom"));

        let outcome = h.worker(action.clone(), 0, 5).process(id).await;
        assert!(matches!(outcome, Outcome::Exhausted { attempts: 1, .. }));
        assert_eq!(action.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_episode_rejected() {
        let h = harness();
        let action = Arc::new(ScriptedAction::new(Stage::Download, vec![Step::Succeed]));

        let outcome = h.worker(action.clone(), 3, 5).process(404).await;
        assert_eq!(
            outcome,
            Outcome::Rejected {
                reason: Rejection::EpisodeNotFound
            }
        );
        assert_eq!(action.calls(), 0);
        assert_eq!(
            h.events.count(|e| matches!(e, PipelineEvent::Rejected { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_precondition_unmet_leaves_status_untouched() {
        let h = harness();
        let id = add_episode(&h.db, 1, 5);
        let before = h.db.get_status(id).unwrap().unwrap();
        let action = Arc::new(ScriptedAction::new(Stage::Transcribe, vec![Step::Succeed]));

        let outcome = h.worker(action.clone(), 3, 5).process(id).await;
        assert_eq!(
            outcome,
            Outcome::Rejected {
                reason: Rejection::PreconditionUnmet
            }
        );
        assert_eq!(action.calls(), 0);
        assert_eq!(h.db.get_status(id).unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_completed_stage_rejected() {
        let h = harness();
        let id = add_episode(&h.db, 1, 5);
        let mut status = h.db.get_status(id).unwrap().unwrap();
        status.mark_completed(Stage::Download, Utc::now());
        h.db.commit_status(&status).unwrap();

        let action = Arc::new(ScriptedAction::new(Stage::Download, vec![Step::Succeed]));
        let outcome = h.worker(action.clone(), 3, 5).process(id).await;
        assert_eq!(
            outcome,
            Outcome::Rejected {
                reason: Rejection::AlreadyComplete
            }
        );
        assert_eq!(action.calls(), 0);
    }

    #[tokio::test]
    async fn test_panicking_action_counts_as_failure() {
        let h = harness();
        let id = add_episode(&h.db, 1, 5);
        let action = Arc::new(ScriptedAction::new(
            Stage::Download,
            vec![Step::Panic, Step::Succeed],
        ));

        let outcome = h.worker(action.clone(), 3, 0).process(id).await;
        assert_eq!(outcome, Outcome::Completed { attempts: 2 });

        let status = h.db.get_status(id).unwrap().unwrap();
        assert_eq!(status.retry_count, 1);
        assert!(status
            .error_message
            .as_deref()
            .unwrap()
            .contains("panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_attempt_takes_a_token() {
        let h = harness();
        let id = add_episode(&h.db, 1, 5);
        let action = Arc::new(ScriptedAction::new(
            Stage::Download,
            vec![Step::Fail("flaky"), Step::Succeed],
        ));
        let limiter = RateLimiter::new(1, Duration::from_secs(60));

        let start = Instant::now();
        let outcome = h
            .worker_with_limiter(action, 3, 0, limiter)
            .process(id)
            .await;
        assert_eq!(outcome, Outcome::Completed { attempts: 2 });
        // The retry had to wait for the single token to refill
        assert!(start.elapsed() >= Duration::from_secs(59));
    }

    #[tokio::test]
    async fn test_failed_attempt_does_not_leak_artifacts() {
        let h = harness();
        let id = add_episode(&h.db, 1, 5);
        let action = Arc::new(ScriptedAction::new(
            Stage::Download,
            vec![Step::FailAfterWrite("disk full")],
        ));

        let outcome = h.worker(action, 0, 0).process(id).await;
        assert!(matches!(outcome, Outcome::Exhausted { .. }));
        let status = h.db.get_status(id).unwrap().unwrap();
        assert!(status.download_path.is_none());
    }
}
