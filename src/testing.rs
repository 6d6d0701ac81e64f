// Shared fixtures for worker and manager tests

use crate::database::{Database, Episode, ProcessingStatus, Stage};
use crate::error::PipelineError;
use crate::worker::StageAction;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub(crate) fn add_episode(db: &Database, n: i64, hours_ago: i64) -> i64 {
    let (id, _) = db
        .upsert_episode(
            1,
            Some(&format!("guid-{}", n)),
            &format!("Episode {}", n),
            &format!("http://example.com/{}.mp3", n),
            Utc::now() - ChronoDuration::hours(hours_ago),
            Some(1800),
        )
        .unwrap();
    id
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Step {
    Succeed,
    Fail(&'static str),
    /// Records an artifact path on the draft status, then fails.
    FailAfterWrite(&'static str),
    Panic,
}

/// A stage action that plays back a script of results.
pub(crate) struct ScriptedAction {
    stage: Stage,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    delay: Duration,
    failing_ids: HashSet<i64>,
    calls: AtomicU32,
    seen: Mutex<Vec<i64>>,
}

impl ScriptedAction {
    pub(crate) fn new(stage: Stage, steps: Vec<Step>) -> Self {
        Self {
            stage,
            script: Mutex::new(steps.into()),
            fallback: Step::Succeed,
            delay: Duration::ZERO,
            failing_ids: HashSet::new(),
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn succeeding(stage: Stage) -> Self {
        Self::new(stage, Vec::new())
    }

    pub(crate) fn always_failing(stage: Stage, error: &'static str) -> Self {
        Self {
            fallback: Step::Fail(error),
            ..Self::new(stage, Vec::new())
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn failing_for(mut self, ids: &[i64]) -> Self {
        self.failing_ids = ids.iter().copied().collect();
        self
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Episode ids in the order the action was invoked.
    pub(crate) fn seen(&self) -> Vec<i64> {
        self.seen.lock().unwrap().clone()
    }

    fn next_step(&self, episode_id: i64) -> Step {
        if self.failing_ids.contains(&episode_id) {
            return Step::Fail("scripted failure");
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback)
    }
}

fn write_artifact(stage: Stage, status: &mut ProcessingStatus) {
    let path = format!("/scripted/{}", stage);
    match stage {
        Stage::Download => status.download_path = Some(path),
        Stage::Transcribe => status.transcript_path = Some(path),
        Stage::Analyze => {}
    }
}

#[async_trait]
impl StageAction for ScriptedAction {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn execute(
        &self,
        episode: &Episode,
        status: &mut ProcessingStatus,
    ) -> Result<(), PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(episode.id);
        let step = self.next_step(episode.id);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match step {
            Step::Succeed => {
                write_artifact(self.stage, status);
                Ok(())
            }
            Step::Fail(error) => Err(PipelineError::Action(error.to_string())),
            Step::FailAfterWrite(error) => {
                write_artifact(self.stage, status);
                Err(PipelineError::Action(error.to_string()))
            }
            Step::Panic => panic!("scripted panic in {}", self.stage),
        }
    }
}
