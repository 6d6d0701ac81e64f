use super::StageAction;
use crate::database::{Episode, EpisodeStore, Insight, ProcessingStatus, Stage, Transcript};
use crate::error::{PipelineError, Result};
use crate::metrics::MetricsCollector;
use async_trait::async_trait;
use std::sync::Arc;

/// Extracts insights from a finished transcript.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, transcript: &Transcript) -> Result<Vec<Insight>>;
}

pub struct AnalyzeStage {
    analyzer: Arc<dyn Analyzer>,
    store: Arc<dyn EpisodeStore>,
    metrics: Arc<MetricsCollector>,
}

impl AnalyzeStage {
    pub fn new(
        analyzer: Arc<dyn Analyzer>,
        store: Arc<dyn EpisodeStore>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            analyzer,
            store,
            metrics,
        }
    }
}

#[async_trait]
impl StageAction for AnalyzeStage {
    fn stage(&self) -> Stage {
        Stage::Analyze
    }

    async fn execute(&self, episode: &Episode, status: &mut ProcessingStatus) -> Result<()> {
        let path = status.transcript_path.as_deref().ok_or_else(|| {
            PipelineError::Action(format!("Episode {} has no transcript", episode.id))
        })?;
        let content = tokio::fs::read_to_string(path).await?;
        let transcript: Transcript = serde_json::from_str(&content)?;

        let insights = self.analyzer.analyze(&transcript).await?;
        self.store.save_insights(episode.id, &insights)?;

        log::info!(
            "Episode {} analyzed: {} segments, {} insights",
            episode.id,
            transcript.segments.len(),
            insights.len()
        );

        let segments = transcript.segments.len() as f64;
        self.metrics.increment("analyses_completed", 1);
        self.metrics.increment("insights_extracted", insights.len() as u64);
        self.metrics.set("last_analysis_segments", segments);
        self.metrics.add("total_analysis_segments", segments);
        Ok(())
    }
}
