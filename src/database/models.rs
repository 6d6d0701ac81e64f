use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One phase of the per-episode pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Transcribe,
    Analyze,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Download, Stage::Transcribe, Stage::Analyze];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Transcribe => "transcribe",
            Self::Analyze => "analyze",
        }
    }

    /// Position in [`Stage::ALL`]; used to index per-stage arrays.
    pub fn index(&self) -> usize {
        match self {
            Self::Download => 0,
            Self::Transcribe => 1,
            Self::Analyze => 2,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub feed_id: i64,
    pub guid: Option<String>,
    pub title: String,
    pub audio_url: String,
    pub publish_date: DateTime<Utc>,
    /// Seconds
    pub duration: Option<i64>,
}

impl Episode {
    /// Hours since publication; negative for episodes dated in the future.
    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.publish_date).num_milliseconds() as f64 / 3_600_000.0
    }
}

/// Per-episode processing state. Exactly one row per episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStatus {
    pub episode_id: i64,

    pub is_downloaded: bool,
    pub is_transcribed: bool,
    pub is_analyzed: bool,

    pub download_path: Option<String>,
    pub transcript_path: Option<String>,

    pub download_started_at: Option<DateTime<Utc>>,
    pub download_completed_at: Option<DateTime<Utc>>,
    pub transcription_started_at: Option<DateTime<Utc>>,
    pub transcription_completed_at: Option<DateTime<Utc>>,
    pub analysis_started_at: Option<DateTime<Utc>>,
    pub analysis_completed_at: Option<DateTime<Utc>>,

    pub error_message: Option<String>,
    pub retry_count: u32,
}

impl ProcessingStatus {
    pub fn new(episode_id: i64) -> Self {
        Self {
            episode_id,
            is_downloaded: false,
            is_transcribed: false,
            is_analyzed: false,
            download_path: None,
            transcript_path: None,
            download_started_at: None,
            download_completed_at: None,
            transcription_started_at: None,
            transcription_completed_at: None,
            analysis_started_at: None,
            analysis_completed_at: None,
            error_message: None,
            retry_count: 0,
        }
    }

    pub fn is_complete(&self, stage: Stage) -> bool {
        match stage {
            Stage::Download => self.is_downloaded,
            Stage::Transcribe => self.is_transcribed,
            Stage::Analyze => self.is_analyzed,
        }
    }

    /// Whether the stages `stage` depends on are done.
    pub fn precondition_met(&self, stage: Stage) -> bool {
        match stage {
            Stage::Download => true,
            Stage::Transcribe => self.is_downloaded,
            Stage::Analyze => self.is_transcribed,
        }
    }

    /// Precondition holds and the stage itself has not completed yet.
    pub fn ready_for(&self, stage: Stage) -> bool {
        self.precondition_met(stage) && !self.is_complete(stage)
    }

    /// The single stage this episode is currently eligible for, if any.
    pub fn next_stage(&self) -> Option<Stage> {
        Stage::ALL.into_iter().find(|stage| self.ready_for(*stage))
    }

    pub fn started_at(&self, stage: Stage) -> Option<DateTime<Utc>> {
        match stage {
            Stage::Download => self.download_started_at,
            Stage::Transcribe => self.transcription_started_at,
            Stage::Analyze => self.analysis_started_at,
        }
    }

    pub fn completed_at(&self, stage: Stage) -> Option<DateTime<Utc>> {
        match stage {
            Stage::Download => self.download_completed_at,
            Stage::Transcribe => self.transcription_completed_at,
            Stage::Analyze => self.analysis_completed_at,
        }
    }

    pub fn mark_started(&mut self, stage: Stage, at: DateTime<Utc>) {
        match stage {
            Stage::Download => self.download_started_at = Some(at),
            Stage::Transcribe => self.transcription_started_at = Some(at),
            Stage::Analyze => self.analysis_started_at = Some(at),
        }
    }

    /// Sets the stage flag and its completion timestamp. Flags only move
    /// from false to true.
    pub fn mark_completed(&mut self, stage: Stage, at: DateTime<Utc>) {
        match stage {
            Stage::Download => {
                self.is_downloaded = true;
                self.download_completed_at = Some(at);
            }
            Stage::Transcribe => {
                self.is_transcribed = true;
                self.transcription_completed_at = Some(at);
            }
            Stage::Analyze => {
                self.is_analyzed = true;
                self.analysis_completed_at = Some(at);
            }
        }
    }

    pub fn record_failure(&mut self, error: &str) {
        self.error_message = Some(error.to_string());
        self.retry_count += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeWithStatus {
    pub episode: Episode,
    pub status: ProcessingStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub language: Option<String>,
    pub segments: Vec<TranscriptSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Seconds from the start of the audio
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// A single finding produced by the content analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub category: String,
    pub summary: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}
