use super::StageAction;
use crate::database::{Episode, ProcessingStatus, Stage, Transcript, TranscriptSegment};
use crate::error::{PipelineError, Result};
use crate::metrics::MetricsCollector;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Turns an audio file into a timed transcript.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio_path: &Path) -> Result<Transcript>;
}

pub struct TranscribeStage {
    transcriber: Arc<dyn Transcriber>,
    transcripts_dir: PathBuf,
    metrics: Arc<MetricsCollector>,
}

impl TranscribeStage {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        transcripts_dir: PathBuf,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            transcriber,
            transcripts_dir,
            metrics,
        }
    }

    pub fn transcript_path(&self, episode: &Episode) -> PathBuf {
        self.transcripts_dir
            .join(episode.feed_id.to_string())
            .join(format!("{}_transcript.json", episode.id))
    }
}

#[async_trait]
impl StageAction for TranscribeStage {
    fn stage(&self) -> Stage {
        Stage::Transcribe
    }

    async fn execute(&self, episode: &Episode, status: &mut ProcessingStatus) -> Result<()> {
        let audio_path = status.download_path.as_deref().ok_or_else(|| {
            PipelineError::Action(format!("Episode {} has no downloaded audio", episode.id))
        })?;
        let transcript = self.transcriber.transcribe(Path::new(audio_path)).await?;

        let output = self.transcript_path(episode);
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(&transcript)?;
        if let Err(e) = tokio::fs::write(&output, json).await {
            let _ = tokio::fs::remove_file(&output).await;
            return Err(e.into());
        }
        status.transcript_path = Some(output.to_string_lossy().to_string());

        let duration = episode.duration.unwrap_or(0) as f64;
        self.metrics.increment("transcriptions_completed", 1);
        self.metrics.set("last_transcription_duration", duration);
        self.metrics.add("total_transcription_duration", duration);
        Ok(())
    }
}

/// Runs a local whisper.cpp `whisper-cli` binary and reads its JSON output.
pub struct WhisperCliTranscriber {
    cli_path: PathBuf,
    model_path: PathBuf,
    work_dir: PathBuf,
}

impl WhisperCliTranscriber {
    pub fn new(cli_path: PathBuf, model_path: PathBuf, work_dir: PathBuf) -> Self {
        Self {
            cli_path,
            model_path,
            work_dir,
        }
    }
}

#[async_trait]
impl Transcriber for WhisperCliTranscriber {
    async fn transcribe(&self, audio_path: &Path) -> Result<Transcript> {
        if !audio_path.exists() {
            return Err(PipelineError::NotFound(format!(
                "Audio file not found: {:?}",
                audio_path
            )));
        }
        if !self.model_path.exists() {
            return Err(PipelineError::NotFound(format!(
                "Model not found: {:?}",
                self.model_path
            )));
        }
        tokio::fs::create_dir_all(&self.work_dir).await?;

        let stem = audio_path
            .file_stem()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let output_base = self.work_dir.join(stem);

        log::info!("Running whisper-cli on {:?}", audio_path);

        let mut child = Command::new(&self.cli_path)
            .arg("-m")
            .arg(&self.model_path)
            .arg("-f")
            .arg(audio_path)
            .arg("-oj")
            .arg("-of")
            .arg(&output_base)
            .arg("-pp")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::Action(format!("Failed to spawn whisper-cli: {}", e)))?;

        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            let mut last_reported = -1;
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(progress) = parse_progress(&line) {
                    if progress >= last_reported + 10 {
                        log::debug!("Transcription of {:?} at {}%", audio_path, progress);
                        last_reported = progress;
                    }
                }
            }
        }

        let exit = child.wait().await?;
        if !exit.success() {
            return Err(PipelineError::Action(format!(
                "whisper-cli failed with status: {}",
                exit
            )));
        }

        let json_path = json_output_path(&output_base);
        let content = tokio::fs::read_to_string(&json_path).await?;
        let _ = tokio::fs::remove_file(&json_path).await;
        parse_whisper_json(&content)
    }
}

/// whisper-cli appends `.json` to the `-of` base, so dots already in the
/// stem must survive.
fn json_output_path(output_base: &Path) -> PathBuf {
    let mut path = output_base.as_os_str().to_owned();
    path.push(".json");
    PathBuf::from(path)
}

#[derive(Debug, Deserialize)]
struct WhisperOutput {
    #[serde(default)]
    result: Option<WhisperResult>,
    #[serde(default)]
    transcription: Vec<WhisperEntry>,
}

#[derive(Debug, Deserialize)]
struct WhisperResult {
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhisperEntry {
    offsets: WhisperOffsets,
    text: String,
}

/// Milliseconds from the start of the audio
#[derive(Debug, Deserialize)]
struct WhisperOffsets {
    from: i64,
    to: i64,
}

/// Convert whisper-cli `-oj` output into a [`Transcript`].
pub fn parse_whisper_json(content: &str) -> Result<Transcript> {
    let output: WhisperOutput = serde_json::from_str(content)?;

    let segments: Vec<TranscriptSegment> = output
        .transcription
        .into_iter()
        .map(|entry| TranscriptSegment {
            start: entry.offsets.from as f64 / 1000.0,
            end: entry.offsets.to as f64 / 1000.0,
            text: entry.text.trim().to_string(),
        })
        .filter(|segment| !segment.text.is_empty())
        .collect();

    let text = segments
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    Ok(Transcript {
        text,
        language: output.result.and_then(|r| r.language),
        segments,
    })
}

/// Parse progress percentage from whisper-cli output
fn parse_progress(line: &str) -> Option<i32> {
    if line.contains("progress") {
        for part in line.split_whitespace() {
            if let Some(num_str) = part.strip_suffix('%') {
                if let Ok(num) = num_str.parse::<i32>() {
                    return Some(num.clamp(0, 100));
                }
            }
            if let Ok(num) = part.parse::<i32>() {
                if (0..=100).contains(&num) {
                    return Some(num);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    const WHISPER_OUTPUT: &str = r#"{
        "systeminfo": "AVX = 1",
        "result": { "language": "en" },
        "transcription": [
            { "timestamps": { "from": "00:00:00,000", "to": "00:00:04,200" },
              "offsets": { "from": 0, "to": 4200 },
              "text": " Welcome back to the show." },
            { "timestamps": { "from": "00:00:04,200", "to": "00:00:05,000" },
              "offsets": { "from": 4200, "to": 5000 },
              "text": "   " },
            { "timestamps": { "from": "00:00:05,000", "to": "00:00:09,500" },
              "offsets": { "from": 5000, "to": 9500 },
              "text": " Today we talk about ice cream." }
        ]
    }"#;

    struct FixedTranscriber;

    #[async_trait]
    impl Transcriber for FixedTranscriber {
        async fn transcribe(&self, _audio_path: &Path) -> Result<Transcript> {
            parse_whisper_json(WHISPER_OUTPUT)
        }
    }

    fn episode() -> Episode {
        Episode {
            id: 12,
            feed_id: 4,
            guid: None,
            title: "Test".to_string(),
            audio_url: "http://x.com/e.mp3".to_string(),
            publish_date: Utc::now(),
            duration: Some(1800),
        }
    }

    #[test]
    fn test_parse_whisper_json() {
        let transcript = parse_whisper_json(WHISPER_OUTPUT).unwrap();
        assert_eq!(transcript.language.as_deref(), Some("en"));
        assert_eq!(transcript.segments.len(), 2);
        assert_eq!(transcript.segments[1].start, 5.0);
        assert_eq!(transcript.segments[1].end, 9.5);
        assert_eq!(
            transcript.text,
            "Welcome back to the show. Today we talk about ice cream."
        );
    }

    #[test]
    fn test_parse_whisper_json_rejects_garbage() {
        assert!(parse_whisper_json("not json").is_err());
    }

    #[test]
    fn test_parse_progress() {
        assert_eq!(parse_progress("whisper_full: progress =  45%"), Some(45));
        assert_eq!(parse_progress("progress 120%"), Some(100));
        assert_eq!(parse_progress("loading model"), None);
    }

    #[tokio::test]
    async fn test_stage_writes_transcript_file() {
        let temp = TempDir::new().unwrap();
        let metrics = Arc::new(MetricsCollector::new());
        let stage = TranscribeStage::new(
            Arc::new(FixedTranscriber),
            temp.path().to_path_buf(),
            metrics.clone(),
        );
        let mut status = ProcessingStatus::new(12);
        status.download_path = Some("/audio/12.mp3".to_string());

        stage.execute(&episode(), &mut status).await.unwrap();

        let expected = temp.path().join("4").join("12_transcript.json");
        assert_eq!(
            status.transcript_path,
            Some(expected.to_string_lossy().to_string())
        );
        let stored: Transcript =
            serde_json::from_str(&std::fs::read_to_string(&expected).unwrap()).unwrap();
        assert_eq!(stored.segments.len(), 2);
        assert_eq!(metrics.counter("transcriptions_completed"), 1);
        assert_eq!(metrics.get("total_transcription_duration", 0.0), 1800.0);
    }

    #[tokio::test]
    async fn test_stage_requires_download_path() {
        let temp = TempDir::new().unwrap();
        let stage = TranscribeStage::new(
            Arc::new(FixedTranscriber),
            temp.path().to_path_buf(),
            Arc::new(MetricsCollector::new()),
        );
        let mut status = ProcessingStatus::new(12);

        let err = stage.execute(&episode(), &mut status).await.unwrap_err();
        assert!(err.to_string().contains("no downloaded audio"));
        assert!(status.transcript_path.is_none());
    }

    #[test]
    fn test_json_output_path_keeps_dotted_stem() {
        let base = Path::new("/work/7_https_feed.example.com_p_42");
        assert_eq!(
            json_output_path(base),
            PathBuf::from("/work/7_https_feed.example.com_p_42.json")
        );
    }

    /// Stand-in for whisper-cli that writes `{-of}.json` the way whisper.cpp does.
    #[cfg(unix)]
    fn fake_whisper_cli(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = format!(
            "#!/bin/sh\n\
             while [ $# -gt 0 ]; do\n\
               if [ \"$1\" = \"-of\" ]; then OF=\"$2\"; shift; fi\n\
               shift\n\
             done\n\
             echo 'whisper_full: progress =  50%' >&2\n\
             cat > \"$OF.json\" <<'EOF'\n{}\nEOF\n",
            WHISPER_OUTPUT
        );
        let path = dir.join("whisper-cli");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_whisper_cli_reads_output_for_dotted_stem() {
        let temp = TempDir::new().unwrap();
        let cli = fake_whisper_cli(temp.path());
        let model = temp.path().join("model.bin");
        std::fs::write(&model, b"model").unwrap();
        let audio = temp.path().join("7_https_feed.example.com_p_42.mp3");
        std::fs::write(&audio, b"audio").unwrap();
        let work_dir = temp.path().join("work");

        let transcriber = WhisperCliTranscriber::new(cli, model, work_dir.clone());
        let transcript = transcriber.transcribe(&audio).await.unwrap();

        assert_eq!(transcript.segments.len(), 2);
        assert_eq!(transcript.language.as_deref(), Some("en"));
        // Output is consumed
        assert!(!work_dir.join("7_https_feed.example.com_p_42.json").exists());
    }

    #[tokio::test]
    async fn test_whisper_cli_missing_audio() {
        let temp = TempDir::new().unwrap();
        let transcriber = WhisperCliTranscriber::new(
            PathBuf::from("whisper-cli"),
            temp.path().join("model.bin"),
            temp.path().to_path_buf(),
        );
        let err = transcriber
            .transcribe(&temp.path().join("missing.mp3"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }
}
