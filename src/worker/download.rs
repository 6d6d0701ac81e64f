use super::StageAction;
use crate::database::{Episode, ProcessingStatus, Stage};
use crate::error::{PipelineError, Result};
use crate::metrics::MetricsCollector;
use async_trait::async_trait;
use futures_util::StreamExt;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const AUDIO_EXTENSIONS: [&str; 6] = ["mp3", "m4a", "wav", "ogg", "opus", "aac"];

/// Fetches an episode's audio to local storage and returns the file path.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, episode: &Episode) -> Result<PathBuf>;
}

pub struct DownloadStage {
    downloader: Arc<dyn Downloader>,
    normalizer: Option<FfmpegNormalizer>,
    metrics: Arc<MetricsCollector>,
}

impl DownloadStage {
    pub fn new(downloader: Arc<dyn Downloader>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            downloader,
            normalizer: None,
            metrics,
        }
    }

    /// Normalize every downloaded file in place before it is recorded.
    pub fn with_normalizer(mut self, normalizer: FfmpegNormalizer) -> Self {
        self.normalizer = Some(normalizer);
        self
    }
}

#[async_trait]
impl StageAction for DownloadStage {
    fn stage(&self) -> Stage {
        Stage::Download
    }

    async fn execute(&self, episode: &Episode, status: &mut ProcessingStatus) -> Result<()> {
        let path = self.downloader.download(episode).await?;
        if let Some(normalizer) = &self.normalizer {
            if let Err(e) = normalizer.normalize(&path).await {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            }
        }
        let size = tokio::fs::metadata(&path).await?.len() as f64;

        status.download_path = Some(path.to_string_lossy().to_string());

        self.metrics.increment("downloads_completed", 1);
        self.metrics.set("last_download_size", size);
        self.metrics.add("total_download_size", size);
        Ok(())
    }
}

/// Streams audio over HTTP into `{download_dir}/{feed_id}/`.
pub struct HttpDownloader {
    client: reqwest::Client,
    download_dir: PathBuf,
}

impl HttpDownloader {
    pub fn new(download_dir: PathBuf) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self {
            client,
            download_dir,
        })
    }

    /// Where the audio for `episode` is stored: `{id}_{guid}.{ext}`, with the
    /// guid reduced to filename-safe characters.
    pub fn target_path(&self, episode: &Episode) -> PathBuf {
        let stem = match episode.guid.as_deref().map(sanitize_filename) {
            Some(guid) if !guid.is_empty() => format!("{}_{}", episode.id, guid),
            _ => episode.id.to_string(),
        };
        self.download_dir
            .join(episode.feed_id.to_string())
            .join(format!("{}.{}", stem, audio_extension(&episode.audio_url)))
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, episode: &Episode) -> Result<PathBuf> {
        let file_path = self.target_path(episode);
        if let Some(parent) = file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match self.try_download(&episode.audio_url, &file_path).await {
            Ok(bytes) => {
                log::info!(
                    "Downloaded episode {} ({} bytes) to {:?}",
                    episode.id,
                    bytes,
                    file_path
                );
                Ok(file_path)
            }
            Err(e) => {
                // Clean up partial file
                let _ = tokio::fs::remove_file(&file_path).await;
                Err(e)
            }
        }
    }
}

impl HttpDownloader {
    /// Single download attempt with streaming and validation
    async fn try_download(&self, url: &str, file_path: &Path) -> Result<u64> {
        log::debug!("Downloading {} to {:?}", url, file_path);

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(PipelineError::Http(format!(
                "Download failed with status: {}",
                response.status()
            )));
        }

        let content_length = response.content_length();
        let mut stream = response.bytes_stream();
        let mut file = tokio::fs::File::create(file_path).await?;
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
        }
        file.flush().await?;

        // Validate file size against Content-Length
        if let Some(expected) = content_length {
            if downloaded != expected {
                return Err(PipelineError::Http(format!(
                    "Download incomplete: got {} bytes, expected {}",
                    downloaded, expected
                )));
            }
        }
        Ok(downloaded)
    }
}

/// Converts audio to what whisper.cpp expects: mono, 16 kHz, loudness
/// normalized. The file is replaced in place.
pub struct FfmpegNormalizer {
    ffmpeg_path: PathBuf,
}

impl FfmpegNormalizer {
    pub fn new(ffmpeg_path: PathBuf) -> Self {
        Self { ffmpeg_path }
    }

    pub async fn normalize(&self, path: &Path) -> Result<()> {
        let output_path = optimized_path(path);
        log::debug!("Normalizing {:?}", path);

        let output = Command::new(&self.ffmpeg_path)
            .arg("-i")
            .arg(path)
            .args(["-ac", "1", "-ar", "16000", "-filter:a", "loudnorm", "-y"])
            .arg(&output_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PipelineError::Action(format!("Failed to run ffmpeg: {}", e)))?;

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&output_path).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Action(format!(
                "ffmpeg failed: {}",
                stderr.trim()
            )));
        }

        tokio::fs::rename(&output_path, path).await?;
        Ok(())
    }
}

/// `{stem}_optimized.{ext}` next to the original.
fn optimized_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
    let name = match path.extension() {
        Some(ext) => format!("{}_optimized.{}", stem, ext.to_string_lossy()),
        None => format!("{}_optimized", stem),
    };
    path.with_file_name(name)
}

fn unsafe_filename_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[^A-Za-z0-9._-]+")
            .unwrap_or_else(|err| panic!("invalid filename regex: {err}"))
    })
}

fn sanitize_filename(raw: &str) -> String {
    unsafe_filename_chars()
        .replace_all(raw, "_")
        .trim_matches(|c: char| c == '_' || c == '.')
        .chars()
        .take(80)
        .collect()
}

/// File extension taken from the URL path, `mp3` when it is not a known
/// audio type.
fn audio_extension(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());
    ext.and_then(|ext| AUDIO_EXTENSIONS.iter().find(|known| **known == ext).copied())
        .unwrap_or("mp3")
}
