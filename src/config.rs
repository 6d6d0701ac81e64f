//! Pipeline configuration.
//!
//! Loaded from a YAML file; every field has the default the pipeline has
//! always shipped with, so an empty file (or no file at all) is valid.
//! Secrets and endpoint overrides come from a `.env` next to the config.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Rate limits are expressed as calls per this many seconds.
pub const RATE_LIMIT_WINDOW_SECS: f64 = 60.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    // Worker counts
    pub num_download_workers: usize,
    pub num_transcribe_workers: usize,
    pub num_analyze_workers: usize,

    // Rate limits (calls per minute)
    pub download_rate_limit: u32,
    pub transcribe_rate_limit: u32,
    pub analyze_rate_limit: u32,

    // Retry configuration
    pub max_retries: u32,
    /// Base delay in seconds; attempt `n` waits `retry_delay * 2^n`.
    pub retry_delay: f64,

    // Loop intervals (seconds)
    pub queue_check_interval: f64,
    pub metrics_interval: f64,

    // Storage
    pub database_path: PathBuf,
    pub download_dir: PathBuf,
    pub transcripts_dir: PathBuf,

    pub audio: AudioConfig,
    pub whisper: WhisperConfig,
    pub ollama: OllamaConfig,
}

/// Post-download audio normalization (mono, 16 kHz, loudnorm).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub normalize: bool,
    pub ffmpeg_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhisperConfig {
    pub cli_path: PathBuf,
    pub model_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            num_download_workers: 3,
            num_transcribe_workers: 2,
            num_analyze_workers: 2,
            download_rate_limit: 30,
            transcribe_rate_limit: 20,
            analyze_rate_limit: 30,
            max_retries: 3,
            retry_delay: 5.0,
            queue_check_interval: 10.0,
            metrics_interval: 30.0,
            database_path: data_dir.join("podcasts.db"),
            download_dir: data_dir.join("downloads"),
            transcripts_dir: data_dir.join("transcripts"),
            audio: AudioConfig::default(),
            whisper: WhisperConfig::default(),
            ollama: OllamaConfig::default(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            normalize: true,
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}

impl Default for WhisperConfig {
    fn default() -> Self {
        let base = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bin")
            .join("whisper-cpp");
        Self {
            cli_path: base.join("build").join("bin").join("whisper-cli"),
            model_path: base.join("models").join("ggml-large-v3.bin"),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            timeout_secs: 120,
        }
    }
}

impl ProcessingConfig {
    /// Load configuration from a YAML file and apply `.env` overrides found
    /// in the same directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml_str(&content)?;
        if let Some(dir) = path.parent() {
            config.apply_env_overrides(dir);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Endpoint overrides from `.env` (`OLLAMA_URL`, `OLLAMA_MODEL`, `WHISPER_CLI`).
    pub fn apply_env_overrides(&mut self, dir: &Path) {
        if let Some(url) = load_env_value(dir, "OLLAMA_URL") {
            log::info!("Ollama URL loaded from .env");
            self.ollama.base_url = url;
        }
        if let Some(model) = load_env_value(dir, "OLLAMA_MODEL") {
            self.ollama.model = model;
        }
        if let Some(cli) = load_env_value(dir, "WHISPER_CLI") {
            self.whisper.cli_path = PathBuf::from(cli);
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, count) in [
            ("num_download_workers", self.num_download_workers),
            ("num_transcribe_workers", self.num_transcribe_workers),
            ("num_analyze_workers", self.num_analyze_workers),
        ] {
            if count == 0 {
                return Err(PipelineError::Config(format!(
                    "{} must be at least 1 or the stage never drains",
                    name
                )));
            }
        }
        for (name, limit) in [
            ("download_rate_limit", self.download_rate_limit),
            ("transcribe_rate_limit", self.transcribe_rate_limit),
            ("analyze_rate_limit", self.analyze_rate_limit),
        ] {
            if limit == 0 {
                return Err(PipelineError::Config(format!("{} must be at least 1", name)));
            }
        }
        for (name, secs) in [
            ("retry_delay", self.retry_delay),
            ("queue_check_interval", self.queue_check_interval),
            ("metrics_interval", self.metrics_interval),
        ] {
            if !secs.is_finite() || secs < 0.0 {
                return Err(PipelineError::Config(format!(
                    "{} must be a non-negative number of seconds, got {}",
                    name, secs
                )));
            }
        }
        if self.queue_check_interval == 0.0 || self.metrics_interval == 0.0 {
            return Err(PipelineError::Config(
                "loop intervals must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay)
    }

    pub fn queue_check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.queue_check_interval)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs_f64(self.metrics_interval)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("podcast-pipeline")
}

/// Load a value from the .env file by key name
pub fn load_env_value(dir: &Path, key: &str) -> Option<String> {
    let env_path = dir.join(".env");
    let prefix = format!("{}=", key);
    let content = std::fs::read_to_string(env_path).ok()?;
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(&prefix) {
            let value = rest.trim().trim_matches('"').trim_matches('\'');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}
