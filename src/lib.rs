pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod ollama;
pub mod rate_limiter;
pub mod worker;

#[cfg(test)]
mod testing;

use config::ProcessingConfig;
use database::Database;
use events::{EventSink, LogSink};
use manager::{ProcessingManager, StageActions};
use metrics::MetricsCollector;
use ollama::OllamaAnalyzer;
use std::path::Path;
use std::sync::Arc;
use worker::download::FfmpegNormalizer;
use worker::{AnalyzeStage, DownloadStage, HttpDownloader, TranscribeStage, WhisperCliTranscriber};

/// How the process should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Keep processing until Ctrl-C, then drain the queues.
    Continuous,
    /// One population pass and one drain per stage, then exit.
    Once,
}

/// Wire the production collaborators (HTTP downloads, whisper-cli, Ollama)
/// into a manager.
pub fn build_manager(
    config: ProcessingConfig,
    db: Arc<Database>,
    metrics: Arc<MetricsCollector>,
    events: Arc<dyn EventSink>,
) -> error::Result<ProcessingManager> {
    let downloader = Arc::new(HttpDownloader::new(config.download_dir.clone())?);
    let transcriber = Arc::new(WhisperCliTranscriber::new(
        config.whisper.cli_path.clone(),
        config.whisper.model_path.clone(),
        config.transcripts_dir.join("work"),
    ));
    let analyzer = Arc::new(OllamaAnalyzer::new(&config.ollama)?);

    let mut download = DownloadStage::new(downloader, metrics.clone());
    if config.audio.normalize {
        let normalizer = FfmpegNormalizer::new(config.audio.ffmpeg_path.clone());
        download = download.with_normalizer(normalizer);
    }

    let actions = StageActions {
        download: Arc::new(download),
        transcribe: Arc::new(TranscribeStage::new(
            transcriber,
            config.transcripts_dir.clone(),
            metrics.clone(),
        )),
        analyze: Arc::new(AnalyzeStage::new(analyzer, db.clone(), metrics.clone())),
    };

    ProcessingManager::new(config, db, actions, metrics, events)
}

fn ensure_dirs(config: &ProcessingConfig) -> anyhow::Result<()> {
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::create_dir_all(&config.download_dir)?;
    std::fs::create_dir_all(&config.transcripts_dir)?;
    Ok(())
}

pub async fn run(config_path: Option<&Path>, mode: RunMode) -> anyhow::Result<()> {
    let config = match config_path {
        Some(path) => ProcessingConfig::load(path)?,
        None => {
            let config = ProcessingConfig::default();
            config.validate()?;
            config
        }
    };
    ensure_dirs(&config)?;

    log::info!("Opening database at {:?}", config.database_path);
    let db = Arc::new(Database::new(&config.database_path)?);
    match db.pipeline_counts(config.max_retries) {
        Ok(counts) => log::info!(
            "{} episodes: {} downloaded, {} transcribed, {} analyzed, {} out of retries",
            counts.total,
            counts.downloaded,
            counts.transcribed,
            counts.analyzed,
            counts.stuck
        ),
        Err(e) => log::warn!("Failed to read pipeline counts: {}", e),
    }

    match OllamaAnalyzer::new(&config.ollama)?.health_check().await {
        Ok(status) if status.model_available => {
            log::info!("Ollama ready with model {}", status.model)
        }
        Ok(status) => log::warn!(
            "Ollama model {} is not installed (available: {})",
            status.model,
            status.available_models.join(", ")
        ),
        Err(e) => log::warn!("Ollama health check failed: {}", e),
    }

    let metrics = Arc::new(MetricsCollector::new());
    let manager = Arc::new(build_manager(config, db, metrics, Arc::new(LogSink))?);

    if mode == RunMode::Once {
        let handled = manager.run_once().await?;
        log::info!(
            "Single pass done: {} downloads, {} transcriptions, {} analyses",
            handled.download,
            handled.transcribe,
            handled.analyze
        );
        return Ok(());
    }

    let mut runner = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.start().await })
    };

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                log::error!("Failed to listen for Ctrl-C: {}", e);
            }
            log::info!("Shutdown requested, draining queues");
            manager.stop().await;
            runner.await??;
        }
        joined = &mut runner => {
            joined??;
        }
    }
    Ok(())
}
