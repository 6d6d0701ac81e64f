//! Ollama integration for transcript analysis
//!
//! Calls the Ollama REST API and turns the model's JSON answer into
//! [`Insight`] rows.

use crate::config::OllamaConfig;
use crate::database::{Insight, Transcript};
use crate::error::{PipelineError, Result};
use crate::worker::Analyzer;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest transcript excerpt sent to the model, in characters.
const MAX_TRANSCRIPT_CHARS: usize = 24_000;

const SYSTEM_PROMPT: &str = "You are a podcast analysis assistant. Read the transcript and \
extract its main topics, notable quotes and recurring segments. Always respond with valid JSON.";

const ANALYSIS_PROMPT: &str = "Respond with a JSON object of the form \
{\"insights\": [{\"category\": \"topic|quote|segment|guest\", \"summary\": \"...\", \"confidence\": 0.0-1.0}]}.";

pub struct OllamaAnalyzer {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaAnalyzer {
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    /// Check if Ollama is running and the model is available
    pub async fn health_check(&self) -> Result<OllamaStatus> {
        let tags_url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&tags_url)
            .send()
            .await
            .map_err(|e| PipelineError::Http(format!("Ollama not running: {}", e)))?;

        if !response.status().is_success() {
            return Err(PipelineError::Http(
                "Ollama server returned error".to_string(),
            ));
        }

        let tags: TagsResponse = response.json().await?;
        let available_models: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();

        Ok(OllamaStatus {
            running: true,
            model: self.model.clone(),
            model_available: model_available(&self.model, &available_models),
            available_models,
        })
    }

    /// Generate a completion from Ollama
    pub async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);

        let request = GenerateRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            system: system.map(|s| s.to_string()),
            stream: false,
            options: Some(GenerateOptions {
                temperature: 0.3,
                num_predict: 2048,
            }),
        };

        log::info!(
            "Sending request to Ollama: model={}, prompt_len={}",
            self.model,
            prompt.len()
        );

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Http(format!(
                "Ollama returned {}: {}",
                status, body
            )));
        }

        let result: GenerateResponse = response.json().await?;

        log::debug!(
            "Ollama response received: {} chars, eval_duration={:?}ms",
            result.response.len(),
            result.eval_duration.map(|d| d / 1_000_000)
        );

        Ok(result.response)
    }
}

#[async_trait]
impl Analyzer for OllamaAnalyzer {
    async fn analyze(&self, transcript: &Transcript) -> Result<Vec<Insight>> {
        if transcript.text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let prompt = build_prompt(&transcript.text);
        let response = self.generate(&prompt, Some(SYSTEM_PROMPT)).await?;
        parse_insights(&response)
    }
}

fn build_prompt(transcript_text: &str) -> String {
    let excerpt: String = transcript_text.chars().take(MAX_TRANSCRIPT_CHARS).collect();
    format!(
        "{}\n\n---\nTRANSCRIPT:\n{}\n---\n\nRespond in JSON format only.",
        ANALYSIS_PROMPT, excerpt
    )
}

/// Pull insights out of a model answer. Accepts `{"insights": [...]}` or a
/// bare array; entries without a summary are dropped.
fn parse_insights(response: &str) -> Result<Vec<Insight>> {
    let json = extract_json_from_response(response).ok_or_else(|| {
        PipelineError::Action("Ollama response contained no JSON".to_string())
    })?;

    let entries = match json {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => match map.remove("insights") {
            Some(serde_json::Value::Array(items)) => items,
            _ => {
                return Err(PipelineError::Action(
                    "Ollama response has no insights array".to_string(),
                ))
            }
        },
        _ => {
            return Err(PipelineError::Action(
                "Unexpected JSON shape in Ollama response".to_string(),
            ))
        }
    };

    Ok(entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value::<RawInsight>(entry).ok())
        .filter(|raw| !raw.summary.trim().is_empty())
        .map(|raw| Insight {
            category: raw
                .category
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| "general".to_string()),
            summary: raw.summary.trim().to_string(),
            confidence: raw.confidence.map(|c| c.clamp(0.0, 1.0)),
        })
        .collect())
}

/// Extract JSON from LLM response (handles markdown code blocks)
fn extract_json_from_response(response: &str) -> Option<serde_json::Value> {
    let trimmed = response.trim();

    // Try direct parse first
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Some(json);
    }

    // Try to extract from markdown code block
    if let Some(start) = trimmed.find("```json") {
        let after_marker = &trimmed[start + 7..];
        if let Some(end) = after_marker.find("```") {
            let json_str = after_marker[..end].trim();
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(json_str) {
                return Some(json);
            }
        }
    }

    // Try to find a balanced JSON object or array in the text
    for (open, close) in [('{', '}'), ('[', ']')] {
        let Some(start) = trimmed.find(open) else {
            continue;
        };
        let mut depth = 0;
        for (i, c) in trimmed[start..].char_indices() {
            if c == open {
                depth += 1;
            } else if c == close {
                depth -= 1;
                if depth == 0 {
                    let candidate = &trimmed[start..start + i + c.len_utf8()];
                    if let Ok(json) = serde_json::from_str::<serde_json::Value>(candidate) {
                        return Some(json);
                    }
                    break;
                }
            }
        }
    }

    None
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    eval_duration: Option<u64>,
}

/// Installed tags match on the model family, so `llama3.2:3b` is satisfied
/// by `llama3.2:latest`.
fn model_available(model: &str, installed: &[String]) -> bool {
    let family = model.split(':').next().unwrap_or(model);
    installed.iter().any(|name| name.starts_with(family))
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawInsight {
    #[serde(default, alias = "type")]
    category: Option<String>,
    #[serde(alias = "text", alias = "content")]
    summary: String,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaStatus {
    pub running: bool,
    pub model: String,
    pub model_available: bool,
    pub available_models: Vec<String>,
}
