//! ABOUTME: Online planner calling an OpenAI-style chat endpoint
//! ABOUTME: Budget-capped and timeout-bounded; every failure is an AdapterError

use crate::{BudgetGuard, KompositionPlanner};
use async_trait::async_trait;
use ko_config::AiConfig;
use ko_core::{Error, Result};
use ko_plan::Komposition;
use ko_registry::FileEntry;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Flat per-call cost estimate charged against the daily budget
const CALL_COST_CENTS: u64 = 2;

/// Planner backed by an OpenAI-compatible chat completion endpoint
pub struct OpenAiPlanner {
    client: Client,
    config: AiConfig,
    base_url: String,
    budget: BudgetGuard,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl OpenAiPlanner {
    pub fn new(config: AiConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.min(30)))
            .build()
            .unwrap_or_default();

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        debug!(base_url = %base_url, model = %config.model, "Created OpenAI planner");

        let budget = BudgetGuard::new(config.daily_budget_cents);
        Self {
            client,
            config,
            base_url,
            budget,
        }
    }

    fn prompt(brief: &str, videos: &[FileEntry], audio: &[FileEntry]) -> String {
        let video_list: Vec<String> = videos
            .iter()
            .map(|entry| {
                format!(
                    "{} ({})",
                    entry.id,
                    entry
                        .path
                        .file_name()
                        .map(|name| name.to_string_lossy().to_string())
                        .unwrap_or_default()
                )
            })
            .collect();
        let audio_list: Vec<String> = audio
            .iter()
            .map(|entry| {
                format!(
                    "{} ({})",
                    entry.id,
                    entry
                        .path
                        .file_name()
                        .map(|name| name.to_string_lossy().to_string())
                        .unwrap_or_default()
                )
            })
            .collect();

        format!(
            "Produce a music-video komposition document as raw JSON with fields \
             metadata{{bpm,totalBeats,estimatedDuration}}, segments[] of \
             {{sourceRef, musical_role, params{{start,duration}}}}, and optional \
             audio{{backgroundMusic, musicVolume}}. Segment durations must sum to \
             estimatedDuration. Use only these sourceRef ids.\n\
             Videos: {}\nAudio: {}\nBrief: {}",
            video_list.join(", "),
            audio_list.join(", "),
            brief
        )
    }

    /// Model output arrives fenced often enough to be worth stripping
    fn extract_json(content: &str) -> &str {
        let trimmed = content.trim();
        let trimmed = trimmed
            .strip_prefix("```json")
            .or_else(|| trimmed.strip_prefix("```"))
            .unwrap_or(trimmed);
        trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
    }
}

#[async_trait]
impl KompositionPlanner for OpenAiPlanner {
    async fn plan(
        &self,
        brief: &str,
        videos: &[FileEntry],
        audio: &[FileEntry],
    ) -> Result<Komposition> {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| Error::Adapter("no API key configured".to_string()))?;
        self.budget.charge(CALL_COST_CENTS)?;

        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: "You compose music-video assembly documents. Reply with JSON only."
                        .to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: Self::prompt(brief, videos, audio),
                },
            ],
            temperature: 0.2,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Adapter(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Planner endpoint returned an error");
            return Err(Error::Adapter(format!("API error ({}): {}", status, body)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Adapter(format!("unparseable response: {}", e)))?;
        let content = parsed
            .choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .ok_or_else(|| Error::Adapter("empty response".to_string()))?;

        serde_json::from_str(Self::extract_json(content))
            .map_err(|e| Error::Adapter(format!("model returned invalid komposition: {}", e)))
    }

    async fn health_check(&self) -> Result<()> {
        if self.config.api_key.is_none() {
            return Err(Error::Adapter("no API key configured".to_string()));
        }
        Ok(())
    }
}
