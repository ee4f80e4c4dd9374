//! Anthropic messages transport.

use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::config::ProviderEntry;
use crate::review::types::{
    FileChange, PullRequestSnapshot, ResolutionCandidate, ResolutionVerdict, ReviewResult,
};

use super::prompt;
use super::{parse_resolution_text, parse_review_text, send_with_retry, ReviewProvider};

const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 8192;

pub struct AnthropicProvider {
    display_name: String,
    endpoint: String,
    api_key: String,
    model: String,
    custom_instructions: Option<String>,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(entry: &ProviderEntry) -> Result<Self> {
        Ok(Self {
            display_name: entry.display_name.clone(),
            endpoint: entry
                .endpoint
                .as_deref()
                .unwrap_or(DEFAULT_ENDPOINT)
                .trim_end_matches('/')
                .to_string(),
            api_key: entry.api_key.clone(),
            model: entry.model.clone(),
            custom_instructions: entry.load_custom_instructions()?,
            client: reqwest::Client::new(),
        })
    }

    async fn chat(&self, user_prompt: &str) -> Result<(String, MessageUsage)> {
        let payload = serde_json::json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "temperature": 0.2,
            "messages": [{ "role": "user", "content": user_prompt }],
        });

        let builder = self
            .client
            .post(format!("{}/v1/messages", self.endpoint))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&payload)
            .timeout(super::REQUEST_TIMEOUT);

        let response = send_with_retry(builder).await?;
        let body: MessageResponse = response.json().await.context("malformed messages response")?;

        let text = body
            .content
            .into_iter()
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("\n");
        Ok((text, body.usage.unwrap_or_default()))
    }

    fn stamp_metrics(&self, result: &mut ReviewResult, usage: &MessageUsage, started: Instant) {
        result.metrics.model_name = self.model.clone();
        result.metrics.prompt_tokens = usage.input_tokens;
        result.metrics.completion_tokens = usage.output_tokens;
        result.metrics.total_tokens = usage.input_tokens + usage.output_tokens;
        result.metrics.ai_duration_ms = started.elapsed().as_millis() as u64;
    }
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<MessageUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[async_trait]
impl ReviewProvider for AnthropicProvider {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn review_all(
        &self,
        pr: &PullRequestSnapshot,
        files: &[FileChange],
    ) -> Result<ReviewResult> {
        let started = Instant::now();
        let prompt = prompt::review_all_prompt(pr, files, self.custom_instructions.as_deref());
        let (text, usage) = self.chat(&prompt).await?;
        let mut result = parse_review_text(&text, files, &self.model);
        self.stamp_metrics(&mut result, &usage, started);
        Ok(result)
    }

    async fn review_one(
        &self,
        pr: &PullRequestSnapshot,
        file: &FileChange,
        total_files: usize,
    ) -> Result<ReviewResult> {
        let started = Instant::now();
        let prompt = prompt::review_one_prompt(
            pr,
            file,
            total_files,
            self.custom_instructions.as_deref(),
        );
        let (text, usage) = self.chat(&prompt).await?;
        let mut result = parse_review_text(&text, std::slice::from_ref(file), &self.model);
        self.stamp_metrics(&mut result, &usage, started);
        Ok(result)
    }

    async fn verify_resolutions(
        &self,
        candidates: &[ResolutionCandidate],
    ) -> Result<Vec<ResolutionVerdict>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let prompt = prompt::verify_resolutions_prompt(candidates);
        let (text, _) = self.chat(&prompt).await?;
        parse_resolution_text(&text, candidates)
    }
}
