//! OpenAI-compatible chat transport, covering both Azure OpenAI
//! deployments and the plain OpenAI API.

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

const AZURE_API_VERSION: &str = "2024-06-01";
const OPENAI_DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";

/// Which dialect of the chat-completions API to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Azure,
    OpenAi,
}

pub struct OpenAiProvider {
    display_name: String,
    flavor: Flavor,
    endpoint: String,
    api_key: String,
    model: String,
    custom_instructions: Option<String>,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn azure(entry: &ProviderEntry) -> Result<Self> {
        let endpoint = entry
            .endpoint
            .as_deref()
            .context("azure-openai provider requires an endpoint")?
            .trim_end_matches('/')
            .to_string();
        Self::build(entry, Flavor::Azure, endpoint)
    }

    pub fn openai(entry: &ProviderEntry) -> Result<Self> {
        let endpoint = entry
            .endpoint
            .as_deref()
            .unwrap_or(OPENAI_DEFAULT_ENDPOINT)
            .trim_end_matches('/')
            .to_string();
        Self::build(entry, Flavor::OpenAi, endpoint)
    }

    fn build(entry: &ProviderEntry, flavor: Flavor, endpoint: String) -> Result<Self> {
        Ok(Self {
            display_name: entry.display_name.clone(),
            flavor,
            endpoint,
            api_key: entry.api_key.clone(),
            model: entry.model.clone(),
            custom_instructions: entry.load_custom_instructions()?,
            client: reqwest::Client::new(),
        })
    }

    fn chat_url(&self) -> String {
        match self.flavor {
            Flavor::Azure => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={AZURE_API_VERSION}",
                self.endpoint, self.model
            ),
            Flavor::OpenAi => format!("{}/chat/completions", self.endpoint),
        }
    }

    /// One chat call; returns the text and token usage.
    async fn chat(&self, user_prompt: &str) -> Result<(String, ChatUsage)> {
        let payload = serde_json::json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [{ "role": "user", "content": user_prompt }],
        });

        let mut builder = self
            .client
            .post(self.chat_url())
            .json(&payload)
            .timeout(super::REQUEST_TIMEOUT);
        builder = match self.flavor {
            Flavor::Azure => builder.header("api-key", &self.api_key),
            Flavor::OpenAi => builder.bearer_auth(&self.api_key),
        };

        let response = send_with_retry(builder).await?;
        let body: ChatResponse = response.json().await.context("malformed chat response")?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        Ok((text, body.usage.unwrap_or_default()))
    }

    fn stamp_metrics(&self, result: &mut ReviewResult, usage: &ChatUsage, started: Instant) {
        result.metrics.model_name = self.model.clone();
        result.metrics.prompt_tokens = usage.prompt_tokens;
        result.metrics.completion_tokens = usage.completion_tokens;
        result.metrics.total_tokens = usage.total_tokens;
        result.metrics.ai_duration_ms = started.elapsed().as_millis() as u64;
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[async_trait]
impl ReviewProvider for OpenAiProvider {
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
