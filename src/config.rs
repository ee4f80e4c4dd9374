//! Service configuration.
//!
//! Loaded from a TOML file, with secrets overridable from the
//! environment so deployments never need keys on disk. The provider
//! registry drives construction in `crate::providers`; unknown type
//! tags are rejected there with a precise message.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ── Top level ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub platform: PlatformConfig,
    #[serde(default)]
    pub review: ReviewOptions,
    #[serde(default)]
    pub orchestration: OrchestrationOptions,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

impl Config {
    /// Read, parse and env-patch a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("parsing configuration")
    }

    /// Secrets from the environment win over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(pat) = std::env::var("AZURE_DEVOPS_PAT") {
            if !pat.is_empty() {
                self.platform.pat = pat;
            }
        }
        for provider in &mut self.providers {
            if provider.api_key.is_empty() {
                let var = match provider.provider_type.as_str() {
                    "azure-openai" => "AZURE_OPENAI_API_KEY",
                    "openai" => "OPENAI_API_KEY",
                    "anthropic" => "ANTHROPIC_API_KEY",
                    _ => continue,
                };
                if let Ok(key) = std::env::var(var) {
                    provider.api_key = key;
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.platform.organization.is_empty() {
            anyhow::bail!("platform.organization must be set");
        }
        let enabled = self.providers.iter().filter(|p| p.enabled).count();
        if enabled == 0 {
            anyhow::bail!("at least one enabled [[providers]] entry is required");
        }
        if self.orchestration.mode == ReviewMode::Single {
            let key = &self.orchestration.active_provider;
            if !self
                .providers
                .iter()
                .any(|p| p.enabled && &p.key == key)
            {
                anyhow::bail!("orchestration.active_provider '{key}' does not name an enabled provider");
            }
        }
        Ok(())
    }
}

// ── Server ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP gateway.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Maximum request body size in bytes.
    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,
    /// Whole-request timeout in seconds; reviews run long.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_body() -> usize {
    65_536
}

fn default_request_timeout() -> u64 {
    900
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_body_bytes: default_max_body(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// ── Platform ─────────────────────────────────────────────────────

/// Azure DevOps connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    pub organization: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Personal access token; usually injected via AZURE_DEVOPS_PAT.
    #[serde(default)]
    pub pat: String,
}

fn default_base_url() -> String {
    "https://dev.azure.com".to_string()
}

// ── Review options ───────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewOptions {
    /// Marker embedded in every AI-posted comment; empty disables
    /// attribution (and with it, re-review resolution).
    #[serde(default = "default_tag")]
    pub attribution_tag: String,
    /// Cooldown between reviews of the same PR. Zero disables.
    #[serde(default = "default_interval")]
    pub min_review_interval_minutes: i64,
    /// Whether the bot casts a reviewer vote on non-draft PRs.
    #[serde(default = "default_true")]
    pub add_reviewer_vote: bool,
    /// Whether re-reviews try to resolve prior AI threads.
    #[serde(default = "default_true")]
    pub auto_resolve_threads: bool,
}

fn default_tag() -> String {
    "prwarden".to_string()
}

fn default_interval() -> i64 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for ReviewOptions {
    fn default() -> Self {
        Self {
            attribution_tag: default_tag(),
            min_review_interval_minutes: default_interval(),
            add_reviewer_vote: true,
            auto_resolve_threads: true,
        }
    }
}

// ── Orchestration ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewMode {
    Single,
    Consensus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestrationOptions {
    #[serde(default = "default_mode")]
    pub mode: ReviewMode,
    /// Provider key used in `single` mode.
    #[serde(default)]
    pub active_provider: String,
    /// Distinct providers required for an inline comment to survive
    /// consensus.
    #[serde(default = "default_threshold")]
    pub consensus_threshold: usize,
    /// Bounded per-file fan-out within one review.
    #[serde(default = "default_parallel")]
    pub max_parallel_reviews: usize,
}

fn default_mode() -> ReviewMode {
    ReviewMode::Single
}

fn default_threshold() -> usize {
    2
}

fn default_parallel() -> usize {
    5
}

impl Default for OrchestrationOptions {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            active_provider: String::new(),
            consensus_threshold: default_threshold(),
            max_parallel_reviews: default_parallel(),
        }
    }
}

// ── Provider registry ────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    /// Registry key referenced by `orchestration.active_provider`.
    pub key: String,
    /// Type tag: "azure-openai", "openai" or "anthropic".
    #[serde(rename = "type")]
    pub provider_type: String,
    pub display_name: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    /// Optional file whose content is appended to review prompts.
    #[serde(default)]
    pub custom_instructions_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ProviderEntry {
    pub fn load_custom_instructions(&self) -> Result<Option<String>> {
        match &self.custom_instructions_path {
            Some(path) => {
                let text = std::fs::read_to_string(path).with_context(|| {
                    format!("reading custom instructions {}", path.display())
                })?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [platform]
        organization = "contoso"

        [review]
        attribution_tag = "warden"
        min_review_interval_minutes = 10

        [orchestration]
        mode = "consensus"
        consensus_threshold = 2
        max_parallel_reviews = 3

        [[providers]]
        key = "gpt"
        type = "azure-openai"
        display_name = "GPT-4o"
        endpoint = "https://x.openai.azure.com"
        api_key = "k1"
        model = "gpt-4o"

        [[providers]]
        key = "claude"
        type = "anthropic"
        display_name = "Claude"
        api_key = "k2"
        model = "claude-sonnet-4-5"
        enabled = false
    "#;

    #[test]
    fn parses_full_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.platform.organization, "contoso");
        assert_eq!(config.platform.base_url, "https://dev.azure.com");
        assert_eq!(config.review.attribution_tag, "warden");
        assert_eq!(config.review.min_review_interval_minutes, 10);
        assert_eq!(config.orchestration.mode, ReviewMode::Consensus);
        assert_eq!(config.orchestration.max_parallel_reviews, 3);
        assert_eq!(config.providers.len(), 2);
        assert!(config.providers[0].enabled);
        assert!(!config.providers[1].enabled);
        assert_eq!(config.providers[0].provider_type, "azure-openai");
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config = Config::from_toml_str(
            r#"
            [platform]
            organization = "o"

            [[providers]]
            key = "p"
            type = "openai"
            display_name = "P"
            api_key = "k"
            model = "gpt-4o"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.review.min_review_interval_minutes, 5);
        assert!(config.review.add_reviewer_vote);
        assert_eq!(config.orchestration.mode, ReviewMode::Single);
        assert_eq!(config.orchestration.max_parallel_reviews, 5);
    }

    #[test]
    fn single_mode_requires_known_active_provider() {
        let mut config = Config::from_toml_str(
            r#"
            [platform]
            organization = "o"

            [orchestration]
            mode = "single"
            active_provider = "nope"

            [[providers]]
            key = "p"
            type = "openai"
            display_name = "P"
            api_key = "k"
            model = "gpt-4o"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
        config.orchestration.active_provider = "p".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn no_enabled_providers_is_rejected() {
        let config = Config::from_toml_str(
            r#"
            [platform]
            organization = "o"

            [[providers]]
            key = "p"
            type = "openai"
            display_name = "P"
            api_key = "k"
            model = "gpt-4o"
            enabled = false
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn custom_instructions_round_trip() {
        use std::io::Write;

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "Prefer iterators over index loops.").unwrap();

        let entry = ProviderEntry {
            key: "p".into(),
            provider_type: "openai".into(),
            display_name: "P".into(),
            endpoint: None,
            api_key: "k".into(),
            model: "m".into(),
            custom_instructions_path: Some(tmp.path().to_path_buf()),
            enabled: true,
        };
        let loaded = entry.load_custom_instructions().unwrap().unwrap();
        assert!(loaded.contains("iterators"));
    }
}
