//! Process configuration: CLI flags with environment fallbacks.
//!
//! Environment:
//! - BIND_ADDR                  -> listen address (default 0.0.0.0:8088)
//! - API_KEYS                   -> comma separated fal credentials for rotation
//! - PROXIES                    -> proxy URL for all backend traffic
//! - AUTHORIZATION_TOKEN        -> bearer token clients must present (optional)
//! - PROMPT_CHAR_LIMIT          -> prompt budget in characters (default 4800)
//! - PROMPT_STRATEGY            -> simple | budgeted (default simple)
//! - FAL_RUN_HOST               -> backend base URL (default https://fal.run)
//! - FAL_KEY                    -> credential for the anonymous fallback client
//! - FAL_HTTP_TIMEOUT_SECONDS   -> overall backend request timeout

use clap::Parser;

use crate::backend::DEFAULT_FAL_RUN_HOST;
use crate::prompt::{PromptStrategy, DEFAULT_PROMPT_CHAR_LIMIT};

/// Models advertised on `/v1/models`.
pub const MODELS: &[&str] = &[
    "anthropic/claude-3.5-sonnet",
    "anthropic/claude-3-5-haiku",
    "anthropic/claude-3-haiku",
    "google/gemini-pro-1.5",
    "google/gemini-flash-1.5",
    "openai/gpt-4o-mini",
    "openai/gpt-4o",
    "deepseek/deepseek-r1",
];

/// Models whose reasoning is shown unless the request opts out.
pub const REASONING_MODELS: &[&str] = &["deepseek/deepseek-r1"];

pub fn is_reasoning_model(model: &str) -> bool {
    REASONING_MODELS.contains(&model)
}

#[derive(Debug, Clone, Parser)]
#[command(name = "falgate", version, about = "OpenAI-compatible proxy for fal any-llm")]
pub struct Config {
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8088")]
    pub bind_addr: String,

    #[arg(long, env = "API_KEYS", default_value = "", hide_env_values = true)]
    pub api_keys: String,

    #[arg(long = "proxy", env = "PROXIES")]
    pub proxy: Option<String>,

    #[arg(long, env = "AUTHORIZATION_TOKEN", hide_env_values = true)]
    pub authorization_token: Option<String>,

    #[arg(long, env = "PROMPT_CHAR_LIMIT", default_value_t = DEFAULT_PROMPT_CHAR_LIMIT)]
    pub prompt_char_limit: usize,

    #[arg(long, env = "PROMPT_STRATEGY", value_enum, default_value_t = PromptStrategy::Simple)]
    pub prompt_strategy: PromptStrategy,

    #[arg(long, env = "FAL_RUN_HOST", default_value = DEFAULT_FAL_RUN_HOST)]
    pub fal_run_host: String,

    #[arg(long, env = "FAL_KEY", hide_env_values = true)]
    pub fal_key: Option<String>,

    #[arg(long = "http-timeout-seconds", env = "FAL_HTTP_TIMEOUT_SECONDS")]
    pub http_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8088".to_string(),
            api_keys: String::new(),
            proxy: None,
            authorization_token: None,
            prompt_char_limit: DEFAULT_PROMPT_CHAR_LIMIT,
            prompt_strategy: PromptStrategy::Simple,
            fal_run_host: DEFAULT_FAL_RUN_HOST.to_string(),
            fal_key: None,
            http_timeout_secs: None,
        }
    }
}

impl Config {
    /// Inbound bearer token, when one is configured and non-blank.
    pub fn authorization_token(&self) -> Option<&str> {
        self.authorization_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn credentials(&self) -> Vec<String> {
        self.api_keys
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.prompt_char_limit == 0 {
            anyhow::bail!("PROMPT_CHAR_LIMIT must be greater than zero");
        }
        if !self.fal_run_host.starts_with("http://") && !self.fal_run_host.starts_with("https://") {
            anyhow::bail!("FAL_RUN_HOST must be an http(s) URL, got {}", self.fal_run_host);
        }
        Ok(())
    }
}
