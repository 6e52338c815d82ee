//! Engine configuration
//!
//! Defaults match production settings; every field can be overridden from
//! the environment (a `.env` file is honoured).

use crate::error::EngineError;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// What happens to the signature of a call that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedCallPolicy {
    /// Failed signatures count as executed; an identical retry is intercepted.
    MarkOnAttempt,
    /// Only successful signatures are recorded; identical retries reach the handler.
    AllowRetry,
}

impl FromStr for FailedCallPolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "mark" | "mark_on_attempt" | "mark-on-attempt" => Ok(FailedCallPolicy::MarkOnAttempt),
            "retry" | "allow_retry" | "allow-retry" => Ok(FailedCallPolicy::AllowRetry),
            other => Err(EngineError::Config(format!(
                "unknown failed-call policy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on DECIDE→ACT cycles per turn.
    pub max_iterations: u32,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    /// Number of history messages kept in prompts.
    pub history_window: usize,
    pub model_timeout: Duration,
    pub tool_timeout: Duration,
    /// Bounded channel size between stream producer and consumer.
    pub stream_buffer: usize,
    pub failed_call_policy: FailedCallPolicy,
    /// Model used for agentic decisions and synthesis.
    pub primary_model: String,
    /// Model used for fast-path answers.
    pub fast_model: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            cache_ttl: Duration::from_secs(60),
            cache_capacity: 200,
            history_window: 10,
            model_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(20),
            stream_buffer: 32,
            failed_call_policy: FailedCallPolicy::MarkOnAttempt,
            primary_model: "gemini-2.0-flash".to_string(),
            fast_model: "gemini-2.0-flash-lite".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from environment, falling back to defaults for unset variables.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            max_iterations: env_parse("AGENT_MAX_ITERATIONS", defaults.max_iterations)?,
            cache_ttl: Duration::from_secs(env_parse(
                "AGENT_CACHE_TTL_SECS",
                defaults.cache_ttl.as_secs(),
            )?),
            cache_capacity: env_parse("AGENT_CACHE_CAPACITY", defaults.cache_capacity)?,
            history_window: env_parse("AGENT_HISTORY_WINDOW", defaults.history_window)?,
            model_timeout: Duration::from_secs(env_parse(
                "AGENT_MODEL_TIMEOUT_SECS",
                defaults.model_timeout.as_secs(),
            )?),
            tool_timeout: Duration::from_secs(env_parse(
                "AGENT_TOOL_TIMEOUT_SECS",
                defaults.tool_timeout.as_secs(),
            )?),
            stream_buffer: env_parse("AGENT_STREAM_BUFFER", defaults.stream_buffer)?,
            failed_call_policy: env_parse(
                "AGENT_FAILED_CALL_POLICY",
                defaults.failed_call_policy,
            )?,
            primary_model: env::var("LLM_MODEL").unwrap_or(defaults.primary_model),
            fast_model: env::var("SMALL_LLM_MODEL").unwrap_or(defaults.fast_model),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(EngineError::Config("max_iterations must be at least 1".into()));
        }
        if self.cache_capacity == 0 {
            return Err(EngineError::Config("cache_capacity must be at least 1".into()));
        }
        if self.stream_buffer == 0 {
            return Err(EngineError::Config("stream_buffer must be at least 1".into()));
        }
        if self.model_timeout.is_zero() || self.tool_timeout.is_zero() {
            return Err(EngineError::Config("timeouts must be non-zero".into()));
        }
        if self.primary_model.trim().is_empty() || self.fast_model.trim().is_empty() {
            return Err(EngineError::Config("model identifiers must be set".into()));
        }
        Ok(())
    }
}

/// Connection settings for the Gemini backend.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
}

impl GeminiConfig {
    pub const DEFAULT_BASE_URL: &'static str =
        "https://generativelanguage.googleapis.com/v1beta/models";

    pub fn from_env() -> Option<Self> {
        dotenv::dotenv().ok();

        let api_key = env::var("GEMINI_API_KEY").ok()?;
        if api_key.trim().is_empty() || api_key == "your_gemini_api_key_here" {
            warn!("GEMINI_API_KEY is set but empty or a placeholder");
            return None;
        }

        let base_url = env::var("GEMINI_BASE_URL")
            .unwrap_or_else(|_| Self::DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Some(Self { api_key, base_url })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| EngineError::Config(format!("{}={}: {}", key, raw, e))),
        _ => Ok(default),
    }
}
