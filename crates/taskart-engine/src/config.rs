use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use taskart_contracts::cache::{DEFAULT_MEMORY_CAPACITY, DEFAULT_MEMORY_TTL};

use crate::retry::RetryPolicy;

pub const PROVIDER_AUTO: &str = "auto";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_base: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-image-1".to_string(),
            timeout_secs: 180,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub api_base: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key: None,
            model: "gemini-2.5-flash-image".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Engine settings: defaults, then an optional JSON file, then environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `auto`, `openai`, `gemini` or `dryrun`.
    pub provider: String,
    pub cache_dir: PathBuf,
    pub memory_capacity: usize,
    pub memory_ttl_secs: u64,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub in_flight_max_age_secs: u64,
    pub activity_log: Option<PathBuf>,
    pub openai: OpenAiConfig,
    pub gemini: GeminiConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: PROVIDER_AUTO.to_string(),
            cache_dir: PathBuf::from("taskart-cache"),
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            memory_ttl_secs: DEFAULT_MEMORY_TTL.as_secs(),
            max_attempts: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 10_000,
            in_flight_max_age_secs: 300,
            activity_log: None,
            openai: OpenAiConfig::default(),
            gemini: GeminiConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed reading config {}", path.display()))?;
                serde_json::from_str::<EngineConfig>(&raw)
                    .with_context(|| format!("invalid config {}", path.display()))?
            }
            None => EngineConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applies environment overrides read through `lookup`. Blank values are
    /// ignored, as are numbers that fail to parse.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(provider) = get("TASKART_PROVIDER") {
            self.provider = provider.to_ascii_lowercase();
        }
        if let Some(dir) = get("TASKART_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(path) = get("TASKART_ACTIVITY_LOG") {
            self.activity_log = Some(PathBuf::from(path));
        }
        if let Some(value) = get("TASKART_MEMORY_CAPACITY").and_then(|raw| raw.parse().ok()) {
            self.memory_capacity = value;
        }
        if let Some(value) = get("TASKART_MEMORY_TTL_SECS").and_then(|raw| raw.parse().ok()) {
            self.memory_ttl_secs = value;
        }
        if let Some(value) = get("TASKART_MAX_ATTEMPTS").and_then(|raw| raw.parse().ok()) {
            self.max_attempts = value;
        }

        if let Some(key) = get("OPENAI_API_KEY").or_else(|| get("OPENAI_API_KEY_BACKUP")) {
            self.openai.api_key = Some(key);
        }
        if let Some(base) = get("OPENAI_API_BASE") {
            self.openai.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(model) = get("TASKART_OPENAI_MODEL") {
            self.openai.model = model;
        }
        if let Some(key) = get("GEMINI_API_KEY").or_else(|| get("GOOGLE_API_KEY")) {
            self.gemini.api_key = Some(key);
        }
        if let Some(base) = get("GEMINI_API_BASE") {
            self.gemini.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(model) = get("TASKART_GEMINI_MODEL") {
            self.gemini.model = model;
        }
    }

    /// Concrete provider name. `auto` prefers the edit-capable backend when
    /// its key is present, then the text-only one, and otherwise settles on
    /// the edit-capable backend so callers see a missing-key error.
    pub fn resolved_provider(&self) -> String {
        let requested = self.provider.trim().to_ascii_lowercase();
        if requested != PROVIDER_AUTO && !requested.is_empty() {
            return requested;
        }
        if self.openai.api_key.is_some() {
            return "openai".to_string();
        }
        if self.gemini.api_key.is_some() {
            return "gemini".to_string();
        }
        "openai".to_string()
    }

    pub fn memory_ttl(&self) -> Duration {
        Duration::from_secs(self.memory_ttl_secs)
    }

    pub fn in_flight_max_age(&self) -> Duration {
        Duration::from_secs(self.in_flight_max_age_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}
