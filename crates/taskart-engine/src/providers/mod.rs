mod dryrun;
mod gemini;
mod openai;
#[cfg(test)]
pub(crate) mod mock_backend;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use reqwest::blocking::Response as HttpResponse;
use serde_json::Value;
use taskart_contracts::errors::{truncate_text, GenerationError, GenerationErrorKind};
use taskart_contracts::payload::{
    encode_data_uri, extension_for_mime, mime_for_bytes, mime_for_extension,
};
use taskart_contracts::records::SettingsStore;
use taskart_contracts::request::QualityTier;

pub use dryrun::{render_dryrun_png, DryrunProvider};
pub use gemini::GeminiProvider;
pub use openai::{resolve_quality, size_for_aspect, size_for_reference, OpenAiProvider};

use crate::config::EngineConfig;

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub prompt: String,
    pub reference_image: Option<PathBuf>,
    pub quality: Option<QualityTier>,
    pub size_hint: Option<String>,
    /// Overall budget for the call, including any internal fallbacks.
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub warnings: Vec<String>,
}

impl GeneratedImage {
    pub fn data_uri(&self) -> String {
        encode_data_uri(&self.bytes, &self.mime_type)
    }

    pub fn extension(&self) -> &'static str {
        extension_for_mime(&self.mime_type)
    }
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    /// Whether a reference image is used as an edit source rather than as
    /// auxiliary context.
    fn supports_edit(&self) -> bool;
    fn is_configured(&self) -> bool;
    fn default_timeout(&self) -> Duration;
    fn generate(&self, request: &ProviderRequest) -> Result<GeneratedImage>;
}

#[derive(Default)]
pub struct ImageProviderRegistry {
    providers: BTreeMap<String, Arc<dyn ImageProvider>>,
}

impl ImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Arc::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ImageProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry(
    config: &EngineConfig,
    settings: Option<Arc<dyn SettingsStore>>,
) -> ImageProviderRegistry {
    let mut providers = ImageProviderRegistry::new();
    providers.register(DryrunProvider::default());
    providers.register(OpenAiProvider::new(&config.openai, settings));
    providers.register(GeminiProvider::new(&config.gemini));
    providers
}

/// Picks the provider named by the config (`auto` resolved by key presence).
pub fn select_provider(
    config: &EngineConfig,
    settings: Option<Arc<dyn SettingsStore>>,
) -> Result<Arc<dyn ImageProvider>> {
    let registry = default_provider_registry(config, settings);
    let name = config.resolved_provider();
    match registry.get(&name) {
        Some(provider) => Ok(provider),
        None => bail!(
            "unknown image provider '{name}' (available: {})",
            registry.names().join(", ")
        ),
    }
}

pub(crate) struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

impl ImageBytes {
    pub fn into_generated(self, warnings: Vec<String>) -> GeneratedImage {
        let mime_type = self
            .mime_type
            .filter(|mime| mime.starts_with("image/"))
            .unwrap_or_else(|| mime_for_bytes(&self.bytes).to_string());
        GeneratedImage {
            bytes: self.bytes,
            mime_type,
            warnings,
        }
    }
}

/// Wall-clock budget shared by every HTTP call a provider makes for one
/// request.
pub(crate) struct Deadline {
    provider: &'static str,
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(provider: &'static str, budget: Duration) -> Self {
        Self {
            provider,
            started: Instant::now(),
            budget,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.started.elapsed() >= self.budget
    }

    pub fn remaining(&self) -> Result<Duration> {
        match self.budget.checked_sub(self.started.elapsed()) {
            Some(left) if !left.is_zero() => Ok(left),
            _ => Err(self.timed_out()),
        }
    }

    pub fn timed_out(&self) -> anyhow::Error {
        GenerationError::new(
            GenerationErrorKind::NetworkError,
            format!(
                "{} request timed out after {:.1}s",
                self.provider,
                self.budget.as_secs_f64()
            ),
        )
        .into()
    }
}

/// Maps a transport failure onto the error taxonomy where reqwest tells us
/// enough; anything else keeps its chain for keyword classification.
pub(crate) fn transport_error(
    deadline: &Deadline,
    endpoint: &str,
    err: reqwest::Error,
) -> anyhow::Error {
    if err.is_timeout() {
        return deadline.timed_out();
    }
    if err.is_connect() {
        return GenerationError::new(
            GenerationErrorKind::NetworkError,
            format!("{} connection failed ({endpoint}): {err}", deadline.provider),
        )
        .into();
    }
    anyhow::Error::new(err).context(format!("{} request failed ({endpoint})", deadline.provider))
}

pub(crate) fn response_json_or_error(
    deadline: &Deadline,
    endpoint: &str,
    response: HttpResponse,
) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .map_err(|err| transport_error(deadline, endpoint, err))?;
    if !status.is_success() {
        bail!(
            "{} request failed ({code}): {}",
            deadline.provider,
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{} returned invalid JSON payload", deadline.provider))?;
    Ok(parsed)
}

pub(crate) fn parse_dims(raw: &str) -> Option<(u32, u32)> {
    let normalized = raw.trim().to_ascii_lowercase();
    let (left, right) = normalized.split_once('x')?;
    let width = left.trim().parse::<u32>().ok()?;
    let height = right.trim().parse::<u32>().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

pub(crate) fn parse_ratio(raw: &str) -> Option<(u32, u32)> {
    let (left, right) = if let Some(parts) = raw.split_once(':') {
        parts
    } else {
        raw.split_once('/')?
    };
    let first = left.trim().parse::<u32>().ok()?;
    let second = right.trim().parse::<u32>().ok()?;
    if first == 0 || second == 0 {
        return None;
    }
    Some((first, second))
}

pub(crate) fn push_unique_warning(warnings: &mut Vec<String>, message: impl Into<String>) {
    let message = message.into();
    if message.trim().is_empty() {
        return;
    }
    if warnings.iter().any(|existing| existing == &message) {
        return;
    }
    warnings.push(message);
}

pub(crate) fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .unwrap_or_default();
    mime_for_extension(ext)
}
