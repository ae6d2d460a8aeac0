use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};
use taskart_contracts::errors::{error_chain_text, GenerationError, GenerationErrorKind};
use taskart_contracts::records::{SettingsStore, IMAGE_QUALITY_SETTING, LEGACY_QUALITY_SETTING};
use taskart_contracts::request::QualityTier;
use tracing::{debug, warn};

use super::{
    mime_for_path, parse_dims, parse_ratio, push_unique_warning, response_json_or_error,
    transport_error, Deadline, GeneratedImage, ImageBytes, ImageProvider, ProviderRequest,
};
use crate::config::OpenAiConfig;

const LANDSCAPE_RATIO: f64 = 1.2;
const PORTRAIT_RATIO: f64 = 0.83;

/// Quality precedence: explicit request value, then the `image_quality`
/// setting, then the legacy `quality` setting. Unparseable settings are skipped.
pub fn resolve_quality(
    explicit: Option<QualityTier>,
    settings: Option<&dyn SettingsStore>,
) -> Option<QualityTier> {
    explicit.or_else(|| {
        let settings = settings?;
        [IMAGE_QUALITY_SETTING, LEGACY_QUALITY_SETTING]
            .into_iter()
            .find_map(|key| settings.get(key).and_then(|raw| QualityTier::parse(&raw)))
    })
}

pub fn size_for_aspect(ratio: f64) -> &'static str {
    if ratio > LANDSCAPE_RATIO {
        "1536x1024"
    } else if ratio < PORTRAIT_RATIO {
        "1024x1536"
    } else {
        "1024x1024"
    }
}

/// Edit output size following the reference image's orientation.
pub fn size_for_reference(path: &Path) -> &'static str {
    match image::image_dimensions(path) {
        Ok((width, height)) if width > 0 && height > 0 => {
            size_for_aspect(width as f64 / height as f64)
        }
        Ok(_) => "1024x1024",
        Err(err) => {
            debug!("could not read dimensions of {}: {err}", path.display());
            "1024x1024"
        }
    }
}

fn normalize_openai_size(raw: Option<&str>, warnings: &mut Vec<String>) -> &'static str {
    let normalized = raw.unwrap_or_default().trim().to_ascii_lowercase();
    match normalized.as_str() {
        "" | "square" | "1:1" | "1024x1024" => return "1024x1024",
        "portrait" | "tall" | "1024x1536" => return "1024x1536",
        "landscape" | "wide" | "1536x1024" => return "1536x1024",
        _ => {}
    }
    let ratio = parse_dims(&normalized)
        .or_else(|| parse_ratio(&normalized))
        .map(|(left, right)| left as f64 / right as f64);
    let Some(ratio) = ratio else {
        push_unique_warning(warnings, "OpenAI size unsupported; using 1024x1024.");
        return "1024x1024";
    };
    let snapped = size_for_aspect(ratio);
    push_unique_warning(warnings, format!("OpenAI size snapped to {snapped}."));
    snapped
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OptionalParam {
    Quality,
    InputFidelity,
    ImageArray,
}

impl OptionalParam {
    fn label(&self) -> &'static str {
        match self {
            OptionalParam::Quality => "quality",
            OptionalParam::InputFidelity => "input_fidelity",
            OptionalParam::ImageArray => "image[]",
        }
    }
}

/// Optional request parameters some deployments reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OpenAiParams {
    pub quality: Option<QualityTier>,
    pub input_fidelity: bool,
    pub image_array: bool,
}

impl OpenAiParams {
    pub fn image_field(&self) -> &'static str {
        if self.image_array {
            "image[]"
        } else {
            "image"
        }
    }

    /// Drops `param`; false when there was nothing left to drop.
    fn strip(&mut self, param: OptionalParam) -> bool {
        match param {
            OptionalParam::Quality => self.quality.take().is_some(),
            OptionalParam::InputFidelity => std::mem::replace(&mut self.input_fidelity, false),
            OptionalParam::ImageArray => std::mem::replace(&mut self.image_array, false),
        }
    }
}

pub(crate) fn rejected_param(message: &str) -> Option<OptionalParam> {
    let lowered = message.to_ascii_lowercase();
    let rejected = [
        "unknown parameter",
        "unsupported parameter",
        "unrecognized request argument",
        "unexpected parameter",
        "invalid parameter",
        "not supported",
    ]
    .iter()
    .any(|needle| lowered.contains(needle));
    if !rejected {
        return None;
    }
    if lowered.contains("input_fidelity") {
        return Some(OptionalParam::InputFidelity);
    }
    if lowered.contains("quality") {
        return Some(OptionalParam::Quality);
    }
    if lowered.contains("image[]") || lowered.contains("'image'") {
        return Some(OptionalParam::ImageArray);
    }
    None
}

/// Calls `call`, and whenever it fails because a known optional parameter was
/// rejected, strips that parameter and calls again. Each parameter is dropped
/// at most once, so this terminates.
pub(crate) fn with_param_fallback<T>(
    params: &mut OpenAiParams,
    warnings: &mut Vec<String>,
    mut call: impl FnMut(&OpenAiParams) -> Result<T>,
) -> Result<T> {
    loop {
        let err = match call(params) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let text = error_chain_text(&err, 2_000);
        let Some(param) = rejected_param(&text) else {
            return Err(err);
        };
        if !params.strip(param) {
            return Err(err);
        }
        debug!("OpenAI rejected {}; retrying without it", param.label());
        push_unique_warning(
            warnings,
            format!("OpenAI rejected {}; retried without it.", param.label()),
        );
    }
}

pub struct OpenAiProvider {
    api_base: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    settings: Option<Arc<dyn SettingsStore>>,
    http: HttpClient,
}

impl OpenAiProvider {
    pub fn new(config: &OpenAiConfig, settings: Option<Arc<dyn SettingsStore>>) -> Self {
        Self {
            api_base: config.api_base.trim().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|key| !key.trim().is_empty()),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            settings,
            http: HttpClient::new(),
        }
    }

    pub fn resolve_quality(&self, explicit: Option<QualityTier>) -> Option<QualityTier> {
        resolve_quality(explicit, self.settings.as_deref())
    }

    fn edit_image(
        &self,
        request: &ProviderRequest,
        reference: &Path,
        api_key: &str,
        deadline: &Deadline,
        warnings: &mut Vec<String>,
    ) -> Result<GeneratedImage> {
        let endpoint = format!("{}/images/edits", self.api_base);
        let bytes = fs::read(reference)
            .with_context(|| format!("failed reading {}", reference.display()))?;
        let file_name = reference
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("reference.png")
            .to_string();
        let mime = mime_for_path(reference);
        let size = size_for_reference(reference);
        let mut params = OpenAiParams {
            quality: self.resolve_quality(request.quality),
            input_fidelity: true,
            image_array: true,
        };

        let payload = with_param_fallback(&mut params, warnings, |params| {
            let mut form = MultipartForm::new()
                .text("model", self.model.clone())
                .text("prompt", request.prompt.clone())
                .text("n", "1")
                .text("size", size);
            if let Some(quality) = params.quality {
                form = form.text("quality", quality.as_str());
            }
            if params.input_fidelity {
                form = form.text("input_fidelity", "high");
            }
            let part = MultipartPart::bytes(bytes.clone())
                .file_name(file_name.clone())
                .mime_str(mime)
                .with_context(|| format!("invalid mime '{mime}' for {}", reference.display()))?;
            form = form.part(params.image_field(), part);

            let response = self
                .http
                .post(&endpoint)
                .bearer_auth(api_key)
                .timeout(deadline.remaining()?)
                .multipart(form)
                .send()
                .map_err(|err| transport_error(deadline, &endpoint, err))?;
            response_json_or_error(deadline, &endpoint, response)
        })?;

        let item = self
            .first_image(&payload, deadline)?
            .context("OpenAI edits response returned no images")?;
        Ok(item.into_generated(std::mem::take(warnings)))
    }

    fn generate_image(
        &self,
        request: &ProviderRequest,
        api_key: &str,
        deadline: &Deadline,
        mut warnings: Vec<String>,
    ) -> Result<GeneratedImage> {
        let endpoint = format!("{}/images/generations", self.api_base);
        let size = normalize_openai_size(request.size_hint.as_deref(), &mut warnings);
        let mut params = OpenAiParams {
            quality: self.resolve_quality(request.quality),
            input_fidelity: false,
            image_array: false,
        };

        let payload = with_param_fallback(&mut params, &mut warnings, |params| {
            let mut payload = Map::new();
            payload.insert("model".to_string(), json!(self.model));
            payload.insert("prompt".to_string(), json!(request.prompt));
            payload.insert("n".to_string(), json!(1));
            payload.insert("size".to_string(), json!(size));
            if let Some(quality) = params.quality {
                payload.insert("quality".to_string(), json!(quality.as_str()));
            }
            self.post_json(&endpoint, api_key, &Value::Object(payload), deadline)
        })?;

        let item = self
            .first_image(&payload, deadline)?
            .context("OpenAI response returned no images")?;
        Ok(item.into_generated(warnings))
    }

    fn post_json(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Value,
        deadline: &Deadline,
    ) -> Result<Value> {
        let response = self
            .http
            .post(endpoint)
            .bearer_auth(api_key)
            .timeout(deadline.remaining()?)
            .json(payload)
            .send()
            .map_err(|err| transport_error(deadline, endpoint, err))?;
        response_json_or_error(deadline, endpoint, response)
    }

    fn first_image(&self, payload: &Value, deadline: &Deadline) -> Result<Option<ImageBytes>> {
        let rows = payload
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for row in rows {
            let Some(obj) = row.as_object() else {
                continue;
            };
            if let Some(b64) = obj.get("b64_json").and_then(Value::as_str) {
                let bytes = BASE64
                    .decode(b64.as_bytes())
                    .context("OpenAI image base64 decode failed")?;
                return Ok(Some(ImageBytes {
                    bytes,
                    mime_type: None,
                }));
            }
            if let Some(url) = obj.get("url").and_then(Value::as_str) {
                return self.download_image(url, deadline).map(Some);
            }
        }
        Ok(None)
    }

    fn download_image(&self, url: &str, deadline: &Deadline) -> Result<ImageBytes> {
        let response = self
            .http
            .get(url)
            .timeout(deadline.remaining()?)
            .send()
            .map_err(|err| transport_error(deadline, url, err))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            bail!("provider image download failed ({code})");
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .map_err(|err| transport_error(deadline, url, err))?
            .to_vec();
        Ok(ImageBytes { bytes, mime_type })
    }
}

impl ImageProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn supports_edit(&self) -> bool {
        true
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn default_timeout(&self) -> Duration {
        self.timeout
    }

    fn generate(&self, request: &ProviderRequest) -> Result<GeneratedImage> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(GenerationError::new(
                GenerationErrorKind::ApiKeyMissing,
                "OPENAI_API_KEY or OPENAI_API_KEY_BACKUP not set",
            )
            .into());
        };
        let deadline = Deadline::new("OpenAI", request.timeout);
        let mut warnings = Vec::new();

        if let Some(reference) = request.reference_image.as_deref() {
            match self.edit_image(request, reference, api_key, &deadline, &mut warnings) {
                Ok(image) => return Ok(image),
                Err(err) if deadline.is_expired() => return Err(err),
                Err(err) => {
                    warn!("OpenAI edit failed, falling back to text-to-image: {err:#}");
                    push_unique_warning(
                        &mut warnings,
                        "Reference edit failed; generated from the text prompt instead.",
                    );
                }
            }
        }

        self.generate_image(request, api_key, &deadline, warnings)
    }
}
