use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use taskart_contracts::errors::{GenerationError, GenerationErrorKind};

use super::{
    mime_for_path, parse_dims, parse_ratio, push_unique_warning, response_json_or_error,
    transport_error, Deadline, GeneratedImage, ImageBytes, ImageProvider, ProviderRequest,
};
use crate::config::GeminiConfig;

const BLOCKING_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "IMAGE_SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
];

const ASPECT_RATIOS: &[(&str, f64)] = &[
    ("1:1", 1.0),
    ("2:3", 2.0 / 3.0),
    ("3:2", 3.0 / 2.0),
    ("3:4", 3.0 / 4.0),
    ("4:3", 4.0 / 3.0),
    ("4:5", 4.0 / 5.0),
    ("5:4", 5.0 / 4.0),
    ("9:16", 9.0 / 16.0),
    ("16:9", 16.0 / 9.0),
    ("21:9", 21.0 / 9.0),
];

pub struct GeminiProvider {
    api_base: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new(config: &GeminiConfig) -> Self {
        Self {
            api_base: config.api_base.trim().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|key| !key.trim().is_empty()),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            http: HttpClient::new(),
        }
    }

    fn endpoint(&self) -> String {
        let trimmed = self.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_parts(request: &ProviderRequest) -> Result<Vec<Value>> {
        let mut parts = Vec::new();
        if let Some(reference) = request.reference_image.as_deref() {
            parts.push(image_part_from_path(reference)?);
        }
        parts.push(json!({ "text": request.prompt }));
        Ok(parts)
    }

    /// Reason the response was withheld by safety filtering, if any.
    fn blocked_reason(payload: &Value) -> Option<String> {
        if let Some(reason) = payload
            .get("promptFeedback")
            .and_then(|feedback| feedback.get("blockReason"))
            .and_then(Value::as_str)
        {
            return Some(reason.to_string());
        }
        payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| candidate.get("finishReason"))
            .and_then(Value::as_str)
            .filter(|reason| BLOCKING_FINISH_REASONS.contains(reason))
            .map(str::to_string)
    }
}

impl ImageProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn supports_edit(&self) -> bool {
        false
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
                "GEMINI_API_KEY or GOOGLE_API_KEY not set",
            )
            .into());
        };
        let deadline = Deadline::new("Gemini", request.timeout);
        let endpoint = self.endpoint();
        let mut warnings = Vec::new();

        let mut generation_config = json!({
            "candidateCount": 1,
            "responseModalities": ["IMAGE"],
        });
        if let Some(ratio) = request
            .size_hint
            .as_deref()
            .and_then(|hint| aspect_ratio_for_hint(hint, &mut warnings))
        {
            generation_config["imageConfig"] = json!({ "aspectRatio": ratio });
        }
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": Self::build_parts(request)?,
            }],
            "generationConfig": generation_config,
        });

        let response = self
            .http
            .post(&endpoint)
            .header("x-goog-api-key", api_key)
            .timeout(deadline.remaining()?)
            .json(&payload)
            .send()
            .map_err(|err| transport_error(&deadline, &endpoint, err))?;
        let response_payload = response_json_or_error(&deadline, &endpoint, response)?;

        if let Some(reason) = Self::blocked_reason(&response_payload) {
            return Err(GenerationError::new(
                GenerationErrorKind::ContentViolation,
                format!("Gemini withheld the image (content policy: {reason})"),
            )
            .into());
        }
        let image =
            first_inline_image(&response_payload)?.context("Gemini response returned no images")?;
        Ok(image.into_generated(warnings))
    }
}

/// Maps a size hint (`16:9`, `1536x1024`, `wide`, ...) onto the closest
/// aspect ratio the image model accepts.
pub(crate) fn aspect_ratio_for_hint(hint: &str, warnings: &mut Vec<String>) -> Option<&'static str> {
    let hint = hint.trim().to_ascii_lowercase();
    let wanted = match hint.as_str() {
        "" => return None,
        "square" => 1.0,
        "portrait" | "tall" => 9.0 / 16.0,
        "landscape" | "wide" => 16.0 / 9.0,
        other => match parse_ratio(other).or_else(|| parse_dims(other)) {
            Some((width, height)) => f64::from(width) / f64::from(height),
            None => {
                push_unique_warning(warnings, "Gemini size hint unsupported; using default ratio.");
                return None;
            }
        },
    };
    let (label, ratio) = ASPECT_RATIOS.iter().copied().min_by(|left, right| {
        (left.1 - wanted).abs().total_cmp(&(right.1 - wanted).abs())
    })?;
    if (ratio - wanted).abs() > 0.01 {
        push_unique_warning(warnings, format!("Gemini aspect ratio snapped to {label}."));
    }
    Some(label)
}

/// First inline image part across all candidates.
fn first_inline_image(payload: &Value) -> Result<Option<ImageBytes>> {
    let parts = payload
        .get("candidates")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|candidate| candidate.pointer("/content/parts").and_then(Value::as_array))
        .flatten();
    for part in parts {
        let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) else {
            continue;
        };
        let Some(data) = inline
            .get("data")
            .and_then(Value::as_str)
            .filter(|data| !data.is_empty())
        else {
            continue;
        };
        let bytes = BASE64
            .decode(data)
            .context("Gemini image base64 decode failed")?;
        let mime_type = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .map(str::to_string);
        return Ok(Some(ImageBytes { bytes, mime_type }));
    }
    Ok(None)
}

fn image_part_from_path(path: &Path) -> Result<Value> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    Ok(json!({
        "inlineData": {
            "mimeType": mime_for_path(path),
            "data": BASE64.encode(bytes),
        }
    }))
}
