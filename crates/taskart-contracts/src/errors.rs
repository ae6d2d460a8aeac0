use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

const MAX_MESSAGE_CHARS: usize = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationErrorKind {
    ApiKeyMissing,
    ApiKeyInvalid,
    ContentViolation,
    QuotaExceeded,
    InvalidPrompt,
    NetworkError,
    RateLimit,
    ServiceUnavailable,
    FileSaveError,
    UnknownError,
}

impl GenerationErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationErrorKind::ApiKeyMissing => "API_KEY_MISSING",
            GenerationErrorKind::ApiKeyInvalid => "API_KEY_INVALID",
            GenerationErrorKind::ContentViolation => "CONTENT_VIOLATION",
            GenerationErrorKind::QuotaExceeded => "QUOTA_EXCEEDED",
            GenerationErrorKind::InvalidPrompt => "INVALID_PROMPT",
            GenerationErrorKind::NetworkError => "NETWORK_ERROR",
            GenerationErrorKind::RateLimit => "RATE_LIMIT",
            GenerationErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            GenerationErrorKind::FileSaveError => "FILE_SAVE_ERROR",
            GenerationErrorKind::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Configuration and policy problems are permanent; everything else is
    /// treated as transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            GenerationErrorKind::ApiKeyMissing
                | GenerationErrorKind::ApiKeyInvalid
                | GenerationErrorKind::ContentViolation
                | GenerationErrorKind::QuotaExceeded
                | GenerationErrorKind::InvalidPrompt
        )
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            GenerationErrorKind::ApiKeyMissing => {
                "Image generation is not set up yet. Add an API key in settings."
            }
            GenerationErrorKind::ApiKeyInvalid => {
                "The image service rejected the API key. Check it in settings."
            }
            GenerationErrorKind::ContentViolation => {
                "This task was flagged by the image service's content policy. Try rewording it."
            }
            GenerationErrorKind::QuotaExceeded => {
                "The image service quota is used up. Check your plan or billing details."
            }
            GenerationErrorKind::InvalidPrompt => {
                "The task text could not be turned into an image. Try a shorter or clearer title."
            }
            GenerationErrorKind::NetworkError => {
                "Could not reach the image service. Check your connection and try again."
            }
            GenerationErrorKind::RateLimit => {
                "Too many image requests right now. Wait a moment and try again."
            }
            GenerationErrorKind::ServiceUnavailable => {
                "The image service is temporarily unavailable. Try again later."
            }
            GenerationErrorKind::FileSaveError => {
                "The image could not be saved. Check available disk space."
            }
            GenerationErrorKind::UnknownError => {
                "Something went wrong while generating the image. Please try again."
            }
        }
    }
}

impl fmt::Display for GenerationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(rename_all = "camelCase")]
#[error("{kind}: {message}")]
pub struct GenerationError {
    pub kind: GenerationErrorKind,
    pub message: String,
    pub user_message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl GenerationError {
    pub fn new(kind: GenerationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: truncate_text(&message.into(), MAX_MESSAGE_CHARS),
            user_message: kind.user_message().to_string(),
            retryable: kind.is_retryable(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierRule {
    pub pattern: String,
    pub kind: GenerationErrorKind,
}

/// Maps raw failures onto the closed [`GenerationErrorKind`] taxonomy.
///
/// Keyword rules are checked in order against the lowercased error chain, so
/// earlier rules win when a message matches several of them.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassifierRule>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl ErrorClassifier {
    pub fn new(rules: Vec<ClassifierRule>) -> Self {
        Self { rules }
    }

    pub fn with_rule(mut self, pattern: &str, kind: GenerationErrorKind) -> Self {
        self.rules.push(ClassifierRule {
            pattern: pattern.to_ascii_lowercase(),
            kind,
        });
        self
    }

    pub fn rules(&self) -> &[ClassifierRule] {
        &self.rules
    }

    pub fn classify(&self, err: &anyhow::Error) -> GenerationError {
        for cause in err.chain() {
            if let Some(known) = cause.downcast_ref::<GenerationError>() {
                return known.clone();
            }
        }
        let message = error_chain_text(err, MAX_MESSAGE_CHARS);
        for cause in err.chain() {
            if let Some(io_err) = cause.downcast_ref::<io::Error>() {
                if let Some(kind) = kind_for_io_error(io_err) {
                    return GenerationError::new(kind, message);
                }
            }
        }
        self.classify_message(&message)
    }

    pub fn classify_message(&self, message: &str) -> GenerationError {
        let lowered = message.to_ascii_lowercase();
        for rule in &self.rules {
            if lowered.contains(rule.pattern.as_str()) {
                return GenerationError::new(rule.kind, message)
                    .with_details(json!({ "matched": rule.pattern }));
            }
        }
        GenerationError::new(GenerationErrorKind::UnknownError, message)
    }
}

fn kind_for_io_error(err: &io::Error) -> Option<GenerationErrorKind> {
    // ENOSPC on unix, ERROR_DISK_FULL on windows.
    if matches!(err.raw_os_error(), Some(28) | Some(112)) {
        return Some(GenerationErrorKind::FileSaveError);
    }
    match err.kind() {
        io::ErrorKind::TimedOut
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe => Some(GenerationErrorKind::NetworkError),
        io::ErrorKind::PermissionDenied | io::ErrorKind::WriteZero => {
            Some(GenerationErrorKind::FileSaveError)
        }
        _ => None,
    }
}

fn default_rules() -> Vec<ClassifierRule> {
    use GenerationErrorKind::*;

    [
        ("api key missing", ApiKeyMissing),
        ("api key not set", ApiKeyMissing),
        ("_api_key not set", ApiKeyMissing),
        ("missing api key", ApiKeyMissing),
        ("invalid api key", ApiKeyInvalid),
        ("incorrect api key", ApiKeyInvalid),
        ("invalid_api_key", ApiKeyInvalid),
        ("api key not valid", ApiKeyInvalid),
        ("unauthorized", ApiKeyInvalid),
        ("(401)", ApiKeyInvalid),
        ("(403)", ApiKeyInvalid),
        ("quota", QuotaExceeded),
        ("billing", QuotaExceeded),
        ("rate limit", RateLimit),
        ("rate_limit", RateLimit),
        ("too many requests", RateLimit),
        ("(429)", RateLimit),
        ("content policy", ContentViolation),
        ("content_policy", ContentViolation),
        ("safety system", ContentViolation),
        ("moderation_blocked", ContentViolation),
        ("policy violation", ContentViolation),
        ("invalid prompt", InvalidPrompt),
        ("prompt is too long", InvalidPrompt),
        ("empty prompt", InvalidPrompt),
        ("network", NetworkError),
        ("timeout", NetworkError),
        ("timed out", NetworkError),
        ("connection", NetworkError),
        ("dns error", NetworkError),
        ("error sending request", NetworkError),
        ("service unavailable", ServiceUnavailable),
        ("service_unavailable", ServiceUnavailable),
        ("(502)", ServiceUnavailable),
        ("(503)", ServiceUnavailable),
        ("(504)", ServiceUnavailable),
        ("overloaded", ServiceUnavailable),
        ("enospc", FileSaveError),
        ("no space left", FileSaveError),
        ("failed to save", FileSaveError),
        ("failed to write", FileSaveError),
    ]
    .into_iter()
    .map(|(pattern, kind)| ClassifierRule {
        pattern: pattern.to_string(),
        kind,
    })
    .collect()
}

/// Flattens an error and its causes into one line, skipping blank and
/// repeated links, capped at `max_chars` characters.
pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut links: Vec<String> = Vec::new();
    for link in err.chain().map(|cause| cause.to_string()) {
        let link = link.trim();
        if !link.is_empty() && links.last().map(String::as_str) != Some(link) {
            links.push(link.to_string());
        }
    }
    truncate_text(&links.join(": "), max_chars)
}

/// Keeps the first `max_chars` characters, marking the cut with an ellipsis.
pub fn truncate_text(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &value[..cut]),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use anyhow::anyhow;

    use super::{
        error_chain_text, truncate_text, ErrorClassifier, GenerationError, GenerationErrorKind,
    };

    fn kind_of(message: &str) -> GenerationErrorKind {
        ErrorClassifier::default().classify_message(message).kind
    }

    #[test]
    fn retryability_is_fixed_per_kind() {
        for kind in [
            GenerationErrorKind::ApiKeyMissing,
            GenerationErrorKind::ApiKeyInvalid,
            GenerationErrorKind::ContentViolation,
            GenerationErrorKind::QuotaExceeded,
            GenerationErrorKind::InvalidPrompt,
        ] {
            assert!(!GenerationError::new(kind, "x").retryable, "{kind}");
        }
        for kind in [
            GenerationErrorKind::NetworkError,
            GenerationErrorKind::RateLimit,
            GenerationErrorKind::ServiceUnavailable,
            GenerationErrorKind::FileSaveError,
            GenerationErrorKind::UnknownError,
        ] {
            assert!(GenerationError::new(kind, "x").retryable, "{kind}");
        }
    }

    #[test]
    fn keyword_rules_cover_common_backend_messages() {
        assert_eq!(
            kind_of("OpenAI request failed (429): You exceeded your current quota"),
            GenerationErrorKind::QuotaExceeded
        );
        assert_eq!(
            kind_of("OpenAI request failed (429): Rate limit reached for requests"),
            GenerationErrorKind::RateLimit
        );
        assert_eq!(
            kind_of("Your request was rejected as a result of our safety system"),
            GenerationErrorKind::ContentViolation
        );
        assert_eq!(
            kind_of("Gemini request failed (503): The model is overloaded"),
            GenerationErrorKind::ServiceUnavailable
        );
        assert_eq!(
            kind_of("OpenAI request failed (401): Incorrect API key provided"),
            GenerationErrorKind::ApiKeyInvalid
        );
        assert_eq!(
            kind_of("write failed: No space left on device"),
            GenerationErrorKind::FileSaveError
        );
        assert_eq!(kind_of("socket hang up after timeout"), GenerationErrorKind::NetworkError);
        assert_eq!(kind_of("something odd"), GenerationErrorKind::UnknownError);
    }

    #[test]
    fn generate_content_endpoint_is_not_a_content_violation() {
        assert_eq!(
            kind_of("Gemini request failed (https://x/models/m:generateContent)"),
            GenerationErrorKind::UnknownError
        );
    }

    #[test]
    fn embedded_generation_error_is_preserved() {
        let original = GenerationError::new(GenerationErrorKind::ApiKeyMissing, "no key");
        let err = anyhow::Error::new(original.clone()).context("provider failed");
        assert_eq!(ErrorClassifier::default().classify(&err), original);
    }

    #[test]
    fn io_errors_classify_by_kind() {
        let err = anyhow::Error::new(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert_eq!(
            ErrorClassifier::default().classify(&err).kind,
            GenerationErrorKind::NetworkError
        );
        let err = anyhow::Error::new(io::Error::from_raw_os_error(28));
        assert_eq!(
            ErrorClassifier::default().classify(&err).kind,
            GenerationErrorKind::FileSaveError
        );
    }

    #[test]
    fn custom_rules_extend_the_table() {
        let classifier =
            ErrorClassifier::default().with_rule("Model Busy", GenerationErrorKind::RateLimit);
        let error = classifier.classify(&anyhow!("model busy, retry later"));
        assert_eq!(error.kind, GenerationErrorKind::RateLimit);
        assert_eq!(error.user_message, GenerationErrorKind::RateLimit.user_message());
    }

    #[test]
    fn serializes_with_screaming_kind() -> anyhow::Result<()> {
        let error = GenerationError::new(GenerationErrorKind::NetworkError, "timed out");
        let value = serde_json::to_value(&error)?;
        assert_eq!(value["kind"], "NETWORK_ERROR");
        assert_eq!(value["retryable"], true);
        assert!(value.get("details").is_none());
        Ok(())
    }

    #[test]
    fn chain_text_skips_blank_and_repeated_causes() {
        let err = anyhow!("socket closed")
            .context("socket closed")
            .context("  ")
            .context("upload failed");
        assert_eq!(error_chain_text(&err, 100), "upload failed: socket closed");
        assert_eq!(error_chain_text(&err, 6), "upload…");
    }

    #[test]
    fn truncation_counts_characters() {
        assert_eq!(truncate_text("héllo", 5), "héllo");
        assert_eq!(truncate_text("héllo", 2), "hé…");
        assert_eq!(truncate_text("", 0), "");
    }
}
