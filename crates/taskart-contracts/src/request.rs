use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::keys::{derive_key, CacheKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStyle {
    Anime,
    #[default]
    Cartoon,
    Minimalist,
    Watercolor,
    Realistic,
    Pixel,
    Sketch,
}

impl ImageStyle {
    pub const ALL: [ImageStyle; 7] = [
        ImageStyle::Anime,
        ImageStyle::Cartoon,
        ImageStyle::Minimalist,
        ImageStyle::Watercolor,
        ImageStyle::Realistic,
        ImageStyle::Pixel,
        ImageStyle::Sketch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStyle::Anime => "anime",
            ImageStyle::Cartoon => "cartoon",
            ImageStyle::Minimalist => "minimalist",
            ImageStyle::Watercolor => "watercolor",
            ImageStyle::Realistic => "realistic",
            ImageStyle::Pixel => "pixel",
            ImageStyle::Sketch => "sketch",
        }
    }

    /// Lenient parse for values read back from stores; unknown tags fall back
    /// to the default style.
    pub fn parse_or_default(raw: Option<&str>) -> Self {
        raw.and_then(|value| value.parse().ok()).unwrap_or_default()
    }
}

impl fmt::Display for ImageStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageStyle {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        ImageStyle::ALL
            .into_iter()
            .find(|style| style.as_str() == normalized)
            .ok_or_else(|| format!("unknown image style '{raw}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    Medium,
    High,
}

impl QualityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Low => "low",
            QualityTier::Medium => "medium",
            QualityTier::High => "high",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" | "fast" | "cheaper" => Some(QualityTier::Low),
            "medium" | "standard" => Some(QualityTier::Medium),
            "high" | "hd" | "quality" | "better" => Some(QualityTier::High),
            _ => None,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityTier {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        QualityTier::parse(raw).ok_or_else(|| format!("unknown quality tier '{raw}'"))
    }
}

/// A single illustration request. Built once through [`GenerationRequestBuilder`]
/// and read through accessors afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    title: String,
    description: Option<String>,
    profile_text: Option<String>,
    style: ImageStyle,
    reference_image: Option<PathBuf>,
    quality: Option<QualityTier>,
    size_hint: Option<String>,
    target_id: Option<i64>,
    force_refresh: bool,
}

impl GenerationRequest {
    pub fn builder(title: impl Into<String>) -> GenerationRequestBuilder {
        GenerationRequestBuilder {
            request: GenerationRequest {
                title: title.into(),
                description: None,
                profile_text: None,
                style: ImageStyle::default(),
                reference_image: None,
                quality: None,
                size_hint: None,
                target_id: None,
                force_refresh: false,
            },
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn profile_text(&self) -> Option<&str> {
        self.profile_text.as_deref()
    }

    pub fn style(&self) -> ImageStyle {
        self.style
    }

    pub fn reference_image(&self) -> Option<&Path> {
        self.reference_image.as_deref()
    }

    pub fn quality(&self) -> Option<QualityTier> {
        self.quality
    }

    pub fn size_hint(&self) -> Option<&str> {
        self.size_hint.as_deref()
    }

    pub fn target_id(&self) -> Option<i64> {
        self.target_id
    }

    pub fn force_refresh(&self) -> bool {
        self.force_refresh
    }

    pub fn cache_key(&self) -> CacheKey {
        derive_key(
            &self.title,
            self.description.as_deref(),
            self.profile_text.as_deref(),
            self.style,
            self.reference_image.as_deref(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequestBuilder {
    request: GenerationRequest,
}

impl GenerationRequestBuilder {
    pub fn description(mut self, description: Option<impl Into<String>>) -> Self {
        self.request.description = non_empty(description.map(Into::into));
        self
    }

    pub fn profile_text(mut self, profile_text: Option<impl Into<String>>) -> Self {
        self.request.profile_text = non_empty(profile_text.map(Into::into));
        self
    }

    pub fn style(mut self, style: ImageStyle) -> Self {
        self.request.style = style;
        self
    }

    pub fn reference_image(mut self, path: Option<impl Into<PathBuf>>) -> Self {
        self.request.reference_image = path.map(Into::into);
        self
    }

    pub fn quality(mut self, quality: Option<QualityTier>) -> Self {
        self.request.quality = quality;
        self
    }

    pub fn size_hint(mut self, size_hint: Option<impl Into<String>>) -> Self {
        self.request.size_hint = non_empty(size_hint.map(Into::into));
        self
    }

    pub fn target_id(mut self, target_id: Option<i64>) -> Self {
        self.request.target_id = target_id;
        self
    }

    pub fn force_refresh(mut self, force_refresh: bool) -> Self {
        self.request.force_refresh = force_refresh;
        self
    }

    pub fn build(self) -> GenerationRequest {
        self.request
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}
