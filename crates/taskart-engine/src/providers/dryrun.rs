use std::io::Cursor;
use std::time::Duration;

use anyhow::{Context, Result};
use image::{ImageFormat, Rgb, RgbImage};
use sha2::{Digest, Sha256};

use super::{parse_dims, GeneratedImage, ImageProvider, ProviderRequest};

const DEFAULT_SIDE: u32 = 64;
const MAX_SIDE: u32 = 512;

/// Offline provider: a solid-colour PNG whose colour is derived from the
/// prompt, so identical prompts produce identical bytes.
#[derive(Debug, Clone, Copy)]
pub struct DryrunProvider {
    side: u32,
}

impl Default for DryrunProvider {
    fn default() -> Self {
        Self { side: DEFAULT_SIDE }
    }
}

impl DryrunProvider {
    pub fn with_side(side: u32) -> Self {
        Self {
            side: side.clamp(1, MAX_SIDE),
        }
    }
}

impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn supports_edit(&self) -> bool {
        false
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn generate(&self, request: &ProviderRequest) -> Result<GeneratedImage> {
        let (width, height) = request
            .size_hint
            .as_deref()
            .and_then(parse_dims)
            .map(|(width, height)| (width.min(MAX_SIDE), height.min(MAX_SIDE)))
            .unwrap_or((self.side, self.side));
        let bytes = render_dryrun_png(&request.prompt, width, height)?;
        Ok(GeneratedImage {
            bytes,
            mime_type: "image/png".to_string(),
            warnings: Vec::new(),
        })
    }
}

pub fn render_dryrun_png(prompt: &str, width: u32, height: u32) -> Result<Vec<u8>> {
    let (r, g, b) = color_from_prompt(prompt);
    let mut image = RgbImage::new(width.max(1), height.max(1));
    for pixel in image.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed to encode dry-run image")?;
    Ok(bytes)
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let digest = Sha256::digest(prompt.as_bytes());
    (digest[0], digest[1], digest[2])
}
