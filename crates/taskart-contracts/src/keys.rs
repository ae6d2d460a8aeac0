use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::request::ImageStyle;

/// Length of the key prefix embedded in cache file names.
pub const KEY_FRAGMENT_LEN: usize = 8;

/// Hex SHA-256 of a request's semantic inputs. Deserialization rejects
/// anything else, so [`CacheKey::fragment`] can always slice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey(String);

/// Hex characters in a full key.
pub const KEY_LEN: usize = 64;

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn fragment(&self) -> &str {
        &self.0[..KEY_FRAGMENT_LEN]
    }
}

impl TryFrom<String> for CacheKey {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        if raw.len() == KEY_LEN && raw.bytes().all(|byte| byte.is_ascii_hexdigit()) {
            Ok(CacheKey(raw.to_ascii_lowercase()))
        } else {
            Err(format!("invalid cache key {raw:?}: expected {KEY_LEN} hex characters"))
        }
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the cache identity of an illustration from its semantic inputs.
///
/// The reference image only contributes its file name, so two different files
/// sharing a basename map to the same key.
pub fn derive_key(
    title: &str,
    description: Option<&str>,
    profile_text: Option<&str>,
    style: ImageStyle,
    reference_image: Option<&Path>,
) -> CacheKey {
    let reference_name = reference_image
        .and_then(|path| path.file_name())
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    CacheKey(stable_hash(&json!([
        title.trim(),
        description.map(str::trim).unwrap_or_default(),
        profile_text.map(str::trim).unwrap_or_default(),
        style.as_str(),
        reference_name,
    ])))
}

/// True when `raw` could be a fragment of a derived key.
pub fn is_key_fragment(raw: &str) -> bool {
    raw.len() == KEY_FRAGMENT_LEN && raw.bytes().all(|byte| byte.is_ascii_hexdigit())
}

fn stable_hash(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
