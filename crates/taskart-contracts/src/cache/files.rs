use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::keys::{is_key_fragment, CacheKey};

const SLUG_MAX_CHARS: usize = 40;

/// Durable image tier: one directory of files named
/// `{timestamp_millis:013}_{slug}_{key_fragment}.{ext}`.
///
/// The zero-padded timestamp prefix makes lexicographic order match
/// creation order.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create cache dir {}", self.dir.display()))
    }

    /// Sorted file names in the cache directory; a missing directory lists as empty.
    pub fn list(&self) -> anyhow::Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed listing {}", self.dir.display()))
            }
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type().map(|kind| kind.is_file()).unwrap_or(false) {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn read(&self, file_name: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.dir.join(file_name);
        std::fs::read(&path).with_context(|| format!("failed reading {}", path.display()))
    }

    /// Persists image bytes for `key` and returns the new file name.
    pub fn write(
        &self,
        key: &CacheKey,
        label: &str,
        bytes: &[u8],
        extension: &str,
    ) -> anyhow::Result<String> {
        self.ensure_dir()?;
        let stamp = chrono::Utc::now().timestamp_millis().max(0);
        let file_name = format!(
            "{:013}_{}_{}.{}",
            stamp,
            slugify(label),
            key.fragment(),
            extension.trim_start_matches('.')
        );
        let path = self.dir.join(&file_name);
        std::fs::write(&path, bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(file_name)
    }
}

/// Most recent of the sorted `file_names` whose embedded fragment is that of `key`.
pub fn latest_for_key<'a>(file_names: &'a [String], key: &CacheKey) -> Option<&'a str> {
    file_names
        .iter()
        .rfind(|name| key_fragment_of(name) == Some(key.fragment()))
        .map(String::as_str)
}

/// Most recent of the sorted `file_names` mentioning either the fragment of
/// `key` or the slug of `label`. The fallback slug never matches.
pub fn repair_candidate<'a>(
    file_names: &'a [String],
    key: &CacheKey,
    label: &str,
) -> Option<&'a str> {
    let slug = slugify(label);
    let match_slug = slug != "image";
    file_names
        .iter()
        .rfind(|name| name.contains(key.fragment()) || (match_slug && name.contains(&slug)))
        .map(String::as_str)
}

/// Filesystem-safe transform of a target name: lowercase ASCII alphanumerics
/// joined by `-`, capped in length, never empty.
pub fn slugify(label: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for ch in label.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
            if slug.len() >= SLUG_MAX_CHARS {
                break;
            }
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        return "image".to_string();
    }
    slug
}

/// Extracts the key fragment embedded after the last `_` of a cache file name.
pub fn key_fragment_of(file_name: &str) -> Option<&str> {
    let stem = match file_name.rsplit_once('.') {
        Some((stem, _)) => stem,
        None => file_name,
    };
    let (_, fragment) = stem.rsplit_once('_')?;
    is_key_fragment(fragment).then_some(fragment)
}
