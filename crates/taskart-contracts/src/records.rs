use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::request::ImageStyle;

/// Settings key holding the preferred image quality tier.
pub const IMAGE_QUALITY_SETTING: &str = "image_quality";
/// Older settings key kept for stores written before `image_quality` existed.
pub const LEGACY_QUALITY_SETTING: &str = "quality";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub id: i64,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequesterProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

impl RequesterProfile {
    pub fn style(&self) -> ImageStyle {
        ImageStyle::parse_or_default(self.style.as_deref())
    }
}

/// The task/profile store the engine reads targets from and binds images to.
pub trait RecordStore: Send + Sync {
    fn list_targets(&self) -> anyhow::Result<Vec<TargetRecord>>;
    fn target(&self, id: i64) -> anyhow::Result<Option<TargetRecord>>;
    fn requester_profile(&self) -> anyhow::Result<RequesterProfile>;
    fn update_image(&self, id: i64, image_url: &str) -> anyhow::Result<()>;
}

pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

impl SettingsStore for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        BTreeMap::get(self, key).cloned()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RecordDocument {
    #[serde(default)]
    targets: Vec<TargetRecord>,
    #[serde(default)]
    profile: RequesterProfile,
    #[serde(default)]
    settings: BTreeMap<String, String>,
}

/// Record and settings store backed by a single JSON document.
///
/// The document is re-read on every call so several handles (or processes)
/// pointing at the same file observe each other's writes.
#[derive(Debug)]
pub struct JsonRecordStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn upsert_target(&self, record: TargetRecord) -> anyhow::Result<()> {
        self.modify(|document| {
            match document.targets.iter_mut().find(|row| row.id == record.id) {
                Some(existing) => *existing = record,
                None => document.targets.push(record),
            }
            Ok(())
        })
    }

    pub fn set_profile(&self, profile: RequesterProfile) -> anyhow::Result<()> {
        self.modify(|document| {
            document.profile = profile;
            Ok(())
        })
    }

    pub fn set_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.modify(|document| {
            document.settings.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn read(&self) -> anyhow::Result<RecordDocument> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("record store lock poisoned"))?;
        read_document(&self.path)
    }

    fn modify(
        &self,
        change: impl FnOnce(&mut RecordDocument) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("record store lock poisoned"))?;
        let mut document = read_document(&self.path)?;
        change(&mut document)?;
        write_document(&self.path, &document)
    }
}

impl RecordStore for JsonRecordStore {
    fn list_targets(&self) -> anyhow::Result<Vec<TargetRecord>> {
        Ok(self.read()?.targets)
    }

    fn target(&self, id: i64) -> anyhow::Result<Option<TargetRecord>> {
        Ok(self.read()?.targets.into_iter().find(|row| row.id == id))
    }

    fn requester_profile(&self) -> anyhow::Result<RequesterProfile> {
        Ok(self.read()?.profile)
    }

    fn update_image(&self, id: i64, image_url: &str) -> anyhow::Result<()> {
        self.modify(|document| {
            let Some(row) = document.targets.iter_mut().find(|row| row.id == id) else {
                anyhow::bail!("target {id} not found in {}", self.path.display());
            };
            row.image_url = Some(image_url.to_string());
            Ok(())
        })
    }
}

impl SettingsStore for JsonRecordStore {
    fn get(&self, key: &str) -> Option<String> {
        self.read()
            .ok()
            .and_then(|document| document.settings.get(key).cloned())
            .filter(|value| !value.trim().is_empty())
    }
}

fn read_document(path: &Path) -> anyhow::Result<RecordDocument> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(RecordDocument::default())
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed reading {}", path.display()))
        }
    };
    if raw.trim().is_empty() {
        return Ok(RecordDocument::default());
    }
    serde_json::from_str(&raw).with_context(|| format!("invalid record store {}", path.display()))
}

fn write_document(path: &Path, document: &RecordDocument) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let staging = path.with_extension("json.tmp");
    std::fs::write(&staging, serde_json::to_string_pretty(document)?)
        .with_context(|| format!("failed to write {}", staging.display()))?;
    std::fs::rename(&staging, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
