mod files;
mod memory;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

pub use files::{key_fragment_of, latest_for_key, repair_candidate, slugify, FileStore};
pub use memory::{
    CacheEntry, MemoryCache, MemoryLookup, DEFAULT_MEMORY_CAPACITY, DEFAULT_MEMORY_TTL,
};

use crate::keys::{derive_key, CacheKey};
use crate::payload::{encode_data_uri, inspect_payload, is_data_uri, mime_for_bytes};
use crate::records::{RequesterProfile, TargetRecord};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub indexed_files: usize,
    pub memory_hits: u64,
    pub file_hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairedRecord {
    pub target_id: i64,
    pub data_uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records whose payload was seeded into memory.
    pub seeded: usize,
    /// Records without an inline payload.
    pub skipped: usize,
    /// Corrupt payloads replaced with file-tier content.
    pub repaired: Vec<RepairedRecord>,
    /// Corrupt payloads kept as-is because no file matched.
    pub unrepaired: Vec<i64>,
}

/// Two-tier image cache: a bounded in-memory LRU in front of the file tier.
///
/// The fragment index (key fragment → file name) is derived state; it can be
/// rebuilt from the directory listing and from the record store at any time.
#[derive(Debug)]
pub struct ImageCache {
    memory: Mutex<MemoryCache>,
    files: FileStore,
    index: Mutex<BTreeMap<String, String>>,
    counters: Mutex<CacheStats>,
}

impl ImageCache {
    pub fn new(dir: impl AsRef<Path>, capacity: usize, ttl: Duration) -> Self {
        Self {
            memory: Mutex::new(MemoryCache::new(capacity, ttl)),
            files: FileStore::new(dir.as_ref()),
            index: Mutex::new(BTreeMap::new()),
            counters: Mutex::new(CacheStats::default()),
        }
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    pub fn get(&self, key: &CacheKey) -> Option<String> {
        let in_memory = match lock(&self.memory).get(key) {
            MemoryLookup::Hit(data_uri) => Some(data_uri.to_string()),
            MemoryLookup::Expired => {
                debug!("memory cache entry expired: {}", key.fragment());
                None
            }
            MemoryLookup::Miss => None,
        };
        if let Some(data_uri) = in_memory {
            lock(&self.counters).memory_hits += 1;
            debug!("memory cache hit: {}", key.fragment());
            return Some(data_uri);
        }

        let indexed = lock(&self.index).get(key.fragment()).cloned();
        if let Some(file_name) = indexed {
            match self.files.read(&file_name) {
                Ok(bytes) if !bytes.is_empty() => {
                    let data_uri = encode_data_uri(&bytes, mime_for_bytes(&bytes));
                    self.insert_memory(key.clone(), data_uri.clone());
                    lock(&self.counters).file_hits += 1;
                    debug!("file cache hit (promoted to memory): {file_name}");
                    return Some(data_uri);
                }
                Ok(_) => {
                    warn!("cache file {file_name} is empty; dropping from index");
                    lock(&self.index).remove(key.fragment());
                }
                Err(err) => {
                    warn!("cache file {file_name} unreadable: {err:#}");
                    lock(&self.index).remove(key.fragment());
                }
            }
        }

        lock(&self.counters).misses += 1;
        debug!("cache miss: {}", key.fragment());
        None
    }

    /// Write-through insert. `persisted_file` names a file the caller has just
    /// written for this key; the cache never writes files itself.
    pub fn put(
        &self,
        key: &CacheKey,
        data_uri: &str,
        persisted_file: Option<&str>,
        target_id: Option<i64>,
    ) {
        self.insert_memory(key.clone(), data_uri.to_string());
        if let Some(file_name) = persisted_file {
            lock(&self.index).insert(key.fragment().to_string(), file_name.to_string());
        }
        debug!(
            "cached image {} for target {:?} (file: {:?})",
            key.fragment(),
            target_id,
            persisted_file
        );
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        lock(&self.memory).remove(key).is_some()
    }

    /// Seeds the fragment index from cache file names. Names without a key
    /// fragment are ignored; for duplicate fragments the newest name wins.
    pub fn reconcile_from_disk(&self, file_names: &[String]) -> usize {
        let mut index = lock(&self.index);
        let mut seeded = 0;
        for name in file_names {
            let Some(fragment) = key_fragment_of(name) else {
                continue;
            };
            let newer = index
                .get(fragment)
                .map(|existing| name.as_str() > existing.as_str())
                .unwrap_or(true);
            if newer {
                index.insert(fragment.to_string(), name.clone());
                seeded += 1;
            }
        }
        debug!("indexed {seeded} cache files");
        seeded
    }

    /// Lists the file tier and reconciles from it; listing failures are logged
    /// and reported as zero seeded files.
    pub fn reconcile_from_file_tier(&self) -> usize {
        match self.files.list() {
            Ok(names) => self.reconcile_from_disk(&names),
            Err(err) => {
                warn!("cache directory scan failed: {err:#}");
                0
            }
        }
    }

    /// Warms memory from inline payloads held in the record store, repairing
    /// corrupt payloads from the file tier where possible.
    pub fn reconcile_from_records(
        &self,
        records: &[TargetRecord],
        profile: &RequesterProfile,
    ) -> ReconcileReport {
        let file_names = self.files.list().unwrap_or_else(|err| {
            warn!("cache directory scan failed during record reconcile: {err:#}");
            Vec::new()
        });
        let mut report = ReconcileReport::default();

        for record in records {
            let Some(payload) = record.image_url.as_deref().filter(|raw| is_data_uri(raw)) else {
                report.skipped += 1;
                continue;
            };
            let key = derive_key(
                &record.title,
                record.description.as_deref(),
                profile.description.as_deref(),
                profile.style(),
                None,
            );

            let payload = match inspect_payload(payload) {
                None => payload.to_string(),
                Some(defect) => {
                    warn!(
                        "target {} has a corrupt image payload: {}",
                        record.id,
                        defect.describe()
                    );
                    match self.repair_from(&file_names, &key, &record.title) {
                        Some(repaired) => {
                            report.repaired.push(RepairedRecord {
                                target_id: record.id,
                                data_uri: repaired.clone(),
                            });
                            repaired
                        }
                        None => {
                            report.unrepaired.push(record.id);
                            payload.to_string()
                        }
                    }
                }
            };

            self.insert_memory(key.clone(), payload);
            if let Some(file_name) = latest_for_key(&file_names, &key) {
                lock(&self.index).insert(key.fragment().to_string(), file_name.to_string());
            }
            report.seeded += 1;
        }

        info!(
            "record reconcile: seeded={} skipped={} repaired={} unrepaired={}",
            report.seeded,
            report.skipped,
            report.repaired.len(),
            report.unrepaired.len()
        );
        report
    }

    /// Finds replacement content for a corrupt payload in the file tier.
    /// Returns `None` when nothing matches or the match cannot be read.
    pub fn repair(&self, key: &CacheKey, label: &str) -> Option<String> {
        match self.files.list() {
            Ok(names) => self.repair_from(&names, key, label),
            Err(err) => {
                warn!("cache directory scan failed during repair: {err:#}");
                None
            }
        }
    }

    fn repair_from(&self, file_names: &[String], key: &CacheKey, label: &str) -> Option<String> {
        let candidate = repair_candidate(file_names, key, label)?;
        match self.files.read(candidate) {
            Ok(bytes) if !bytes.is_empty() => {
                info!("repaired payload for {} from {candidate}", key.fragment());
                Some(encode_data_uri(&bytes, mime_for_bytes(&bytes)))
            }
            Ok(_) => {
                warn!("repair candidate {candidate} is empty");
                None
            }
            Err(err) => {
                warn!("repair candidate {candidate} unreadable: {err:#}");
                None
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let (memory_entries, evictions) = {
            let memory = lock(&self.memory);
            (memory.len(), memory.evictions())
        };
        let indexed_files = lock(&self.index).len();
        let mut stats = *lock(&self.counters);
        stats.memory_entries = memory_entries;
        stats.indexed_files = indexed_files;
        stats.evictions = evictions;
        stats
    }

    fn insert_memory(&self, key: CacheKey, data_uri: String) {
        if let Some(evicted) = lock(&self.memory).insert(key, data_uri) {
            debug!("evicted LRU entry from memory: {}", evicted.fragment());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ImageCache;
    use crate::keys::derive_key;
    use crate::payload::{decode_data_uri, encode_data_uri, tiny_png, PNG_END_MARKER};
    use crate::records::{RequesterProfile, TargetRecord};
    use crate::request::ImageStyle;

    fn profile() -> RequesterProfile {
        RequesterProfile {
            description: Some("a night owl".to_string()),
            style: Some("anime".to_string()),
        }
    }

    fn record(id: i64, title: &str, image_url: Option<String>) -> TargetRecord {
        TargetRecord {
            id,
            title: title.to_string(),
            description: None,
            image_url,
        }
    }

    fn record_key(title: &str) -> super::CacheKey {
        derive_key(title, None, Some("a night owl"), ImageStyle::Anime, None)
    }

    fn truncated_png_uri() -> String {
        let mut bytes = tiny_png();
        bytes.truncate(bytes.len() - PNG_END_MARKER.len());
        encode_data_uri(&bytes, "image/png")
    }

    #[test]
    fn file_tier_hit_is_promoted_to_memory() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let cache = ImageCache::new(temp.path(), 4, Duration::from_secs(60));
        let key = record_key("Write report");
        let name = cache.files().write(&key, "Write report", &tiny_png(), "png")?;

        assert_eq!(cache.get(&key), None);
        assert_eq!(cache.reconcile_from_file_tier(), 1);
        let first = cache.get(&key);
        assert_eq!(first, Some(encode_data_uri(&tiny_png(), "image/png")));
        let second = cache.get(&key);
        assert_eq!(first, second);

        let stats = cache.stats();
        assert_eq!(stats.file_hits, 1);
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.indexed_files, 1);
        assert!(name.contains(key.fragment()));
        Ok(())
    }

    #[test]
    fn put_records_persisted_file_for_later_lookup() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let cache = ImageCache::new(temp.path(), 1, Duration::from_secs(60));
        let key = record_key("Write report");
        let other = record_key("Walk dog");
        let name = cache.files().write(&key, "Write report", &tiny_png(), "png")?;
        let uri = encode_data_uri(&tiny_png(), "image/png");

        cache.put(&key, &uri, Some(&name), Some(7));
        cache.put(&other, "data:image/png;base64,AAAA", None, None);
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.get(&key), Some(uri));
        Ok(())
    }

    #[test]
    fn disk_reconcile_ignores_foreign_files_and_keeps_newest() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let cache = ImageCache::new(temp.path(), 4, Duration::from_secs(60));
        let key = record_key("Write report");
        let names = vec![
            format!("0000000000002_write-report_{}.png", key.fragment()),
            format!("0000000000001_write-report_{}.png", key.fragment()),
            "notes.txt".to_string(),
        ];
        std::fs::write(temp.path().join(&names[0]), b"newer")?;
        std::fs::write(temp.path().join(&names[1]), b"older")?;
        cache.reconcile_from_disk(&names);

        let (_, bytes) = cache
            .get(&key)
            .and_then(|uri| decode_data_uri(&uri))
            .unwrap_or_default();
        assert_eq!(bytes, b"newer".to_vec());
        Ok(())
    }

    #[test]
    fn record_reconcile_makes_records_reachable() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let cache = ImageCache::new(temp.path(), 10, Duration::from_secs(60));
        let intact = encode_data_uri(&tiny_png(), "image/png");
        let records = vec![
            record(1, "Write report", Some(intact.clone())),
            record(2, "Walk dog", Some(intact.clone())),
            record(3, "No image yet", None),
            record(4, "Remote", Some("https://example.test/a.png".to_string())),
        ];
        let report = cache.reconcile_from_records(&records, &profile());

        assert_eq!(report.seeded, 2);
        assert_eq!(report.skipped, 2);
        assert!(report.repaired.is_empty());
        assert_eq!(cache.get(&record_key("Write report")), Some(intact.clone()));
        assert_eq!(cache.get(&record_key("Walk dog")), Some(intact));
        Ok(())
    }

    #[test]
    fn corrupt_payload_is_repaired_byte_identically() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let cache = ImageCache::new(temp.path(), 10, Duration::from_secs(60));
        let key = record_key("Write report");
        let mut on_disk = tiny_png();
        on_disk.insert(10, 0x42);
        cache.files().write(&key, "Write report", &on_disk, "png")?;

        let records = vec![record(1, "Write report", Some(truncated_png_uri()))];
        let report = cache.reconcile_from_records(&records, &profile());

        assert_eq!(report.repaired.len(), 1);
        assert_eq!(report.repaired[0].target_id, 1);
        let (_, repaired) = decode_data_uri(&report.repaired[0].data_uri).unwrap_or_default();
        assert_eq!(repaired, on_disk);
        assert_eq!(cache.get(&key), Some(report.repaired[0].data_uri.clone()));
        Ok(())
    }

    #[test]
    fn unrepairable_payload_is_kept_not_dropped() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let cache = ImageCache::new(temp.path(), 10, Duration::from_secs(60));
        let corrupt = truncated_png_uri();
        let records = vec![record(5, "Write report", Some(corrupt.clone()))];
        let report = cache.reconcile_from_records(&records, &profile());

        assert_eq!(report.unrepaired, vec![5]);
        assert_eq!(cache.get(&record_key("Write report")), Some(corrupt));
        assert_eq!(cache.repair(&record_key("Write report"), "Write report"), None);
        Ok(())
    }

    #[test]
    fn repair_matches_by_name_when_fragment_differs() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let cache = ImageCache::new(temp.path(), 10, Duration::from_secs(60));
        let old_key = derive_key("Write report", None, None, ImageStyle::Sketch, None);
        cache
            .files()
            .write(&old_key, "Write report", &tiny_png(), "png")?;

        let repaired = cache.repair(&record_key("Write report"), "Write report");
        assert_eq!(repaired, Some(encode_data_uri(&tiny_png(), "image/png")));
        Ok(())
    }
}
