use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Map, Value};
use taskart_contracts::cache::{CacheStats, ImageCache};
use taskart_contracts::errors::{
    error_chain_text, ErrorClassifier, GenerationError, GenerationErrorKind,
};
use taskart_contracts::events::{ActivityKind, ActivityLog};
use taskart_contracts::keys::CacheKey;
use taskart_contracts::records::{RecordStore, RequesterProfile, SettingsStore, TargetRecord};
use taskart_contracts::request::GenerationRequest;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::dedup::InFlightQueue;
use crate::prompt::build_prompt;
use crate::providers::{select_provider, GeneratedImage, ImageProvider, ProviderRequest};
use crate::retry::{with_retry, RetryPolicy};

pub type GenerationResult = Result<ImageOutcome, GenerationError>;

/// Advisory progress callback: stage plus a 0-100 percent hint.
pub type ProgressFn<'a> = &'a dyn Fn(ProgressStage, u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStage {
    Preparing,
    Generating,
    Processing,
    Complete,
}

impl ProgressStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStage::Preparing => "preparing",
            ProgressStage::Generating => "generating",
            ProgressStage::Processing => "processing",
            ProgressStage::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageOutcome {
    pub image_url: String,
    pub cache_key: CacheKey,
    pub from_cache: bool,
    /// Provider attempts spent; zero for cache hits.
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmUpReport {
    pub indexed_files: usize,
    pub seeded: usize,
    pub skipped: usize,
    pub repaired: Vec<i64>,
    pub unrepaired: Vec<i64>,
    /// Repaired payloads successfully written back to the record store.
    pub written_back: usize,
}

/// Entry point for callers: cache lookup, per-target deduplication, retried
/// provider calls, persistence and record binding.
pub struct ImageOrchestrator {
    provider: Arc<dyn ImageProvider>,
    records: Arc<dyn RecordStore>,
    cache: ImageCache,
    in_flight: InFlightQueue<GenerationResult>,
    retry: RetryPolicy,
    classifier: ErrorClassifier,
    activity: ActivityLog,
}

impl ImageOrchestrator {
    pub fn new(
        config: &EngineConfig,
        provider: Arc<dyn ImageProvider>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        let activity = match config.activity_log.as_ref() {
            Some(path) => ActivityLog::new(path.clone()),
            None => ActivityLog::disabled(),
        };
        Self {
            provider,
            records,
            cache: ImageCache::new(&config.cache_dir, config.memory_capacity, config.memory_ttl()),
            in_flight: InFlightQueue::new(config.in_flight_max_age()),
            retry: config.retry_policy(),
            classifier: ErrorClassifier::default(),
            activity,
        }
    }

    /// Builds the orchestrator around a store that also holds settings, with
    /// the provider chosen by the config.
    pub fn from_config<S>(config: &EngineConfig, store: Arc<S>) -> Result<Self>
    where
        S: RecordStore + SettingsStore + 'static,
    {
        let settings: Arc<dyn SettingsStore> = store.clone();
        let provider = select_provider(config, Some(settings))?;
        info!("using image provider {}", provider.name());
        Ok(Self::new(config, provider, store))
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_activity_log(mut self, activity: ActivityLog) -> Self {
        self.activity = activity;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn cache_stats(&self) -> CacheStats {
        let stats = self.cache.stats();
        debug!(
            "cache stats: memory={} files={} memory_hits={} file_hits={} misses={} evictions={}",
            stats.memory_entries,
            stats.indexed_files,
            stats.memory_hits,
            stats.file_hits,
            stats.misses,
            stats.evictions
        );
        stats
    }

    pub fn is_ready(&self) -> bool {
        if !self.provider.is_configured() {
            debug!("provider {} is not configured", self.provider.name());
            return false;
        }
        match self.cache.files().ensure_dir() {
            Ok(()) => true,
            Err(err) => {
                warn!("cache directory unusable: {err:#}");
                false
            }
        }
    }

    /// Rebuilds cache state from the file tier and the record store, writing
    /// repaired payloads back. Never fails; problems are logged.
    pub fn warm_up(&self) -> WarmUpReport {
        let started = Instant::now();
        let indexed_files = self.cache.reconcile_from_file_tier();
        let records = self.records.list_targets().unwrap_or_else(|err| {
            warn!("could not list targets for reconcile: {err:#}");
            Vec::new()
        });
        let profile = self.profile_or_default();
        let reconciled = self.cache.reconcile_from_records(&records, &profile);

        let mut written_back = 0;
        for repaired in &reconciled.repaired {
            match self
                .records
                .update_image(repaired.target_id, &repaired.data_uri)
            {
                Ok(()) => written_back += 1,
                Err(err) => warn!(
                    "could not write repaired image back to target {}: {err:#}",
                    repaired.target_id
                ),
            }
        }

        let summary = WarmUpReport {
            indexed_files,
            seeded: reconciled.seeded,
            skipped: reconciled.skipped,
            repaired: reconciled
                .repaired
                .iter()
                .map(|repaired| repaired.target_id)
                .collect(),
            unrepaired: reconciled.unrepaired,
            written_back,
        };
        self.activity.record(
            ActivityKind::ReconcileCompleted,
            map_object(json!({
                "indexed_files": summary.indexed_files,
                "seeded": summary.seeded,
                "repaired": summary.repaired,
                "unrepaired": summary.unrepaired,
                "duration_ms": started.elapsed().as_millis() as u64,
            })),
        );
        self.cache_stats();
        summary
    }

    pub fn generate_image_for(
        &self,
        request: &GenerationRequest,
        progress: Option<ProgressFn<'_>>,
    ) -> GenerationResult {
        report(progress, ProgressStage::Preparing, 5);
        let key = request.cache_key();

        if request.force_refresh() {
            if self.cache.invalidate(&key) {
                debug!("invalidated cached image {} for refresh", key.fragment());
            }
        } else if let Some(outcome) = self.cached_outcome(request, &key)? {
            report(progress, ProgressStage::Complete, 100);
            return Ok(outcome);
        }

        if request.force_refresh() {
            // A refresh must not adopt the result of a run that started before it.
            return self
                .in_flight
                .run_superseding(request.target_id(), || self.produce(request, &key, progress));
        }
        self.in_flight.run_exclusive(request.target_id(), || {
            if let Some(outcome) = self.cached_outcome(request, &key)? {
                report(progress, ProgressStage::Complete, 100);
                return Ok(outcome);
            }
            self.produce(request, &key, progress)
        })
    }

    /// Regenerates the image for a stored target, bypassing any cached entry.
    pub fn regenerate_image_for(
        &self,
        target_id: i64,
        progress: Option<ProgressFn<'_>>,
    ) -> GenerationResult {
        let target = self.load_target(target_id)?;
        let profile = self.profile_or_default();
        let request = request_for_target(&target, &profile, true);
        self.generate_image_for(&request, progress)
    }

    /// Image currently bound to a stored target, without generating anything.
    pub fn get_image_for(&self, target_id: i64) -> Result<Option<String>, GenerationError> {
        Ok(self
            .load_target(target_id)?
            .image_url
            .filter(|url| !url.trim().is_empty()))
    }

    /// Generates sequentially for every stored target without an image.
    pub fn generate_missing_images(
        &self,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<Vec<(i64, GenerationResult)>, GenerationError> {
        let targets = self
            .records
            .list_targets()
            .map_err(|err| self.classifier.classify(&err))?;
        let profile = self.profile_or_default();
        let missing: Vec<TargetRecord> = targets
            .into_iter()
            .filter(|target| {
                target
                    .image_url
                    .as_deref()
                    .map(|url| url.trim().is_empty())
                    .unwrap_or(true)
            })
            .collect();
        info!("{} targets need images", missing.len());

        let mut outcomes = Vec::with_capacity(missing.len());
        for target in missing {
            let request = request_for_target(&target, &profile, false);
            let result = self.generate_image_for(&request, progress);
            if let Err(err) = &result {
                warn!("image for target {} failed: {err}", target.id);
            }
            outcomes.push((target.id, result));
        }
        Ok(outcomes)
    }

    fn cached_outcome(
        &self,
        request: &GenerationRequest,
        key: &CacheKey,
    ) -> Result<Option<ImageOutcome>, GenerationError> {
        let Some(data_uri) = self.cache.get(key) else {
            return Ok(None);
        };
        if let Some(target_id) = request.target_id() {
            let current = self
                .records
                .target(target_id)
                .map_err(|err| persist_error("failed to read target", err))?
                .and_then(|target| target.image_url);
            if current.as_deref() != Some(data_uri.as_str()) {
                self.bind(target_id, &data_uri)?;
            }
        }
        self.activity.record(
            ActivityKind::CacheHit,
            map_object(json!({
                "cache_key": key.fragment(),
                "target_id": request.target_id(),
            })),
        );
        Ok(Some(ImageOutcome {
            image_url: data_uri,
            cache_key: key.clone(),
            from_cache: true,
            attempts: 0,
            file_name: None,
            warnings: Vec::new(),
        }))
    }

    fn produce(
        &self,
        request: &GenerationRequest,
        key: &CacheKey,
        progress: Option<ProgressFn<'_>>,
    ) -> GenerationResult {
        report(progress, ProgressStage::Generating, 20);
        let started = Instant::now();
        let provider_request = ProviderRequest {
            prompt: build_prompt(request),
            reference_image: request.reference_image().map(|path| path.to_path_buf()),
            quality: request.quality(),
            size_hint: request.size_hint().map(str::to_string),
            timeout: self.provider.default_timeout(),
        };
        self.activity.record(
            ActivityKind::GenerationStarted,
            map_object(json!({
                "provider": self.provider.name(),
                "cache_key": key.fragment(),
                "target_id": request.target_id(),
                "force_refresh": request.force_refresh(),
            })),
        );

        let retried = with_retry(&self.retry, &self.classifier, |attempt| {
            debug!(
                "generating {} with {} (attempt {attempt})",
                key.fragment(),
                self.provider.name()
            );
            self.provider.generate(&provider_request)
        });
        let attempts = retried.attempts;
        let result = retried
            .result
            .and_then(|image| {
                report(progress, ProgressStage::Processing, 80);
                self.persist(request, key, image, attempts)
            });

        match &result {
            Ok(outcome) => {
                info!(
                    "generated image {} for target {:?} in {} attempt(s)",
                    key.fragment(),
                    request.target_id(),
                    attempts
                );
                self.activity.record(
                    ActivityKind::GenerationCompleted,
                    map_object(json!({
                        "cache_key": key.fragment(),
                        "target_id": request.target_id(),
                        "attempts": attempts,
                        "file_name": outcome.file_name,
                        "duration_ms": started.elapsed().as_millis() as u64,
                    })),
                );
                report(progress, ProgressStage::Complete, 100);
            }
            Err(err) => {
                warn!("generation for {} failed: {err}", key.fragment());
                self.activity.record(
                    ActivityKind::GenerationFailed,
                    map_object(json!({
                        "cache_key": key.fragment(),
                        "target_id": request.target_id(),
                        "attempts": attempts,
                        "error": err,
                    })),
                );
            }
        }
        result
    }

    fn persist(
        &self,
        request: &GenerationRequest,
        key: &CacheKey,
        image: GeneratedImage,
        attempts: u32,
    ) -> GenerationResult {
        let data_uri = image.data_uri();
        let file_name = self
            .cache
            .files()
            .write(key, request.title(), &image.bytes, image.extension())
            .map_err(|err| persist_error("failed to save image file", err))?;
        self.cache
            .put(key, &data_uri, Some(&file_name), request.target_id());
        if let Some(target_id) = request.target_id() {
            self.bind(target_id, &data_uri)?;
        }
        Ok(ImageOutcome {
            image_url: data_uri,
            cache_key: key.clone(),
            from_cache: false,
            attempts,
            file_name: Some(file_name),
            warnings: image.warnings,
        })
    }

    /// Writes the image to the target's record and confirms it by reading back.
    fn bind(&self, target_id: i64, data_uri: &str) -> Result<(), GenerationError> {
        self.records
            .update_image(target_id, data_uri)
            .map_err(|err| persist_error("failed to save image to target", err))?;
        let stored = self
            .records
            .target(target_id)
            .map_err(|err| persist_error("failed to verify target image", err))?
            .and_then(|target| target.image_url);
        if stored.as_deref() != Some(data_uri) {
            return Err(GenerationError::new(
                GenerationErrorKind::FileSaveError,
                format!("verification failed: target {target_id} does not hold the saved image"),
            ));
        }
        Ok(())
    }

    fn load_target(&self, target_id: i64) -> Result<TargetRecord, GenerationError> {
        self.records
            .target(target_id)
            .map_err(|err| self.classifier.classify(&err))?
            .ok_or_else(|| {
                GenerationError::new(
                    GenerationErrorKind::UnknownError,
                    format!("target {target_id} not found"),
                )
            })
    }

    fn profile_or_default(&self) -> RequesterProfile {
        self.records.requester_profile().unwrap_or_else(|err| {
            warn!("could not read requester profile: {err:#}");
            RequesterProfile::default()
        })
    }
}

/// Request for a stored target. Reference images are not recorded with
/// targets, so none is attached.
pub fn request_for_target(
    target: &TargetRecord,
    profile: &RequesterProfile,
    force_refresh: bool,
) -> GenerationRequest {
    GenerationRequest::builder(target.title.clone())
        .description(target.description.clone())
        .profile_text(profile.description.clone())
        .style(profile.style())
        .target_id(Some(target.id))
        .force_refresh(force_refresh)
        .build()
}

fn report(progress: Option<ProgressFn<'_>>, stage: ProgressStage, percent: u8) {
    if let Some(callback) = progress {
        callback(stage, percent.min(100));
    }
}

fn persist_error(what: &str, err: anyhow::Error) -> GenerationError {
    GenerationError::new(
        GenerationErrorKind::FileSaveError,
        format!("{what}: {}", error_chain_text(&err, 500)),
    )
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::Duration;

    use anyhow::bail;
    use serde_json::Value;
    use taskart_contracts::errors::GenerationErrorKind;
    use taskart_contracts::events::ActivityLog;
    use taskart_contracts::keys::derive_key;
    use taskart_contracts::payload::{
        decode_data_uri, encode_data_uri, inspect_payload, PNG_END_MARKER,
    };
    use taskart_contracts::records::{
        JsonRecordStore, RecordStore, RequesterProfile, TargetRecord,
    };
    use taskart_contracts::request::{GenerationRequest, ImageStyle};

    use super::{request_for_target, ImageOrchestrator, ProgressStage};
    use crate::config::EngineConfig;
    use crate::providers::{
        render_dryrun_png, DryrunProvider, GeneratedImage, ImageProvider, OpenAiProvider,
        ProviderRequest,
    };
    use crate::retry::RetryPolicy;

    struct ScriptedProvider {
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        delay: Duration,
        failures: Mutex<VecDeque<&'static str>>,
    }

    impl ScriptedProvider {
        fn healthy() -> Arc<Self> {
            Self::build(Duration::ZERO, &[])
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Self::build(delay, &[])
        }

        fn failing(failures: &[&'static str]) -> Arc<Self> {
            Self::build(Duration::ZERO, failures)
        }

        fn build(delay: Duration, failures: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                delay,
                failures: Mutex::new(failures.iter().copied().collect()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn max_active(&self) -> usize {
            self.max_active.load(Ordering::SeqCst)
        }
    }

    impl ImageProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn supports_edit(&self) -> bool {
            false
        }

        fn is_configured(&self) -> bool {
            true
        }

        fn default_timeout(&self) -> Duration {
            Duration::from_secs(5)
        }

        fn generate(&self, request: &ProviderRequest) -> anyhow::Result<GeneratedImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.active.fetch_sub(1, Ordering::SeqCst);
            let failure = self
                .failures
                .lock()
                .map_err(|_| anyhow::anyhow!("poisoned"))?
                .pop_front();
            if let Some(message) = failure {
                bail!("{message}");
            }
            DryrunProvider::default().generate(request)
        }
    }

    /// Accepts writes but keeps serving the old image, so verification fails.
    struct ForgetfulRecords {
        inner: JsonRecordStore,
    }

    impl RecordStore for ForgetfulRecords {
        fn list_targets(&self) -> anyhow::Result<Vec<TargetRecord>> {
            self.inner.list_targets()
        }

        fn target(&self, id: i64) -> anyhow::Result<Option<TargetRecord>> {
            self.inner.target(id)
        }

        fn requester_profile(&self) -> anyhow::Result<RequesterProfile> {
            self.inner.requester_profile()
        }

        fn update_image(&self, _id: i64, _image_url: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        }
    }

    fn target(id: i64, title: &str, image_url: Option<String>) -> TargetRecord {
        TargetRecord {
            id,
            title: title.to_string(),
            description: None,
            image_url,
        }
    }

    fn store(dir: &Path, targets: Vec<TargetRecord>) -> anyhow::Result<Arc<JsonRecordStore>> {
        let store = JsonRecordStore::new(dir.join("records.json"));
        for row in targets {
            store.upsert_target(row)?;
        }
        store.set_profile(RequesterProfile {
            description: None,
            style: Some("anime".to_string()),
        })?;
        Ok(Arc::new(store))
    }

    fn orchestrator(
        dir: &Path,
        provider: Arc<dyn ImageProvider>,
        records: Arc<dyn RecordStore>,
    ) -> ImageOrchestrator {
        let config = EngineConfig {
            cache_dir: dir.join("cache"),
            ..EngineConfig::default()
        };
        ImageOrchestrator::new(&config, provider, records).with_retry_policy(fast_retry())
    }

    fn write_report_request() -> GenerationRequest {
        GenerationRequest::builder("Write report")
            .style(ImageStyle::Anime)
            .target_id(Some(7))
            .build()
    }

    #[test]
    fn generated_image_is_bound_and_served_without_new_calls() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let records = store(temp.path(), vec![target(7, "Write report", None)])?;
        let provider = ScriptedProvider::healthy();
        let engine = orchestrator(temp.path(), provider.clone(), records.clone());

        let stages = Mutex::new(Vec::new());
        let on_progress = |stage: ProgressStage, percent: u8| {
            if let Ok(mut stages) = stages.lock() {
                stages.push((stage, percent));
            }
        };
        let outcome = engine.generate_image_for(&write_report_request(), Some(&on_progress))?;
        assert!(outcome.image_url.starts_with("data:image/png;base64,"));
        assert!(!outcome.from_cache);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(inspect_payload(&outcome.image_url), None);
        let seen: Vec<ProgressStage> = stages
            .lock()
            .map(|stages| stages.iter().map(|(stage, _)| *stage).collect())
            .unwrap_or_default();
        assert_eq!(
            seen,
            vec![
                ProgressStage::Preparing,
                ProgressStage::Generating,
                ProgressStage::Processing,
                ProgressStage::Complete
            ]
        );

        assert_eq!(engine.get_image_for(7)?, Some(outcome.image_url.clone()));
        assert_eq!(
            records.target(7)?.and_then(|row| row.image_url),
            Some(outcome.image_url.clone())
        );
        let again = engine.generate_image_for(&write_report_request(), None)?;
        assert!(again.from_cache);
        assert_eq!(again.image_url, outcome.image_url);
        assert_eq!(provider.calls(), 1);

        let file_name = outcome.file_name.unwrap_or_default();
        assert!(file_name.contains("_write-report_"));
        assert!(temp.path().join("cache").join(&file_name).is_file());
        Ok(())
    }

    #[test]
    fn concurrent_requests_for_one_target_call_provider_once() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let records = store(temp.path(), vec![target(7, "Write report", None)])?;
        let provider = ScriptedProvider::slow(Duration::from_millis(150));
        let engine = orchestrator(temp.path(), provider.clone(), records);
        let barrier = Barrier::new(4);

        let urls: Vec<String> = thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        engine.generate_image_for(&write_report_request(), None)
                    })
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|handle| handle.join().ok())
                .filter_map(Result::ok)
                .map(|outcome| outcome.image_url)
                .collect()
        });

        assert_eq!(provider.calls(), 1);
        assert_eq!(urls.len(), 4);
        assert!(urls.windows(2).all(|pair| pair[0] == pair[1]));
        Ok(())
    }

    #[test]
    fn transient_failures_are_retried() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let records = store(temp.path(), vec![target(7, "Write report", None)])?;
        let provider = ScriptedProvider::failing(&[
            "OpenAI request failed (503): overloaded",
            "OpenAI request timed out",
        ]);
        let engine = orchestrator(temp.path(), provider.clone(), records);
        let outcome = engine.generate_image_for(&write_report_request(), None)?;
        assert_eq!(outcome.attempts, 3);
        assert_eq!(provider.calls(), 3);
        Ok(())
    }

    #[test]
    fn permanent_failure_surfaces_classified_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let records = store(temp.path(), vec![target(7, "Write report", None)])?;
        let provider = ScriptedProvider::failing(&["OpenAI request failed (401): Incorrect API key"]);
        let events = temp.path().join("events.jsonl");
        let engine = orchestrator(temp.path(), provider.clone(), records.clone())
            .with_activity_log(ActivityLog::new(&events));

        let err = engine
            .generate_image_for(&write_report_request(), None)
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected failure"))?;
        assert_eq!(err.kind, GenerationErrorKind::ApiKeyInvalid);
        assert!(!err.retryable);
        assert!(!err.user_message.is_empty());
        assert_eq!(provider.calls(), 1);
        assert_eq!(records.target(7)?.and_then(|row| row.image_url), None);

        let raw = std::fs::read_to_string(&events)?;
        let types: Vec<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(types, vec!["generation_started", "generation_failed"]);
        Ok(())
    }

    #[test]
    fn unverified_binding_is_a_file_save_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let inner = JsonRecordStore::new(temp.path().join("records.json"));
        inner.upsert_target(target(7, "Write report", None))?;
        let records = Arc::new(ForgetfulRecords { inner });
        let engine = orchestrator(temp.path(), ScriptedProvider::healthy(), records);

        let err = engine
            .generate_image_for(&write_report_request(), None)
            .err()
            .map(|err| err.kind);
        assert_eq!(err, Some(GenerationErrorKind::FileSaveError));
        Ok(())
    }

    #[test]
    fn regenerate_bypasses_cache() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let records = store(temp.path(), vec![target(7, "Write report", None)])?;
        let provider = ScriptedProvider::healthy();
        let engine = orchestrator(temp.path(), provider.clone(), records);

        let first = engine.regenerate_image_for(7, None)?;
        let second = engine.regenerate_image_for(7, None)?;
        assert!(!first.from_cache);
        assert!(!second.from_cache);
        assert_eq!(first.cache_key, second.cache_key);
        assert_eq!(provider.calls(), 2);

        let missing = engine.regenerate_image_for(99, None).err().map(|err| err.kind);
        assert_eq!(missing, Some(GenerationErrorKind::UnknownError));
        Ok(())
    }

    #[test]
    fn regenerate_during_running_generation_waits_and_produces_its_own() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let records = store(temp.path(), vec![target(7, "Write report", None)])?;
        let provider = ScriptedProvider::slow(Duration::from_millis(300));
        let engine = orchestrator(temp.path(), provider.clone(), records);
        let request = {
            let profile = RequesterProfile {
                description: None,
                style: Some("anime".to_string()),
            };
            request_for_target(&target(7, "Write report", None), &profile, false)
        };

        let (first, refreshed) = thread::scope(|scope| {
            let first = scope.spawn(|| engine.generate_image_for(&request, None));
            thread::sleep(Duration::from_millis(50));
            let refreshed = engine.regenerate_image_for(7, None);
            (first.join(), refreshed)
        });
        let first = first.map_err(|_| anyhow::anyhow!("generation thread panicked"))??;
        let refreshed = refreshed?;

        assert!(!first.from_cache);
        assert!(!refreshed.from_cache);
        assert_eq!(refreshed.attempts, 1);
        assert_eq!(first.cache_key, refreshed.cache_key);
        assert_eq!(provider.calls(), 2);
        assert_eq!(provider.max_active(), 1);
        assert_eq!(engine.get_image_for(7)?, Some(refreshed.image_url));
        Ok(())
    }

    #[test]
    fn warm_up_makes_stored_images_reachable_without_provider() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let stored = encode_data_uri(&render_dryrun_png("stored", 4, 4)?, "image/png");
        let records = store(
            temp.path(),
            vec![
                target(7, "Write report", Some(stored.clone())),
                target(8, "Walk dog", None),
            ],
        )?;
        let provider = ScriptedProvider::healthy();
        let engine = orchestrator(temp.path(), provider.clone(), records.clone());

        let summary = engine.warm_up();
        assert_eq!(summary.seeded, 1);
        assert_eq!(summary.skipped, 1);

        let profile = records.requester_profile()?;
        let row = records.target(7)?.ok_or_else(|| anyhow::anyhow!("missing target"))?;
        let outcome = engine.generate_image_for(&request_for_target(&row, &profile, false), None)?;
        assert!(outcome.from_cache);
        assert_eq!(outcome.image_url, stored);
        assert_eq!(provider.calls(), 0);
        Ok(())
    }

    #[test]
    fn warm_up_repairs_corrupt_payloads_and_writes_them_back() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let good = render_dryrun_png("Write report", 4, 4)?;
        let mut truncated = good.clone();
        truncated.truncate(truncated.len() - PNG_END_MARKER.len());
        let corrupt = encode_data_uri(&truncated, "image/png");
        let records = store(
            temp.path(),
            vec![
                target(7, "Write report", Some(corrupt.clone())),
                target(8, "Walk dog", Some(corrupt.clone())),
            ],
        )?;
        let engine = orchestrator(temp.path(), ScriptedProvider::healthy(), records.clone());
        let key = derive_key("Write report", None, None, ImageStyle::Anime, None);
        engine
            .cache()
            .files()
            .write(&key, "Write report", &good, "png")?;

        let summary = engine.warm_up();
        assert_eq!(summary.indexed_files, 1);
        assert_eq!(summary.repaired, vec![7]);
        assert_eq!(summary.unrepaired, vec![8]);
        assert_eq!(summary.written_back, 1);

        let repaired = records.target(7)?.and_then(|row| row.image_url);
        let bytes = repaired
            .as_deref()
            .and_then(decode_data_uri)
            .map(|(_, bytes)| bytes);
        assert_eq!(bytes, Some(good));
        assert_eq!(records.target(8)?.and_then(|row| row.image_url), Some(corrupt));
        Ok(())
    }

    #[test]
    fn fill_generates_only_for_targets_without_images() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let records = store(
            temp.path(),
            vec![
                target(1, "Write report", None),
                target(2, "Walk dog", Some("https://example.test/dog.png".to_string())),
                target(3, "Buy groceries", Some(" ".to_string())),
            ],
        )?;
        let provider = ScriptedProvider::healthy();
        let engine = orchestrator(temp.path(), provider.clone(), records.clone());

        let outcomes = engine.generate_missing_images(None)?;
        let ids: Vec<i64> = outcomes.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(outcomes.iter().all(|(_, result)| result.is_ok()));
        assert_eq!(provider.calls(), 2);
        assert!(engine.generate_missing_images(None)?.is_empty());
        Ok(())
    }

    #[test]
    fn readiness_requires_configured_provider() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let records = store(temp.path(), Vec::new())?;
        let ready = orchestrator(temp.path(), Arc::new(DryrunProvider::default()), records.clone());
        assert!(ready.is_ready());

        let unconfigured = Arc::new(OpenAiProvider::new(&Default::default(), None));
        let engine = orchestrator(temp.path(), unconfigured, records);
        assert!(!engine.is_ready());
        let err = engine
            .generate_image_for(&write_report_request(), None)
            .err()
            .map(|err| err.kind);
        assert_eq!(err, Some(GenerationErrorKind::ApiKeyMissing));
        Ok(())
    }
}
