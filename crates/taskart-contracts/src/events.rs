use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    CacheHit,
    GenerationStarted,
    GenerationCompleted,
    GenerationFailed,
    ReconcileCompleted,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::CacheHit => "cache_hit",
            ActivityKind::GenerationStarted => "generation_started",
            ActivityKind::GenerationCompleted => "generation_completed",
            ActivityKind::GenerationFailed => "generation_failed",
            ActivityKind::ReconcileCompleted => "reconcile_completed",
        }
    }
}

/// Session-scoped JSONL record of what the engine did.
///
/// Every line carries `type`, `session_id` and `ts`; the event's own fields
/// follow and never replace those three. A log built with [`ActivityLog::disabled`]
/// still stamps events but writes nothing.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    sink: Option<PathBuf>,
    session_id: String,
    write_lock: Mutex<()>,
}

impl ActivityLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_sink(Some(path.into()))
    }

    pub fn disabled() -> Self {
        Self::with_sink(None)
    }

    fn with_sink(sink: Option<PathBuf>) -> Self {
        Self {
            shared: Arc::new(Shared {
                sink,
                session_id: uuid::Uuid::new_v4().to_string(),
                write_lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.shared.sink.as_deref()
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// Stamps the event and appends it to the log, returning the stamped line.
    pub fn emit(&self, kind: ActivityKind, fields: EventPayload) -> anyhow::Result<Value> {
        let mut line = EventPayload::new();
        for (key, value) in fields {
            if !matches!(key.as_str(), "type" | "session_id" | "ts") {
                line.insert(key, value);
            }
        }
        line.insert("type".to_string(), Value::from(kind.as_str()));
        line.insert("session_id".to_string(), Value::from(self.session_id()));
        line.insert(
            "ts".to_string(),
            Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)),
        );
        let line = Value::Object(line);

        if let Some(sink) = self.shared.sink.as_deref() {
            self.append(sink, &line)?;
        }
        Ok(line)
    }

    /// [`ActivityLog::emit`] for callers that must not fail on logging.
    pub fn record(&self, kind: ActivityKind, fields: EventPayload) {
        if let Err(err) = self.emit(kind, fields) {
            tracing::warn!("activity log write failed for {}: {err:#}", kind.as_str());
        }
    }

    fn append(&self, sink: &Path, line: &Value) -> anyhow::Result<()> {
        if let Some(parent) = sink.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut encoded = serde_json::to_vec(line)?;
        encoded.push(b'\n');
        let _guard = self
            .shared
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("activity log lock poisoned"))?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(sink)
            .and_then(|mut file| file.write_all(&encoded))
            .with_context(|| format!("failed to append to {}", sink.display()))
    }
}
