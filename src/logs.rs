use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::model::BuildId;

const MASK: &str = "******";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
}

/// Destination of job log lines. Rendering is up to the implementation.
pub trait LogSink: Send + Sync {
    fn append(&self, build_id: BuildId, line: LogLine);
}

/// Per-build job log writer that masks secrets before lines leave the node.
#[derive(Clone)]
pub struct JobLogger {
    build_id: BuildId,
    masks: Arc<Vec<String>>,
    sink: Arc<dyn LogSink>,
}

impl std::fmt::Debug for JobLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLogger")
            .field("build_id", &self.build_id)
            .field("masks", &self.masks.len())
            .finish()
    }
}

impl JobLogger {
    pub fn new(build_id: BuildId, sink: Arc<dyn LogSink>) -> Self {
        Self {
            build_id,
            masks: Arc::new(Vec::new()),
            sink,
        }
    }

    /// Values replaced by a mask in every line. Empty values are ignored.
    pub fn with_masks(mut self, masks: impl IntoIterator<Item = String>) -> Self {
        let mut masks: Vec<String> = masks.into_iter().filter(|m| !m.is_empty()).collect();
        // Longest first so a secret containing another is masked whole
        masks.sort_by_key(|m| std::cmp::Reverse(m.len()));
        masks.dedup();
        self.masks = Arc::new(masks);
        self
    }

    pub fn build_id(&self) -> BuildId {
        self.build_id
    }

    pub fn log(&self, message: impl AsRef<str>) {
        self.write(LogLevel::Info, message.as_ref());
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.write(LogLevel::Warning, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.write(LogLevel::Error, message.as_ref());
    }

    fn write(&self, level: LogLevel, message: &str) {
        let mut message = message.to_string();
        for mask in self.masks.iter() {
            if message.contains(mask.as_str()) {
                message = message.replace(mask.as_str(), MASK);
            }
        }
        self.sink.append(self.build_id, LogLine { level, message });
    }
}

/// Job logs kept in memory, mostly for tests and single node use.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    lines: Mutex<HashMap<BuildId, Vec<LogLine>>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self, build_id: BuildId) -> Vec<LogLine> {
        self.lines
            .lock()
            .get(&build_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains(&self, build_id: BuildId, text: &str) -> bool {
        self.lines(build_id)
            .iter()
            .any(|line| line.message.contains(text))
    }
}

impl LogSink for MemoryLogSink {
    fn append(&self, build_id: BuildId, line: LogLine) {
        self.lines.lock().entry(build_id).or_default().push(line);
    }
}

/// Forwards job log lines to `tracing`, for nodes without a log store.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn append(&self, build_id: BuildId, line: LogLine) {
        match line.level {
            LogLevel::Info => tracing::info!(build_id = %build_id, "{}", line.message),
            LogLevel::Warning => tracing::warn!(build_id = %build_id, "{}", line.message),
            LogLevel::Error => tracing::error!(build_id = %build_id, "{}", line.message),
        }
    }
}
