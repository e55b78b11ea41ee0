//! Structured, correlation-scoped, secret-redacting logger (C1).
//!
//! Buffers [`LogEntry`] records in memory and flushes them as JSON-lines to
//! `<workdir>/<appdata>/logs/<appname>.log` at most every five seconds.
//! Every accepted record is also forwarded to `tracing` at the matching
//! level so a host binary that installs a `tracing_subscriber` layer sees
//! the same stream without double configuration.

mod redact;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use redact::redact_str;

/// Log level, ordered so that `Level::Error > Level::Warn > ...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    /// Parses the recognized values of `<APP>_LOG_LEVEL`; anything else is
    /// treated as absent (spec §6).
    pub fn from_env_value(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" => Some(Level::Warn),
            "error" => Some(Level::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// A structured error value attached to an `error`-level record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl<E: std::error::Error> From<&E> for ErrorValue {
    fn from(e: &E) -> Self {
        Self {
            name: std::any::type_name::<E>().to_string(),
            message: e.to_string(),
            stack: None,
        }
    }
}

/// One JSON-lines record written to the log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub correlation_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Where flushed records end up.
#[derive(Debug, Clone)]
pub struct LoggerOptions {
    pub level: Option<Level>,
    pub app_name: String,
    pub log_dir: PathBuf,
    pub console: bool,
    pub redact_secrets: bool,
}

impl LoggerOptions {
    pub fn new(app_name: impl Into<String>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            level: None,
            app_name: app_name.into(),
            log_dir: log_dir.into(),
            console: true,
            redact_secrets: true,
        }
    }
}

/// Structured logger. Cheap to clone — all state lives behind `Arc`-shared
/// internals reached through [`Logger::child`].
pub struct Logger {
    inner: std::sync::Arc<Inner>,
    correlation_id: Mutex<String>,
    context: Value,
}

struct Inner {
    level: Level,
    app_name: String,
    log_dir: PathBuf,
    console: bool,
    redact_secrets: bool,
    buffer: Mutex<VecDeque<LogEntry>>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Logger {
    /// Builds a logger. The level threshold is resolved as: `opts.level`,
    /// then `<APP>_LOG_LEVEL` (uppercased app name), then `info` (spec §4.1).
    pub fn new(opts: LoggerOptions) -> std::sync::Arc<Self> {
        let env_key = format!("{}_LOG_LEVEL", opts.app_name.to_ascii_uppercase());
        let level = opts.level.unwrap_or_else(|| {
            std::env::var(&env_key)
                .ok()
                .and_then(|v| Level::from_env_value(&v))
                .unwrap_or(Level::Info)
        });

        let logger = std::sync::Arc::new(Logger {
            inner: std::sync::Arc::new(Inner {
                level,
                app_name: opts.app_name,
                log_dir: opts.log_dir,
                console: opts.console,
                redact_secrets: opts.redact_secrets,
                buffer: Mutex::new(VecDeque::new()),
                flush_handle: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
            correlation_id: Mutex::new(Uuid::new_v4().to_string()),
            context: Value::Null,
        });

        logger.spawn_periodic_flush();
        logger
    }

    fn spawn_periodic_flush(self: &std::sync::Arc<Self>) {
        let this = std::sync::Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                if this.inner.shut_down.load(Ordering::Acquire) {
                    break;
                }
                let has_entries = !this.inner.buffer.lock().unwrap().is_empty();
                if has_entries {
                    this.flush().await;
                }
            }
        });
        *self.inner.flush_handle.lock().unwrap() = Some(handle);
    }

    pub fn set_correlation_id(&self, id: impl Into<String>) {
        *self.correlation_id.lock().unwrap() = id.into();
    }

    pub fn correlation_id(&self) -> String {
        self.correlation_id.lock().unwrap().clone()
    }

    /// Returns a new logger sharing this one's sink and correlation id,
    /// merging `context` into every record it produces.
    pub fn child(self: &std::sync::Arc<Self>, context: Value) -> std::sync::Arc<Self> {
        let merged = merge_context(&self.context, context);
        std::sync::Arc::new(Logger {
            inner: std::sync::Arc::clone(&self.inner),
            correlation_id: Mutex::new(self.correlation_id()),
            context: merged,
        })
    }

    pub fn debug(&self, message: impl Into<String>, context: Option<Value>) {
        self.record(Level::Debug, message.into(), context, None, None);
    }

    pub fn info(&self, message: impl Into<String>, context: Option<Value>) {
        self.record(Level::Info, message.into(), context, None, None);
    }

    pub fn warn(&self, message: impl Into<String>, context: Option<Value>) {
        self.record(Level::Warn, message.into(), context, None, None);
    }

    pub fn error(
        &self,
        message: impl Into<String>,
        context: Option<Value>,
        error: Option<ErrorValue>,
    ) {
        self.record(Level::Error, message.into(), context, error, None);
    }

    fn record(
        &self,
        level: Level,
        message: String,
        context: Option<Value>,
        error: Option<ErrorValue>,
        metadata: Option<Value>,
    ) {
        // Level filtering happens before any serialization or allocation
        // beyond the comparison itself (spec §4.1).
        if level < self.inner.level {
            return;
        }

        let merged_context = merge_optional_context(&self.context, context);
        let (message, merged_context, metadata) = if self.inner.redact_secrets {
            (
                redact_str(&message),
                merged_context.map(|c| redact::redact_value(&c)),
                metadata.map(|m| redact::redact_value(&m)),
            )
        } else {
            (message, merged_context, metadata)
        };

        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            correlation_id: self.correlation_id(),
            message,
            context: merged_context,
            error,
            metadata,
        };

        self.emit_to_tracing(&entry);
        self.inner.buffer.lock().unwrap().push_back(entry);
    }

    fn emit_to_tracing(&self, entry: &LogEntry) {
        match entry.level {
            Level::Debug => tracing::debug!(correlation_id = %entry.correlation_id, "{}", entry.message),
            Level::Info => tracing::info!(correlation_id = %entry.correlation_id, "{}", entry.message),
            Level::Warn => tracing::warn!(correlation_id = %entry.correlation_id, "{}", entry.message),
            Level::Error => tracing::error!(correlation_id = %entry.correlation_id, "{}", entry.message),
        }
    }

    /// Forces the buffered write queue to disk. On write failure, entries
    /// are restored to the head of the buffer so the next flush retries
    /// them (spec §4.1).
    pub async fn flush(&self) {
        let mut drained: Vec<LogEntry> = {
            let mut buf = self.inner.buffer.lock().unwrap();
            buf.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }

        if let Err(e) = self.write_entries(&drained).await {
            if self.inner.console {
                eprintln!("ccore logger: flush failed, will retry: {}", e);
            }
            let mut buf = self.inner.buffer.lock().unwrap();
            for entry in drained.drain(..).rev() {
                buf.push_front(entry);
            }
        }
    }

    async fn write_entries(&self, entries: &[LogEntry]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.inner.log_dir).await?;
        let path = self
            .inner
            .log_dir
            .join(format!("{}.log", self.inner.app_name));

        let mut buf = String::new();
        for entry in entries {
            let line = serde_json::to_string(entry)
                .unwrap_or_else(|e| format!("{{\"error\":\"serialize failed: {}\"}}", e));
            buf.push_str(&line);
            buf.push('\n');
        }

        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        Ok(())
    }

    /// Stops the periodic flusher and flushes once more.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        if let Some(handle) = self.inner.flush_handle.lock().unwrap().take() {
            handle.abort();
        }
        self.flush().await;
    }
}

fn merge_context(base: &Value, extra: Value) -> Value {
    match (base, extra) {
        (Value::Object(base_map), Value::Object(extra_map)) => {
            let mut merged = base_map.clone();
            for (k, v) in extra_map {
                merged.insert(k, v);
            }
            Value::Object(merged)
        }
        (Value::Null, extra) => extra,
        (base, Value::Null) => base.clone(),
        (_, extra) => extra,
    }
}

fn merge_optional_context(base: &Value, extra: Option<Value>) -> Option<Value> {
    match (base, extra) {
        (Value::Null, None) => None,
        (Value::Null, Some(e)) => Some(e),
        (base, None) => Some(base.clone()),
        (base, Some(e)) => Some(merge_context(base, e)),
    }
}

static GLOBAL_LOGGER: std::sync::OnceLock<std::sync::Arc<Logger>> = std::sync::OnceLock::new();

/// Installs the process-wide convenience logger. Idempotent — later calls
/// are ignored if a logger is already installed (Design Note "Global
/// singletons": components should still prefer an injected logger; this
/// exists only for hosts that want a single ambient instance).
pub fn init_logger(opts: LoggerOptions) -> std::sync::Arc<Logger> {
    GLOBAL_LOGGER.get_or_init(|| Logger::new(opts)).clone()
}

/// Returns the process-wide logger, initializing one with defaults rooted
/// at `./.ccore/logs` if none has been installed yet.
pub fn get_logger() -> std::sync::Arc<Logger> {
    GLOBAL_LOGGER
        .get_or_init(|| Logger::new(LoggerOptions::new("ccore", "./.ccore/logs")))
        .clone()
}
