use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" | "trace" => Some(LogLevel::Debug),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

#[derive(Debug, Default)]
struct Emitted {
    error: AtomicU64,
    warn: AtomicU64,
    info: AtomicU64,
    debug: AtomicU64,
}

/// Scoped stderr logger shared by every component. Child loggers extend the
/// scope (`opsgate:sessions:reaper`) and share the emission counters.
#[derive(Debug, Clone)]
pub struct Logger {
    scope: String,
    level: LogLevel,
    emitted: Arc<Emitted>,
}

impl Logger {
    pub fn new(scope: &str) -> Self {
        let level = std::env::var("OPSGATE_LOG_LEVEL")
            .ok()
            .and_then(|raw| LogLevel::parse(&raw))
            .unwrap_or(LogLevel::Info);
        Self {
            scope: scope.to_string(),
            level,
            emitted: Arc::new(Emitted::default()),
        }
    }

    pub fn with_level(scope: &str, level: LogLevel) -> Self {
        Self {
            scope: scope.to_string(),
            level,
            emitted: Arc::new(Emitted::default()),
        }
    }

    pub fn child(&self, suffix: &str) -> Self {
        let scope = if suffix.is_empty() {
            self.scope.clone()
        } else {
            format!("{}:{}", self.scope, suffix)
        };
        Self {
            scope,
            level: self.level,
            emitted: self.emitted.clone(),
        }
    }

    fn emit(&self, level: LogLevel, message: &str, meta: Option<&serde_json::Value>) {
        if level > self.level {
            return;
        }
        let counter = match level {
            LogLevel::Error => &self.emitted.error,
            LogLevel::Warn => &self.emitted.warn,
            LogLevel::Info => &self.emitted.info,
            LogLevel::Debug => &self.emitted.debug,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        let suffix = match meta {
            Some(value) if !value.is_null() => format!(" {}", value),
            _ => String::new(),
        };
        eprintln!(
            "[{}] {} [{}] {}{}",
            chrono::Utc::now().to_rfc3339(),
            level.label(),
            self.scope,
            message,
            suffix
        );
    }

    pub fn error(&self, message: &str, meta: Option<&serde_json::Value>) {
        self.emit(LogLevel::Error, message, meta);
    }

    pub fn warn(&self, message: &str, meta: Option<&serde_json::Value>) {
        self.emit(LogLevel::Warn, message, meta);
    }

    pub fn info(&self, message: &str, meta: Option<&serde_json::Value>) {
        self.emit(LogLevel::Info, message, meta);
    }

    pub fn debug(&self, message: &str, meta: Option<&serde_json::Value>) {
        self.emit(LogLevel::Debug, message, meta);
    }

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "scope": self.scope,
            "error": self.emitted.error.load(Ordering::Relaxed),
            "warn": self.emitted.warn.load(Ordering::Relaxed),
            "info": self.emitted.info.load(Ordering::Relaxed),
            "debug": self.emitted.debug.load(Ordering::Relaxed),
        })
    }
}
