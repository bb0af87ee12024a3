use crate::constants::{execution, limits, model, network, profile};
use std::time::Duration;

/// Deadline and cap bundle. Every timeout the core applies comes from here;
/// components never read the environment themselves.
#[derive(Debug, Clone)]
pub struct Limits {
    pub connect_deadline: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_deadline: Duration,
    pub heartbeat_failure_threshold: u32,
    pub idle_timeout: Duration,
    pub step_deadline: Duration,
    pub step_deadline_min: Duration,
    pub step_deadline_max: Duration,
    pub generator_deadline: Duration,
    pub probe_deadline: Duration,
    pub capture_limit_bytes: usize,
    pub max_sessions_per_user: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            connect_deadline: Duration::from_millis(network::TIMEOUT_CONNECT_MS),
            heartbeat_interval: Duration::from_millis(network::HEARTBEAT_INTERVAL_MS),
            heartbeat_deadline: Duration::from_millis(network::TIMEOUT_HEARTBEAT_MS),
            heartbeat_failure_threshold: limits::HEARTBEAT_FAILURE_THRESHOLD,
            idle_timeout: Duration::from_millis(network::IDLE_TIMEOUT_MS),
            step_deadline: Duration::from_millis(execution::TIMEOUT_STEP_DEFAULT_MS),
            step_deadline_min: Duration::from_millis(execution::STEP_DEADLINE_MIN_MS),
            step_deadline_max: Duration::from_millis(execution::STEP_DEADLINE_MAX_MS),
            generator_deadline: Duration::from_millis(model::TIMEOUT_GENERATOR_MS),
            probe_deadline: Duration::from_millis(profile::TIMEOUT_PROBE_MS),
            capture_limit_bytes: execution::MAX_CAPTURE_BYTES,
            max_sessions_per_user: limits::MAX_SESSIONS_PER_USER,
        }
    }
}

/// External model endpoint. The core only ever POSTs a chat-completion
/// request here; the vendor SDK stays outside.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Vault key material (hex / raw 32 bytes / base64). Absent means an
    /// ephemeral key is generated at startup.
    pub vault_key: Option<String>,
    pub model: ModelConfig,
    pub limits: Limits,
}

fn env_ms(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
}

impl Config {
    /// Read the configuration surface once, at wiring time.
    pub fn from_env() -> Self {
        let mut limits = Limits::default();
        if let Some(value) = env_ms("OPSGATE_CONNECT_DEADLINE_MS") {
            limits.connect_deadline = value;
        }
        if let Some(value) = env_ms("OPSGATE_HEARTBEAT_INTERVAL_MS") {
            limits.heartbeat_interval = value;
        }
        if let Some(value) = env_ms("OPSGATE_IDLE_TIMEOUT_MS") {
            limits.idle_timeout = value;
        }
        if let Some(value) = env_ms("OPSGATE_STEP_DEADLINE_MS") {
            limits.step_deadline = value;
        }
        if let Some(value) = env_ms("OPSGATE_GENERATOR_DEADLINE_MS") {
            limits.generator_deadline = value;
        }
        if let Some(value) = env_usize("OPSGATE_CAPTURE_LIMIT_BYTES") {
            limits.capture_limit_bytes = value;
        }
        if let Some(value) = env_usize("OPSGATE_MAX_SESSIONS_PER_USER") {
            limits.max_sessions_per_user = value;
        }

        Self {
            vault_key: std::env::var("OPSGATE_VAULT_KEY").ok().filter(|v| !v.trim().is_empty()),
            model: ModelConfig {
                endpoint: std::env::var("OPSGATE_MODEL_ENDPOINT")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
                api_key: std::env::var("OPSGATE_MODEL_API_KEY").unwrap_or_default(),
                model: std::env::var("OPSGATE_MODEL_NAME")
                    .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            },
            limits,
        }
    }
}
