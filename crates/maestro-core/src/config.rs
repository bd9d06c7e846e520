use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Engine constants, shared across crates so the numbers live in one place.
pub const DEFAULT_PORT: u16 = 18990;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Hard cap on a single decoder input line. Lines beyond this are dropped
/// and the accumulator reset (defense against a child that never newlines).
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;
/// Bytes of child stderr retained for error reporting.
pub const STDERR_TAIL_BYTES: usize = 8 * 1024;
/// Characters of stderr surfaced to clients on a non-zero exit.
pub const STDERR_REPORT_CHARS: usize = 1000;
/// `partial_text` is flushed to the store every Nth streamed text chunk.
pub const PARTIAL_TEXT_FLUSH_EVERY: u32 = 5;
/// Auto-continuation budget per turn when the assistant stops early.
pub const MAX_AUTO_CONTINUES: u32 = 3;
/// Prompt sent on auto-continuation.
pub const CONTINUE_PROMPT: &str = "Continue where you left off. Complete the remaining work.";
/// Per-task retry budget before a failed task is cancelled for good.
pub const TASK_RETRY_LIMIT: u32 = 2;
/// Scheduler wakes at least this often even without kicks.
pub const SCHEDULER_TICK_SECS: u64 = 15;
/// Grace between the polite termination signal and the forced kill.
pub const KILL_GRACE_SECS: u64 = 3;
/// An in-flight turn with no connected subscriber is cancelled after this.
pub const IDLE_EVICT_SECS: u64 = 30 * 60;
/// Pending ask-user questions resolve with a default answer after this.
pub const ASK_TIMEOUT_SECS: u64 = 5 * 60;
/// Proxy queue capacity; overflow is silently dropped.
pub const PROXY_QUEUE_CAP: usize = 1000;
/// Assembled prompt cache capacity (insertion-ordered eviction).
pub const PROMPT_CACHE_CAP: usize = 32;
/// Delay before the recovery supervisor runs after startup.
pub const RECOVERY_DELAY_SECS: u64 = 3;
/// Graceful-shutdown fuse: hard-exit if teardown hangs past this.
pub const SHUTDOWN_FUSE_SECS: u64 = 10;

/// Top-level config (maestro.toml + MAESTRO_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaestroConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl Default for MaestroConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            assistant: AssistantConfig::default(),
            database: DatabaseConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token clients present on WS upgrade. `None` disables the check
    /// (trusted-network deployments only).
    pub auth_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    /// The assistant CLI binary to spawn.
    #[serde(default = "default_command")]
    pub command: String,
    /// Model alias passed through when the client does not pick one.
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Path to the skills/plugins config file (JSON).
    pub library_path: Option<String>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            default_model: default_model(),
            library_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Operational knobs. Every field has an env override via the MAESTRO_LIMITS_
/// prefix, e.g. `MAESTRO_LIMITS_MAX_TASK_WORKERS=8`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Global subprocess timeout in milliseconds.
    #[serde(default = "default_max_subprocess_ms")]
    pub max_subprocess_ms: u64,
    /// Concurrent independent (session-less) kanban tasks.
    #[serde(default = "default_max_task_workers")]
    pub max_task_workers: usize,
    /// Sessions idle longer than this are garbage-collected.
    #[serde(default = "default_session_ttl_days")]
    pub session_ttl_days: u32,
    /// Store maintenance cadence.
    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_subprocess_ms: default_max_subprocess_ms(),
            max_task_workers: default_max_task_workers(),
            session_ttl_days: default_session_ttl_days(),
            cleanup_interval_hours: default_cleanup_interval_hours(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_command() -> String {
    "claude".to_string()
}
fn default_model() -> String {
    "sonnet".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.maestro/maestro.db", home)
}
fn default_max_subprocess_ms() -> u64 {
    1_800_000
}
fn default_max_task_workers() -> usize {
    5
}
fn default_session_ttl_days() -> u32 {
    30
}
fn default_cleanup_interval_hours() -> u32 {
    24
}

impl MaestroConfig {
    /// Load config from a TOML file with MAESTRO_* env var overrides
    /// (double underscore separates sections: `MAESTRO_GATEWAY__PORT`).
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.maestro/maestro.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let mut config: MaestroConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("MAESTRO_").split("__"))
            .extract()
            .map_err(|e| crate::error::MaestroError::Config(e.to_string()))?;

        // Bare operational knobs, kept for compatibility with existing
        // deployments.
        if let Some(v) = env_u64("MAX_SUBPROCESS_MS") {
            config.limits.max_subprocess_ms = v;
        }
        if let Some(v) = env_u64("MAX_TASK_WORKERS") {
            config.limits.max_task_workers = v as usize;
        }
        if let Some(v) = env_u64("SESSION_TTL_DAYS") {
            config.limits.session_ttl_days = v as u32;
        }
        if let Some(v) = env_u64("CLEANUP_INTERVAL_HOURS") {
            config.limits.cleanup_interval_hours = v as u32;
        }

        Ok(config)
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.maestro/maestro.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.max_subprocess_ms, 1_800_000);
        assert_eq!(limits.max_task_workers, 5);
        assert_eq!(limits.session_ttl_days, 30);
        assert_eq!(limits.cleanup_interval_hours, 24);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = MaestroConfig::load(Some("/nonexistent/maestro.toml"))
            .expect("load with absent file should fall back to defaults");
        assert_eq!(config.gateway.port, DEFAULT_PORT);
        assert_eq!(config.assistant.command, "claude");
    }
}
