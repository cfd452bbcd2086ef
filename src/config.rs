use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "AGENT_DASHBOARD_CONFIG";
pub const DATA_DIR_ENV: &str = "AGENT_DASHBOARD_DATA_DIR";
pub const BIND_ENV: &str = "AGENT_DASHBOARD_BIND";
pub const STORE_ENV: &str = "AGENT_DASHBOARD_STORE";
pub const CODEX_ENV: &str = "AGENT_DASHBOARD_CODEX";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendPreference {
    #[default]
    Auto,
    Sqlite,
    Json,
}

impl StoreBackendPreference {
    fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "sqlite" => Ok(Self::Sqlite),
            "json" => Ok(Self::Json),
            other => Err(AppError::Validation(format!("Unknown store backend '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CompanionConfig {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub client_name: String,
    pub client_title: String,
    pub client_version: String,
    pub request_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub restart_base_ms: u64,
    pub restart_max_ms: u64,
    pub log_capacity: usize,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            program: "codex".to_string(),
            args: vec!["app-server".to_string()],
            cwd: None,
            client_name: "local_agent_dashboard".to_string(),
            client_title: "Local Agent Dashboard".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout_ms: 60_000,
            handshake_timeout_ms: 15_000,
            restart_base_ms: 1_000,
            restart_max_ms: 30_000,
            log_capacity: 200,
        }
    }
}

impl CompanionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Delay before restart attempt number `failures` (0-based), doubling and capped.
    pub fn restart_delay(&self, failures: u32) -> Duration {
        let factor = 2_u64.saturating_pow(failures.min(32));
        let delay = self.restart_base_ms.saturating_mul(factor).min(self.restart_max_ms);
        Duration::from_millis(delay)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RunnerConfig {
    pub snippet_max_chars: usize,
    pub summary_max_chars: usize,
    pub notify_min_idle_secs: u64,
    pub agent_program: String,
    pub default_test_command: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            snippet_max_chars: 240,
            summary_max_chars: 160,
            notify_min_idle_secs: 30,
            agent_program: "codex".to_string(),
            default_test_command: "npm test".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub bind: String,
    pub store: StoreBackendPreference,
    pub log_filter: String,
    pub companion: CompanionConfig,
    pub runner: RunnerConfig,
    pub notify: NotifyConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bind: "127.0.0.1:8787".to_string(),
            store: StoreBackendPreference::Auto,
            log_filter: "info".to_string(),
            companion: CompanionConfig::default(),
            runner: RunnerConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl AppConfig {
    /// Resolves the configuration once at startup: YAML file first, then
    /// environment overrides.
    pub fn load() -> AppResult<Self> {
        let data_dir_override = std::env::var(DATA_DIR_ENV).ok().map(PathBuf::from);
        let config_path = std::env::var(CONFIG_PATH_ENV)
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                data_dir_override
                    .clone()
                    .unwrap_or_else(default_data_dir)
                    .join("config.yaml")
            });

        let mut config = if config_path.exists() {
            Self::from_yaml_file(&config_path)?
        } else {
            Self::default()
        };

        if let Some(dir) = data_dir_override {
            config.data_dir = dir;
        }
        if let Ok(bind) = std::env::var(BIND_ENV) {
            config.bind = bind;
        }
        if let Ok(store) = std::env::var(STORE_ENV) {
            config.store = StoreBackendPreference::parse(&store)?;
        }
        if let Ok(program) = std::env::var(CODEX_ENV) {
            config.companion.program = program.clone();
            config.runner.agent_program = program;
        }

        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> AppResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("state.sqlite")
    }

    pub fn json_state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(unix)]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local-agent-dashboard");
        }
    }

    #[cfg(windows)]
    {
        if let Ok(home) = std::env::var("USERPROFILE") {
            return PathBuf::from(home).join(".local-agent-dashboard");
        }
    }

    PathBuf::from(".local-agent-dashboard")
}
