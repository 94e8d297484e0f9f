use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CrewflowError, Result};

/// Top-level Crewflow configuration (`crewflow.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub crew: CrewConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Allow any origin (development setups with a separate frontend).
    #[serde(default = "default_cors_permissive")]
    pub cors_permissive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_permissive: default_cors_permissive(),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }
fn default_cors_permissive() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> String { "~/.crewflow/crewflow.db".to_string() }

impl StorageConfig {
    /// Resolve the database path (expand ~).
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(rest) = self.database_path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.database_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum number of runs executing at once.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Jobs accepted before `submit` starts rejecting.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_pool_size() -> usize { 4 }
fn default_queue_capacity() -> usize { 256 }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Local,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Per-observer channel capacity. Observers that fall this far behind are dropped.
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            observer_buffer: default_observer_buffer(),
            transport: TransportKind::default(),
            redis_url: default_redis_url(),
        }
    }
}

fn default_observer_buffer() -> usize { 128 }
fn default_redis_url() -> String { "redis://127.0.0.1:6379".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrewConfig {
    /// Base URL of the crew service. Crew steps fail when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_crew_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for CrewConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_crew_timeout(),
            api_key: None,
        }
    }
}

fn default_crew_timeout() -> u64 { 600 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| CrewflowError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Like [`AppConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(CrewflowError::ConfigNotFound(_)) => Ok(Self::default()),
            other => other,
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        toml::from_str(&expanded).map_err(|e| CrewflowError::Config(e.to_string()))
    }

    /// Default config location: `~/.crewflow/crewflow.toml`.
    pub fn default_path() -> PathBuf {
        dirs_home()
            .map(|home| home.join(".crewflow").join("crewflow.toml"))
            .unwrap_or_else(|| PathBuf::from("crewflow.toml"))
    }
}

fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables are left as written
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
