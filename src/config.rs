//! Process-wide configuration.
//!
//! Loaded once at startup from `dropdeploy.toml` (path overridable with
//! `--config`), with per-key environment overrides (`DROPDEPLOY_*`) layered
//! on top. Missing file means defaults.
//!
//! ```toml
//! projects_root = "/var/lib/dropdeploy/projects"
//! container_engine_socket = "/var/run/docker.sock"
//! queue_host = "127.0.0.1"
//! queue_port = 6379
//! memory_limit_bytes = 536870912
//! cpu_shares = 1024
//! container_prefix = "dropdeploy"
//! subdomain_base = "example.app"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory holding one cloned working tree per project slug.
    #[serde(default = "default_projects_root")]
    pub projects_root: PathBuf,

    /// Container-engine data root. Informational; the engine owns it.
    #[serde(default = "default_docker_data_root")]
    pub docker_data_root: PathBuf,

    /// Control socket for the container engine.
    #[serde(default = "default_engine_socket")]
    pub container_engine_socket: String,

    #[serde(default = "default_queue_host")]
    pub queue_host: String,

    #[serde(default = "default_queue_port")]
    pub queue_port: u16,

    /// Hard memory cap applied to every project container.
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: i64,

    /// CPU-share weight applied to every project container.
    #[serde(default = "default_cpu_shares")]
    pub cpu_shares: i64,

    /// Prefix for container names (`<prefix>-<slug>`) and the image
    /// namespace (`<prefix>/<slug>:latest`).
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,

    /// Base domain the reverse proxy serves subdomains under.
    /// Informational to the core.
    #[serde(default = "default_subdomain_base")]
    pub subdomain_base: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
}

fn default_projects_root() -> PathBuf {
    PathBuf::from("/var/lib/dropdeploy/projects")
}

fn default_docker_data_root() -> PathBuf {
    PathBuf::from("/var/lib/docker")
}

fn default_engine_socket() -> String {
    "/var/run/docker.sock".to_string()
}

fn default_queue_host() -> String {
    "127.0.0.1".to_string()
}

fn default_queue_port() -> u16 {
    6379
}

fn default_memory_limit() -> i64 {
    512 * 1024 * 1024
}

fn default_cpu_shares() -> i64 {
    1024
}

fn default_container_prefix() -> String {
    "dropdeploy".to_string()
}

fn default_subdomain_base() -> String {
    "example.app".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/dropdeploy/dropdeploy.db")
}

fn default_api_port() -> u16 {
    4100
}

fn default_worker_concurrency() -> usize {
    5
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("defaults deserialize from empty config")
    }
}

impl Config {
    /// Load configuration: file (if present) -> environment -> result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new("dropdeploy.toml"));
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("DROPDEPLOY_PROJECTS_ROOT") {
            self.projects_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DROPDEPLOY_DOCKER_DATA_ROOT") {
            self.docker_data_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DROPDEPLOY_ENGINE_SOCKET") {
            self.container_engine_socket = v;
        }
        if let Ok(v) = std::env::var("DROPDEPLOY_QUEUE_HOST") {
            self.queue_host = v;
        }
        if let Ok(v) = std::env::var("DROPDEPLOY_QUEUE_PORT") {
            self.queue_port = v.parse().context("Invalid DROPDEPLOY_QUEUE_PORT")?;
        }
        if let Ok(v) = std::env::var("DROPDEPLOY_MEMORY_LIMIT_BYTES") {
            self.memory_limit_bytes = v.parse().context("Invalid DROPDEPLOY_MEMORY_LIMIT_BYTES")?;
        }
        if let Ok(v) = std::env::var("DROPDEPLOY_CPU_SHARES") {
            self.cpu_shares = v.parse().context("Invalid DROPDEPLOY_CPU_SHARES")?;
        }
        if let Ok(v) = std::env::var("DROPDEPLOY_CONTAINER_PREFIX") {
            self.container_prefix = v;
        }
        if let Ok(v) = std::env::var("DROPDEPLOY_SUBDOMAIN_BASE") {
            self.subdomain_base = v;
        }
        if let Ok(v) = std::env::var("DROPDEPLOY_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DROPDEPLOY_API_PORT") {
            self.api_port = v.parse().context("Invalid DROPDEPLOY_API_PORT")?;
        }
        if let Ok(v) = std::env::var("DROPDEPLOY_WORKER_CONCURRENCY") {
            self.worker_concurrency = v.parse().context("Invalid DROPDEPLOY_WORKER_CONCURRENCY")?;
        }
        Ok(())
    }

    /// Connection URL for the queue backend.
    pub fn queue_url(&self) -> String {
        format!("redis://{}:{}/", self.queue_host, self.queue_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    // `Config::load` reads the process environment, so every test touching
    // it serializes on this lock.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.container_prefix, "dropdeploy");
        assert_eq!(config.memory_limit_bytes, 512 * 1024 * 1024);
        assert_eq!(config.cpu_shares, 1024);
        assert_eq!(config.queue_port, 6379);
        assert_eq!(config.worker_concurrency, 5);
        assert_eq!(config.queue_url(), "redis://127.0.0.1:6379/");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.container_prefix, "dropdeploy");
    }

    #[test]
    fn test_load_partial_file_keeps_other_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("dropdeploy.toml");
        fs::write(
            &path,
            r#"
container_prefix = "preview"
queue_host = "queue.internal"
memory_limit_bytes = 268435456
"#,
        )
        .unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.container_prefix, "preview");
        assert_eq!(config.queue_host, "queue.internal");
        assert_eq!(config.memory_limit_bytes, 256 * 1024 * 1024);
        assert_eq!(config.queue_port, 6379);
        assert_eq!(config.cpu_shares, 1024);
    }

    #[test]
    fn test_load_invalid_toml_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("dropdeploy.toml");
        fs::write(&path, "not valid toml {{{{").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("dropdeploy.toml");
        fs::write(&path, "queue_port = 7000\n").unwrap();

        unsafe { std::env::set_var("DROPDEPLOY_QUEUE_PORT", "7777") };
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.queue_port, 7777);

        unsafe { std::env::set_var("DROPDEPLOY_QUEUE_PORT", "lots") };
        assert!(Config::load(Some(&path)).is_err());
        unsafe { std::env::remove_var("DROPDEPLOY_QUEUE_PORT") };
    }
}
