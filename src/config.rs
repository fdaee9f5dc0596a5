use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use std::{env, fs, path};

use crate::queue::RetryPolicy;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "redis_addr_default")]
    pub redis_addr: String,
    #[serde(default = "cache_prefix_default")]
    pub cache_prefix: String,
    #[serde(default = "store_path_default")]
    pub store_path: path::PathBuf,
    #[serde(default = "log_level_default")]
    pub log_level: String,
    #[serde(default = "health_check_port_default")]
    pub health_check_port: u16,
    #[serde(default = "control_port_default")]
    pub control_port: u16,
    /// Lifetime of a dirty marker, bounds how long a lost flush can block its counter.
    #[serde(default = "dirty_marker_ttl_secs_default")]
    pub dirty_marker_ttl_secs: u64,
    /// Flush every known counter on this interval, disabled when unset.
    #[serde(default)]
    pub writeback_interval_secs: Option<u64>,

    #[serde(default)]
    pub queue: QueueConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_addr: redis_addr_default(),
            cache_prefix: cache_prefix_default(),
            store_path: store_path_default(),
            log_level: log_level_default(),
            health_check_port: health_check_port_default(),
            control_port: control_port_default(),
            dirty_marker_ttl_secs: dirty_marker_ttl_secs_default(),
            writeback_interval_secs: None,
            queue: QueueConfig::default(),
        }
    }
}

impl Config {
    fn get_config_dir() -> anyhow::Result<path::PathBuf> {
        let config_dir = if let Ok(xdg_path) = env::var("XDG_CONFIG_HOME") {
            path::PathBuf::from(&xdg_path)
        } else {
            let home = env::var("HOME").with_context(|| "neither XDG_CONFIG_HOME nor HOME is set")?;
            path::Path::new(&home).join(".config")
        };

        Ok(config_dir.join("livecount"))
    }

    pub fn from_path() -> anyhow::Result<Self> {
        let file_path = if let Ok(cfg_path) = env::var("LIVECOUNT_CFG_PATH") {
            path::PathBuf::from(cfg_path)
        } else {
            Self::get_config_dir()
                .with_context(|| "fail to open config directory")?
                .join("config.toml")
        };

        if !file_path.exists() {
            anyhow::bail!("Config file not found in {file_path:?}");
        }
        let content = fs::read_to_string(file_path).with_context(|| "fail to read config file")?;

        toml::from_str(&content).with_context(|| "fail to parse config from toml")
    }

    pub fn dirty_marker_ttl(&self) -> Duration {
        Duration::from_secs(self.dirty_marker_ttl_secs.max(1))
    }

    pub fn writeback_interval(&self) -> Option<Duration> {
        self.writeback_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default = "queue_name_default")]
    pub name: String,
    #[serde(default = "workers_default")]
    pub workers: usize,
    #[serde(default = "max_attempts_default")]
    pub max_attempts: u32,
    #[serde(default = "retry_delay_ms_default")]
    pub retry_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: queue_name_default(),
            workers: workers_default(),
            max_attempts: max_attempts_default(),
            retry_delay_ms: retry_delay_ms_default(),
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

fn redis_addr_default() -> String {
    "redis://localhost:6379".to_string()
}

fn cache_prefix_default() -> String {
    "livecount".to_string()
}

fn store_path_default() -> path::PathBuf {
    path::PathBuf::from("livecount.json")
}

fn health_check_port_default() -> u16 {
    11451
}

fn control_port_default() -> u16 {
    11452
}

fn dirty_marker_ttl_secs_default() -> u64 {
    600
}

fn log_level_default() -> String {
    "INFO".to_string()
}

fn queue_name_default() -> String {
    "livecount-writebacks".to_string()
}

fn workers_default() -> usize {
    4
}

fn max_attempts_default() -> u32 {
    5
}

fn retry_delay_ms_default() -> u64 {
    200
}

#[test]
fn validate_file_correctness() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    let config = r#"
        redis_addr = "redis://localhost"
        log_level = "DEBUG"
        store_path = "/var/lib/livecount/counters.json"
        writeback_interval_secs = 300

        [queue]
        workers = 8
    "#;
    fs::write(&path, config).unwrap();
    std::env::set_var("LIVECOUNT_CFG_PATH", &path);

    let config = Config::from_path().unwrap();
    assert_eq!(config.redis_addr, "redis://localhost");
    assert_eq!(config.cache_prefix, "livecount");
    assert_eq!(config.writeback_interval(), Some(Duration::from_secs(300)));
    assert_eq!(config.queue.workers, 8);
    assert_eq!(config.queue.name, "livecount-writebacks");
    assert_eq!(config.queue.retry_policy().max_attempts, 5);

    std::env::remove_var("LIVECOUNT_CFG_PATH");
}

#[test]
fn empty_config_uses_defaults() {
    let config: Config = toml::from_str("").unwrap();
    assert_eq!(config.health_check_port, 11451);
    assert_eq!(config.store_path, path::PathBuf::from("livecount.json"));
    assert_eq!(config.writeback_interval(), None);
    assert_eq!(config.control_port, 11452);
    assert_eq!(config.dirty_marker_ttl(), Duration::from_secs(600));
}
