//! Layered runtime configuration.
//!
//! Values resolve in three layers: an optional `crucible.toml` file, then
//! `CRUCIBLE_*` environment variables, then CLI flags (applied by `main`).
//! Every field has a default, so a bare binary with no config file starts
//! with a working local setup.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//!
//! [scheduler]
//! workers = 10
//! admission_slack = 2
//! submit_timeout_secs = 5
//! result_retention_secs = 86400
//! sweep_interval_secs = 3600
//!
//! [agent]
//! base_url = "http://localhost:8000"
//! analyze_timeout_secs = 30
//! convert_timeout_secs = 60
//! test_timeout_secs = 45
//! retry_count = 3
//!
//! [git]
//! clone_timeout_secs = 600
//! analyze_timeout_secs = 300
//!
//! [websocket]
//! ping_interval_secs = 30
//! pong_timeout_secs = 60
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub agent: AgentConfig,
    pub git: GitConfig,
    pub websocket: WsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Permissive CORS for local frontend development.
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of concurrent worker routines, i.e. the cap on tasks in
    /// `running` state at once.
    pub workers: usize,
    /// Queue capacity = workers × admission_slack.
    pub admission_slack: usize,
    /// How long `submit` waits for a queue slot before rejecting with a
    /// saturation error.
    pub submit_timeout_secs: u64,
    /// Age past `completed_at` after which a terminal task is evicted.
    pub result_retention_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            admission_slack: 2,
            submit_timeout_secs: 5,
            result_retention_secs: 24 * 60 * 60,
            sweep_interval_secs: 60 * 60,
        }
    }
}

impl SchedulerConfig {
    pub fn queue_capacity(&self) -> usize {
        (self.workers * self.admission_slack).max(1)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub base_url: String,
    pub analyze_timeout_secs: u64,
    pub convert_timeout_secs: u64,
    pub test_timeout_secs: u64,
    /// Retries on top of the first attempt, for timeouts/429/5xx only.
    pub retry_count: u32,
    pub backoff_base_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            analyze_timeout_secs: 30,
            convert_timeout_secs: 60,
            test_timeout_secs: 45,
            retry_count: 3,
            backoff_base_ms: 500,
        }
    }
}

impl AgentConfig {
    pub fn analyze_timeout(&self) -> Duration {
        Duration::from_secs(self.analyze_timeout_secs)
    }

    pub fn convert_timeout(&self) -> Duration {
        Duration::from_secs(self.convert_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub clone_timeout_secs: u64,
    pub analyze_timeout_secs: u64,
    pub history_timeout_secs: u64,
    pub diff_timeout_secs: u64,
    /// Files larger than this are skipped by the repository census.
    pub max_file_size: u64,
    pub allowed_extensions: Vec<String>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            clone_timeout_secs: 10 * 60,
            analyze_timeout_secs: 5 * 60,
            history_timeout_secs: 2 * 60,
            diff_timeout_secs: 60,
            max_file_size: 10 * 1024 * 1024,
            allowed_extensions: [".py", ".js", ".java", ".cpp", ".c", ".go", ".rs", ".ts"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl GitConfig {
    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }

    pub fn analyze_timeout(&self) -> Duration {
        Duration::from_secs(self.analyze_timeout_secs)
    }

    pub fn history_timeout(&self) -> Duration {
        Duration::from_secs(self.history_timeout_secs)
    }

    pub fn diff_timeout(&self) -> Duration {
        Duration::from_secs(self.diff_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WsConfig {
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
    /// Outbound event buffer per subscriber; a subscriber this far behind
    /// is dropped.
    pub send_buffer: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            pong_timeout_secs: 60,
            send_buffer: 256,
        }
    }
}

impl WsConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// "pretty" or "json".
    pub format: String,
    /// Log to this file instead of stdout when set.
    pub file: Option<std::path::PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: "pretty".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration. An explicitly provided path must exist; the
    /// default `crucible.toml` is optional. Environment overrides are
    /// applied on top of whatever the file provided.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?
            }
            None => {
                let default_path = Path::new("crucible.toml");
                if default_path.exists() {
                    let raw = std::fs::read_to_string(default_path)
                        .context("Failed to read crucible.toml")?;
                    toml::from_str(&raw).context("Failed to parse crucible.toml")?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("CRUCIBLE_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("CRUCIBLE_PORT")
            && let Ok(port) = port.parse()
        {
            self.server.port = port;
        }
        if let Ok(url) = std::env::var("CRUCIBLE_AGENT_URL") {
            self.agent.base_url = url;
        }
        if let Ok(workers) = std::env::var("CRUCIBLE_WORKERS")
            && let Ok(workers) = workers.parse()
        {
            self.scheduler.workers = workers;
        }
        if let Ok(retention) = std::env::var("CRUCIBLE_RESULT_RETENTION_SECS")
            && let Ok(retention) = retention.parse()
        {
            self.scheduler.result_retention_secs = retention;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.scheduler.workers == 0 {
            bail!("scheduler.workers must be at least 1");
        }
        if self.scheduler.admission_slack == 0 {
            bail!("scheduler.admission_slack must be at least 1");
        }
        if self.agent.base_url.is_empty() {
            bail!("agent.base_url cannot be empty");
        }
        if self.logging.format != "pretty" && self.logging.format != "json" {
            bail!(
                "logging.format must be \"pretty\" or \"json\", got \"{}\"",
                self.logging.format
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.workers, 10);
        assert_eq!(config.scheduler.queue_capacity(), 20);
        assert_eq!(config.agent.analyze_timeout(), Duration::from_secs(30));
        assert_eq!(config.websocket.ping_interval(), Duration::from_secs(30));
        assert!(config.websocket.pong_timeout() > config.websocket.ping_interval());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crucible.toml");
        fs::write(
            &path,
            r#"
[server]
port = 9999

[scheduler]
workers = 3
admission_slack = 4

[agent]
base_url = "http://agent:8000"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.scheduler.workers, 3);
        assert_eq!(config.scheduler.queue_capacity(), 12);
        assert_eq!(config.agent.base_url, "http://agent:8000");
        // Untouched sections keep their defaults.
        assert_eq!(config.git.clone_timeout_secs, 600);
    }

    #[test]
    fn test_explicit_missing_file_errors() {
        let result = Config::load(Some(Path::new("/nonexistent/crucible.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = Config::default();
        config.scheduler.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_logging_format_rejected() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_capacity_never_zero() {
        let mut config = SchedulerConfig::default();
        config.workers = 1;
        config.admission_slack = 1;
        assert_eq!(config.queue_capacity(), 1);
    }
}
