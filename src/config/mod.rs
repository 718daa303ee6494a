//! Startup configuration: TOML-backed `[server]`/`[logging]`/`[[rules]]`,
//! following the same `from_file`/`create_example` shape as this codebase's
//! other config loaders. The rule/access-rule persistence store is an
//! out-of-scope collaborator for the library; this is only how the
//! standalone binary seeds a rule set.

use crate::rule::Rule;
use crate::utils::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `None` lets tokio pick its default (num_cpus). Any worker-group
    /// sizing is a runtime-builder hint, not a custom pool.
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            rules: Vec::new(),
        }
    }
}

impl RelayConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| RelayError::Config(format!("failed to read config file: {e}")))?;

        let config: RelayConfig = toml::from_str(&content)
            .map_err(|e| RelayError::Config(format!("failed to parse config: {e}")))?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for rule in &self.rules {
            rule.validate()?;
        }

        for (i, a) in self.rules.iter().enumerate() {
            for b in &self.rules[i + 1..] {
                if a.conflicts_with(b) {
                    return Err(RelayError::RuleConflict(format!(
                        "rule {} conflicts with rule {} on the same bind key",
                        a.id, b.id
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"[server]
# worker_threads = 4

[logging]
level = "info"  # Options: "trace", "debug", "info", "warn", "error"
format = "pretty"  # Options: "pretty", "json"

[[rules]]
id = 1
name = "example-tcp-forward"
source_port = 9000
target_ip = "127.0.0.1"
target_port = 8080
protocol = "TCP"
enabled = true
auto_reconnect = true
reconnect_interval_ms = 1000
max_reconnect_attempts = 10
pool_size = 2

[[rules]]
id = 2
name = "example-udp-forward"
source_port = 9001
target_ip = "127.0.0.1"
target_port = 8081
protocol = "UDP"
udp_mode = "pointtopoint"
enabled = true
"#;

        std::fs::write(path.as_ref(), example)
            .map_err(|e| RelayError::Config(format!("failed to write example config: {e}")))?;

        Ok(())
    }
}
