//! Relay configuration
//!
//! Loads the relay's TOML configuration file. Every field has a default, so
//! an empty file (or no file at all) gives a working local relay.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use super::ProjectEntry;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// Accepted authorization tokens
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AuthSection {
    #[serde(default)]
    pub tokens: Vec<String>,
}

/// How interactive processes are spawned and kept alive
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    /// Program started in each project directory
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the process
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// How long a detached process waits for its client to come back
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Wait between hangup and kill
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// PTY output chunks buffered before the process is made to wait
    #[serde(default = "default_queue")]
    pub output_queue: usize,
    /// Frames buffered per attached socket
    #[serde(default = "default_queue")]
    pub attach_queue: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            env: HashMap::new(),
            idle_timeout_ms: default_idle_timeout_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            output_queue: default_queue(),
            attach_queue: default_queue(),
        }
    }
}

impl SessionSettings {
    /// Settings for running `command` with defaults for everything else
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Root relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub session: SessionSettings,
    /// Directory whose subdirectories are projects, keyed by directory name
    #[serde(default)]
    pub projects_root: Option<PathBuf>,
    /// Explicitly registered projects
    #[serde(default)]
    pub projects: Vec<ProjectEntry>,
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3002
}

fn default_command() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_kill_grace_ms() -> u64 {
    3_000
}

fn default_queue() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = RelayConfig::parse("").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 3002);
        assert!(config.auth.tokens.is_empty());
        assert_eq!(config.session.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.session.kill_grace(), Duration::from_secs(3));
        assert_eq!(config.session.output_queue, 256);
        assert!(config.projects.is_empty());
        assert!(config.projects_root.is_none());
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
            projects_root = "/opt/claude-dev-hub/projects"

            [server]
            bind = "0.0.0.0"
            port = 9100

            [auth]
            tokens = ["alpha", "beta"]

            [session]
            command = "claude"
            args = ["--verbose"]
            idle_timeout_ms = 5000
            kill_grace_ms = 500

            [session.env]
            LANG = "C.UTF-8"

            [[projects]]
            id = "p"
            name = "P"
            path = "/srv/p"
        "#;
        let config = RelayConfig::parse(toml).unwrap();

        assert_eq!(config.socket_addr(), "0.0.0.0:9100");
        assert_eq!(config.auth.tokens, vec!["alpha", "beta"]);
        assert_eq!(config.session.command, "claude");
        assert_eq!(config.session.args, vec!["--verbose"]);
        assert_eq!(config.session.idle_timeout(), Duration::from_secs(5));
        assert_eq!(config.session.kill_grace(), Duration::from_millis(500));
        assert_eq!(config.session.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
        assert_eq!(
            config.projects_root,
            Some(PathBuf::from("/opt/claude-dev-hub/projects"))
        );
        assert_eq!(config.projects.len(), 1);
        assert_eq!(config.projects[0].name.as_deref(), Some("P"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        fs::write(&path, "[server]\nport = 4000\n").unwrap();

        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 4000);
    }

    #[test]
    fn test_load_missing_file() {
        let result = RelayConfig::load(Path::new("/nonexistent/relay.toml"));
        assert!(matches!(result, Err(ConfigError::Read(_))));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let result = RelayConfig::parse("[server\nport = ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_with_command() {
        let settings = SessionSettings::with_command("bash");
        assert_eq!(settings.command, "bash");
        assert_eq!(settings.attach_queue, 256);
    }
}
