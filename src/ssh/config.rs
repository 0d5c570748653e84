//! SSH configuration types
//!
//! Connection parameters for the unlock session, including the pinned
//! known-hosts file.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::{Config, CONNECTION_TIMEOUT_SECS, DEFAULT_USER};

/// SSH connection configuration
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Remote hostname or IP address
    pub host: String,

    /// SSH port (default: 22)
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Private key path; default key locations are tried when unset
    pub key_path: Option<PathBuf>,

    /// Known-hosts file holding the pinned server key
    pub known_hosts: PathBuf,

    /// Timeout for establishing the connection
    pub connect_timeout: Duration,
}

impl SshConfig {
    /// Create a new SSH configuration with minimal required fields
    pub fn new(host: impl Into<String>, known_hosts: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: DEFAULT_USER.to_string(),
            key_path: None,
            known_hosts: known_hosts.into(),
            connect_timeout: Duration::from_secs(CONNECTION_TIMEOUT_SECS),
        }
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the username
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Set private key authentication (path to the key file)
    pub fn with_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    /// Set the connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl From<&Config> for SshConfig {
    fn from(config: &Config) -> Self {
        let mut ssh_config = SshConfig::new(&config.host, &config.host_keys)
            .with_port(config.port)
            .with_username(&config.user)
            .with_connect_timeout(config.timings.connect_timeout);
        if let Some(ref key) = config.key {
            ssh_config = ssh_config.with_key_path(key);
        }
        ssh_config
    }
}
