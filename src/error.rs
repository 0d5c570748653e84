//! Error types for the LUKS unlock tool

use std::path::PathBuf;

use thiserror::Error;

/// Process exit status for fatal errors
pub const EXIT_FAILURE: u8 = 1;

/// Process exit status when the policy list does not allow unlocking
pub const EXIT_POLICY_DENIED: u8 = 2;

/// Main error type for the unlock sequence
#[derive(Debug, Error)]
pub enum UnlockError {
    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Probe, TCP or SSH transport failure
    #[error("SSH connection error: {0}")]
    Connection(String),

    /// Public key authentication failed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// No pinned host key is available for the target
    #[error("No pinned host key for {host} in {}", path.display())]
    HostKeyMissing { host: String, path: PathBuf },

    /// The server presented a key that is not pinned
    #[error("Host key verification failed for {host}:{port}")]
    HostKeyMismatch { host: String, port: u16 },

    /// SSH key parsing error
    #[error("SSH key error: {0}")]
    SshKey(String),

    /// Interactive channel failure
    #[error("Channel error: {0}")]
    Channel(String),

    /// A readiness wait or channel write ran out of time
    #[error("Timed out after {millis}ms waiting for {what}")]
    Timeout { what: String, millis: u64 },

    /// The policy list could not be retrieved
    #[error("Policy fetch failed: {0}")]
    PolicyFetch(String),

    /// The policy list holds no enabling entry for the host
    #[error("Unlocking {host} is not allowed by the policy list")]
    PolicyDenied { host: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using UnlockError
pub type Result<T> = std::result::Result<T, UnlockError>;

impl UnlockError {
    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        UnlockError::Config(msg.into())
    }

    /// Create a connection error from a string
    pub fn connection(msg: impl Into<String>) -> Self {
        UnlockError::Connection(msg.into())
    }

    /// Create an authentication error from a string
    pub fn auth(msg: impl Into<String>) -> Self {
        UnlockError::Authentication(msg.into())
    }

    /// Create a channel error from a string
    pub fn channel(msg: impl Into<String>) -> Self {
        UnlockError::Channel(msg.into())
    }

    /// Create a policy fetch error from a string
    pub fn policy_fetch(msg: impl Into<String>) -> Self {
        UnlockError::PolicyFetch(msg.into())
    }

    /// Create a timeout error for the named wait
    pub fn timeout(what: impl Into<String>, after: std::time::Duration) -> Self {
        UnlockError::Timeout {
            what: what.into(),
            millis: after.as_millis() as u64,
        }
    }

    /// Process exit status for this error: 2 for policy denial, 1 otherwise
    pub fn exit_code(&self) -> u8 {
        match self {
            UnlockError::PolicyDenied { .. } => EXIT_POLICY_DENIED,
            _ => EXIT_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let err = UnlockError::Connection("failed to connect".to_string());
        assert_eq!(err.to_string(), "SSH connection error: failed to connect");

        let err = UnlockError::timeout("receive-ready", Duration::from_secs(3));
        assert_eq!(err.to_string(), "Timed out after 3000ms waiting for receive-ready");

        let err = UnlockError::HostKeyMissing {
            host: "10.0.0.5".to_string(),
            path: PathBuf::from("/opt/unlock/host_keys"),
        };
        assert_eq!(
            err.to_string(),
            "No pinned host key for 10.0.0.5 in /opt/unlock/host_keys"
        );
    }

    #[test]
    fn test_exit_codes() {
        let denied = UnlockError::PolicyDenied {
            host: "nas".to_string(),
        };
        assert_eq!(denied.exit_code(), 2);

        assert_eq!(UnlockError::config("missing host").exit_code(), 1);
        assert_eq!(UnlockError::policy_fetch("503").exit_code(), 1);
        assert_eq!(
            UnlockError::HostKeyMismatch {
                host: "nas".to_string(),
                port: 2222
            }
            .exit_code(),
            1
        );
    }
}
