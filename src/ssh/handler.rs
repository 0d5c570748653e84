//! SSH client handler implementation
//!
//! Implements the `russh::client::Handler` trait. The server key is checked
//! against keys pinned in a known-hosts file; any other key aborts the
//! connection.

use std::path::Path;

use russh::keys::known_hosts::known_host_keys_path;
use russh::keys::ssh_key::{HashAlg, PublicKey};
use tracing::{debug, error};

use crate::error::{Result, UnlockError};

/// Load the pinned keys for `host:port` from a known-hosts file
///
/// Fails with [`UnlockError::HostKeyMissing`] when the file does not exist
/// or holds no entry for the target.
pub fn load_pinned_keys(path: &Path, host: &str, port: u16) -> Result<Vec<PublicKey>> {
    let missing = || UnlockError::HostKeyMissing {
        host: format!("{}:{}", host, port),
        path: path.to_path_buf(),
    };

    if !path.is_file() {
        return Err(missing());
    }

    let keys = known_host_keys_path(host, port, path).map_err(|e| {
        UnlockError::SshKey(format!("Failed to read {}: {}", path.display(), e))
    })?;

    if keys.is_empty() {
        return Err(missing());
    }

    Ok(keys.into_iter().map(|(_line, key)| key).collect())
}

/// SSH client handler for russh
///
/// Accepts the server only if its key matches one of the pinned keys.
#[derive(Debug, Clone)]
pub struct SshHandler {
    host: String,
    port: u16,
    pinned: Vec<PublicKey>,
}

impl SshHandler {
    /// Create a handler for `host:port` with its pinned keys
    pub fn new(host: impl Into<String>, port: u16, pinned: Vec<PublicKey>) -> Self {
        Self {
            host: host.into(),
            port,
            pinned,
        }
    }

    /// Whether `key` is one of the pinned keys (comments are ignored)
    pub fn is_pinned(&self, key: &PublicKey) -> bool {
        self.pinned
            .iter()
            .any(|pinned| pinned.key_data() == key.key_data())
    }
}

impl russh::client::Handler for SshHandler {
    type Error = anyhow::Error;

    /// Verify the server's host key against the pinned record
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256);

        if self.is_pinned(server_public_key) {
            debug!(
                "Host key for {}:{} matches pinned record ({})",
                self.host, self.port, fingerprint
            );
            Ok(true)
        } else {
            error!(
                "Host key for {}:{} does not match the pinned record (server offered {})",
                self.host, self.port, fingerprint
            );
            Ok(false)
        }
    }
}
