//! SSH unlock session
//!
//! One short-lived, key-authenticated connection to the initramfs SSH
//! server. The pinned host keys are loaded before the TCP connection is
//! opened, so a missing record never leads to a handshake.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::ssh_key::PublicKey;
use russh::keys::{load_secret_key, PrivateKey, PrivateKeyWithHashAlg};
use tokio::time::timeout;
use tracing::{debug, error, info};

use super::channel::RusshPromptChannel;
use super::config::SshConfig;
use super::handler::{load_pinned_keys, SshHandler};
use crate::error::{Result, UnlockError};

/// Private keys tried, in order, when no key path is configured
const DEFAULT_KEY_FILES: [&str; 2] = [".ssh/id_ed25519", ".ssh/id_rsa"];

/// An authenticated SSH connection to the unlock target
pub struct UnlockSession {
    /// SSH configuration
    config: SshConfig,

    /// Active SSH session handle
    handle: Handle<SshHandler>,
}

impl UnlockSession {
    /// Verify, connect and authenticate
    pub async fn connect(config: SshConfig) -> Result<Self> {
        let pinned = load_pinned_keys(&config.known_hosts, &config.host, config.port)?;
        Self::connect_pinned(config, pinned).await
    }

    /// Connect and authenticate, accepting only the given host keys
    pub async fn connect_pinned(config: SshConfig, pinned: Vec<PublicKey>) -> Result<Self> {
        if pinned.is_empty() {
            return Err(UnlockError::HostKeyMissing {
                host: format!("{}:{}", config.host, config.port),
                path: config.known_hosts.clone(),
            });
        }

        let key = load_private_key(&config)?;

        info!(
            "establishing SSH connection to {}:{}...",
            config.host, config.port
        );

        let ssh_config = Arc::new(client::Config::default());
        let handler = SshHandler::new(&config.host, config.port, pinned);

        let connect_result = timeout(
            config.connect_timeout,
            client::connect(ssh_config, (config.host.as_str(), config.port), handler),
        )
        .await;

        let mut handle = match connect_result {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(map_connect_error(e, &config)),
            Err(_) => {
                error!(
                    "SSH connection timeout after {}s",
                    config.connect_timeout.as_secs()
                );
                return Err(UnlockError::connection(format!(
                    "Connection timeout after {}s",
                    config.connect_timeout.as_secs()
                )));
            }
        };

        authenticate(&mut handle, &config, key).await?;

        info!(
            "Successfully connected to {}@{}:{}",
            config.username, config.host, config.port
        );

        Ok(Self { config, handle })
    }

    /// Open a session channel with a pty and an interactive shell
    pub async fn open_prompt_channel(&self, io_timeout: Duration) -> Result<RusshPromptChannel> {
        info!("open TTY shell...");

        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| UnlockError::channel(format!("Failed to open channel: {}", e)))?;

        channel
            .request_pty(
                true, // want_reply
                "xterm",
                80,  // cols
                24,  // rows
                0,   // pixel width
                0,   // pixel height
                &[], // terminal modes
            )
            .await
            .map_err(|e| UnlockError::channel(format!("Failed to request PTY: {}", e)))?;

        debug!("PTY requested");

        channel
            .request_shell(true)
            .await
            .map_err(|e| UnlockError::channel(format!("Failed to request shell: {}", e)))?;

        debug!("Shell requested");

        Ok(RusshPromptChannel::new(channel, io_timeout))
    }

    /// Close the SSH connection
    pub async fn close(self) {
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await
        {
            debug!("Disconnect from {}:{} failed: {}", self.config.host, self.config.port, e);
        }

        info!("SSH connection closed");
    }
}

impl std::fmt::Debug for UnlockSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockSession")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("username", &self.config.username)
            .finish()
    }
}

/// Authenticate with the SSH server using the private key
async fn authenticate(
    session: &mut Handle<SshHandler>,
    config: &SshConfig,
    key: PrivateKey,
) -> Result<()> {
    debug!(
        "Attempting key authentication for user '{}'",
        config.username
    );

    // None: default hash for RSA keys, ignored for other key types
    let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), None);

    let auth_result = session
        .authenticate_publickey(&config.username, key_with_alg)
        .await
        .map_err(|e| UnlockError::auth(e.to_string()))?;

    if auth_result.success() {
        info!("Key authentication successful");
        Ok(())
    } else {
        Err(UnlockError::auth(format!(
            "Key authentication rejected for user '{}'",
            config.username
        )))
    }
}

/// Load the configured private key, or the first default key found
fn load_private_key(config: &SshConfig) -> Result<PrivateKey> {
    let path = match config.key_path {
        Some(ref path) => path.clone(),
        None => default_key_path()?,
    };

    debug!("Using private key {}", path.display());

    load_secret_key(&path, None).map_err(|e| {
        UnlockError::SshKey(format!(
            "Failed to load private key {}: {}",
            path.display(),
            e
        ))
    })
}

fn default_key_path() -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| UnlockError::config("No SSH key configured and HOME is not set"))?;

    DEFAULT_KEY_FILES
        .iter()
        .map(|file| home.join(file))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            UnlockError::config(format!(
                "No SSH key configured and none of {} found in {}",
                DEFAULT_KEY_FILES.join(", "),
                home.display()
            ))
        })
}

/// Translate a russh connect failure, singling out host key rejection
fn map_connect_error(e: anyhow::Error, config: &SshConfig) -> UnlockError {
    if let Some(russh::Error::UnknownKey) = e.downcast_ref::<russh::Error>() {
        return UnlockError::HostKeyMismatch {
            host: config.host.clone(),
            port: config.port,
        };
    }

    error!("SSH connection failed: {}", e);
    UnlockError::connection(e.to_string())
}
