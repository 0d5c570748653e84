//! Full unlock runs against an in-process dropbear-like SSH server

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use russh::keys::ssh_key::private::Ed25519Keypair;
use russh::keys::ssh_key::LineEnding;
use russh::keys::PrivateKey;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty, SshId};
use tokio::net::TcpListener;

use ssh_unlock_luks::{Args, Config, Outcome, UnlockError};

const PROMPT: &[u8] = b"Please unlock disk cryptroot: ";

/// Initramfs stand-in: accepts any client key, prompts on shell start and
/// records everything typed into the channel
#[derive(Clone, Default)]
struct Initramfs {
    received: Arc<Mutex<Vec<u8>>>,
}

impl server::Handler for Initramfs {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        session.data(channel, CryptoVec::from_slice(PROMPT))?;
        Ok(())
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Ok(mut received) = self.received.lock() {
            received.extend_from_slice(data);
        }
        Ok(())
    }
}

fn keypair(seed: u8) -> PrivateKey {
    PrivateKey::from(Ed25519Keypair::from_seed(&[seed; 32]))
}

/// Start the server with `host_key`; returns its port and the recorded input
async fn start_initramfs(host_key: PrivateKey) -> (u16, Arc<Mutex<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = Arc::new(server::Config {
        server_id: SshId::Standard("SSH-2.0-dropbear_2022.83".to_string()),
        keys: vec![host_key],
        inactivity_timeout: Some(Duration::from_secs(10)),
        ..Default::default()
    });
    let handler = Initramfs::default();
    let received = handler.received.clone();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let config = config.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                // the banner check disconnects before the key exchange
                if let Ok(session) = server::run_stream(config, socket, handler).await {
                    let _ = session.await;
                }
            });
        }
    });

    (port, received)
}

/// Known-hosts file pinning `key` for 127.0.0.1:`port`
fn pin(dir: &Path, port: u16, key: &PrivateKey) -> PathBuf {
    let path = dir.join("host_keys");
    let line = format!(
        "[127.0.0.1]:{} {}\n",
        port,
        key.public_key().to_openssh().unwrap()
    );
    std::fs::write(&path, line).unwrap();
    path
}

/// Client private key in OpenSSH format
fn client_key(dir: &Path) -> PathBuf {
    let path = dir.join("id_ed25519");
    let pem = keypair(42).to_openssh(LineEnding::LF).unwrap();
    std::fs::write(&path, pem.as_bytes()).unwrap();
    path
}

fn config(port: u16, host_keys: &Path, key: &Path) -> Config {
    let argv = [
        "ssh-unlock-luks".to_string(),
        "--host".to_string(),
        "127.0.0.1".to_string(),
        "--port".to_string(),
        port.to_string(),
        "--key".to_string(),
        key.to_str().unwrap().to_string(),
        "--host-keys".to_string(),
        host_keys.to_str().unwrap().to_string(),
    ];

    let mut config = temp_env::with_vars(
        [
            ("SUL_SSH_IP", None),
            ("SUL_SSH_PORT", None),
            ("SUL_SSH_USER", None),
            ("SUL_SSH_KEY", None),
            ("SUL_LUKS_PASS", Some("s3cr3t")),
            ("SUL_POLICY_URL", None),
            ("SUL_HOST_KEYS", None),
            ("SUL_BANNER_PREFIX", None),
            ("DEBUG", None),
        ],
        || Config::from_args(Args::try_parse_from(argv).unwrap()).unwrap(),
    );
    config.timings.poll_interval = Duration::from_millis(50);
    config.timings.grace_period = Duration::from_millis(200);
    config.timings.connect_timeout = Duration::from_secs(10);
    config
}

/// Wait briefly for the server to process what the client sent
async fn settle(received: &Arc<Mutex<Vec<u8>>>, expected: usize) -> Vec<u8> {
    for _ in 0..20 {
        let data = received.lock().unwrap().clone();
        if data.len() >= expected {
            return data;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    received.lock().unwrap().clone()
}

#[tokio::test]
async fn passphrase_is_typed_once_into_the_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let (port, received) = start_initramfs(keypair(1)).await;
    let host_keys = pin(dir.path(), port, &keypair(1));
    let config = config(port, &host_keys, &client_key(dir.path()));

    let outcome = ssh_unlock_luks::run(&config).await.unwrap();

    assert_eq!(outcome, Outcome::Unlocked);
    assert_eq!(settle(&received, 7).await, b"s3cr3t\n".to_vec());
}

#[tokio::test]
async fn server_with_other_host_key_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (port, received) = start_initramfs(keypair(1)).await;
    // pinned record belongs to a different machine
    let host_keys = pin(dir.path(), port, &keypair(2));
    let config = config(port, &host_keys, &client_key(dir.path()));

    let err = ssh_unlock_luks::run(&config).await.unwrap_err();

    match err {
        UnlockError::HostKeyMismatch { ref host, port: p } => {
            assert_eq!(host, "127.0.0.1");
            assert_eq!(p, port);
        }
        ref other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.exit_code(), 1);
    assert!(settle(&received, 1).await.is_empty());
}
