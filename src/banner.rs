//! Raw banner probe
//!
//! Before anything else the target port is probed with a plain TCP
//! connection. Only a dropbear banner means the machine is sitting in its
//! initramfs waiting for the passphrase.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::BANNER_READ_LEN;
use crate::error::{Result, UnlockError};

/// Whether the leading banner bytes start with `prefix`
pub fn matches_banner(banner: &[u8], prefix: &str) -> bool {
    banner.starts_with(prefix.as_bytes())
}

/// Connect to `host:port` and read the first banner bytes
///
/// Reads once, up to `BANNER_READ_LEN` bytes or the prefix length if that is
/// longer. Connect and read each get `limit`; the socket is dropped on return.
pub async fn probe_banner(host: &str, port: u16, prefix: &str, limit: Duration) -> Result<Vec<u8>> {
    let mut stream = timeout(limit, TcpStream::connect((host, port)))
        .await
        .map_err(|_| {
            UnlockError::connection(format!(
                "probe of {}:{} timed out after {}ms",
                host,
                port,
                limit.as_millis()
            ))
        })?
        .map_err(|e| UnlockError::connection(format!("probe of {}:{} failed: {}", host, port, e)))?;

    let mut buf = vec![0u8; BANNER_READ_LEN.max(prefix.len())];
    let n = timeout(limit, stream.read(&mut buf))
        .await
        .map_err(|_| {
            UnlockError::connection(format!(
                "no banner from {}:{} within {}ms",
                host,
                port,
                limit.as_millis()
            ))
        })?
        .map_err(|e| UnlockError::connection(format!("reading banner from {}:{} failed: {}", host, port, e)))?;
    buf.truncate(n);

    debug!("Banner from {}:{}: {:?}", host, port, String::from_utf8_lossy(&buf));
    Ok(buf)
}

/// Probe the target and report whether it is the expected initramfs server
pub async fn is_unlock_target(host: &str, port: u16, prefix: &str, limit: Duration) -> Result<bool> {
    let banner = probe_banner(host, port, prefix, limit).await?;
    Ok(matches_banner(&banner, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_BANNER_PREFIX;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn banner_server(banner: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(banner).await.unwrap();
            // hold the socket until the client hangs up
            let mut sink = [0u8; 64];
            let _ = socket.read(&mut sink).await;
        });
        port
    }

    #[test]
    fn test_matches_banner() {
        assert!(matches_banner(b"SSH-2.0-dropbear", DEFAULT_BANNER_PREFIX));
        assert!(matches_banner(b"SSH-2.0-dropbear_2022.83\r\n", DEFAULT_BANNER_PREFIX));
        assert!(!matches_banner(b"SSH-2.0-OpenSSH_", DEFAULT_BANNER_PREFIX));
        assert!(!matches_banner(b"SSH-2.0-drop", DEFAULT_BANNER_PREFIX));
        assert!(!matches_banner(b"", DEFAULT_BANNER_PREFIX));
    }

    #[tokio::test]
    async fn test_probe_reads_leading_bytes() {
        let port = banner_server(b"SSH-2.0-dropbear_2020.81\r\n").await;
        let banner = probe_banner("127.0.0.1", port, DEFAULT_BANNER_PREFIX, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!banner.is_empty());
        assert!(banner.len() <= 16);
        assert!(b"SSH-2.0-dropbear_2020.81\r\n".starts_with(&banner));
    }

    #[tokio::test]
    async fn test_openssh_is_not_a_target() {
        let port = banner_server(b"SSH-2.0-OpenSSH_9.6p1 Ubuntu-3ubuntu13\r\n").await;
        let ok = is_unlock_target("127.0.0.1", port, DEFAULT_BANNER_PREFIX, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_connection_refused_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = probe_banner("127.0.0.1", port, DEFAULT_BANNER_PREFIX, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, UnlockError::Connection(_)));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let err = probe_banner("127.0.0.1", port, DEFAULT_BANNER_PREFIX, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no banner"));
    }
}
