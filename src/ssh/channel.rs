//! Interactive prompt channel
//!
//! The initramfs prompt is driven through readiness flags: receive-ready
//! once prompt bytes are buffered, send-ready while the channel is open.
//! [`PromptChannel`] abstracts these so the unlock sequence can run
//! against a real russh channel or a scripted one.

use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{Channel, ChannelMsg};
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Result, UnlockError};

/// How long `refresh` waits for each pending channel message
const REFRESH_WAIT: Duration = Duration::from_millis(20);

/// A pty-backed channel with independent receive/send readiness
#[async_trait]
pub trait PromptChannel: Send {
    /// Pull whatever the remote side has sent so far, without blocking long
    async fn refresh(&mut self) -> Result<()>;

    /// Unread inbound bytes are buffered
    fn recv_ready(&self) -> bool;

    /// The channel accepts outbound data
    fn send_ready(&self) -> bool;

    /// Take up to `max` buffered inbound bytes
    fn recv(&mut self, max: usize) -> Vec<u8>;

    /// Write `data` to the channel
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Signal EOF and close the channel
    async fn close(&mut self);
}

/// [`PromptChannel`] over a russh session channel
pub struct RusshPromptChannel {
    channel: Channel<client::Msg>,
    inbound: Vec<u8>,
    closed: bool,
    io_timeout: Duration,
}

impl RusshPromptChannel {
    /// Wrap an opened channel; writes are bounded by `io_timeout`
    pub fn new(channel: Channel<client::Msg>, io_timeout: Duration) -> Self {
        Self {
            channel,
            inbound: Vec::new(),
            closed: false,
            io_timeout,
        }
    }
}

#[async_trait]
impl PromptChannel for RusshPromptChannel {
    async fn refresh(&mut self) -> Result<()> {
        while !self.closed {
            let msg = match timeout(REFRESH_WAIT, self.channel.wait()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    debug!("Channel ended");
                    self.closed = true;
                    break;
                }
                Err(_) => break,
            };

            match msg {
                ChannelMsg::Data { data } => {
                    self.inbound.extend_from_slice(&data);
                }
                ChannelMsg::ExtendedData { data, .. } => {
                    self.inbound.extend_from_slice(&data);
                }
                ChannelMsg::Success => {
                    debug!("Channel request accepted");
                }
                ChannelMsg::Failure => {
                    return Err(UnlockError::channel(
                        "Remote side refused the PTY/shell request",
                    ));
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    debug!("Remote shell exited with status {}", exit_status);
                    self.closed = true;
                }
                ChannelMsg::Eof | ChannelMsg::Close => {
                    debug!("Channel closed by remote side");
                    self.closed = true;
                }
                _ => {
                    // Ignore other messages
                }
            }
        }

        Ok(())
    }

    fn recv_ready(&self) -> bool {
        !self.inbound.is_empty()
    }

    fn send_ready(&self) -> bool {
        !self.closed
    }

    fn recv(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.inbound.len());
        self.inbound.drain(..n).collect()
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(UnlockError::channel("Channel closed before sending"));
        }

        timeout(self.io_timeout, self.channel.data(data))
            .await
            .map_err(|_| UnlockError::timeout("channel write", self.io_timeout))?
            .map_err(|e| UnlockError::channel(format!("Failed to send data: {}", e)))
    }

    async fn close(&mut self) {
        if !self.closed {
            if let Err(e) = self.channel.eof().await {
                debug!("Failed to send EOF: {}", e);
            }
        }
        if let Err(e) = self.channel.close().await {
            debug!("Failed to close channel: {}", e);
        }
        self.closed = true;
        self.inbound.clear();
    }
}
