//! The unlock sequence
//!
//! Probe the target, load its pinned host key, consult the policy list,
//! connect, wait for the prompt, send the passphrase once and disconnect.
//! Each gate either continues, ends the run as a no-op, or fails it.

use std::fmt;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::banner::is_unlock_target;
use crate::config::{Config, UnlockTimings, PROMPT_READ_LIMIT};
use crate::error::{Result, UnlockError};
use crate::policy::check_policy;
use crate::ssh::{load_pinned_keys, PromptChannel, SshConfig, UnlockSession};

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Probing,
    PolicyCheck,
    Connecting,
    AwaitRecvReady,
    AwaitSendReady,
    Sending,
    GracePeriod,
    Closed,
}

impl Stage {
    fn enter(self) {
        debug!(stage = %self, "entering stage");
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Probing => "probing",
            Stage::PolicyCheck => "policy-check",
            Stage::Connecting => "connecting",
            Stage::AwaitRecvReady => "await-recv-ready",
            Stage::AwaitSendReady => "await-send-ready",
            Stage::Sending => "sending",
            Stage::GracePeriod => "grace-period",
            Stage::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// How a run ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The passphrase was sent
    Unlocked,
    /// The target is not waiting for a passphrase
    Skipped,
}

/// Readiness flag of a [`PromptChannel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Receive,
    Send,
}

impl Readiness {
    fn holds<C: PromptChannel + ?Sized>(self, channel: &C) -> bool {
        match self {
            Readiness::Receive => channel.recv_ready(),
            Readiness::Send => channel.send_ready(),
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Readiness::Receive => "receive-ready",
            Readiness::Send => "send-ready",
        }
    }
}

/// Poll `channel` every `interval` until `readiness` holds or `limit` elapses
pub async fn await_ready<C: PromptChannel + ?Sized>(
    channel: &mut C,
    readiness: Readiness,
    interval: Duration,
    limit: Duration,
) -> Result<()> {
    let deadline = Instant::now() + limit;

    loop {
        channel.refresh().await?;
        if readiness.holds(channel) {
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(UnlockError::timeout(
                format!("SSH pseudo-terminal to be {}", readiness.describe()),
                limit,
            ));
        }

        debug!(
            "waiting for SSH pseudo-terminal to be {}...",
            readiness.describe()
        );
        sleep(interval.min(deadline - now)).await;
    }
}

/// Wait for the prompt, send `passphrase` plus newline, then hold for the grace period
///
/// The channel is left open; closing it is up to the caller.
pub async fn send_passphrase<C: PromptChannel + ?Sized>(
    channel: &mut C,
    passphrase: &str,
    timings: &UnlockTimings,
) -> Result<()> {
    Stage::AwaitRecvReady.enter();
    await_ready(
        channel,
        Readiness::Receive,
        timings.poll_interval,
        timings.channel_timeout,
    )
    .await?;

    let prompt = channel.recv(PROMPT_READ_LIMIT);
    debug!(
        "Received {} prompt bytes: {:?}",
        prompt.len(),
        String::from_utf8_lossy(&prompt)
    );

    Stage::AwaitSendReady.enter();
    await_ready(
        channel,
        Readiness::Send,
        timings.poll_interval,
        timings.channel_timeout,
    )
    .await?;

    Stage::Sending.enter();
    info!("sending passphrase string plus ENTER/newline ...");
    let mut line = Zeroizing::new(Vec::with_capacity(passphrase.len() + 1));
    line.extend_from_slice(passphrase.as_bytes());
    line.push(b'\n');
    channel.send(&line).await?;

    Stage::GracePeriod.enter();
    info!(
        "waiting {} seconds (grace time)...",
        timings.grace_period.as_secs_f32()
    );
    sleep(timings.grace_period).await;

    Ok(())
}

/// Run the whole sequence against the configured target
pub async fn run(config: &Config) -> Result<Outcome> {
    Stage::Idle.enter();

    Stage::Probing.enter();
    info!("checking remote server {}...", config.target());
    let is_target = is_unlock_target(
        &config.host,
        config.port,
        &config.banner_prefix,
        config.timings.probe_timeout,
    )
    .await?;
    if !is_target {
        warn!(
            "{} does not present a '{}' banner, it is not waiting for a passphrase. Nothing to do.",
            config.target(),
            config.banner_prefix
        );
        return Ok(Outcome::Skipped);
    }

    let pinned = load_pinned_keys(&config.host_keys, &config.host, config.port)?;
    info!(
        "Loaded {} pinned host key(s) from {}",
        pinned.len(),
        config.host_keys.display()
    );

    if let Some(ref url) = config.policy_url {
        Stage::PolicyCheck.enter();
        check_policy(url, &config.host, config.timings.policy_timeout).await?;
    }

    Stage::Connecting.enter();
    let session = UnlockSession::connect_pinned(SshConfig::from(config), pinned).await?;
    let mut channel = session
        .open_prompt_channel(config.timings.channel_timeout)
        .await?;

    send_passphrase(&mut channel, &config.passphrase, &config.timings).await?;

    debug!("closing SSH connection...");
    channel.close().await;
    session.close().await;
    Stage::Closed.enter();

    Ok(Outcome::Unlocked)
}
