//! Configuration and CLI argument parsing for the LUKS unlock tool

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgAction, Parser};
use zeroize::Zeroizing;

use crate::error::{Result, UnlockError};
use crate::policy::PolicyEndpoint;

/// Username used when none is configured
pub const DEFAULT_USER: &str = "root";

/// Banner prefix sent by dropbear while it waits in the initramfs
pub const DEFAULT_BANNER_PREFIX: &str = "SSH-2.0-dropbear";

/// Pinned known-hosts file name, resolved next to the executable
pub const HOST_KEYS_FILE: &str = "host_keys";

/// Minimum number of banner bytes read by the probe
pub const BANNER_READ_LEN: usize = 16;

/// Upper bound on the prompt bytes drained before sending
pub const PROMPT_READ_LIMIT: usize = 1000;

/// Raw banner probe timeout in milliseconds
pub const PROBE_TIMEOUT_MS: u64 = 1_000;

/// Channel read/write timeout in milliseconds
pub const CHANNEL_TIMEOUT_MS: u64 = 3_000;

/// Readiness poll interval in milliseconds
pub const POLL_INTERVAL_MS: u64 = 500;

/// Time given to the remote side after sending the passphrase
pub const GRACE_PERIOD_MS: u64 = 3_000;

/// SSH connection timeout in seconds
pub const CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Policy list request timeout in seconds
pub const POLICY_TIMEOUT_SECS: u64 = 10;

/// The only source of the LUKS passphrase
pub const PASSPHRASE_ENV: &str = "SUL_LUKS_PASS";

/// LUKS unlock CLI arguments
///
/// Every argument can also be given through the environment, which is the
/// usual way to run the tool from cron or a systemd timer. The passphrase
/// has no flag: it is read from `SUL_LUKS_PASS` only, so it never shows up
/// in the process command line.
#[derive(Parser, Clone)]
#[command(name = "ssh-unlock-luks")]
#[command(author = "Ixtalo")]
#[command(version)]
#[command(about = "Unlock a LUKS volume at boot through a dropbear-initramfs SSH prompt")]
#[command(after_help = "The LUKS passphrase is read from the SUL_LUKS_PASS environment variable.")]
pub struct Args {
    /// Target host (dropbear in the initramfs)
    #[arg(long, env = "SUL_SSH_IP")]
    pub host: Option<String>,

    /// Target SSH port
    #[arg(long, env = "SUL_SSH_PORT")]
    pub port: Option<String>,

    /// SSH username
    #[arg(long, default_value = DEFAULT_USER, env = "SUL_SSH_USER")]
    pub user: String,

    /// Path to SSH private key file
    #[arg(long, env = "SUL_SSH_KEY")]
    pub key: Option<PathBuf>,

    /// Policy list URL (http or https); when set, the host must be allowed there
    #[arg(long, env = "SUL_POLICY_URL")]
    pub policy_url: Option<String>,

    /// Pinned known-hosts file. Default: `host_keys` next to the executable
    #[arg(long, env = "SUL_HOST_KEYS")]
    pub host_keys: Option<PathBuf>,

    /// Banner prefix identifying the initramfs SSH server
    #[arg(long, default_value = DEFAULT_BANNER_PREFIX, env = "SUL_BANNER_PREFIX")]
    pub banner_prefix: String,

    /// Verbose logging (1, true, yes)
    #[arg(
        long,
        env = "DEBUG",
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true",
        value_parser = parse_flag
    )]
    pub debug: bool,
}

/// Timing knobs of the unlock sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockTimings {
    pub probe_timeout: Duration,
    pub connect_timeout: Duration,
    pub channel_timeout: Duration,
    pub poll_interval: Duration,
    pub grace_period: Duration,
    pub policy_timeout: Duration,
}

impl Default for UnlockTimings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_millis(PROBE_TIMEOUT_MS),
            connect_timeout: Duration::from_secs(CONNECTION_TIMEOUT_SECS),
            channel_timeout: Duration::from_millis(CHANNEL_TIMEOUT_MS),
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
            grace_period: Duration::from_millis(GRACE_PERIOD_MS),
            policy_timeout: Duration::from_secs(POLICY_TIMEOUT_SECS),
        }
    }
}

/// Parsed and validated configuration
#[derive(Clone)]
pub struct Config {
    /// Target host
    pub host: String,

    /// Target port
    pub port: u16,

    /// SSH username
    pub user: String,

    /// Path to SSH private key
    pub key: Option<PathBuf>,

    /// LUKS passphrase, wiped on drop
    pub passphrase: Zeroizing<String>,

    /// Policy list URL
    pub policy_url: Option<String>,

    /// Pinned known-hosts file
    pub host_keys: PathBuf,

    /// Expected banner prefix
    pub banner_prefix: String,

    /// Debug logging enabled
    pub debug: bool,

    pub timings: UnlockTimings,
}

impl Config {
    /// Create Config from CLI Args
    ///
    /// The passphrase is taken from the `SUL_LUKS_PASS` environment variable.
    pub fn from_args(args: Args) -> Result<Self> {
        let host = non_empty(args.host);
        let passphrase = std::env::var(PASSPHRASE_ENV)
            .ok()
            .filter(|p| !p.is_empty());
        let policy_url = non_empty(args.policy_url);

        let mut errors = Vec::new();

        if host.is_none() {
            errors.push("Missing required host (--host / SUL_SSH_IP)".to_string());
        }

        let port = match non_empty(args.port) {
            None => {
                errors.push("Missing required port (--port / SUL_SSH_PORT)".to_string());
                None
            }
            Some(raw) => match parse_port(&raw) {
                Ok(port) => Some(port),
                Err(e) => {
                    errors.push(e);
                    None
                }
            },
        };

        if passphrase.is_none() {
            errors.push(format!("Missing required passphrase ({})", PASSPHRASE_ENV));
        }

        if let Some(ref key_path) = args.key {
            if !key_path.exists() {
                errors.push(format!("SSH key file not found: {}", key_path.display()));
            }
        }

        if let Some(ref url) = policy_url {
            if let Err(e) = PolicyEndpoint::parse(url) {
                errors.push(e.to_string());
            }
        }

        if args.banner_prefix.is_empty() {
            errors.push("Banner prefix cannot be empty".to_string());
        }

        let (Some(host), Some(port), Some(passphrase)) = (host, port, passphrase) else {
            return Err(config_error(errors));
        };
        if !errors.is_empty() {
            return Err(config_error(errors));
        }

        let host_keys = match args.host_keys {
            Some(path) => path,
            None => default_host_keys_path()?,
        };

        Ok(Config {
            host,
            port,
            user: args.user,
            key: args.key,
            passphrase: Zeroizing::new(passphrase),
            policy_url,
            host_keys,
            banner_prefix: args.banner_prefix,
            debug: args.debug,
            timings: UnlockTimings::default(),
        })
    }

    /// `host:port` of the target
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("key", &self.key)
            .field("passphrase", &"<redacted>")
            .field("policy_url", &self.policy_url)
            .field("host_keys", &self.host_keys)
            .field("banner_prefix", &self.banner_prefix)
            .field("debug", &self.debug)
            .field("timings", &self.timings)
            .finish()
    }
}

/// Seed the process environment from `.env` in the working directory
///
/// Variables already present in the environment are left untouched.
/// Returns the path of the loaded file, or `None` when there is no `.env`.
/// An unreadable or malformed file is a configuration error.
pub fn load_env_file() -> Result<Option<PathBuf>> {
    env_file_outcome(dotenvy::dotenv(), Path::new(".env"))
}

/// Seed the process environment from the env file at `path`
pub fn load_env_file_from(path: &Path) -> Result<Option<PathBuf>> {
    env_file_outcome(
        dotenvy::from_path(path).map(|()| path.to_path_buf()),
        path,
    )
}

fn env_file_outcome(
    loaded: std::result::Result<PathBuf, dotenvy::Error>,
    path: &Path,
) -> Result<Option<PathBuf>> {
    match loaded {
        Ok(path) => Ok(Some(path)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(UnlockError::config(format!(
            "Failed to load {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Case-insensitive truthiness used by the debug flag and the policy list
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

fn parse_flag(value: &str) -> std::result::Result<bool, String> {
    Ok(is_truthy(value))
}

/// Parse a TCP port, rejecting 0
pub fn parse_port(raw: &str) -> std::result::Result<u16, String> {
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("Invalid port: {:?}", raw)),
        Ok(port) => Ok(port),
    }
}

/// `host_keys` in the directory of the running executable
pub fn default_host_keys_path() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| UnlockError::config("Cannot resolve the executable directory"))?;
    Ok(dir.join(HOST_KEYS_FILE))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn config_error(errors: Vec<String>) -> UnlockError {
    UnlockError::Config(format!("\n{}", errors.join("\n")))
}
