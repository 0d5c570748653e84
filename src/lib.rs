//! ssh-unlock-luks - unlock LUKS volumes at boot over SSH
//!
//! A machine with an encrypted root waits in its initramfs, where a small
//! SSH server (dropbear) asks for the disk passphrase instead of offering a
//! shell. This crate connects to that server, waits for the prompt and
//! types the stored passphrase.
//!
//! # Sequence
//!
//! 1. Probe the port and check for a `SSH-2.0-dropbear` banner. Anything
//!    else means the host already booted and the run is a no-op.
//! 2. Optionally fetch a policy list and require an `host,yes` entry.
//! 3. Connect with a private key; the server key must match a pinned
//!    known-hosts record.
//! 4. Open a pty shell, wait for the prompt, send the passphrase and a
//!    newline, wait a grace period, disconnect.
//!
//! # Exit codes
//!
//! - `0` - unlocked, or nothing to do
//! - `1` - configuration, connection or policy fetch error
//! - `2` - denied by the policy list
//!
//! # Example Usage (CLI)
//!
//! ```bash
//! SUL_SSH_IP=10.0.0.5 SUL_SSH_PORT=2222 SUL_LUKS_PASS=... ssh-unlock-luks
//! ```

pub mod banner;
pub mod config;
pub mod error;
pub mod policy;
pub mod ssh;
pub mod unlock;

// Re-exports for convenience
pub use config::{Args, Config, UnlockTimings};
pub use error::{Result, UnlockError};
pub use policy::{evaluate_policy, PolicyDecision};
pub use ssh::{PromptChannel, SshConfig, UnlockSession};
pub use unlock::{run, send_passphrase, Outcome, Stage};
