//! SSH session handling for the unlock sequence
//!
//! This module opens a key-authenticated SSH session whose server key must
//! match a pinned known-hosts record, and exposes the pty shell of the
//! initramfs as a [`PromptChannel`].

pub mod channel;
pub mod config;
pub mod connection;
pub mod handler;

// Re-exports
pub use channel::{PromptChannel, RusshPromptChannel};
pub use config::SshConfig;
pub use connection::UnlockSession;
pub use handler::{load_pinned_keys, SshHandler};
