//! ssh-unlock-luks - Entry point
//!
//! Loads `.env`, parses configuration, sets up logging on stdout and runs
//! the unlock sequence. The exit status tells cron/systemd what happened.

use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ssh_unlock_luks::config::{load_env_file, Args, Config};
use ssh_unlock_luks::error::EXIT_FAILURE;
use ssh_unlock_luks::unlock::{run, Outcome};

#[tokio::main]
async fn main() -> ExitCode {
    // Seed the environment before clap reads it
    let env_file = match load_env_file() {
        Ok(path) => path,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(EXIT_FAILURE),
            };
        }
    };

    init_logging(args.debug);

    if let Some(path) = env_file {
        debug!("Loaded environment from {}", path.display());
    }

    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    info!("ssh-unlock-luks v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("host_keys_filepath: {}", config.host_keys.display());

    match run(&config).await {
        Ok(Outcome::Unlocked) => {
            info!("done.");
            ExitCode::SUCCESS
        }
        Ok(Outcome::Skipped) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

/// Timestamped log lines on stdout; `RUST_LOG` overrides the level
fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,ssh_unlock_luks={}", level)));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stdout)
        .init();
}
