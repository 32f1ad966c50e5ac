//! icsync - one-way iCloud Photos Library mirror
//!
//! Commands:
//! - `token`   - validate credentials and acquire a trust token
//! - `sync`    - run one full synchronization
//! - `archive` - freeze an album folder locally
//! - `daemon`  - run syncs on a cron schedule (the default)
//!
//! Flags override environment variables; sensitive environment variables
//! are scrubbed after parsing so child processes and crash dumps never see
//! them.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use icsync_core::config::{
    Config, DEFAULT_DATA_DIR, DEFAULT_DOWNLOAD_THREADS, DEFAULT_MFA_PORT, DEFAULT_SCHEDULE,
};
use icsync_core::domain::errors::{AppError, InterruptError, Severity};
use icsync_core::events::{Event, EventSink};
use icsync_telemetry::Reporter;

mod commands;

use commands::{archive, daemon, sync, token};

/// Environment variables holding secrets, scrubbed after parsing.
const SENSITIVE_ENV: &[(&str, &str)] = &[
    ("APPLE_ID_PWD", icsync_core::config::PASSWORD_PLACEHOLDER),
    ("TRUST_TOKEN", icsync_core::config::TRUST_TOKEN_PLACEHOLDER),
];

#[derive(Debug, Parser)]
#[command(name = "icsync", version, about = "One-way iCloud Photos Library mirror")]
struct Cli {
    #[command(flatten)]
    opts: GlobalOpts,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct GlobalOpts {
    /// Apple ID username
    #[arg(short = 'u', long, env = "APPLE_ID_USER")]
    username: Option<String>,

    /// Apple ID password
    #[arg(short = 'p', long, env = "APPLE_ID_PWD")]
    password: Option<String>,

    /// Trust token to use instead of the persisted one
    #[arg(short = 'T', long, env = "TRUST_TOKEN")]
    trust_token: Option<String>,

    /// Directory to store the local library in
    #[arg(short = 'd', long, env = "DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Port for the MFA intake server
    #[arg(short = 'P', long, env = "PORT", default_value_t = DEFAULT_MFA_PORT)]
    port: u16,

    /// Override an existing library lock
    #[arg(long, env = "FORCE")]
    force: bool,

    /// Discard the persisted trust token before authenticating
    #[arg(long)]
    refresh_token: bool,

    /// Fail instead of waiting for MFA input (unattended environments)
    #[arg(long, env = "FAIL_ON_MFA")]
    fail_on_mfa: bool,

    /// Concurrent asset downloads
    #[arg(long, env = "DOWNLOAD_THREADS", default_value_t = DEFAULT_DOWNLOAD_THREADS)]
    download_threads: usize,

    /// Cron expression for daemon mode
    #[arg(long, env = "SCHEDULE", default_value = DEFAULT_SCHEDULE)]
    schedule: String,

    /// Persist and upload error reports on fatal failures
    #[arg(long, env = "ENABLE_CRASH_REPORTING")]
    enable_crash_reporting: bool,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate credentials and acquire a trust token
    Token,
    /// Run one full synchronization
    Sync,
    /// Freeze an album folder locally
    Archive(archive::ArchiveArgs),
    /// Run syncs on a cron schedule
    Daemon,
}

impl GlobalOpts {
    /// Builds the runtime configuration; credentials must be present.
    fn into_config(self) -> Result<Config, String> {
        let username = self
            .username
            .ok_or("missing Apple ID username (-u or APPLE_ID_USER)")?;
        let password = self
            .password
            .ok_or("missing Apple ID password (-p or APPLE_ID_PWD)")?;

        let config = Config {
            username,
            password,
            trust_token: self.trust_token,
            data_dir: self.data_dir,
            mfa_port: self.port,
            force: self.force,
            refresh_token: self.refresh_token,
            fail_on_mfa: self.fail_on_mfa,
            download_threads: self.download_threads,
            schedule: self.schedule,
            enable_crash_reporting: self.enable_crash_reporting,
            log_level: self.log_level,
            ..Config::default()
        };
        config.validate()?;
        Ok(config)
    }
}

/// Sets up stderr plus file logging; the log file is truncated per start.
fn init_tracing(config: &Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;
    let log_file = std::fs::File::create(config.log_path())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(log_file)),
        )
        .init();
    Ok(())
}

/// Replaces secret environment variables with placeholders so child
/// processes and diagnostics never see the real values.
fn scrub_environment() {
    for (name, placeholder) in SENSITIVE_ENV {
        if std::env::var_os(name).is_some() {
            std::env::set_var(name, placeholder);
        }
    }
}

/// Cancels the token on SIGINT/SIGTERM.
fn install_signal_handler(cancel: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("SIGTERM handler installs");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }
        cancel.cancel();
    });
}

/// Logs lifecycle events as they arrive from the components.
fn spawn_event_logger(mut rx: tokio::sync::mpsc::UnboundedReceiver<Event>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                Event::Scheduled { next } => info!(next = %next, "Sync scheduled"),
                Event::RunStarted => info!("Sync started"),
                Event::Done {
                    assets_added,
                    assets_removed,
                    albums_changed,
                } => info!(assets_added, assets_removed, albums_changed, "Sync done"),
                Event::Retry { attempt, delay_secs } => {
                    warn!(attempt, delay_secs, "Sync will be retried")
                }
                Event::Failed { message } => error!(message, "Scheduled sync failed"),
                Event::MfaAwaited { port } => {
                    info!(port, "MFA required: POST /resend and /mfa on this port")
                }
                Event::Warning { area, message } => warn!(area, message, "Warning"),
            }
        }
    });
}

#[tokio::main]
async fn main() {
    // Exit code 1 for CLI misuse; clap's default of 2 is reserved for
    // interrupts here.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };
    let command = cli.command.unwrap_or(Commands::Daemon);

    let config = match cli.opts.into_config() {
        Ok(config) => config,
        Err(message) => {
            eprintln!("error: {message}");
            std::process::exit(1);
        }
    };
    scrub_environment();

    if let Err(e) = init_tracing(&config) {
        eprintln!("error: failed to initialize logging: {e}");
        std::process::exit(1);
    }
    info!(?config, version = env!("CARGO_PKG_VERSION"), "icsync starting");

    let cancel = tokio_util::sync::CancellationToken::new();
    install_signal_handler(cancel.clone());

    let (events, rx) = EventSink::channel();
    spawn_event_logger(rx);

    let result = match command {
        Commands::Token => token::execute(&config, &events).await,
        Commands::Sync => sync::execute(&config, &events, &cancel).await,
        Commands::Archive(args) => archive::execute(&config, args, &events, &cancel).await,
        Commands::Daemon => daemon::execute(&config, &events, &cancel).await,
    };

    // The lock is released inside each command on every path; interrupts
    // surface here as a regular fatal with exit code 2.
    let result = match result {
        Ok(()) if cancel.is_cancelled() => Err(AppError::new(InterruptError { signal: "signal" })),
        other => other,
    };

    match result {
        Ok(()) => {}
        Err(err) => {
            error!(error = %err, report_id = %err.report_id, "Aborting");
            if err.severity() == Severity::Fatal {
                let reporter = Reporter::new(config.reports_dir(), config.enable_crash_reporting);
                reporter.report(&err, Some(&config.log_path())).await;
            }
            eprintln!("error [{}]: {err}", err.report_id);
            std::process::exit(err.exit_code());
        }
    }
}
