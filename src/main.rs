//! channel-tail CLI - prints the messages delivered on a realtime channel.
//!
//! This is the main binary entry point. See the `channel_tail` library for
//! the core functionality.

use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use channel_tail::constants::{HARD_SHUTDOWN_DEADLINE, RUNTIME_SHUTDOWN_TIMEOUT};
use channel_tail::diagnostics::{init_logging, LogSink};
use channel_tail::{AblyRealtime, ChannelSession, Config, ConfigError, RendererRegistry};
use clap::error::ErrorKind;
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> ExitCode {
    let config = match Config::from_args(std::env::args_os()) {
        Ok(config) => config,
        Err(e) => return config_failure(&e),
    };

    init_logging(&config);
    log::debug!("Starting with {config:?}");

    match run(config) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Report a configuration problem. Help and version output are not failures.
fn config_failure(error: &ConfigError) -> ExitCode {
    match error {
        ConfigError::Usage(e) => {
            // Clap already formats help, version and usage errors.
            let _ = e.print();
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            }
        }
        other => {
            eprintln!("Error: {other}");
            eprintln!("Usage: channel-tail --api-key <KEY> --channel <NAME> [--event <NAME>] [--quiet] [--debug]");
            ExitCode::FAILURE
        }
    }
}

/// Runs the session to completion.
///
/// Session failures are already reported by the session's diagnostics and
/// only change the exit code. `Err` is left for failures before the session
/// starts.
fn run(config: Config) -> Result<ExitCode> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let shutdown = CancellationToken::new();
    install_signal_handler(shutdown.clone())?;

    let config = Arc::new(config);
    let mut client = AblyRealtime::from_config(&config);
    let mut session = ChannelSession::builder(Arc::clone(&config))
        .renderers(RendererRegistry::with_builtin_overrides())
        .output(std::io::stdout())
        .diagnostics(Arc::new(LogSink::default()))
        .build();

    let result = runtime.block_on(session.run(&mut client, shutdown));
    drop(client);
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);

    Ok(match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    })
}

/// Cancel `shutdown` on SIGINT/SIGTERM/SIGHUP.
///
/// The first signal starts a graceful shutdown and arms a watchdog that
/// exits the process after [`HARD_SHUTDOWN_DEADLINE`]. A second signal exits
/// immediately.
fn install_signal_handler(shutdown: CancellationToken) -> Result<()> {
    let signals = AtomicUsize::new(0);
    ctrlc::set_handler(move || {
        if signals.fetch_add(1, Ordering::SeqCst) > 0 {
            log::warn!("Second termination signal, exiting now");
            std::process::exit(0);
        }

        log::info!("Termination signal received, shutting down");
        shutdown.cancel();

        std::thread::spawn(|| {
            std::thread::sleep(HARD_SHUTDOWN_DEADLINE);
            log::warn!(
                "Shutdown did not finish within {}s, exiting",
                HARD_SHUTDOWN_DEADLINE.as_secs()
            );
            std::process::exit(0);
        });
    })
    .context("Failed to install signal handler")
}
