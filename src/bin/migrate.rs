//! CLI entry point for the replication engine.

use std::process;

use clap::Parser;
use lazy_static::lazy_static;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use mongomirror::config::{self, Config};
use mongomirror::orchestrator::{Mode, Orchestrator, Threads};
use mongomirror::shutdown::Shutdown;

/// Continuous collection replication between document stores.
#[derive(Debug, Parser)]
#[command(name = "migrate", version)]
struct Args {
    /// Operation mode: migrate, cdc, verify, or update.
    #[arg(default_value = "migrate")]
    mode: String,

    /// Change-capture parallelism: `auto` for one worker per collection, or
    /// a worker count.
    #[arg(long)]
    threads: Option<String>,

    /// Documents per fetch/apply batch.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Ignore saved watermarks and scan fully.
    #[arg(long)]
    force_refresh: bool,
}

lazy_static! {
    static ref SHUTDOWN: Shutdown = Shutdown::new();
}

extern "C" fn handle_signal(_signal: libc::c_int) {
    // Only the atomic store is allowed here; workers notice at their next
    // batch boundary and drain cleanly.
    SHUTDOWN.trigger();
}

fn install_signal_handlers() {
    let handler = handle_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

/// One initialization point for log sinks: stderr plus a rolling file under
/// the log directory. `RUST_LOG` overrides the default `info` filter.
fn init_logging(cfg: &Config) -> tracing_appender::non_blocking::WorkerGuard {
    let _ = std::fs::create_dir_all(&cfg.log_dir);
    let appender = tracing_appender::rolling::daily(&cfg.log_dir, "migrate.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(false);
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let args = Args::parse();

    let mut cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("configuration error: {}", err);
            return 1;
        }
    };
    if let Some(batch_size) = args.batch_size {
        cfg.batch_size = batch_size.max(1);
    }
    if args.force_refresh {
        cfg.force_refresh = true;
    }

    let _log_guard = init_logging(&cfg);
    // Touch the flag before handlers are installed: initialization must not
    // happen inside the signal handler itself.
    let shutdown = SHUTDOWN.clone();
    install_signal_handlers();
    info!("=== migration tool starting ===");

    let mode = match args.mode.parse::<Mode>() {
        Ok(mode) => mode,
        Err(err) => {
            error!(%err, "invalid mode");
            return 1;
        }
    };
    let threads = match args.threads.as_deref() {
        None => Threads::PerCollection,
        Some(raw) => match raw.parse::<Threads>() {
            Ok(threads) => threads,
            Err(err) => {
                error!(%err, "invalid thread count");
                return 1;
            }
        },
    };

    let mappings = match config::load_mappings("collections.json") {
        Ok(mappings) if mappings.is_empty() => {
            error!("collections.json lists no collections");
            return 1;
        }
        Ok(mappings) => mappings,
        Err(err) => {
            error!(%err, "failed to load collections.json");
            return 1;
        }
    };
    info!(collections = mappings.len(), "loaded collection mappings");

    let orchestrator = match Orchestrator::new(cfg, shutdown) {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            error!(%err, "initialization failed");
            return 1;
        }
    };
    match orchestrator.run(mode, mappings, threads) {
        Ok(code) => code,
        Err(err) => {
            error!(%err, "run failed");
            1
        }
    }
}
