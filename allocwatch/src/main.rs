//! # allocwatch - Main Entry Point
//!
//! - `allocwatch`: trace allocwatch's own allocations (warm-up included)
//! - `allocwatch <PROCESS>` / `allocwatch --pid <PID>`: trace another process
//!
//! Startup order: preflight, memlock limit, load, attach, subscribe, then the
//! poll loop until Ctrl+C, SIGTERM or `--duration`.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use allocwatch::cli::Args;
use allocwatch::lifecycle::Session;
use allocwatch::preflight::{bump_memlock_rlimit, run_preflight_checks};
use allocwatch::probe::{log_probe_stats, AyaProbe};
use allocwatch::resolver::{DlResolver, MapsResolver};
use allocwatch::sink::{display_summary, ConsolePrinter, Discard, EventSink};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("operation not permitted") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

/// Allocate and free `size` bytes through the global allocator
fn allocate(size: usize) {
    let buf: Vec<u8> = Vec::with_capacity(size);
    drop(std::hint::black_box(buf));
}

/// Cancel `token` on Ctrl+C or SIGTERM
fn spawn_signal_handler(token: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
        token.cancel();
    });

    Ok(())
}

#[tokio::main]
async fn run() -> Result<()> {
    let config = Args::parse().into_config()?;

    run_preflight_checks(&config.probe_object, config.pid)?;
    bump_memlock_rlimit()?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let mut session = Session::new();
    session.load(AyaProbe::load(&config.probe_object)?)?;

    // dlsym/dladdr see exactly what this process bound; other processes (or
    // an explicit --binary) go through /proc/<pid>/maps
    let target = if config.traces_self() && config.binary.is_none() {
        session.attach(&DlResolver, &config.symbol, config.pid)
    } else {
        let resolver = MapsResolver::new(config.pid).with_binary(config.binary.clone());
        session.attach(&resolver, &config.symbol, config.pid)
    }
    .with_context(|| format!("Failed to attach to {}", config.symbol))?;

    session.subscribe().context("Failed to subscribe to probe events")?;

    if !config.quiet {
        eprintln!("Tracing {} at {target}. Press Ctrl+C to stop.", config.symbol);
    }

    let mut sink: Box<dyn EventSink> = if config.quiet {
        Box::new(Discard)
    } else {
        Box::new(ConsolePrinter::new(std::io::stdout(), config.symbol.clone()))
    };

    if config.traces_self() && config.warmup > 0 {
        session.warm_up(config.warmup, allocate, &mut *sink).await?;
    }

    let result = session.run(config.poll_interval, config.duration, &mut *sink, &cancel).await;

    // Counters live in the program's maps; read them before it goes away
    let probe_stats = session.probe_stats();
    session.close();
    log_probe_stats(probe_stats);

    let summary = result?;
    display_summary(&summary, probe_stats.as_ref());
    Ok(())
}
