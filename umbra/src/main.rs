/*
SPDX-FileCopyrightText: Copyright 2026 The Umbra Project Authors
SPDX-License-Identifier: MIT
*/

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use umbra::camera::sim::SimCamera;
use umbra::camera::state::CameraSync;
use umbra::clock::EventClock;
use umbra::executor::{ExecutorConfig, ExposureExecutor};
use umbra::schedule;
use umbra::script;
use umbra::trigger::TriggerScheduler;

// ── CLI argument definition ───────────────────────────────────────────────────

/// Umbra eclipse exposure sequencer.
///
/// Compiles a YAML shot script into absolute-UTC exposure tracks and drives
/// them against the simulated camera body.  Real transports integrate by
/// implementing the `CameraDevice` trait in the library.
///
/// Example (rehearse tomorrow's 17:00 UTC contacts right now, shifted):
///   umbra --script demos/spain_eclipse.yaml --shift-hours 5
#[derive(Debug, Parser)]
#[command(
    name = "umbra",
    about = "Umbra eclipse exposure sequencer",
    long_about = None,
)]
struct Cli {
    /// Path to the YAML shot script.
    #[arg(short = 'f', long = "script")]
    script: PathBuf,

    /// Whole hours added to UTC now, for rehearsing the timeline early.
    #[arg(short = 's', long = "shift-hours", default_value_t = 0)]
    shift_hours: i64,

    /// Poll interval of the trigger loop, milliseconds.
    #[arg(long = "poll-ms", default_value_t = 200)]
    poll_ms: u64,

    /// Settle delay after each exposure, milliseconds (body dependent).
    #[arg(long = "settle-ms", default_value_t = 1_500)]
    settle_ms: u64,

    /// Per-attempt device event wait while the body is busy, milliseconds.
    #[arg(long = "event-timeout-ms", default_value_t = 5_000)]
    event_timeout_ms: u64,

    /// Upper bound on waiting for a capture to complete, milliseconds.
    #[arg(long = "capture-timeout-ms", default_value_t = 10_000)]
    capture_timeout_ms: u64,

    /// Virtual shutter-release hold time for bracket bursts, milliseconds.
    #[arg(long = "burst-hold-ms", default_value_t = 3_000)]
    burst_hold_ms: u64,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Initialise structured logging.
    // Level is controlled by the RUST_LOG env-var (e.g. RUST_LOG=debug).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Umbra starting up...");

    let cli = Cli::parse();

    info!(
        script = %cli.script.display(),
        shift_hours = cli.shift_hours,
        poll_ms = cli.poll_ms,
        settle_ms = cli.settle_ms,
        event_timeout_ms = cli.event_timeout_ms,
        "Configuration"
    );

    // ── Load and compile the shot script ──────────────────────────────────────
    let rows = match script::load_script(&cli.script) {
        Ok(rows) => rows,
        Err(e) => {
            error!("Failed to load shot script: {:#}", e);
            process::exit(1);
        }
    };

    let clock = EventClock::new(cli.shift_hours);
    let start = clock.now();
    info!(now = %start.format("%Y-%m-%d %H:%M:%S"), "sequencer clock (shifted UTC)");

    let compiled = match schedule::compile(&rows, clock.base_date(), start) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to compile schedule: {e}");
            process::exit(1);
        }
    };
    compiled.log_summary();

    // ── Bring up the camera ───────────────────────────────────────────────────
    let sync = match CameraSync::new(
        SimCamera::new(),
        Duration::from_millis(cli.event_timeout_ms),
    ) {
        Ok(sync) => sync,
        Err(e) => {
            error!("Failed to open camera: {e}");
            process::exit(1);
        }
    };

    let mut executor = ExposureExecutor::new(
        sync,
        ExecutorConfig {
            settle: Duration::from_millis(cli.settle_ms),
            capture_timeout: Duration::from_millis(cli.capture_timeout_ms),
            burst_hold: Duration::from_millis(cli.burst_hold_ms),
        },
    );
    if let Err(e) = executor.initialize() {
        error!("Camera configuration contract failed: {e}");
        process::exit(1);
    }

    // ── Run until Ctrl-C ──────────────────────────────────────────────────────
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received; stopping after the current dispatch");
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    let mut scheduler = TriggerScheduler::new(
        compiled,
        executor,
        clock,
        Duration::from_millis(cli.poll_ms),
    );

    if let Err(e) = scheduler.run(&stop).await {
        error!("Sequencer aborted: {e}");
        process::exit(1);
    }

    if let Err(e) = scheduler.executor_mut().sync_mut().close() {
        error!("Failed to close camera cleanly: {e}");
    }
    info!("Umbra shut down.");
}
