// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! framepipe CLI
//!
//! Loads a pipeline configuration file, runs it until Ctrl+C (or for a
//! fixed duration) and prints final per-block statistics.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use framepipe::core::Timer;
use framepipe::Pipeline;

#[derive(Parser)]
#[command(name = "framepipe")]
#[command(author, version, about = "Modular video pipeline runner", long_about = None)]
struct Cli {
    /// Pipeline configuration file (JSON or YAML)
    #[arg(value_name = "CONFIG_FILE")]
    config: PathBuf,

    /// Run for this many seconds, then stop (default: until Ctrl+C)
    #[arg(short, long)]
    duration: Option<f64>,

    /// Print pipeline status every N seconds while running
    #[arg(long, value_name = "SECONDS")]
    status_interval: Option<f64>,

    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let pipeline = Pipeline::new();

    if let Err(e) = pipeline.load_file(&cli.config) {
        tracing::error!("failed to load pipeline from {}: {e}", cli.config.display());
        return ExitCode::from(1);
    }

    if let Err(e) = pipeline.start() {
        tracing::error!("failed to start pipeline: {e}");
        let _ = pipeline.shutdown();
        return ExitCode::from(1);
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        if let Err(e) = ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
        }) {
            tracing::warn!("failed to install Ctrl+C handler: {e}");
        }
    }

    match cli.duration {
        Some(seconds) => tracing::info!("running for {seconds}s (Ctrl+C to stop early)"),
        None => tracing::info!("running until Ctrl+C"),
    }

    let timer = Timer::start();
    let mut last_status = 0.0;
    while !interrupted.load(Ordering::SeqCst) {
        if let Some(limit) = cli.duration {
            if timer.elapsed_secs() >= limit {
                break;
            }
        }
        if let Some(interval) = cli.status_interval {
            if timer.elapsed_secs() - last_status >= interval {
                print!("{}", pipeline.status());
                last_status = timer.elapsed_secs();
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    if let Err(e) = pipeline.stop() {
        tracing::warn!("stop reported an error: {e}");
    }

    println!("--- final statistics ---");
    for (name, stats) in pipeline.all_stats() {
        println!(
            "{name}: processed={} dropped={} bytes={} fps={:.1} latency={:.2}ms",
            stats.frames_processed,
            stats.frames_dropped,
            stats.bytes_processed,
            stats.avg_fps,
            stats.avg_latency_ms,
        );
    }

    if let Err(e) = pipeline.shutdown() {
        tracing::warn!("shutdown reported an error: {e}");
    }

    ExitCode::SUCCESS
}
