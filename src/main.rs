//! kmscap - Main entry point
//!
//! Captures a DRM/KMS plane at a fixed rate and reports dirty regions and
//! cursor changes.

mod args;

use args::Args;
use clap::Parser;
use kmscap::capture::{create_capturer, CaptureSession, Capturer, DumpMode};
use kmscap::config::Config;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::task;

/// Interval between statistics lines
const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration before logging so its level can apply
    let loaded = args.load_config();
    let mut config = match loaded {
        Ok(ref cfg) => cfg.clone(),
        Err(_) => Config::default(),
    };
    args.apply(&mut config);

    env_logger::Builder::new()
        .parse_filters(&std::env::var("KMSCAP_LOG").unwrap_or_else(|_| config.logging.level.clone()))
        .init();

    info!("kmscap v{}", env!("CARGO_PKG_VERSION"));
    match loaded {
        Ok(_) => info!("Loaded configuration from {:?}", args.config),
        Err(e) => warn!("Failed to load config: {}, using defaults", e),
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e.into());
    }
    let capture_config = config.capture.clone();

    // One-shot dump
    if let Some(ref path) = args.dump {
        let mode = if args.dump_raw { DumpMode::Raw } else { DumpMode::Converted };
        let mut session = CaptureSession::open(&capture_config)?;
        session.dump_frame(path, mode)?;
        return Ok(());
    }

    let running = Arc::new(AtomicBool::new(true));
    let capture_running = running.clone();
    let mut capture_handle = task::spawn_blocking(move || -> Result<(), String> {
        let mut session: Box<dyn Capturer> = create_capturer(&capture_config).map_err(|e| e.to_string())?;
        let (width, height) = session.dimensions();
        info!("Capturing {}x{} at {} fps", width, height, capture_config.fps);

        let interval = Duration::from_secs_f64(1.0 / capture_config.fps as f64);
        let mut last_stats = Instant::now();
        while capture_running.load(Ordering::Relaxed) {
            let frame_start = Instant::now();

            match session.next_frame() {
                Ok(Some(rect)) => {
                    let (x1, y1, x2, y2) = rect.to_exclusive();
                    debug!("Modified region {},{} -> {},{}", x1, y1, x2, y2);
                }
                Ok(None) => {}
                Err(e) => warn!("Frame capture failed: {}", e),
            }

            if let Some(cursor) = session.next_cursor() {
                info!(
                    "Cursor changed: {}x{} at +{}+{}",
                    cursor.width, cursor.height, cursor.origin_x, cursor.origin_y
                );
            }

            if last_stats.elapsed() >= STATS_INTERVAL {
                let stats = session.stats();
                info!(
                    "Frames: {} total, {} changed, {} failed, avg capture {}us",
                    stats.total_frames,
                    stats.changed_frames,
                    stats.failed_frames,
                    stats.average_capture_time_us()
                );
                last_stats = Instant::now();
            }

            // Frames that overrun the interval are not made up
            let elapsed = frame_start.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        Ok(())
    });

    // Wait for shutdown signal
    let mut terminate = unix_signal(SignalKind::terminate())?;
    let mut hangup = unix_signal(SignalKind::hangup())?;
    let shutdown = async {
        tokio::select! {
            _ = signal::ctrl_c() => info!("Received SIGINT"),
            _ = terminate.recv() => info!("Received SIGTERM"),
            _ = hangup.recv() => info!("Received SIGHUP"),
        }
        info!("Shutdown signal received");
    };

    tokio::select! {
        _ = shutdown => {
            info!("Initiating graceful shutdown...");
        }
        result = &mut capture_handle => {
            return log_blocking_task_result("Capture loop", result);
        }
    }

    // Cleanup
    running.store(false, Ordering::Relaxed);
    let result = capture_handle.await;
    log_blocking_task_result("Capture loop", result)?;

    info!("Shutdown complete");
    Ok(())
}

fn log_blocking_task_result(
    name: &str,
    result: Result<Result<(), String>, task::JoinError>,
) -> Result<(), Box<dyn std::error::Error>> {
    match result {
        Ok(Ok(())) => {
            info!("{} exited", name);
            Ok(())
        }
        Ok(Err(e)) => {
            error!("{} failed: {}", name, e);
            Err(e.into())
        }
        Err(e) => {
            error!("{} panicked: {}", name, e);
            Err(e.into())
        }
    }
}
