//! Memora daemon: periodic background captioning.
//!
//! Each wake-up evaluates the scan policy against the current network and
//! power state, scans the library when due, and captions at most one queued
//! image. User-initiated work goes through the `memora` CLI; both share the
//! same database.
//!
//! ## Usage
//!
//! ```bash
//! memora-daemon              # Run until interrupted
//! memora-daemon --once       # Single background pass, then exit
//! ```

use anyhow::{Context, Result};
use chrono::Local;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use memora::caption::CaptionClient;
use memora::config::Config;
use memora::db::SqliteStore;
use memora::logging;
use memora::pipeline::{BackgroundFetchResult, Pipeline, PipelineOptions};
use memora::scanner::FsAssetSource;
use memora::schedule::{EnvironmentProbe, Scheduler, SchedulerStatus, SysfsProbe, TokioScheduler};

struct DaemonConfig {
    /// Overrides `background.min_interval_secs`.
    interval: Option<u64>,
    once: bool,
    config_path: Option<PathBuf>,
}

fn parse_args() -> DaemonConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = DaemonConfig {
        interval: None,
        once: false,
        config_path: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--once" | "-1" => {
                config.once = true;
            }
            "--interval" | "-i" => {
                if i + 1 < args.len() {
                    match args[i + 1].parse() {
                        Ok(interval) => config.interval = Some(interval),
                        Err(_) => {
                            eprintln!("Error: --interval expects a number of seconds");
                            std::process::exit(1);
                        }
                    }
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn print_help() {
    println!(
        r#"memora-daemon - Background captioning for Memora

USAGE:
    memora-daemon [OPTIONS]

OPTIONS:
    --once, -1          Run one background pass and exit
    --interval, -i N    Wake-up interval in seconds (default: background.min_interval_secs)
    --config, -c PATH   Path to config file
    --help, -h          Show this help message

ENVIRONMENT:
    MEMORA_CONFIG       Path to config file (overrides default location)
    MEMORA_API_KEY      Provider API key when not set in the config file
    MEMORA_LOG          Log level (trace, debug, info, warn, error)

Background work only runs when auto_scan is enabled and the wifi, power
and time window settings allow it. Change them with `memora settings`."#
    );
}

fn background_pass(pipeline: &Pipeline, probe: &dyn EnvironmentProbe) -> BackgroundFetchResult {
    let environment = probe.probe();
    let result = pipeline.run_background(environment, &Local::now());
    info!(
        on_wifi = environment.on_wifi,
        charging = environment.charging,
        result = ?result,
        "Background pass finished"
    );
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let daemon_config = parse_args();

    let _ = logging::init(Some(Config::config_dir().join("logs")));
    info!("Memora daemon starting");

    let config = match daemon_config.config_path {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let store = SqliteStore::open(&config.db_path)?;
    info!(path = %config.db_path.display(), "Database opened");

    let client = CaptionClient::from_config(&config.provider);
    let source = FsAssetSource::new(
        config.library.roots.clone(),
        config.library.image_extensions.clone(),
    );
    let pipeline = Arc::new(
        Pipeline::open(
            Arc::new(store),
            client.provider(),
            Arc::new(source),
            PipelineOptions::from_config(&config),
        )
        .context("Failed to load pipeline state")?,
    );
    let probe: Arc<dyn EnvironmentProbe> = Arc::new(SysfsProbe::new());

    if daemon_config.once {
        info!("Running in single-shot mode");
        let pass_pipeline = Arc::clone(&pipeline);
        let result =
            tokio::task::spawn_blocking(move || background_pass(&pass_pipeline, probe.as_ref()))
                .await?;
        println!("{:?}", result);
        return Ok(());
    }

    let mut scheduler = TokioScheduler::new();
    scheduler.set_enabled(config.background.enabled);
    if scheduler.status() != SchedulerStatus::Available {
        warn!(status = scheduler.status().as_str(), "Background scheduling unavailable");
        return Ok(());
    }

    let interval = Duration::from_secs(
        daemon_config.interval.unwrap_or(config.background.min_interval_secs),
    );
    let callback_pipeline = Arc::clone(&pipeline);
    scheduler.register_periodic(
        interval,
        Arc::new(move || {
            background_pass(&callback_pipeline, probe.as_ref());
        }),
    )?;
    info!(interval_secs = interval.as_secs(), "Daemon running; press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }

    scheduler.unregister();
    info!("Memora daemon stopped");
    Ok(())
}
