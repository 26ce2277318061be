//! Logging setup: journald on Linux, a daily log file everywhere else.
//!
//! The level comes from `MEMORA_LOG` (`debug`, `info`, `warn`, `error`, or
//! any `EnvFilter` directive such as `memora::pipeline=debug`). Defaults to
//! `info`.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_ENV: &str = "MEMORA_LOG";

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Call once, at startup.
///
/// `log_dir` is only used when journald is unavailable.
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(journald_layer.with_syslog_identifier("memora".to_string()))
                .try_init()?;

            tracing::info!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("memora")
            .join("logs")
    });
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "memora.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()?;

    tracing::info!(dir = %log_dir.display(), "Logging initialized with file backend");
    Ok(())
}
