//! Logging setup with journald support on Linux.
//!
//! Logs go to systemd's journal when it is reachable, otherwise to a daily
//! rolling file under the local data directory.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system.
///
/// Log level is read from the `PHOTOSENSE_LOG` environment variable using
/// `EnvFilter` syntax, e.g. `PHOTOSENSE_LOG=photosense::scan=debug,info`.
/// Defaults to `info`.
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_env("PHOTOSENSE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer)
                .init();

            tracing::info!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photosense")
            .join("logs")
    });

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "photosense.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // The writer stops flushing once the guard drops
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    tracing::info!(log_dir = ?log_dir, "Logging initialized with file backend");
    Ok(())
}
