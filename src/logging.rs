//! Structured logging setup.
//!
//! Console output is always enabled; when `SCHEDULER_LOG_DIR` is set, a
//! JSON file layer is added so job lifecycle audit entries survive service
//! restarts. All scheduler errors are recorded here with job-id context;
//! the poller has no caller to surface them to.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the global tracing subscriber.
///
/// Safe to call more than once; only the first call installs anything.
/// `interactive` controls ANSI colors on the console layer.
pub fn init_logging(interactive: bool) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,scheduler_core=debug"));

        let console = fmt::layer()
            .with_target(true)
            .with_ansi(interactive)
            .with_filter(filter);

        match log_dir() {
            Some(dir) => {
                let appender = tracing_appender::rolling::daily(&dir, "scheduler.log");
                let (writer, guard) = tracing_appender::non_blocking(appender);

                let file = fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .json()
                    .with_filter(EnvFilter::new("info"));

                if tracing_subscriber::registry()
                    .with(console)
                    .with(file)
                    .try_init()
                    .is_ok()
                {
                    // Keep the non-blocking writer alive for the process
                    // lifetime.
                    std::mem::forget(guard);
                    tracing::info!(log_dir = %dir.display(), "File logging enabled");
                }
            }
            None => {
                let _ = tracing_subscriber::registry().with(console).try_init();
            }
        }
    });
}

fn log_dir() -> Option<PathBuf> {
    let dir = PathBuf::from(std::env::var("SCHEDULER_LOG_DIR").ok()?);
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir)
}
