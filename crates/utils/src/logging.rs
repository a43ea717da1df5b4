//! provides logging helpers

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Directory for daily rotated log files. Logs go to stderr when unset.
pub const LOG_PATH_ENV_VAR: &str = "THROUGHPUT_LOG_PATH";

const LOG_FILE_PREFIX: &str = "throughput.log";

/// Builds the human readable log layer, writing to `log_path` when given.
///
/// Falls back to stderr if the log directory cannot be used.
pub fn get_fmt_layer<S>(log_path: Option<String>) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    if let Some(log_path) = log_path {
        match RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .max_log_files(7)
            .build(Path::new(&log_path))
        {
            Ok(appender) => {
                return layer()
                    .with_writer(appender)
                    .with_ansi(false)
                    .with_target(true)
                    .boxed();
            }
            Err(err) => {
                eprintln!("failed to create log file appender at {log_path}: {err}; logging to stderr");
            }
        }
    }

    layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .boxed()
}

/// Default level filter: `INFO`, overridable through `RUST_LOG`.
pub fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
pub fn init() {
    let log_path = std::env::var(LOG_PATH_ENV_VAR).ok();
    let fmt_layer = get_fmt_layer(log_path).with_filter(env_filter());

    registry().with(fmt_layer).init();
}
