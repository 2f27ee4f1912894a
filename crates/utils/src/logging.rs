//! provides logging helpers

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// When set, logs are written to a daily rotated file under this path instead of stderr.
pub const LOG_PATH_ENV_VAR: &str = "LOG_PATH";

const DEFAULT_LOG_PREFIX: &str = "virtual-device-plugin.log";

/// Builds the fmt layer, writing either to stderr or to a rolling file below `log_path`.
///
/// The returned guard must be kept alive for as long as file logging should be flushed.
pub fn get_fmt_layer<S>(
    log_path: Option<&Path>,
) -> (Box<dyn Layer<S> + Send + Sync + 'static>, Option<WorkerGuard>)
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let Some(log_path) = log_path else {
        let fmt_layer = layer().with_writer(std::io::stderr).with_target(true);
        return (fmt_layer.boxed(), None);
    };

    let (dir, prefix) = split_log_path(log_path);
    let appender = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(dir)
    {
        Ok(appender) => appender,
        Err(e) => {
            eprintln!("failed to create log file under {dir:?}, logging to stderr: {e}");
            let fmt_layer = layer().with_writer(std::io::stderr).with_target(true);
            return (fmt_layer.boxed(), None);
        }
    };

    let (file_writer, guard) = tracing_appender::non_blocking(appender);
    let fmt_layer = layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true);
    (fmt_layer.boxed(), Some(guard))
}

/// A directory keeps the default file prefix; anything else is treated as `<dir>/<prefix>`.
fn split_log_path(log_path: &Path) -> (&Path, String) {
    if log_path.is_dir() {
        return (log_path, DEFAULT_LOG_PREFIX.to_string());
    }
    let dir = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = log_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_LOG_PREFIX.to_string());
    (dir, prefix)
}

/// initiate the global tracing subscriber
pub fn init(log_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let (fmt_layer, guard) = get_fmt_layer(log_path);

    registry().with(fmt_layer.with_filter(env_filter)).init();
    guard
}
