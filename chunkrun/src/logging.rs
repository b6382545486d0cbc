use std::{fs, io, path::Path};

use anyhow::{bail, Context};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
    Layer,
};

/// Installs the global subscriber: `console_level` (or `RUST_LOG`) on stderr
/// and `file_level` to `file`.
///
/// The returned guard flushes the file writer when dropped and must be held
/// until the program exits.
pub fn init_logging(
    console_level: LevelFilter,
    file: &Path,
    file_level: LevelFilter,
) -> anyhow::Result<WorkerGuard> {
    let Some(file_name) = file.file_name() else {
        bail!("Log path {} has no file name", file.display());
    };
    let directory = file.parent().filter(|parent| !parent.as_os_str().is_empty());
    if let Some(directory) = directory {
        fs::create_dir_all(directory)
            .with_context(|| format!("Failed to create log directory {}", directory.display()))?;
    }

    let appender =
        tracing_appender::rolling::never(directory.unwrap_or_else(|| Path::new(".")), file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let console_layer = fmt::layer().with_writer(io::stderr).with_target(false).with_filter(
        EnvFilter::builder().with_default_directive(console_level.into()).from_env_lossy(),
    );
    let file_layer = fmt::layer().with_writer(writer).with_ansi(false).with_filter(file_level);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install the log subscriber")?;

    Ok(guard)
}
