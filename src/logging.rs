use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context as _;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt as _;

pub fn init() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter()?)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}

fn env_filter() -> anyhow::Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("build log filter")
}

/// Builds a dispatcher that writes events to stderr and appends them to `path`.
pub fn tee_dispatch(path: &Path) -> anyhow::Result<tracing::Dispatch> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file: {}", path.display()))?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter()?)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr.and(Mutex::new(file)))
        .finish();

    Ok(tracing::Dispatch::new(subscriber))
}

/// Runs `f` with log output tee'd into `path`.
///
/// The tee is installed as the thread's default dispatcher only for the
/// duration of `f`; whatever was active before is back in place once `f`
/// returns or unwinds. If the log file cannot be opened, `f` still runs
/// against the current dispatcher.
pub fn with_log_file<T>(path: &Path, f: impl FnOnce() -> T) -> T {
    match tee_dispatch(path) {
        Ok(dispatch) => tracing::dispatcher::with_default(&dispatch, || {
            tracing::info!(path = %path.display(), "logging to file");
            f()
        }),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %format!("{err:#}"),
                "failed to open log file; logging to stderr only"
            );
            f()
        }
    }
}
