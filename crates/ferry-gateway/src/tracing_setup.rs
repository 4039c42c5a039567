use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Path of the JSONL trace file. Unset means no file layer.
const TRACE_FILE_ENV: &str = "FERRY_TRACE_FILE";
/// Filter for the trace file only, e.g. `ferry::audit=info`.
const TRACE_LEVEL_ENV: &str = "FERRY_TRACE_LEVEL";
const DEFAULT_TRACE_NAME: &str = "ferry-traces.jsonl";

/// Holds the trace file writer open. Dropping it flushes buffered lines.
pub(crate) struct TracingGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber: human-readable stderr plus an optional
/// JSONL trace file.
///
/// Stderr is filtered by `RUST_LOG` (default `info`); stdout is left alone
/// because it carries command output and the serve protocol. The file layer
/// uses `FERRY_TRACE_LEVEL`, then `RUST_LOG`, then `debug`. Audit entries
/// carry the `ferry::audit` target in both.
pub(crate) fn init() -> TracingGuard {
    let (file_layer, file_guard) = match std::env::var(TRACE_FILE_ENV) {
        Ok(trace_file) if !trace_file.is_empty() => {
            let (layer, guard) = trace_file_layer(Path::new(&trace_file));
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    Registry::default()
        .with(console_layer())
        .with(file_layer)
        .init();

    TracingGuard { _file: file_guard }
}

fn console_layer<S>() -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter)
}

fn trace_file_layer<S>(path: &Path) -> (impl Layer<S>, WorkerGuard)
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let (dir, name) = split_trace_path(path);
    let appender = tracing_appender::rolling::never(dir, name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_env(TRACE_LEVEL_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("debug"));

    let layer = fmt::layer()
        .json()
        .with_writer(writer)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_filter(filter);
    (layer, guard)
}

/// Directory and file name for the appender. A bare file name lands in `.`.
fn split_trace_path(path: &Path) -> (PathBuf, String) {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let name = path.file_name().map_or_else(
        || DEFAULT_TRACE_NAME.to_owned(),
        |name| name.to_string_lossy().into_owned(),
    );
    (dir, name)
}
