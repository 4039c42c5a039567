//! Hot reload of `ferry.toml`.
//!
//! The file is polled rather than watched with inotify/kqueue so the same
//! code works on every platform and inside containers with bind mounts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::{Config, SharedConfig};
use crate::config_check::{self, CheckReport};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const SETTLE_DELAY: Duration = Duration::from_millis(200);

/// Sections applied through `App::apply_runtime_config` rather than read per request.
const RUNTIME_SECTIONS: [&str; 2] = ["hooks", "queue"];

/// What a reload attempt did with the file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReloadOutcome {
    /// The new config is live; these sections differ from the old one.
    Applied(Vec<&'static str>),
    /// Same content as the running config; nothing stored.
    Unchanged,
    /// Unparseable or failed validation; the running config stays.
    Invalid(Vec<String>),
    /// Touches sections that are wired in at start-up.
    NeedsRestart(Vec<&'static str>),
}

impl ReloadOutcome {
    fn touches_runtime(&self) -> bool {
        match self {
            Self::Applied(sections) => sections.iter().any(|s| RUNTIME_SECTIONS.contains(s)),
            _ => false,
        }
    }
}

/// Poll `config_path` and swap `config` whenever the file changes to a valid,
/// hot-reloadable config.
///
/// `runtime_notify` fires when hooks or queue settings change. Session and
/// gateway edits need no signal: policies are resolved per request.
pub(crate) fn spawn_config_watcher(
    config_path: PathBuf,
    config: SharedConfig,
    shutdown: CancellationToken,
    runtime_notify: Option<Arc<Notify>>,
) -> JoinHandle<()> {
    let span = info_span!("config_watcher", path = %config_path.display());
    tokio::spawn(
        async move {
            watch(&config_path, &config, &shutdown, runtime_notify.as_deref()).await;
        }
        .instrument(span),
    )
}

/// Modification time plus length. Length catches rewrites that land within
/// the filesystem's timestamp resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

impl FileStamp {
    fn read(path: &Path) -> Option<Self> {
        let metadata = std::fs::metadata(path).ok()?;
        Some(Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        })
    }
}

async fn watch(
    config_path: &Path,
    config: &SharedConfig,
    shutdown: &CancellationToken,
    runtime_notify: Option<&Notify>,
) {
    let mut stamp = FileStamp::read(config_path);
    info!("watching config for changes");

    loop {
        tokio::select! {
            () = tokio::time::sleep(POLL_INTERVAL) => {}
            () = shutdown.cancelled() => {
                debug!("config watcher stopped");
                return;
            }
        }

        let current = FileStamp::read(config_path);
        if current == stamp {
            continue;
        }
        stamp = current;

        // Let editors finish their write-rename dance before reading.
        tokio::time::sleep(SETTLE_DELAY).await;

        let outcome = try_reload(config_path, config);
        if outcome.touches_runtime()
            && let Some(notify) = runtime_notify
        {
            notify.notify_one();
        }
    }
}

fn try_reload(config_path: &Path, config: &SharedConfig) -> ReloadOutcome {
    let candidate = match Config::load(config_path) {
        Ok(candidate) => candidate,
        Err(e) => {
            warn!(
                error = %format!("{e:#}"),
                "config reload skipped: parse error"
            );
            return ReloadOutcome::Invalid(vec![format!("{e:#}")]);
        }
    };

    let mut report = CheckReport::default();
    config_check::validate_parsed(&mut report, &candidate);
    if report.has_errors() {
        let errors = report.errors();
        warn!(errors = ?errors, "config reload skipped: validation failed");
        return ReloadOutcome::Invalid(errors);
    }

    let running = config.load();
    let restart = restart_sections(&running, &candidate);
    if !restart.is_empty() {
        warn!(
            sections = ?restart,
            "config reload skipped: restart ferry to apply"
        );
        return ReloadOutcome::NeedsRestart(restart);
    }

    if **running == candidate {
        debug!("config touched without content changes");
        return ReloadOutcome::Unchanged;
    }

    let changed = changed_sections(&running, &candidate);
    config.store(Arc::new(candidate));
    info!(changed = ?changed, "config reloaded");
    ReloadOutcome::Applied(changed)
}

/// Sections baked into components at start-up.
fn restart_sections(running: &Config, candidate: &Config) -> Vec<&'static str> {
    [
        ("executor", running.executor != candidate.executor),
        ("sandbox", running.sandbox != candidate.sandbox),
        ("audit", running.audit != candidate.audit),
    ]
    .into_iter()
    .filter_map(|(name, differs)| differs.then_some(name))
    .collect()
}

fn changed_sections(running: &Config, candidate: &Config) -> Vec<&'static str> {
    [
        ("sessions", running.sessions != candidate.sessions),
        ("gateways", running.gateways != candidate.gateways),
        ("hooks", running.hooks != candidate.hooks),
        ("queue", running.queue != candidate.queue),
    ]
    .into_iter()
    .filter_map(|(name, differs)| differs.then_some(name))
    .collect()
}
