use anyhow::{Context, Result};
use chrono::Utc;
use ferry_core::{InjectOptions, InjectionSource};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::app::App;
use crate::config_watcher::spawn_config_watcher;
use crate::protocol::{
    CancelScope, ClientMessage, ClientRequest, ServerMessage, ServerResponse, SourceSpec,
};

const RESPONSE_BUFFER: usize = 256;
const STREAM_BUFFER: usize = 64;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type Responses = mpsc::Sender<ServerResponse>;

/// Run `ferry serve` on stdin/stdout until stdin closes or Ctrl-C.
pub(crate) async fn run(app: Arc<App>, config_path: PathBuf) -> Result<()> {
    let shutdown = CancellationToken::new();

    let notify = Arc::new(tokio::sync::Notify::new());
    let watcher = spawn_config_watcher(
        config_path,
        Arc::clone(&app.config),
        shutdown.clone(),
        Some(Arc::clone(&notify)),
    );

    let reload_app = Arc::clone(&app);
    let reload_shutdown = shutdown.clone();
    let reloader = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = notify.notified() => reload_app.apply_runtime_config(),
                () = reload_shutdown.cancelled() => return,
            }
        }
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_shutdown.cancel();
        }
    });

    let stdin = BufReader::new(tokio::io::stdin());
    let result = serve_lines(app, stdin, tokio::io::stdout(), shutdown.clone()).await;

    shutdown.cancel();
    let _ = watcher.await;
    let _ = reloader.await;
    result
}

/// Serve requests from `reader`, writing responses and events to `writer`.
///
/// Returns after the input closes or `shutdown` fires; everything still
/// queued or running is cancelled first.
pub(crate) async fn serve_lines<R, W>(
    app: Arc<App>,
    reader: R,
    writer: W,
    shutdown: CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
    let writer_task = tokio::spawn(write_responses(writer, rx));

    let mut background = JoinSet::new();
    background.spawn(mirror_events(
        app.queues.subscribe(),
        tx.clone(),
        shutdown.clone(),
    ));
    background.spawn(housekeeping(Arc::clone(&app), tx.clone(), shutdown.clone()));

    let mut injections = JoinSet::new();
    let mut lines = reader.lines();
    info!("serving requests on stdin");

    let result = loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            () = shutdown.cancelled() => break Ok(()),
        };
        match line.context("failed to read request") {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                handle_line(&app, &line, &tx, &mut injections).await;
                while injections.try_join_next().is_some() {}
            }
            Ok(None) => {
                debug!("input closed");
                break Ok(());
            }
            Err(e) => break Err(e),
        }
    };

    shutdown.cancel();
    let cancelled = app.queues.cancel_everything();
    debug!(cancelled, "draining in-flight injections");
    if tokio::time::timeout(DRAIN_TIMEOUT, async {
        while injections.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("in-flight injections did not settle, aborting");
        injections.abort_all();
    }
    while background.join_next().await.is_some() {}

    drop(tx);
    writer_task.await.context("response writer panicked")??;
    result
}

async fn write_responses<W>(mut writer: W, mut rx: mpsc::Receiver<ServerResponse>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let encoded = serde_json::to_string(&response).context("failed to encode response")?;
        writer
            .write_all(encoded.as_bytes())
            .await
            .context("failed to write response")?;
        writer
            .write_all(b"\n")
            .await
            .context("failed to write response delimiter")?;
        writer.flush().await.context("failed to flush response")?;
    }
    Ok(())
}

async fn send(tx: &Responses, response: ServerResponse) {
    if tx.send(response).await.is_err() {
        debug!("response writer closed, dropping response");
    }
}

async fn handle_line(
    app: &Arc<App>,
    line: &str,
    tx: &Responses,
    injections: &mut JoinSet<()>,
) {
    let request: ClientRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "invalid request");
            let message = ServerMessage::error(format!("invalid request: {e}"));
            send(tx, ServerResponse::unsolicited(message)).await;
            return;
        }
    };
    let id = request.request;

    match request.message {
        ClientMessage::Inject {
            session,
            message,
            source,
            priority,
            allow_live,
            stream,
        } => {
            let source = source.map_or_else(|| InjectionSource::cli(None), SourceSpec::into_source);
            let mut options = InjectOptions::default().with_priority(priority);
            options.allow_live_inject = allow_live;

            let span = info_span!("serve_inject", request = ?id, session = %session);
            injections.spawn(
                run_inject(
                    Arc::clone(app),
                    id,
                    session,
                    message,
                    source,
                    options,
                    stream,
                    tx.clone(),
                )
                .instrument(span),
            );
        }
        ClientMessage::Cancel {
            session,
            scope,
            inject_id,
        } => {
            let count = match (inject_id, scope) {
                (Some(inject_id), _) => usize::from(app.queues.cancel(&session, inject_id)),
                (None, CancelScope::Active) => usize::from(app.queues.cancel_active(&session)),
                (None, CancelScope::Queued) => app.queues.cancel_queued(&session),
                (None, CancelScope::All) => app.queues.cancel_all(&session),
            };
            let response = ServerResponse::reply(id, ServerMessage::Cancelled { count });
            send(tx, response).await;
        }
        ClientMessage::CancelEverything => {
            let count = app.queues.cancel_everything();
            let response = ServerResponse::reply(id, ServerMessage::Cancelled { count });
            send(tx, response).await;
        }
        ClientMessage::Stats { session } => {
            let sessions = match session {
                Some(session) => app.queues.stats(&session).into_iter().collect(),
                None => app.queues.all_stats(),
            };
            let response = ServerResponse::reply(id, ServerMessage::Stats { sessions });
            send(tx, response).await;
        }
        ClientMessage::PendingForwards => {
            let pending = app.injector.pending_forwards();
            let response = ServerResponse::reply(id, ServerMessage::Forwards { pending });
            send(tx, response).await;
        }
        ClientMessage::ApproveForward { id: forward_id } => {
            let app = Arc::clone(app);
            let tx = tx.clone();
            injections.spawn(
                async move {
                    let message = match app.injector.approve_forward(forward_id).await {
                        Ok(outcome) => ServerMessage::Outcome { outcome },
                        Err(e) => ServerMessage::error(e.to_string()),
                    };
                    send(&tx, ServerResponse::reply(id, message)).await;
                }
                .instrument(info_span!("serve_approve", forward = %forward_id)),
            );
        }
        ClientMessage::RejectForward {
            id: forward_id,
            reason,
        } => {
            let message = match app.injector.reject_forward(forward_id, reason) {
                Ok(forward) => ServerMessage::Forward { forward },
                Err(e) => ServerMessage::error(e.to_string()),
            };
            send(tx, ServerResponse::reply(id, message)).await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_inject(
    app: Arc<App>,
    id: Option<String>,
    session: String,
    message: ferry_core::InjectMessage,
    source: InjectionSource,
    mut options: InjectOptions,
    stream: bool,
    tx: Responses,
) {
    let forwarder = if stream {
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(STREAM_BUFFER);
        options.stream = Some(chunk_tx);
        let tx = tx.clone();
        let id = id.clone();
        let session = session.clone();
        Some(tokio::spawn(async move {
            while let Some(text) = chunk_rx.recv().await {
                let chunk = ServerMessage::Chunk {
                    session: session.clone(),
                    text,
                };
                send(&tx, ServerResponse::reply(id.clone(), chunk)).await;
            }
        }))
    } else {
        None
    };

    let result = app
        .injector
        .inject(&session, message, source, options)
        .await;
    // Chunks go out before the outcome.
    if let Some(forwarder) = forwarder {
        let _ = forwarder.await;
    }

    let message = match result {
        Ok(outcome) => ServerMessage::Outcome { outcome },
        Err(e) => ServerMessage::error(e.to_string()),
    };
    send(&tx, ServerResponse::reply(id, message)).await;
}

async fn mirror_events(
    mut events: broadcast::Receiver<ferry_queue::QueueEvent>,
    tx: Responses,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            () = shutdown.cancelled() => return,
        };
        match event {
            Ok(event) => {
                let response = ServerResponse::unsolicited(ServerMessage::Event { event });
                send(&tx, response).await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event mirror lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Periodic cleanup of idle queues and stale forward requests.
async fn housekeeping(app: Arc<App>, tx: Responses, shutdown: CancellationToken) {
    let period = Duration::from_secs(app.config.load().queue.idle_cleanup_secs.max(1));
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            () = shutdown.cancelled() => return,
        }

        let max_idle = Duration::from_secs(app.config.load().queue.idle_cleanup_secs);
        let removed = app.queues.cleanup(max_idle);
        let pruned = app.injector.forwards().prune_terminal();
        let expired = app.injector.forwards().expire_stale(Utc::now());
        if removed > 0 || pruned > 0 || !expired.is_empty() {
            debug!(removed, pruned, expired = expired.len(), "housekeeping");
        }
        if !expired.is_empty() {
            let response = ServerResponse::unsolicited(ServerMessage::Expired { ids: expired });
            send(&tx, response).await;
        }
    }
}
