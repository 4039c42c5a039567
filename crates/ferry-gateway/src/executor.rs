//! Executors the daemon installs into the queue manager.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ferry_core::{ExecuteRequest, Executor, InjectResult};
use ferry_policy::{ContextRegistry, PolicyEngine, SecurityContext};
use ferry_sandbox::SandboxResolver;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The session exempt from `non-main` sandboxing.
pub(crate) const MAIN_SESSION: &str = "main";

/// Routes executor commands through the session's sandbox container.
pub(crate) struct SandboxRouting {
    pub resolver: Arc<SandboxResolver>,
    /// Container CLI used for `exec`.
    pub runtime: String,
}

/// Runs a configured command per injection: message on stdin, response on stdout.
pub(crate) struct CommandExecutor {
    command: Vec<String>,
    timeout: Duration,
    sandbox: Option<SandboxRouting>,
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("command", &self.command)
            .field("timeout", &self.timeout)
            .field("sandboxed", &self.sandbox.is_some())
            .finish()
    }
}

impl CommandExecutor {
    pub(crate) fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            sandbox: None,
        }
    }

    #[must_use]
    pub(crate) fn with_sandbox(mut self, routing: SandboxRouting) -> Self {
        self.sandbox = Some(routing);
        self
    }

    /// The argv for one turn, wrapped in `<runtime> exec` when the session
    /// must be sandboxed. Refuses to run unsandboxed in that case.
    async fn argv_for(&self, session: &str) -> Result<Vec<String>> {
        let Some(routing) = &self.sandbox else {
            return Ok(self.command.clone());
        };

        let request = routing.resolver.resolve_request(session);
        if !request.config.required_for(session == MAIN_SESSION) {
            debug!(
                session,
                trust = %request.trust_level,
                "sandbox not required for session"
            );
            return Ok(self.command.clone());
        }

        let handle = routing
            .resolver
            .get_sandbox_for_session(session)
            .await?
            .with_context(|| {
                format!(
                    "session {session} requires a {} sandbox but none could be provided",
                    request.trust_level
                )
            })?;

        let mut argv = vec![
            routing.runtime.clone(),
            "exec".to_owned(),
            "-i".to_owned(),
            "-w".to_owned(),
            handle.workdir.display().to_string(),
            handle.container.clone(),
        ];
        argv.extend(self.command.iter().cloned());
        info!(
            session,
            container = %handle.container,
            "running turn in sandbox"
        );
        Ok(argv)
    }
}

/// Collect stdout lines, forwarding each to `stream` as it arrives.
async fn read_output(
    stdout: ChildStdout,
    stream: Option<&mpsc::Sender<String>>,
) -> Result<String> {
    let mut lines = BufReader::new(stdout).lines();
    let mut response = String::new();
    while let Some(line) = lines
        .next_line()
        .await
        .context("failed to read executor output")?
    {
        if let Some(stream) = stream {
            if stream.send(line.clone()).await.is_err() {
                debug!("stream receiver dropped, collecting output only");
            }
        }
        if !response.is_empty() {
            response.push('\n');
        }
        response.push_str(&line);
    }
    Ok(response)
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, request: ExecuteRequest) -> Result<InjectResult> {
        let argv = self.argv_for(&request.session_key).await?;
        let (program, args) = argv.split_first().context("executor command is empty")?;

        let mut child = Command::new(program)
            .args(args)
            .env("FERRY_SESSION", &request.session_key)
            .env("FERRY_INJECT_ID", request.inject_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn executor {program}"))?;

        // Written from its own task so cancel and timeout apply while a command
        // leaves its input unread.
        let stdin_task = child.stdin.take().map(|mut stdin| {
            let message = request.message.text();
            tokio::spawn(async move { stdin.write_all(message.as_bytes()).await })
        });

        let stdout = child.stdout.take().context("executor stdout not captured")?;
        let stderr = child.stderr.take().context("executor stderr not captured")?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = BufReader::new(stderr).read_to_string(&mut buf).await;
            buf
        });

        let output = read_output(stdout, request.options.stream.as_ref());
        let response = tokio::select! {
            result = tokio::time::timeout(self.timeout, output) => match result {
                Ok(response) => response?,
                Err(_elapsed) => {
                    let _ = child.kill().await;
                    anyhow::bail!("executor timed out after {}s", self.timeout.as_secs());
                }
            },
            () = request.cancel.cancelled() => {
                let _ = child.kill().await;
                info!(
                    session = %request.session_key,
                    inject_id = %request.inject_id,
                    "executor killed on cancel"
                );
                anyhow::bail!("executor stopped: turn cancelled");
            }
        };

        if let Some(task) = stdin_task {
            match task.await {
                Ok(Ok(())) => {}
                // The command may exit without reading its input.
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!("executor closed stdin before reading the message");
                }
                Ok(Err(e)) => return Err(e).context("failed to write message to executor"),
                Err(e) => warn!(error = %e, "executor stdin task failed"),
            }
        }

        let status = child.wait().await.context("failed to wait for executor")?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            anyhow::bail!(
                "executor exited with code {}: {}",
                status.code().unwrap_or(-1),
                stderr.trim()
            );
        }
        if !stderr.trim().is_empty() {
            debug!(stderr = %stderr.trim(), "executor stderr");
        }

        Ok(InjectResult {
            response,
            session_id: Some(request.session_key),
            cost: None,
            live: false,
        })
    }
}

/// Stores the injection's security context for exactly as long as its turn runs.
///
/// Anything that looks up the session's context mid-turn (sandbox resolution,
/// transcript access) sees the source of the turn actually executing, not of
/// whatever was queued last.
pub(crate) struct TurnContextExecutor {
    inner: Arc<dyn Executor>,
    engine: PolicyEngine,
    registry: Arc<ContextRegistry>,
}

impl std::fmt::Debug for TurnContextExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnContextExecutor")
            .finish_non_exhaustive()
    }
}

impl TurnContextExecutor {
    pub(crate) fn new(
        inner: Arc<dyn Executor>,
        engine: PolicyEngine,
        registry: Arc<ContextRegistry>,
    ) -> Self {
        Self {
            inner,
            engine,
            registry,
        }
    }
}

#[async_trait]
impl Executor for TurnContextExecutor {
    async fn execute(&self, request: ExecuteRequest) -> Result<InjectResult> {
        let _guard = match request.options.source.clone() {
            Some(source) => {
                let context = SecurityContext::resolve(&self.engine, source, &request.session_key);
                Some(self.registry.enter(context))
            }
            None => {
                warn!(
                    session = %request.session_key,
                    inject_id = %request.inject_id,
                    "injection has no source, turn runs without a security context"
                );
                None
            }
        };
        self.inner.execute(request).await
    }
}
