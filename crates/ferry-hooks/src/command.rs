//! External command hooks: context as JSON on stdin, response as JSON on stdout.

use anyhow::{Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::types::{HookContext, HookResponse};

/// Hard limit for a single hook invocation.
pub const HOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Run one command hook in a fresh process.
///
/// Errors cover spawn failures, timeouts, non-zero exits and unparseable
/// output; the pipeline turns all of them into "allow".
pub async fn run_command_hook(
    command: &[String],
    context: &HookContext,
    timeout: Duration,
) -> Result<HookResponse> {
    let (program, args) = command.split_first().context("hook command is empty")?;
    let input = serde_json::to_vec(context).context("failed to serialize hook context")?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn hook {program}"))?;

    // Feed stdin alongside the wait so a hook that never reads its input
    // still hits the timeout.
    let stdin = child.stdin.take();
    let feed = async move {
        if let Some(mut stdin) = stdin {
            // A hook may exit without reading its input; its output still counts.
            if let Err(e) = stdin.write_all(&input).await {
                debug!(error = %e, "hook did not read its input");
            }
        }
    };
    let run = async {
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        output
    };

    let output = tokio::time::timeout(timeout, run)
        .await
        .map_err(|_elapsed| {
            anyhow::anyhow!("hook timed out after {}ms", timeout.as_millis())
        })?
        .context("failed to wait for hook")?;

    if !output.stderr.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(program = %program, stderr = %stderr.trim(), "hook stderr");
    }

    if !output.status.success() {
        anyhow::bail!(
            "hook exited with code {}",
            output.status.code().unwrap_or(-1)
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if stdout.trim().is_empty() {
        return Ok(HookResponse::allow());
    }
    serde_json::from_str(stdout.trim()).context("failed to parse hook output")
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::InjectionSource;

    fn context() -> HookContext {
        HookContext::new("hello".into(), InjectionSource::cli(None), "main")
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn parses_json_response() {
        let response = run_command_hook(
            &sh(r#"cat >/dev/null; echo '{"allow": false, "reason": "no"}'"#),
            &context(),
            HOOK_TIMEOUT,
        )
        .await
        .unwrap();
        assert!(!response.allow);
        assert_eq!(response.reason.as_deref(), Some("no"));
    }

    #[tokio::test]
    async fn empty_output_allows() {
        let response = run_command_hook(&sh("cat >/dev/null"), &context(), HOOK_TIMEOUT)
            .await
            .unwrap();
        assert!(response.allow);
    }

    #[tokio::test]
    async fn failures_are_errors() {
        let empty = run_command_hook(&[], &context(), HOOK_TIMEOUT).await;
        assert!(empty.is_err());
        assert!(
            run_command_hook(&sh("exit 3"), &context(), HOOK_TIMEOUT)
                .await
                .is_err()
        );
        assert!(
            run_command_hook(&sh("echo not-json"), &context(), HOOK_TIMEOUT)
                .await
                .is_err()
        );
        assert!(
            run_command_hook(&["/nonexistent/hook".to_owned()], &context(), HOOK_TIMEOUT)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn slow_hook_times_out() {
        let err = run_command_hook(&sh("sleep 5"), &context(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn hook_ignoring_a_large_input_still_times_out() {
        let big = HookContext::new(
            "x".repeat(512 * 1024).into(),
            InjectionSource::cli(None),
            "main",
        );
        let started = std::time::Instant::now();
        let err = run_command_hook(&sh("sleep 4"), &big, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
