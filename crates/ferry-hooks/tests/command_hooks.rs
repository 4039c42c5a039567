#![allow(clippy::unwrap_used)]

use ferry_core::InjectionSource;
use ferry_hooks::{HookConfig, HookContext, HookPhase, HookPipeline, PreInjectOutcome};
use std::path::Path;
use std::time::{Duration, Instant};

fn write_script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    path.display().to_string()
}

fn hook(name: &str, phase: HookPhase, script: String) -> HookConfig {
    HookConfig {
        name: name.into(),
        phase,
        command: vec!["sh".into(), script],
        enabled: true,
    }
}

fn context() -> HookContext {
    let source = InjectionSource::p2p("peer");
    HookContext::new("call me at 555-1234".into(), source, "support")
}

#[tokio::test]
async fn script_rewrites_message_and_sees_context() {
    let dir = tempfile::tempdir().unwrap();
    let seen = dir.path().join("seen.json");
    let redact = write_script(
        dir.path(),
        "redact.sh",
        &format!(
            r#"cat > {}
echo '{{"message": "call me at [redacted]", "metadata": {{"redacted": true}}}}'"#,
            seen.display()
        ),
    );

    let pipeline = HookPipeline::new();
    pipeline.sync_config(&[hook("redact", HookPhase::PreInject, redact)]);

    match pipeline.run_pre_inject(context()).await {
        PreInjectOutcome::Allow { message, metadata } => {
            assert_eq!(message.text(), "call me at [redacted]");
            assert_eq!(metadata["redacted"], serde_json::json!(true));
        }
        PreInjectOutcome::Blocked { .. } => panic!("expected allow"),
    }

    let input: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&seen).unwrap()).unwrap();
    assert_eq!(input["targetSession"], "support");
    assert_eq!(input["message"], "call me at 555-1234");
    assert_eq!(input["source"]["type"], "p2p");
    assert_eq!(input["source"]["trust_level"], "untrusted");
}

#[tokio::test]
async fn script_block_reason_is_returned() {
    let dir = tempfile::tempdir().unwrap();
    let gate = write_script(
        dir.path(),
        "gate.sh",
        r#"cat >/dev/null
echo '{"allow": false, "reason": "x"}'"#,
    );
    let never = write_script(
        dir.path(),
        "never.sh",
        r#"cat >/dev/null
echo '{"allow": false, "reason": "second"}'"#,
    );

    let pipeline = HookPipeline::new();
    pipeline.sync_config(&[
        hook("gate", HookPhase::PreInject, gate),
        hook("never", HookPhase::PreInject, never),
    ]);

    assert_eq!(
        pipeline.run_pre_inject(context()).await,
        PreInjectOutcome::Blocked {
            hook: "gate".into(),
            reason: "x".into()
        }
    );
}

#[tokio::test]
async fn hung_or_crashing_scripts_let_message_through() {
    let dir = tempfile::tempdir().unwrap();
    let hung = write_script(dir.path(), "hung.sh", "sleep 5");
    let crash = write_script(dir.path(), "crash.sh", "echo oops >&2; exit 1");
    let garbage = write_script(dir.path(), "garbage.sh", "cat >/dev/null; echo '{not json'");

    let pipeline = HookPipeline::new().with_timeout(Duration::from_millis(200));
    pipeline.sync_config(&[
        hook("hung", HookPhase::PreInject, hung),
        hook("crash", HookPhase::PreInject, crash),
        hook("garbage", HookPhase::PreInject, garbage),
    ]);

    match pipeline.run_pre_inject(context()).await {
        PreInjectOutcome::Allow { message, metadata } => {
            assert_eq!(message.text(), "call me at 555-1234");
            assert!(metadata.is_empty());
        }
        PreInjectOutcome::Blocked { .. } => panic!("expected allow"),
    }
}

#[tokio::test]
async fn post_inject_script_receives_response() {
    let dir = tempfile::tempdir().unwrap();
    let seen = dir.path().join("post.json");
    let body = format!("cat > {}", seen.display());
    let notify = write_script(dir.path(), "notify.sh", &body);

    let pipeline = HookPipeline::new();
    pipeline.sync_config(&[hook("notify", HookPhase::PostInject, notify)]);

    let mut context = context();
    context.response = Some("done".into());
    pipeline.run_post_inject(&context).await;

    let input: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&seen).unwrap()).unwrap();
    assert_eq!(input["response"], "done");
}

#[tokio::test]
async fn script_ignoring_a_large_message_is_cut_off_at_the_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let stuck = write_script(dir.path(), "stuck.sh", "sleep 4");

    let pipeline = HookPipeline::new().with_timeout(Duration::from_millis(200));
    pipeline.sync_config(&[hook("stuck", HookPhase::PreInject, stuck)]);

    let message = "x".repeat(512 * 1024);
    let context = HookContext::new(
        message.clone().into(),
        InjectionSource::p2p("peer"),
        "support",
    );
    let started = Instant::now();
    let outcome = pipeline.run_pre_inject(context).await;

    assert!(
        started.elapsed() < Duration::from_secs(2),
        "pipeline stalled for {:?}",
        started.elapsed()
    );
    match outcome {
        PreInjectOutcome::Allow { message: out, .. } => assert_eq!(out.text(), message),
        PreInjectOutcome::Blocked { .. } => panic!("expected allow"),
    }
}
