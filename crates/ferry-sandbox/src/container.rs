//! Sandbox extension backed by a container CLI (`docker`, `podman`, apple `container`).
//!
//! One long-lived container per trust level, named `ferry-sandbox-<trust>`,
//! created on first use and reused afterwards.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ferry_core::TrustLevel;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info};

use crate::policy::{ExecOutput, NetworkMode, WorkspaceAccess};
use crate::resolver::{SandboxExtension, SandboxHandle, SandboxRequest};

const WORKDIR: &str = "/work";

/// How containers are created.
#[derive(Debug, Clone)]
pub struct ContainerSettings {
    /// Container CLI binary.
    pub runtime: String,
    pub image: String,
    /// Host directory mounted at `/work` (subject to workspace access).
    pub workspace: PathBuf,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            runtime: "docker".to_owned(),
            image: "ubuntu:24.04".to_owned(),
            workspace: PathBuf::from("./workspaces"),
        }
    }
}

#[derive(Debug)]
pub struct ContainerExtension {
    settings: ContainerSettings,
    /// Containers this process has ensured, with last use.
    known: Mutex<HashMap<String, Instant>>,
}

impl ContainerExtension {
    pub fn new(settings: ContainerSettings) -> Self {
        Self {
            settings,
            known: Mutex::new(HashMap::new()),
        }
    }

    fn touch(&self, name: &str) {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), Instant::now());
    }

    /// Containers this extension has created or reused, most recent first.
    pub fn known_containers(&self) -> Vec<String> {
        let known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<_> = known.iter().map(|(name, at)| (name.clone(), *at)).collect();
        drop(known);
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.into_iter().map(|(name, _)| name).collect()
    }

    /// Create or ensure a long-lived container exists for the request.
    ///
    /// 1. `exec <name> true`: container already running.
    /// 2. `start <name>`: container exists but is stopped.
    /// 3. `run -d ...`: create it; an "already exists" error means another
    ///    process won the race, so start and reuse it.
    async fn ensure_container(&self, request: &SandboxRequest) -> Result<String> {
        let name = container_name(request.trust_level);
        let runtime = &self.settings.runtime;

        if self.runtime_succeeds(&["exec", &name, "true"]).await {
            info!(container = %name, "reusing running container");
            self.touch(&name);
            return Ok(name);
        }

        if self.runtime_succeeds(&["start", &name]).await {
            info!(container = %name, "started and reusing stopped container");
            self.touch(&name);
            return Ok(name);
        }

        debug!(
            container = %name,
            trust = %request.trust_level,
            "creating sandbox container"
        );
        let output = Command::new(runtime)
            .args(run_args(&name, request, &self.settings))
            .output()
            .await
            .with_context(|| format!("failed to spawn {runtime}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("already exists") {
                info!(
                    container = %name,
                    "container already exists, attempting to start and reuse"
                );
                self.runtime_succeeds(&["start", &name]).await;
                self.touch(&name);
                return Ok(name);
            }
            anyhow::bail!("failed to create container {name}: {}", stderr.trim());
        }

        info!(
            container = %name,
            network = ?request.config.network,
            "created sandbox container"
        );
        self.touch(&name);
        Ok(name)
    }

    async fn runtime_succeeds(&self, args: &[&str]) -> bool {
        Command::new(&self.settings.runtime)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok_and(|status| status.success())
    }
}

fn container_name(trust: TrustLevel) -> String {
    format!("ferry-sandbox-{trust}")
}

/// Arguments for `<runtime> run` that create a container for this request.
fn run_args(name: &str, request: &SandboxRequest, settings: &ContainerSettings) -> Vec<String> {
    let config = &request.config;
    let mut args: Vec<String> = vec!["run".into(), "-d".into(), "--name".into(), name.into()];

    if config.memory_limit > 0 {
        let mb = config.memory_limit / (1024 * 1024);
        args.push("--memory".into());
        args.push(format!("{mb}m"));
    }
    if config.pids_limit > 0 {
        args.push("--pids-limit".into());
        args.push(config.pids_limit.to_string());
    }

    match config.network {
        NetworkMode::None => {
            args.push("--network".into());
            args.push("none".into());
        }
        NetworkMode::Restricted | NetworkMode::Full => {}
    }

    let workspace = settings.workspace.display();
    match config.workspace_access {
        WorkspaceAccess::None => {}
        WorkspaceAccess::Ro => {
            args.push("-v".into());
            args.push(format!("{workspace}:{WORKDIR}:ro"));
        }
        WorkspaceAccess::Rw => {
            args.push("-v".into());
            args.push(format!("{workspace}:{WORKDIR}"));
        }
    }

    args.push("-w".into());
    args.push(WORKDIR.into());
    args.push(settings.image.clone());
    // Keep the container running with a long-lived process
    args.extend(["tail", "-f", "/dev/null"].map(String::from));
    args
}

/// Wrap a command so that private address ranges are unreachable.
fn restrict_network(command: &str) -> String {
    format!(
        concat!(
            "for NET in 10.0.0.0/8 172.16.0.0/12 192.168.0.0/16 ",
            "169.254.0.0/16 100.64.0.0/10; do ",
            "iptables -A OUTPUT -d \"$NET\" -j REJECT 2>/dev/null; done; ",
            "{}"
        ),
        command
    )
}

#[async_trait]
impl SandboxExtension for ContainerExtension {
    fn name(&self) -> &str {
        "container"
    }

    async fn resolve_context(&self, request: &SandboxRequest) -> Result<Option<SandboxHandle>> {
        if !request.config.enabled {
            debug!(
                session = %request.session_name,
                "sandbox disabled for session"
            );
            return Ok(None);
        }
        let container = self.ensure_container(request).await?;
        Ok(Some(SandboxHandle {
            container,
            workdir: PathBuf::from(WORKDIR),
            trust_level: request.trust_level,
            network: request.config.network,
        }))
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let effective = if handle.network == NetworkMode::Restricted {
            restrict_network(command)
        } else {
            command.to_owned()
        };

        let mut cmd = Command::new(&self.settings.runtime);
        cmd.arg("exec")
            .arg("-w")
            .arg(&handle.workdir)
            .arg(&handle.container)
            .args(["sh", "-c", &effective])
            .kill_on_drop(true);

        match tokio::time::timeout(timeout, cmd.output()).await {
            Err(_) => Ok(ExecOutput {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("command timed out after {}s", timeout.as_secs()),
            }),
            Ok(Err(e)) => anyhow::bail!("failed to exec in container {}: {e}", handle.container),
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(-1);
                debug!(
                    container = %handle.container,
                    exit_code,
                    "container exec complete"
                );
                self.touch(&handle.container);
                Ok(ExecOutput {
                    exit_code,
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
        }
    }
}
