//! Fake sandbox extension for testing.
#![allow(clippy::unwrap_used)]

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crate::policy::ExecOutput;
use crate::resolver::{SandboxExtension, SandboxHandle, SandboxRequest};

/// Records every request and echoes commands back as stdout.
#[derive(Debug, Default)]
pub struct RecordingSandboxExtension {
    pub requests: Mutex<Vec<SandboxRequest>>,
    pub commands: Mutex<Vec<(String, String)>>,
}

impl RecordingSandboxExtension {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<SandboxRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// `(container, command)` pairs in execution order.
    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxExtension for RecordingSandboxExtension {
    fn name(&self) -> &str {
        "recording"
    }

    async fn resolve_context(&self, request: &SandboxRequest) -> Result<Option<SandboxHandle>> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(Some(SandboxHandle {
            container: format!("fake-{}", request.trust_level),
            workdir: PathBuf::from("/work"),
            trust_level: request.trust_level,
            network: request.config.network,
        }))
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: &str,
        _timeout: Duration,
    ) -> Result<ExecOutput> {
        self.commands
            .lock()
            .unwrap()
            .push((handle.container.clone(), command.to_owned()));
        Ok(ExecOutput {
            exit_code: 0,
            stdout: command.to_owned(),
            stderr: String::new(),
        })
    }
}
