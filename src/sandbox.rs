//! Core sandbox execution logic.
//!
//! One request: resolve profile, stage workspace, run the container under a
//! deadline, release the workspace, normalize output.

use crate::config::{Config, ResourceLimits};
use crate::container::{ContainerEngine, ContainerManager, RawOutput};
use crate::deadline::{self, Deadlined};
use crate::error::{RunError, SandboxError};
use crate::output;
use crate::profile::{self, RuntimeProfile};
use crate::scheduler::Executor;
use crate::workspace::WorkspaceManager;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

/// A submitted program. Immutable once created.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub id: Uuid,
    pub code: String,
    pub filename: String,
    pub submitted_at: DateTime<Utc>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: code.into(),
            filename: filename.into(),
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Success,
    RuntimeError,
    CompileError,
    Timeout,
    /// The request itself is unacceptable, e.g. an unsupported language.
    Invalid,
    Rejected,
    InternalError,
}

impl Outcome {
    /// The program ran (successfully or not); the request itself succeeded.
    pub fn program_ran(&self) -> bool {
        matches!(
            self,
            Outcome::Success | Outcome::RuntimeError | Outcome::CompileError | Outcome::Timeout
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub output: String,
    pub outcome: Outcome,
}

impl ExecutionResult {
    pub fn rejected() -> Self {
        Self {
            output: RunError::Backpressure.to_string(),
            outcome: Outcome::Rejected,
        }
    }

    pub fn internal_error() -> Self {
        Self {
            output: RunError::Infrastructure.to_string(),
            outcome: Outcome::InternalError,
        }
    }
}

pub struct Sandbox<E> {
    workspaces: WorkspaceManager,
    containers: ContainerManager<E>,
    timeout: Duration,
}

impl<E: ContainerEngine> Sandbox<E> {
    pub fn new(
        engine: Arc<E>,
        workspaces: WorkspaceManager,
        limits: ResourceLimits,
        timeout: Duration,
    ) -> Self {
        Self {
            workspaces,
            containers: ContainerManager::new(engine, limits),
            timeout,
        }
    }

    pub fn from_config(engine: Arc<E>, config: &Config) -> Self {
        Self::new(
            engine,
            WorkspaceManager::new(&config.workspace_root),
            config.limits,
            config.timeout,
        )
    }

    /// Run one request to completion. Workspace and container are gone by the
    /// time this returns, whatever the outcome.
    pub async fn run(&self, request: &ExecutionRequest) -> ExecutionResult {
        let Some(profile) = profile::extension_of(&request.filename).and_then(profile::resolve)
        else {
            return ExecutionResult {
                output: unsupported_message(&request.filename),
                outcome: Outcome::Invalid,
            };
        };

        match self.execute_profile(profile, request).await {
            Ok(result) => result,
            Err(e) => {
                error!(request_id = %request.id, error = %e, "Execution failed");
                ExecutionResult::internal_error()
            }
        }
    }

    async fn execute_profile(
        &self,
        profile: &RuntimeProfile,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, SandboxError> {
        let mut workspace = self
            .workspaces
            .stage(request.id, profile, &request.code)
            .await?;

        // Unguessable from inside the container.
        let marker = Uuid::new_v4().simple().to_string();

        let run = deadline::with_deadline(self.timeout, |token| {
            let workspace = &workspace;
            let containers = &self.containers;
            let marker = marker.as_str();
            async move { containers.run(profile, workspace, marker, &token).await }
        })
        .await;

        self.workspaces.release(&mut workspace).await;

        let result = match run? {
            Deadlined::Completed(raw) => classify(profile, raw, &marker),
            Deadlined::TimedOut => ExecutionResult {
                output: deadline::timeout_message(self.timeout),
                outcome: Outcome::Timeout,
            },
        };
        info!(request_id = %request.id, language = profile.extension, outcome = ?result.outcome, "Execution finished");
        Ok(result)
    }
}

fn classify(profile: &RuntimeProfile, raw: RawOutput, marker: &str) -> ExecutionResult {
    let (outcome, bytes) = match profile.compile_failure(raw.exit_code, &raw.bytes, marker) {
        Some(diagnostics) => (Outcome::CompileError, diagnostics),
        None if raw.exit_code == 0 => (Outcome::Success, &raw.bytes[..]),
        None => (Outcome::RuntimeError, &raw.bytes[..]),
    };
    let mut text = output::normalize(bytes, raw.truncated, outcome == Outcome::Success);
    if text.is_empty() {
        text = format!("Process exited with status {}.", raw.exit_code);
    }
    ExecutionResult {
        output: text,
        outcome,
    }
}

pub fn unsupported_message(filename: &str) -> String {
    let extension = profile::extension_of(filename).unwrap_or(filename);
    format!("Error: Language '{}' is not supported.", extension)
}

#[async_trait]
impl<E: ContainerEngine> Executor for Sandbox<E> {
    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        self.run(&request).await
    }
}
