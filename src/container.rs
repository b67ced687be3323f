//! Container lifecycle for a single execution.
//!
//! [`ContainerManager::run`] creates one container, streams its combined
//! output, waits for it to exit and always removes it. The engine itself sits
//! behind [`ContainerEngine`] so the lifecycle does not depend on Docker.

use crate::config::ResourceLimits;
use crate::error::{EngineError, SandboxError};
use crate::output::OutputBuffer;
use crate::profile::RuntimeProfile;
use crate::workspace::Workspace;
use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Label carried by every container this service creates.
pub const MANAGED_LABEL: &str = "code-runner.managed";

/// Label naming the runner instance that owns a container.
pub const INSTANCE_LABEL: &str = "code-runner.instance";

/// Where the workspace is mounted inside the container.
pub const SANDBOX_MOUNT: &str = "/sandbox";

/// Upper bound on kill/remove calls so a stuck engine cannot pin a slot forever.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Everything an engine needs to create one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Shell command run with `sh -c`.
    pub command: String,
    /// Host directory bind-mounted read-only at [`SANDBOX_MOUNT`].
    pub host_dir: PathBuf,
    pub limits: ResourceLimits,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync + 'static {
    /// Create (but do not start) a container, returning its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start(&self, id: &str) -> Result<(), EngineError>;

    /// Combined stdout/stderr, following until the container exits.
    fn output<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<Vec<u8>, EngineError>>;

    /// Wait for exit and return the status code.
    async fn wait(&self, id: &str) -> Result<i64, EngineError>;

    /// SIGKILL the container. A container that already exited is not an error.
    async fn kill(&self, id: &str) -> Result<(), EngineError>;

    /// Force-remove the container. Returns `NotFound` if it is already gone.
    async fn remove(&self, id: &str) -> Result<(), EngineError>;
}

#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub id: String,
    pub started_at: Instant,
}

/// Output and status of a container that exited on its own.
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub bytes: Vec<u8>,
    pub truncated: bool,
    pub exit_code: i64,
    pub elapsed: Duration,
}

pub struct ContainerManager<E> {
    engine: Arc<E>,
    limits: ResourceLimits,
}

impl<E: ContainerEngine> ContainerManager<E> {
    pub fn new(engine: Arc<E>, limits: ResourceLimits) -> Self {
        Self { engine, limits }
    }

    /// `marker` is printed by a failing compile step; see
    /// [`RuntimeProfile::command`].
    pub fn spec_for(
        &self,
        profile: &RuntimeProfile,
        workspace: &Workspace,
        marker: &str,
    ) -> ContainerSpec {
        let staged = format!("{}/{}", SANDBOX_MOUNT, workspace.file_name());
        ContainerSpec {
            name: container_name(workspace),
            image: profile.image.to_string(),
            command: profile.command(&staged, marker),
            host_dir: workspace.root().to_path_buf(),
            limits: self.limits,
        }
    }

    /// Run `profile` against `workspace` until the container exits or `cancel`
    /// fires. On cancellation the container is killed and `Cancelled` returned.
    /// The container is removed before this returns on every path.
    pub async fn run(
        &self,
        profile: &RuntimeProfile,
        workspace: &Workspace,
        marker: &str,
        cancel: &CancellationToken,
    ) -> Result<RawOutput, SandboxError> {
        let spec = self.spec_for(profile, workspace, marker);

        let created = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.abandon_create(&spec).await,
            created = self.engine.create(&spec) => created,
        };
        let id = created.map_err(|e| {
            error!(image = %spec.image, error = %e, "Container create failed");
            SandboxError::Infrastructure(e)
        })?;
        let handle = ContainerHandle {
            id,
            started_at: Instant::now(),
        };
        debug!(container = %handle.id, image = %spec.image, "Container created");

        let result = self.drive(&handle, cancel).await;
        self.remove(&handle).await;
        result
    }

    async fn drive(
        &self,
        handle: &ContainerHandle,
        cancel: &CancellationToken,
    ) -> Result<RawOutput, SandboxError> {
        let id = handle.id.as_str();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.cancelled(handle).await,
            started = self.engine.start(id) => started?,
        }
        info!(container = %id, "Container started");

        let mut buffer = OutputBuffer::new(self.limits.max_output_bytes);
        {
            let mut stream = self.engine.output(id);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return self.cancelled(handle).await,
                    chunk = stream.next() => match chunk {
                        Some(Ok(bytes)) => buffer.push(&bytes),
                        Some(Err(e)) => return Err(e.into()),
                        None => break,
                    },
                }
            }
        }

        let exit_code = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.cancelled(handle).await,
            code = self.engine.wait(id) => code?,
        };

        let elapsed = handle.started_at.elapsed();
        if buffer.is_truncated() {
            warn!(container = %id, kept = buffer.len(), "Output truncated");
        }
        info!(container = %id, exit_code, elapsed_ms = elapsed.as_millis() as u64, "Container exited");

        let (bytes, truncated) = buffer.into_parts();
        Ok(RawOutput {
            bytes,
            truncated,
            exit_code,
            elapsed,
        })
    }

    async fn cancelled(&self, handle: &ContainerHandle) -> Result<RawOutput, SandboxError> {
        warn!(container = %handle.id, "Killing container");
        match tokio::time::timeout(CLEANUP_TIMEOUT, self.engine.kill(&handle.id)).await {
            Ok(Ok(())) | Ok(Err(EngineError::NotFound(_))) => {}
            Ok(Err(e)) => warn!(container = %handle.id, error = %e, "Kill failed"),
            Err(_) => warn!(container = %handle.id, "Kill timed out"),
        }
        Err(SandboxError::Cancelled)
    }

    /// Cancelled mid-create: we have no id, so remove by the name we chose.
    async fn abandon_create(&self, spec: &ContainerSpec) -> Result<RawOutput, SandboxError> {
        warn!(container = %spec.name, "Cancelled during create, removing by name");
        match tokio::time::timeout(CLEANUP_TIMEOUT, self.engine.remove(&spec.name)).await {
            Ok(Ok(())) | Ok(Err(EngineError::NotFound(_))) => {}
            Ok(Err(e)) => error!(container = %spec.name, error = %e, "Failed to remove container"),
            Err(_) => error!(container = %spec.name, "Container removal timed out"),
        }
        Err(SandboxError::Cancelled)
    }

    async fn remove(&self, handle: &ContainerHandle) {
        match tokio::time::timeout(CLEANUP_TIMEOUT, self.engine.remove(&handle.id)).await {
            Ok(Ok(())) => debug!(container = %handle.id, "Container removed"),
            Ok(Err(EngineError::NotFound(_))) => {}
            Ok(Err(e)) => error!(container = %handle.id, error = %e, "Failed to remove container"),
            Err(_) => error!(container = %handle.id, "Container removal timed out"),
        }
    }
}

/// Name given to the container for `workspace`.
fn container_name(workspace: &Workspace) -> String {
    format!("code-runner-{}", workspace.id())
}
