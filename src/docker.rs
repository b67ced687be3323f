//! Docker-backed [`ContainerEngine`] using bollard.

use crate::container::{
    ContainerEngine, ContainerSpec, INSTANCE_LABEL, MANAGED_LABEL, SANDBOX_MOUNT,
};
use crate::error::EngineError;
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures_util::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use tracing::{info, warn};

/// Scratch space inside the container; compiled artifacts land here.
const TMPFS_OPTIONS: &str = "rw,exec,nosuid,size=64m";

/// Instance name used when none is configured.
pub const DEFAULT_INSTANCE: &str = "default";

#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
    instance: String,
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` or the local socket.
    ///
    /// Containers are labelled with `instance`; runners sharing a daemon
    /// need distinct instance names or they reap each other's containers.
    pub fn connect(instance: impl Into<String>) -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            instance: instance.into(),
        })
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await?;
        Ok(())
    }

    /// Force-remove this instance's containers, e.g. ones leaked by a crash.
    pub async fn reap_orphans(&self) -> Result<usize, EngineError> {
        let filters = HashMap::from([("label".to_string(), orphan_filter(&self.instance))]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: Some(filters),
                ..Default::default()
            }))
            .await?;

        let mut removed = 0;
        for id in containers.into_iter().filter_map(|c| c.id) {
            match self.remove(&id).await {
                Ok(()) | Err(EngineError::NotFound(_)) => removed += 1,
                Err(e) => warn!(container = %id, error = %e, "Failed to remove orphaned container"),
            }
        }
        if removed > 0 {
            info!(removed, "Removed orphaned containers");
        }
        Ok(removed)
    }

    fn create_body(&self, spec: &ContainerSpec) -> ContainerCreateBody {
        let limits = &spec.limits;
        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}:ro",
                spec.host_dir.display(),
                SANDBOX_MOUNT
            )]),
            memory: Some(limits.memory_bytes),
            // Equal to memory: no swap.
            memory_swap: Some(limits.memory_bytes),
            nano_cpus: Some(limits.nano_cpus()),
            pids_limit: Some(limits.pids_limit),
            network_mode: Some("none".to_string()),
            readonly_rootfs: Some(true),
            tmpfs: Some(HashMap::from([(
                "/tmp".to_string(),
                TMPFS_OPTIONS.to_string(),
            )])),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            auto_remove: Some(false),
            ..Default::default()
        };

        ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                spec.command.clone(),
            ]),
            working_dir: Some("/tmp".to_string()),
            labels: Some(container_labels(&self.instance)),
            network_disabled: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

fn container_labels(instance: &str) -> HashMap<String, String> {
    HashMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (INSTANCE_LABEL.to_string(), instance.to_string()),
    ])
}

/// Label filters matching exactly what [`container_labels`] sets.
/// Docker ANDs multiple label filters.
fn orphan_filter(instance: &str) -> Vec<String> {
    container_labels(instance)
        .into_iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect()
}

fn not_found(id: &str, err: BollardError) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound(id.to_string()),
        other => EngineError::Docker(other),
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };
        let response = self
            .docker
            .create_container(Some(options), self.create_body(spec))
            .await?;
        for warning in &response.warnings {
            warn!(container = %response.id, %warning, "Docker warning on create");
        }
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await?;
        Ok(())
    }

    fn output<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<Vec<u8>, EngineError>> {
        self.docker
            .logs(
                id,
                Some(LogsOptions {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            )
            .map(|item| {
                item.map(|log| match log {
                    LogOutput::StdOut { message }
                    | LogOutput::StdErr { message }
                    | LogOutput::Console { message } => message.to_vec(),
                    LogOutput::StdIn { .. } => Vec::new(),
                })
                .map_err(EngineError::from)
            })
            .boxed()
    }

    async fn wait(&self, id: &str) -> Result<i64, EngineError> {
        let mut stream = self.docker.wait_container(id, None::<WaitContainerOptions>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(not_found(id, e)),
            None => Err(EngineError::Other(format!(
                "wait stream for {} ended without a status",
                id
            ))),
        }
    }

    async fn kill(&self, id: &str) -> Result<(), EngineError> {
        let options = KillContainerOptions {
            signal: "SIGKILL".to_string(),
            ..Default::default()
        };
        match self.docker.kill_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 409: not running any more.
            Err(BollardError::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(not_found(id, e)),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| not_found(id, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orphan_filter_is_scoped_to_the_instance() {
        let mut filter = orphan_filter("blue");
        filter.sort();
        assert_eq!(
            filter,
            vec![
                "code-runner.instance=blue".to_string(),
                "code-runner.managed=true".to_string(),
            ]
        );
        assert!(!orphan_filter("green").contains(&"code-runner.instance=blue".to_string()));
    }

    #[test]
    fn containers_carry_both_labels() {
        let labels = container_labels("blue");
        assert_eq!(labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(labels.get(INSTANCE_LABEL).map(String::as_str), Some("blue"));
    }
}
