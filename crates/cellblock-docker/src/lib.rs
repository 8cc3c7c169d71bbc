//! Docker Engine backend for [`cellblock_core::SandboxRuntime`].
//!
//! Sandboxes are containers created from [`CreateParams`]; shell channels are
//! attached TTY execs. Containers that ran are stopped, never removed. Only a
//! container that failed to start is removed, so its name is free again.

pub mod convert;

use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    CreateContainerOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use cellblock_core::obs::short_id;
use cellblock_core::{
    ChannelControl, ChannelRequest, CreateParams, DockerConfig, Geometry, RuntimeError,
    SandboxChannel, SandboxRuntime,
};

use crate::convert::{container_config, exec_options, is_not_modified, runtime_error};

/// Request timeout for engine calls over an explicit socket, in seconds.
pub const SOCKET_TIMEOUT_SECS: u64 = 120;
/// Grace period before the engine kills a stopping container, in seconds.
pub const STOP_GRACE_SECS: i64 = 10;

/// Sandbox runtime backed by a Docker Engine.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the configured socket, or the platform defaults.
    pub fn connect(config: &DockerConfig) -> Result<Self, RuntimeError> {
        let docker = match config.socket_path.as_deref() {
            Some(path) => connect_socket(path)?,
            None => Docker::connect_with_local_defaults()
                .map_err(|e| RuntimeError::Backend(format!("docker connect: {e}")))?,
        };
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Remove a container that never started.
    async fn discard(&self, container_id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..RemoveContainerOptions::default()
        };
        match self.docker.remove_container(container_id, Some(options)).await {
            Ok(()) => debug!(sandbox = %short_id(container_id), "removed unstarted container"),
            Err(e) => warn!(
                sandbox = %short_id(container_id),
                error = %e,
                "failed to remove unstarted container"
            ),
        }
    }

    /// Check that the engine answers.
    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| runtime_error("ping", "engine", e))
    }
}

fn connect_socket(path: &Path) -> Result<Docker, RuntimeError> {
    let path = path
        .to_str()
        .ok_or_else(|| RuntimeError::Backend(format!("non UTF-8 socket path {}", path.display())))?;
    Docker::connect_with_socket(path, SOCKET_TIMEOUT_SECS, API_DEFAULT_VERSION)
        .map_err(|e| RuntimeError::Backend(format!("docker connect {path}: {e}")))
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn create(&self, params: &CreateParams) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: params.name.clone(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), container_config(params))
            .await
            .map_err(|e| runtime_error("create", &params.name, e))?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            self.discard(&created.id).await;
            return Err(runtime_error("start", &created.id, e));
        }

        info!(
            sandbox = %short_id(&created.id),
            name = %params.name,
            "container started"
        );
        Ok(created.id)
    }

    async fn stop(&self, sandbox_id: &str) -> Result<(), RuntimeError> {
        let options = StopContainerOptions { t: STOP_GRACE_SECS };
        match self.docker.stop_container(sandbox_id, Some(options)).await {
            Ok(()) => {}
            Err(e) if is_not_modified(&e) => {
                debug!(sandbox = %short_id(sandbox_id), "container already stopped");
            }
            Err(e) => return Err(runtime_error("stop", sandbox_id, e)),
        }
        info!(sandbox = %short_id(sandbox_id), "container stopped (preserved)");
        Ok(())
    }

    async fn open_channel(
        &self,
        sandbox_id: &str,
        request: &ChannelRequest,
    ) -> Result<SandboxChannel, RuntimeError> {
        let exec = self
            .docker
            .create_exec(sandbox_id, exec_options(request))
            .await
            .map_err(|e| runtime_error("exec create", sandbox_id, e))?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: true,
                    output_capacity: None,
                }),
            )
            .await
            .map_err(|e| runtime_error("exec start", sandbox_id, e))?;

        let StartExecResults::Attached { output, input } = started else {
            return Err(RuntimeError::Backend(format!(
                "exec into {sandbox_id} started detached"
            )));
        };

        let control = ExecControl {
            docker: self.docker.clone(),
            exec_id: exec.id,
        };
        // The exec starts at the engine's default size.
        if let Err(e) = control.resize(request.geometry).await {
            debug!(sandbox = %short_id(sandbox_id), error = %e, "initial exec resize failed");
        }

        let bytes = output.map(|item| {
            item.map(|log| -> Bytes { log.into_bytes() })
                .map_err(std::io::Error::other)
        });
        debug!(sandbox = %short_id(sandbox_id), exec = %short_id(&control.exec_id), "exec attached");

        Ok(SandboxChannel {
            reader: Box::new(StreamReader::new(bytes)),
            writer: Box::new(input),
            control: Box::new(control),
        })
    }
}

/// Resize handle for one attached exec.
struct ExecControl {
    docker: Docker,
    exec_id: String,
}

#[async_trait]
impl ChannelControl for ExecControl {
    async fn resize(&self, geometry: Geometry) -> Result<(), RuntimeError> {
        self.docker
            .resize_exec(
                &self.exec_id,
                ResizeExecOptions {
                    width: geometry.cols,
                    height: geometry.rows,
                },
            )
            .await
            .map_err(|e| runtime_error("exec resize", &self.exec_id, e))
    }
}
