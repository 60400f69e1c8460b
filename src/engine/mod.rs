//! Container engine adapter.
//!
//! `ContainerEngine` is the seam between the deployment core and the
//! engine daemon: the orchestrator and the command gateway only ever see
//! the trait, which keeps them testable against scripted doubles. The real
//! implementation (`DockerEngine`) talks to the engine over its unix
//! socket via bollard.

pub mod demux;
pub mod ports;

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::BuildImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::recipes;
use crate::store::models::Framework;
use self::demux::{StreamKind, encode_frame};

/// Chunks of build progress retained for failure messages.
const BUILD_TAIL_CHUNKS: usize = 20;

/// A started exec: its id (for the exit-code lookup) and the multiplexed
/// output stream in the engine's wire framing. The gateway demultiplexes.
pub struct ExecSession {
    pub exec_id: String,
    pub output: BoxStream<'static, Result<Bytes, DeployError>>,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Write the framework recipe into the context, build the image as
    /// `<prefix>/<slug>:latest`, and verify it actually exists afterwards.
    /// Returns the image reference.
    async fn build_image(
        &self,
        slug: &str,
        context_dir: &Path,
        framework: Framework,
    ) -> Result<String, DeployError>;

    /// Remove any container with this name, then create and start a fresh
    /// one with the framework's internal port bound to a newly allocated
    /// host port and the configured resource caps. Returns the host port.
    async fn replace_and_run(
        &self,
        image: &str,
        framework: Framework,
        container_name: &str,
    ) -> Result<u16, DeployError>;

    /// Start a command inside a running container with stdout and stderr
    /// attached.
    async fn exec(&self, container: &str, cmd: Vec<String>) -> Result<ExecSession, DeployError>;

    /// Exit code of a finished exec, if the engine reports one.
    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, DeployError>;

    /// Last `tail` lines of a container's output, both streams combined.
    async fn logs(&self, container: &str, tail: u32) -> Result<String, DeployError>;

    async fn container_running(&self, name: &str) -> Result<bool, DeployError>;

    /// Name of a running container whose image matches exactly, if any.
    async fn find_running_by_image(&self, image: &str) -> Result<Option<String>, DeployError>;

    /// Stop (if running) and remove a container. Missing containers are a
    /// no-op.
    async fn remove_container(&self, name: &str) -> Result<(), DeployError>;
}

pub struct DockerEngine {
    docker: Docker,
    prefix: String,
    memory_limit_bytes: i64,
    cpu_shares: i64,
}

impl DockerEngine {
    /// Connect to the engine's control socket and verify it responds.
    pub async fn connect(
        socket: &str,
        prefix: &str,
        memory_limit_bytes: i64,
        cpu_shares: i64,
    ) -> Result<Self, DeployError> {
        let docker = Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| {
                DeployError::Internal(format!("failed to connect to container engine: {}", e))
            })?;
        docker.ping().await.map_err(|e| {
            DeployError::Internal(format!("container engine is not responding: {}", e))
        })?;
        Ok(Self {
            docker,
            prefix: prefix.to_string(),
            memory_limit_bytes,
            cpu_shares,
        })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn build_image(
        &self,
        slug: &str,
        context_dir: &Path,
        framework: Framework,
    ) -> Result<String, DeployError> {
        recipes::prepare_context(framework, context_dir)?;
        let image_tag = format!("{}/{}:latest", self.prefix, slug);

        let context = context_dir.to_path_buf();
        let tar_bytes = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut builder = tar::Builder::new(Vec::new());
            builder.append_dir_all(".", &context)?;
            builder.into_inner()
        })
        .await
        .map_err(|e| DeployError::Internal(format!("tar task panicked: {}", e)))?
        .map_err(|e| DeployError::BuildFailed {
            tail: format!("failed to package build context: {}", e),
        })?;

        info!(image = %image_tag, "building image");
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: image_tag.clone(),
            rm: true,
            ..Default::default()
        };

        let mut tail: VecDeque<String> = VecDeque::with_capacity(BUILD_TAIL_CHUNKS);
        let mut stream = self.docker.build_image(options, None, Some(tar_bytes.into()));
        while let Some(item) = stream.next().await {
            match item {
                Ok(progress) => {
                    if let Some(line) = progress.stream {
                        debug!(image = %image_tag, chunk = line.trim(), "build progress");
                        push_tail(&mut tail, line);
                    }
                    if let Some(err) = progress.error {
                        push_tail(&mut tail, err);
                        return Err(DeployError::BuildFailed {
                            tail: render_tail(&tail),
                        });
                    }
                }
                Err(e) => {
                    push_tail(&mut tail, e.to_string());
                    return Err(DeployError::BuildFailed {
                        tail: render_tail(&tail),
                    });
                }
            }
        }

        // The build stream can finish without an error chunk yet produce no
        // image; only inspect is trusted.
        if self.docker.inspect_image(&image_tag).await.is_err() {
            return Err(DeployError::ImageMissingAfterBuild {
                hint: image_missing_hint(framework),
            });
        }

        Ok(image_tag)
    }

    async fn replace_and_run(
        &self,
        image: &str,
        framework: Framework,
        container_name: &str,
    ) -> Result<u16, DeployError> {
        self.remove_container(container_name).await?;

        let host_port = ports::allocate_host_port()?;
        let internal = recipes::internal_port(framework);
        let port_key = format!("{}/tcp", internal);

        let host_config = HostConfig {
            memory: Some(self.memory_limit_bytes),
            cpu_shares: Some(self.cpu_shares),
            port_bindings: Some(HashMap::from([(
                port_key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            )])),
            ..Default::default()
        };
        let config = ContainerConfig {
            image: Some(image.to_string()),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.to_string(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(|e| {
                DeployError::RunFailed(format!(
                    "failed to create container {}: {}",
                    container_name, e
                ))
            })?;

        self.docker
            .start_container(container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                DeployError::RunFailed(format!(
                    "failed to start container {}: {}",
                    container_name, e
                ))
            })?;

        info!(container = container_name, host_port, internal, "container started");
        Ok(host_port)
    }

    async fn exec(&self, container: &str, cmd: Vec<String>) -> Result<ExecSession, DeployError> {
        let created = self
            .docker
            .create_exec(
                container,
                CreateExecOptions::<String> {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(cmd),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => DeployError::NotFound(format!("container {} not found", container)),
                other => DeployError::RunFailed(format!("failed to create exec: {}", other)),
            })?;

        let started = self
            .docker
            .start_exec(&created.id, None)
            .await
            .map_err(|e| DeployError::RunFailed(format!("failed to start exec: {}", e)))?;

        let output = match started {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => {
                return Err(DeployError::Internal(
                    "exec started detached despite attached streams".into(),
                ));
            }
        };

        // The session carries the engine's wire framing; the client splits
        // frames itself, so restore the headers it consumed.
        let framed = output.map(|item| match item {
            Ok(LogOutput::StdErr { message }) => Ok(encode_frame(StreamKind::Stderr, &message)),
            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                Ok(encode_frame(StreamKind::Stdout, &message))
            }
            Ok(LogOutput::StdIn { .. }) => Ok(Bytes::new()),
            Err(e) => Err(DeployError::RunFailed(format!("exec stream error: {}", e))),
        });

        Ok(ExecSession {
            exec_id: created.id,
            output: framed.boxed(),
        })
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, DeployError> {
        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| DeployError::RunFailed(format!("failed to inspect exec: {}", e)))?;
        Ok(inspect.exit_code)
    }

    async fn logs(&self, container: &str, tail: u32) -> Result<String, DeployError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(container, Some(options));
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(frame) => out.extend_from_slice(&frame.into_bytes()),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => {
                    return Err(DeployError::NotFound(format!(
                        "container {} not found",
                        container
                    )));
                }
                Err(e) => {
                    return Err(DeployError::RunFailed(format!(
                        "failed to read logs for {}: {}",
                        container, e
                    )));
                }
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    async fn container_running(&self, name: &str) -> Result<bool, DeployError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => Ok(details
                .state
                .as_ref()
                .and_then(|s| s.running)
                .unwrap_or(false)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(DeployError::RunFailed(format!(
                "failed to inspect container {}: {}",
                name, e
            ))),
        }
    }

    async fn find_running_by_image(&self, image: &str) -> Result<Option<String>, DeployError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(|e| DeployError::RunFailed(format!("failed to list containers: {}", e)))?;

        for container in containers {
            if container.image.as_deref() == Some(image) {
                let name = container
                    .names
                    .and_then(|names| names.first().cloned())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .or(container.id);
                return Ok(name);
            }
        }
        Ok(None)
    }

    async fn remove_container(&self, name: &str) -> Result<(), DeployError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => {
                let running = details
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                if running
                    && let Err(e) = self
                        .docker
                        .stop_container(name, Some(StopContainerOptions { t: 10 }))
                        .await
                {
                    warn!(container = name, error = %e, "stop before removal failed");
                }
                self.docker
                    .remove_container(
                        name,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await
                    .map_err(|e| {
                        DeployError::RunFailed(format!(
                            "failed to remove container {}: {}",
                            name, e
                        ))
                    })?;
                info!(container = name, "removed prior container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(DeployError::RunFailed(format!(
                "failed to inspect container {}: {}",
                name, e
            ))),
        }
    }
}

/// Actionable message for a build that claimed success but left no image.
/// The advice is recipe-specific.
fn image_missing_hint(framework: Framework) -> String {
    match framework {
        Framework::Nodejs => {
            "the build stream completed but no image exists; check that package.json \
             defines a `start` script"
                .to_string()
        }
        Framework::Nextjs => {
            "the build stream completed but no image exists; check that `next build` \
             succeeds and package.json defines `build` and `start` scripts"
                .to_string()
        }
        Framework::Django => {
            "the build stream completed but no image exists; check that requirements.txt \
             installs cleanly"
                .to_string()
        }
        Framework::Static => "the build stream completed but no image exists".to_string(),
    }
}

fn push_tail(tail: &mut VecDeque<String>, chunk: String) {
    if tail.len() == BUILD_TAIL_CHUNKS {
        tail.pop_front();
    }
    tail.push_back(chunk);
}

fn render_tail(tail: &VecDeque<String>) -> String {
    tail.iter().map(String::as_str).collect::<String>().trim().to_string()
}
