// Docker container management using Bollard

use crate::container_spec::ContainerSpec;
use crate::error::{Result, SandboxError};
use crate::runtime::{
    BuildOutcome, ContainerRuntime, ExecOutput, ImageRemoval, ManagedContainer, StreamDecoder,
    MANAGED_LABEL,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions, RemoveImageOptions, TagImageOptions};
use bollard::models::HostConfig;
use bollard::network::DisconnectNetworkOptions;
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

fn status_code(err: &BollardError) -> Option<u16> {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// Split `repo[:tag]` into its parts; a colon inside a registry host is not a tag.
pub fn split_reference(reference: &str) -> (&str, &str) {
    match reference.rfind(':') {
        Some(idx) if !reference[idx..].contains('/') => (&reference[..idx], &reference[idx + 1..]),
        _ => (reference, "latest"),
    }
}

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Verify the daemon answers before accepting work
    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        info!("Successfully connected to Docker daemon");
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn host_supports_apparmor(&self) -> Result<bool> {
        let info = self.docker.info().await?;
        let supported = info
            .security_options
            .unwrap_or_default()
            .iter()
            .any(|opt| opt.contains("name=apparmor"));
        Ok(supported)
    }

    async fn image_id(&self, image: &str) -> Result<Option<String>> {
        match self.docker.inspect_image(image).await {
            Ok(inspect) => Ok(inspect.id),
            Err(e) if status_code(&e) == Some(404) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn image_labels(&self, image: &str) -> Result<Option<HashMap<String, String>>> {
        match self.docker.inspect_image(image).await {
            Ok(inspect) => Ok(Some(
                inspect.config.and_then(|c| c.labels).unwrap_or_default(),
            )),
            Err(e) if status_code(&e) == Some(404) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        warn!("⚠ Image cache miss: {} (pulling now)", image);

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::ImageUnavailable(format!("{}: {}", image, e)))?;
        }

        info!("✓ Image pulled successfully: {}", image);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let host_config = HostConfig {
            memory: Some(spec.memory_bytes),
            memory_swap: Some(spec.memory_bytes),
            nano_cpus: Some(spec.nano_cpus),
            pids_limit: Some(spec.pids_limit),
            cap_drop: Some(spec.cap_drop.clone()),
            security_opt: Some(spec.security_opt.clone()),
            binds: Some(vec![spec.bind()]),
            network_mode: Some(spec.network_mode().to_string()),
            privileged: Some(false),
            readonly_rootfs: Some(false), // pip needs site-packages
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.keepalive_cmd.clone()),
            entrypoint: Some(vec![]),
            env: Some(spec.env.clone()),
            working_dir: Some(spec.working_dir.clone()),
            labels: Some(spec.labels.clone()),
            network_disabled: Some(spec.network_disabled()),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self.docker.create_container(Some(options), config).await?;
        debug!(container_id = %response.id, name = %spec.name, "Container created");
        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        working_dir: &str,
        output: &mut ExecOutput,
    ) -> Result<()> {
        let exec_config = CreateExecOptions {
            cmd: Some(argv.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(working_dir.to_string()),
            ..Default::default()
        };

        let exec = self.docker.create_exec(container_id, exec_config).await?;

        let start_config = StartExecOptions {
            detach: false,
            ..Default::default()
        };

        if let StartExecResults::Attached { output: mut stream, .. } =
            self.docker.start_exec(&exec.id, Some(start_config)).await?
        {
            let mut stdout = StreamDecoder::default();
            let mut stderr = StreamDecoder::default();
            while let Some(msg) = stream.next().await {
                match msg? {
                    LogOutput::StdOut { message } => stdout.push(&message, &mut output.stdout),
                    LogOutput::StdErr { message } => stderr.push(&message, &mut output.stderr),
                    _ => {}
                }
            }
            stdout.finish(&mut output.stdout);
            stderr.finish(&mut output.stderr);
        } else {
            return Err(SandboxError::Internal(
                "exec started detached; output cannot be captured".to_string(),
            ));
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        output.exit_code = inspect.exit_code;
        Ok(())
    }

    async fn disconnect_network(&self, container_id: &str, network: &str) -> Result<()> {
        self.docker
            .disconnect_network(
                network,
                DisconnectNetworkOptions {
                    container: container_id.to_string(),
                    force: true,
                },
            )
            .await?;
        Ok(())
    }

    async fn kill_container(&self, container_id: &str) -> Result<()> {
        match self
            .docker
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // already gone or already stopped
            Err(e) if matches!(status_code(&e), Some(404) | Some(409)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_managed_containers(&self) -> Result<Vec<ManagedContainer>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ManagedContainer {
                    id: c.id?,
                    created_at: c.created.unwrap_or(0),
                })
            })
            .collect())
    }

    async fn build_image(
        &self,
        tag: &str,
        context: Vec<u8>,
        labels: HashMap<String, String>,
    ) -> Result<BuildOutcome> {
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            labels,
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(Bytes::from(context)));

        let mut log = String::new();
        let mut error = None;

        while let Some(item) = stream.next().await {
            match item {
                Ok(info) => {
                    if let Some(line) = info.stream {
                        log.push_str(&line);
                    }
                    if let Some(status) = info.status {
                        log.push_str(&status);
                        log.push('\n');
                    }
                    if let Some(message) = info.error {
                        log.push_str(&message);
                        log.push('\n');
                        error = Some(message);
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    log.push_str(&message);
                    log.push('\n');
                    error = Some(message);
                    break;
                }
            }
        }

        Ok(BuildOutcome {
            success: error.is_none(),
            log,
            error,
        })
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
        let (repo, tag) = split_reference(target);
        self.docker
            .tag_image(
                source,
                Some(TagImageOptions {
                    repo: repo.to_string(),
                    tag: tag.to_string(),
                }),
            )
            .await?;
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<ImageRemoval> {
        let options = RemoveImageOptions {
            force: false,
            noprune: false,
        };
        match self.docker.remove_image(image, Some(options), None).await {
            Ok(_) => Ok(ImageRemoval::Removed),
            Err(e) if status_code(&e) == Some(404) => Ok(ImageRemoval::NotFound),
            Err(e) if status_code(&e) == Some(409) => Ok(ImageRemoval::Conflict(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}
