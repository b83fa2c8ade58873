//! Container engine adapter
//!
//! [`ContainerEngine`] is the narrow surface the deployment pipeline and the
//! lifecycle service need from the local container runtime. [`DockerEngine`]
//! drives a Docker-compatible daemon: images are built with the docker CLI, and
//! everything else goes through the daemon API. Errors are returned as-is; this
//! layer never retries.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use hyper::body::Bytes;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Raw container output, stdout and stderr interleaved
pub type LogStream = BoxStream<'static, Result<Bytes>>;

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Build `image_tag` from `dockerfile` with `context` as the build context
    async fn build(&self, context: &Path, dockerfile: &Path, image_tag: &str) -> Result<()>;

    /// Create a container publishing `exposed_port` on the same host port.
    /// A name collision surfaces as [`Error::ContainerInUse`].
    async fn create(&self, image_tag: &str, name: &str, exposed_port: u16) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str) -> Result<()>;

    async fn pause(&self, id: &str) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    /// Id of the container called `name`, if one exists
    async fn resolve_by_name(&self, name: &str) -> Result<Option<String>>;

    async fn logs(&self, id: &str) -> Result<LogStream>;
}

/// Docker-backed engine
pub struct DockerEngine {
    client: Docker,
    cli: String,
}

impl DockerEngine {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(docker_host: Option<&str>, cli: &str) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!("Failed to connect to Docker at '{}': {}", host, e)
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}",
                    host,
                    e
                )
            })?
        } else {
            Self::connect_with_defaults()?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd or a compatible engine is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self {
            client,
            cli: cli.to_string(),
        })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION).map_err(
                |e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e),
            )
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker host '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let candidates = [
            "/var/run/docker.sock".to_string(),
            format!("{}/.docker/run/docker.sock", home),
            format!("{}/.colima/default/docker.sock", home),
        ];

        for path in &candidates {
            if Path::new(path).exists() {
                debug!(path, "Found Docker socket");
                return Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                    .map_err(|e| anyhow::anyhow!("Cannot connect to '{}': {}", path, e));
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon: {}. Start dockerd or set DOCKER_HOST.",
                e
            )
        })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn build(&self, context: &Path, dockerfile: &Path, image_tag: &str) -> Result<()> {
        info!(
            image = %image_tag,
            context = %context.display(),
            dockerfile = %dockerfile.display(),
            "Building image"
        );

        let mut child = Command::new(&self.cli)
            .arg("build")
            .arg("-t")
            .arg(image_tag)
            .arg("-f")
            .arg(dockerfile)
            .arg(context)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Engine(format!("failed to spawn {} build: {}", self.cli, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Engine("build stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Engine("build stderr unavailable".into()))?;

        // Both pipes are drained to completion so the build never blocks on a full pipe.
        let drain_stdout = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(target: "docker", "{}", line);
            }
        };
        let drain_stderr = async {
            let mut tail: Vec<String> = Vec::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(target: "docker", "{}", line);
                tail.push(line);
                if tail.len() > 20 {
                    tail.remove(0);
                }
            }
            tail
        };
        let ((), tail) = tokio::join!(drain_stdout, drain_stderr);

        let status = child.wait().await?;
        if !status.success() {
            return Err(Error::Engine(format!(
                "image build for {} failed with exit code {}: {}",
                image_tag,
                status.code().unwrap_or(-1),
                tail.join("\n")
            )));
        }

        info!(image = %image_tag, "Image built");
        Ok(())
    }

    async fn create(&self, image_tag: &str, name: &str, exposed_port: u16) -> Result<String> {
        let port_key = format!("{}/tcp", exposed_port);
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(exposed_port.to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let container_config = Config {
            image: Some(image_tag.to_string()),
            tty: Some(true),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                auto_remove: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), container_config)
            .await?;

        for warning in &response.warnings {
            warn!(container = name, "{}", warning);
        }
        info!(container_id = %response.id, name, image = image_tag, "Created container");
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        match self
            .client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => debug!(container_id = id, "Container was already running"),
            Err(e) => return Err(e.into()),
        }
        info!(container_id = id, "Started container");
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        match self
            .client
            .stop_container(id, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(_) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => debug!(container_id = id, "Container was already stopped"),
            Err(e) => return Err(e.into()),
        }
        info!(container_id = id, "Stopped container");
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.client.pause_container(id).await?;
        info!(container_id = id, "Paused container");
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.client.remove_container(id, Some(options)).await?;
        debug!(container_id = id, "Removed container");
        Ok(())
    }

    async fn resolve_by_name(&self, name: &str) -> Result<Option<String>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let wanted = format!("/{}", name);
        let containers = self.client.list_containers(Some(options)).await?;

        Ok(containers.into_iter().find_map(|summary| {
            let matches = summary
                .names
                .as_ref()
                .map(|names| names.iter().any(|n| *n == wanted))
                .unwrap_or(false);
            if matches {
                summary.id
            } else {
                None
            }
        }))
    }

    async fn logs(&self, id: &str) -> Result<LogStream> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: false,
            ..Default::default()
        };

        let stream = self.client.logs(id, Some(options)).map(|item| {
            item.map(|output| match output {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message }
                | LogOutput::StdIn { message } => message,
            })
            .map_err(Error::from)
        });
        Ok(stream.boxed())
    }
}

/// Re-emit a container's output on the `container` tracing target until it exits
pub fn forward_logs(engine: Arc<dyn ContainerEngine>, container_id: String, name: String) {
    tokio::spawn(async move {
        let mut stream = match engine.logs(&container_id).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(container = %name, error = %e, "Cannot attach to container logs");
                return;
            }
        };

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    for line in String::from_utf8_lossy(&bytes).lines() {
                        let line = line.trim_end();
                        if !line.is_empty() {
                            info!(target: "container", container = %name, "{}", line);
                        }
                    }
                }
                Err(e) => {
                    warn!(container = %name, error = %e, "Error reading container logs");
                    break;
                }
            }
        }
        debug!(container = %name, "Container log stream ended");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_docker_host_rejected() {
        let err = DockerEngine::connect_to_host("ftp://example").unwrap_err();
        assert!(err.to_string().contains("Invalid docker host"));
    }
}
