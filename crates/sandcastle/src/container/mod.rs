//! Container runtime management module.
//!
//! Provides an async interface to the Docker or Podman CLI. The runtime is
//! auto-detected or can be configured explicitly. Everything above this
//! module talks to the engine through [`ContainerRuntimeApi`] so tests can
//! substitute a fake.

mod container;
mod error;

pub use container::{
    CPU_PERIOD_MICROS, Container, ContainerConfig, ContainerInspect, ContainerState, ExecOutput,
    InspectState, ResourceLimits, VolumeMount, parse_container_list, validate_container_name,
    validate_image_name,
};
pub use error::{ContainerError, ContainerResult};

use container::{validate_container_id_or_name, validate_volume_name};

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    #[default]
    Docker,
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// Container engine abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    async fn create_volume(
        &self,
        name: &str,
        labels: &[(String, String)],
    ) -> ContainerResult<()>;
    async fn remove_volume(&self, name: &str) -> ContainerResult<()>;
    async fn image_exists(&self, image: &str) -> ContainerResult<bool>;
    async fn pull_image(&self, image: &str) -> ContainerResult<()>;

    /// Create (but do not start) a container, returning its ID.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;
    async fn start_container(&self, container_id: &str) -> ContainerResult<()>;
    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;
    async fn inspect_container(&self, container_id: &str) -> ContainerResult<ContainerInspect>;

    /// Run a command in a container and wait for it, bounded by `timeout`.
    async fn exec(
        &self,
        container_id: &str,
        command: &[&str],
        workdir: Option<&str>,
        timeout: Duration,
    ) -> ContainerResult<ExecOutput>;

    async fn connect_network(&self, network: &str, container_id: &str) -> ContainerResult<()>;
    async fn disconnect_network(
        &self,
        network: &str,
        container_id: &str,
        force: bool,
    ) -> ContainerResult<()>;

    /// List all containers (running or not) carrying the given label key.
    async fn list_containers(&self, label: &str) -> ContainerResult<Vec<Container>>;
}

/// Container runtime client backed by the docker/podman CLI.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Prefers Docker, falls back to Podman. If neither is on PATH the
    /// runtime still constructs and every call fails with a spawn error.
    pub fn new() -> Self {
        let runtime_type = if Self::is_binary_available("docker") {
            RuntimeType::Docker
        } else if Self::is_binary_available("podman") {
            RuntimeType::Podman
        } else {
            RuntimeType::Docker
        };
        Self::with_type(runtime_type)
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let output = self.run("version", &["version", "--format", "json"]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Spawn the CLI and capture its output without interpreting the status.
    async fn spawn(&self, command: &str, args: &[&str]) -> ContainerResult<Output> {
        debug!("{} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })
    }

    /// Run the CLI and turn a non-zero exit into a classified error.
    async fn run(&self, command: &str, args: &[&str]) -> ContainerResult<Output> {
        self.run_on(command, "", args).await
    }

    async fn run_on(&self, command: &str, target: &str, args: &[&str]) -> ContainerResult<Output> {
        let output = self.spawn(command, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::from_stderr(command, target, &stderr));
        }
        Ok(output)
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_volume(
        &self,
        name: &str,
        labels: &[(String, String)],
    ) -> ContainerResult<()> {
        validate_volume_name(name)?;

        let label_args: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mut args = vec!["volume", "create"];
        for label in &label_args {
            args.push("--label");
            args.push(label);
        }
        args.push(name);

        self.run_on("volume create", name, &args).await?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> ContainerResult<()> {
        validate_volume_name(name)?;
        self.run_on("volume rm", name, &["volume", "rm", "-f", name])
            .await?;
        Ok(())
    }

    /// Uses `image inspect`, which both Docker and Podman support.
    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;
        let output = self
            .spawn("image inspect", &["image", "inspect", image])
            .await?;
        Ok(output.status.success())
    }

    async fn pull_image(&self, image: &str) -> ContainerResult<()> {
        validate_image_name(image)?;
        self.run_on("pull", image, &["pull", image]).await?;
        Ok(())
    }

    /// The configuration is validated before anything reaches the CLI.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let owned_args = config.to_create_args();
        let args: Vec<&str> = owned_args.iter().map(String::as_str).collect();
        let output = self.run_on("create", &config.image, &args).await?;

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(ContainerError::ParseError(
                "create returned an empty container ID".to_string(),
            ));
        }
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;
        self.run_on("start", container_id, &["start", container_id])
            .await?;
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let timeout = timeout_seconds.map(|t| t.to_string());
        let mut args = vec!["stop"];
        if let Some(ref t) = timeout {
            args.push("-t");
            args.push(t);
        }
        args.push(container_id);

        self.run_on("stop", container_id, &args).await?;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(container_id);

        self.run_on("rm", container_id, &args).await?;
        Ok(())
    }

    async fn inspect_container(&self, container_id: &str) -> ContainerResult<ContainerInspect> {
        validate_container_id_or_name(container_id)?;

        let output = self
            .run_on(
                "inspect",
                container_id,
                &["inspect", "--type", "container", container_id],
            )
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed: Vec<ContainerInspect> = serde_json::from_str(stdout.trim())
            .map_err(|e| ContainerError::ParseError(e.to_string()))?;

        parsed
            .into_iter()
            .next()
            .ok_or_else(|| ContainerError::ContainerNotFound(container_id.to_string()))
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &[&str],
        workdir: Option<&str>,
        timeout: Duration,
    ) -> ContainerResult<ExecOutput> {
        validate_container_id_or_name(container_id)?;

        let mut args = vec!["exec"];
        if let Some(dir) = workdir {
            args.push("-w");
            args.push(dir);
        }
        args.push(container_id);
        args.extend(command);

        // kill_on_drop reaps the CLI process when the timeout drops the future.
        let output = match tokio::time::timeout(timeout, self.spawn("exec", &args)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ContainerError::Timeout {
                    command: "exec".to_string(),
                    seconds: timeout.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success()
            && stdout.is_empty()
            && is_engine_exec_failure(output.status.code(), &stderr)
        {
            return Err(ContainerError::from_stderr("exec", container_id, &stderr));
        }

        Ok(ExecOutput {
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn connect_network(&self, network: &str, container_id: &str) -> ContainerResult<()> {
        validate_container_name(network)?;
        validate_container_id_or_name(container_id)?;
        self.run_on(
            "network connect",
            container_id,
            &["network", "connect", network, container_id],
        )
        .await?;
        Ok(())
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container_id: &str,
        force: bool,
    ) -> ContainerResult<()> {
        validate_container_name(network)?;
        validate_container_id_or_name(container_id)?;

        let mut args = vec!["network", "disconnect"];
        if force {
            args.push("-f");
        }
        args.push(network);
        args.push(container_id);

        self.run_on("network disconnect", container_id, &args).await?;
        Ok(())
    }

    async fn list_containers(&self, label: &str) -> ContainerResult<Vec<Container>> {
        let filter = format!("label={label}");
        let output = self
            .run(
                "ps",
                &[
                    "ps",
                    "-a",
                    "--no-trunc",
                    "--filter",
                    filter.as_str(),
                    "--format",
                    "json",
                ],
            )
            .await?;
        parse_container_list(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Whether a failed `exec` was refused by the engine rather than run.
///
/// Only the engine's own error line counts. The command's stderr may say
/// "is not running" about anything.
fn is_engine_exec_failure(code: Option<i32>, stderr: &str) -> bool {
    let first = stderr
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    // Docker reports daemon refusals with exit 1, Podman with 125.
    let from_engine = first.starts_with("error response from daemon:")
        || (code == Some(125) && first.starts_with("error:"));
    from_engine
        && (first.contains("no such container")
            || first.contains("no container with name or id")
            || first.contains("is not running")
            || first.contains("container state improper"))
}
