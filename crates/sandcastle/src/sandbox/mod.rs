//! Environment containers.
//!
//! Maps an environment (user + record ID + type) to one hardened container
//! and one named volume mounted at `/workspace`, and drives the container
//! through its lifecycle. Containers are created without network access;
//! the bridge network is only attached on demand via
//! [`SandboxManager::enable_network`].

mod stats;

pub use stats::{UsageSample, compute_cpu_percent, memory_usage, parse_usage_sample};
pub(crate) use stats::USAGE_SCRIPT;

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::container::{
    Container, ContainerConfig, ContainerError, ContainerRuntimeApi, ExecOutput, ResourceLimits,
};
use crate::environment::EnvironmentType;
use crate::error::{SandboxError, SandboxResult};
use crate::security::WORKSPACE_ROOT;

pub const LABEL_USER_ID: &str = "sandcastle.user_id";
pub const LABEL_ENV_ID: &str = "sandcastle.env_id";
pub const LABEL_ENV_TYPE: &str = "sandcastle.env_type";
pub const LABEL_ENV_NAME: &str = "sandcastle.env_name";

/// Capabilities re-added after `--cap-drop ALL`.
pub const KEPT_CAPABILITIES: &[&str] = &["CHOWN", "DAC_OVERRIDE", "FOWNER", "SETGID", "SETUID"];

const NAME_PREFIX: &str = "sandcastle";

/// Images used per environment type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub nodejs: String,
    pub python: String,
    pub fullstack: String,
    pub cpp: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            nodejs: "node:18-alpine".to_string(),
            python: "python:3.11-alpine".to_string(),
            fullstack: "node:18-alpine".to_string(),
            cpp: "gcc:latest".to_string(),
        }
    }
}

impl ImageConfig {
    pub fn image_for(&self, env_type: EnvironmentType) -> &str {
        match env_type {
            EnvironmentType::Nodejs => &self.nodejs,
            EnvironmentType::Python => &self.python,
            EnvironmentType::Fullstack => &self.fullstack,
            EnvironmentType::Cpp => &self.cpp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Network attached while package installs run.
    pub network: String,
    pub images: ImageConfig,
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub pids_limit: u32,
    /// Grace period passed to `stop`.
    pub stop_timeout_secs: u32,
    /// Wait after an implicit start before running a command.
    pub start_settle_ms: u64,
    /// Gap between the two usage samples taken by `get_status`.
    pub stats_sample_ms: u64,
    pub exec_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let limits = ResourceLimits::default();
        Self {
            network: "bridge".to_string(),
            images: ImageConfig::default(),
            cpu_cores: limits.cpu_cores,
            memory_mb: limits.memory_mb,
            disk_mb: 1024,
            pids_limit: limits.pids_limit,
            stop_timeout_secs: 10,
            start_settle_ms: 1000,
            stats_sample_ms: 1000,
            exec_timeout_secs: 30,
        }
    }
}

/// Request to provision an environment's container and volume.
#[derive(Debug, Clone)]
pub struct CreateSandbox {
    pub user_id: String,
    pub env_id: i64,
    pub env_type: EnvironmentType,
    pub name: String,
    pub cpu_cores: Option<f64>,
    pub memory_mb: Option<u64>,
}

/// Handles returned by a successful create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provisioned {
    pub container_id: String,
    pub volume_name: String,
}

/// Live container state with resource usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub status: String,
    pub running: bool,
    pub cpu_percent: f64,
    pub memory_usage_mb: f64,
    pub memory_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ContainerStatus {
    fn not_found() -> Self {
        Self {
            status: "not_found".to_string(),
            ..Default::default()
        }
    }

    fn failed(err: impl ToString) -> Self {
        Self {
            status: "error".to_string(),
            error: Some(err.to_string()),
            ..Default::default()
        }
    }
}

/// A container carrying this crate's labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedContainer {
    pub container_id: String,
    pub name: String,
    pub status: String,
    pub user_id: Option<String>,
    pub env_id: Option<String>,
    pub env_type: Option<String>,
    pub env_name: Option<String>,
}

impl From<Container> for ManagedContainer {
    fn from(container: Container) -> Self {
        let label = |key: &str| container.labels.get(key).cloned();
        Self {
            name: container.names.first().cloned().unwrap_or_default(),
            status: container.state.to_string(),
            user_id: label(LABEL_USER_ID),
            env_id: label(LABEL_ENV_ID),
            env_type: label(LABEL_ENV_TYPE),
            env_name: label(LABEL_ENV_NAME),
            container_id: container.id,
        }
    }
}

/// Replace anything the engine would reject in an object name with `_`.
fn sanitize_name_part(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn container_name(user_id: &str, env_id: i64, name: &str) -> String {
    format!(
        "{}_{}_{}_{}",
        NAME_PREFIX,
        sanitize_name_part(user_id),
        env_id,
        sanitize_name_part(name)
    )
}

pub fn volume_name(user_id: &str, env_id: i64) -> String {
    format!("{}_env_{}_{}", NAME_PREFIX, sanitize_name_part(user_id), env_id)
}

fn is_already_connected(err: &ContainerError) -> bool {
    match err {
        ContainerError::CommandFailed { message, .. } => {
            let lower = message.to_lowercase();
            lower.contains("already exists") || lower.contains("already connected")
        }
        _ => false,
    }
}

fn is_not_connected(err: &ContainerError) -> bool {
    match err {
        ContainerError::CommandFailed { message, .. } => {
            message.to_lowercase().contains("not connected")
        }
        _ => false,
    }
}

fn is_existing_volume(err: &ContainerError) -> bool {
    matches!(err, ContainerError::CommandFailed { message, .. } if message.to_lowercase().contains("already exists"))
}

/// Lifecycle manager for environment containers.
pub struct SandboxManager {
    runtime: Arc<dyn ContainerRuntimeApi>,
    config: SandboxConfig,
}

impl SandboxManager {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>, config: SandboxConfig) -> Self {
        Self { runtime, config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn default_exec_timeout(&self) -> Duration {
        Duration::from_secs(self.config.exec_timeout_secs)
    }

    /// Provision the volume and container for an environment.
    ///
    /// The container is created stopped and leaves this call with no network
    /// attached. If anything after the volume step fails, the partial
    /// resources are removed before the error is returned.
    pub async fn create(&self, request: &CreateSandbox) -> SandboxResult<Provisioned> {
        let volume = volume_name(&request.user_id, request.env_id);
        let env_id = request.env_id.to_string();
        let env_type = request.env_type.as_str();

        let volume_labels = vec![
            (LABEL_USER_ID.to_string(), request.user_id.clone()),
            (LABEL_ENV_ID.to_string(), env_id.clone()),
        ];
        match self.runtime.create_volume(&volume, &volume_labels).await {
            Ok(()) => debug!("Created volume {}", volume),
            Err(e) if is_existing_volume(&e) => {
                warn!("Volume {} already exists, reusing it", volume);
            }
            Err(e) => return Err(e.into()),
        }

        let image = self.config.images.image_for(request.env_type).to_string();
        if let Err(e) = self.ensure_image(&image).await {
            self.discard_volume(&volume).await;
            return Err(e);
        }

        let limits = ResourceLimits {
            cpu_cores: request.cpu_cores.unwrap_or(self.config.cpu_cores),
            memory_mb: request.memory_mb.unwrap_or(self.config.memory_mb),
            pids_limit: self.config.pids_limit,
        };
        let config = ContainerConfig::new(&image)
            .name(container_name(&request.user_id, request.env_id, &request.name))
            .interactive()
            .network(&self.config.network)
            .volume(&volume, WORKSPACE_ROOT)
            .workdir(WORKSPACE_ROOT)
            .limits(limits)
            .drop_capabilities_except(KEPT_CAPABILITIES)
            .security_opt("no-new-privileges")
            .env("USER_ID", &request.user_id)
            .env("ENV_ID", &env_id)
            .env("ENV_TYPE", env_type)
            .env("HOME", WORKSPACE_ROOT)
            .label(LABEL_USER_ID, &request.user_id)
            .label(LABEL_ENV_ID, &env_id)
            .label(LABEL_ENV_TYPE, env_type)
            .label(LABEL_ENV_NAME, &request.name);

        let container_id = match self.runtime.create_container(&config).await {
            Ok(id) => id,
            Err(e) => {
                self.discard_volume(&volume).await;
                return Err(e.into());
            }
        };

        // A container created with `--network none` can never join another
        // network, so it is created on the bridge and detached here.
        if let Err(e) = self
            .runtime
            .disconnect_network(&self.config.network, &container_id, true)
            .await
            && !is_not_connected(&e)
        {
            warn!(
                "Failed to isolate container {}, removing it: {}",
                container_id, e
            );
            if let Err(rm) = self.runtime.remove_container(&container_id, true).await {
                warn!("Failed to remove container {}: {}", container_id, rm);
            }
            self.discard_volume(&volume).await;
            return Err(e.into());
        }

        info!(
            "Created container {} for user {} environment {} ({})",
            container_id, request.user_id, request.env_id, env_type
        );
        Ok(Provisioned {
            container_id,
            volume_name: volume,
        })
    }

    async fn ensure_image(&self, image: &str) -> SandboxResult<()> {
        if self.runtime.image_exists(image).await? {
            return Ok(());
        }
        info!("Pulling image {}", image);
        self.runtime.pull_image(image).await?;
        Ok(())
    }

    async fn discard_volume(&self, volume: &str) {
        if let Err(e) = self.runtime.remove_volume(volume).await
            && !e.is_not_found()
        {
            warn!("Failed to remove volume {}: {}", volume, e);
        }
    }

    pub async fn start(&self, container_id: &str) -> SandboxResult<()> {
        self.runtime.start_container(container_id).await?;
        info!("Started container {}", container_id);
        Ok(())
    }

    /// Stop a container, waiting `timeout_secs` (default from config) before killing it.
    pub async fn stop(&self, container_id: &str, timeout_secs: Option<u32>) -> SandboxResult<()> {
        let timeout = timeout_secs.unwrap_or(self.config.stop_timeout_secs);
        self.runtime
            .stop_container(container_id, Some(timeout))
            .await?;
        info!("Stopped container {}", container_id);
        Ok(())
    }

    /// Force-remove a container and its volume. Objects already gone count as removed.
    pub async fn destroy(&self, container_id: Option<&str>, volume: Option<&str>) -> SandboxResult<()> {
        if let Some(id) = container_id {
            match self.runtime.remove_container(id, true).await {
                Ok(()) => info!("Removed container {}", id),
                Err(e) if e.is_not_found() => debug!("Container {} already removed", id),
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(volume) = volume {
            match self.runtime.remove_volume(volume).await {
                Ok(()) => info!("Removed volume {}", volume),
                Err(e) if e.is_not_found() => debug!("Volume {} already removed", volume),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Run `sh -c <command>` in `/workspace`, starting the container first if needed.
    pub async fn execute(
        &self,
        container_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> SandboxResult<ExecOutput> {
        let inspect = self.runtime.inspect_container(container_id).await?;
        if !inspect.state.running {
            debug!("Container {} not running, starting before exec", container_id);
            self.runtime.start_container(container_id).await?;
            tokio::time::sleep(Duration::from_millis(self.config.start_settle_ms)).await;
        }

        let timeout = timeout.unwrap_or_else(|| self.default_exec_timeout());
        let output = self
            .runtime
            .exec(
                container_id,
                &["sh", "-c", command],
                Some(WORKSPACE_ROOT),
                timeout,
            )
            .await?;
        Ok(output)
    }

    /// Attach the configured network. Already attached is success.
    pub async fn enable_network(&self, container_id: &str) -> SandboxResult<()> {
        match self
            .runtime
            .connect_network(&self.config.network, container_id)
            .await
        {
            Ok(()) => {
                info!("Enabled network for container {}", container_id);
                Ok(())
            }
            Err(e) if is_already_connected(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Detach the configured network. Not attached is success.
    pub async fn disable_network(&self, container_id: &str) -> SandboxResult<()> {
        match self
            .runtime
            .disconnect_network(&self.config.network, container_id, true)
            .await
        {
            Ok(()) => {
                info!("Disabled network for container {}", container_id);
                Ok(())
            }
            Err(e) if is_not_connected(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Current state plus CPU and memory usage. Never fails; problems are
    /// reported through `status`/`error`.
    pub async fn get_status(&self, container_id: &str) -> ContainerStatus {
        let inspect = match self.runtime.inspect_container(container_id).await {
            Ok(inspect) => inspect,
            Err(ContainerError::ContainerNotFound(_)) => return ContainerStatus::not_found(),
            Err(e) => return ContainerStatus::failed(e),
        };

        let mut status = ContainerStatus {
            status: inspect.state.status.to_string(),
            running: inspect.state.running,
            created: Some(inspect.created).filter(|s| !s.is_empty()),
            started: Some(inspect.state.started_at).filter(|s| !s.is_empty()),
            ..Default::default()
        };

        if status.running {
            match self.sample_usage(container_id).await {
                Ok((prev, current)) => {
                    status.cpu_percent = compute_cpu_percent(&prev, &current);
                    let (used_mb, percent) = memory_usage(&current);
                    status.memory_usage_mb = used_mb;
                    status.memory_percent = percent;
                }
                Err(e) => debug!("Usage sampling failed for {}: {}", container_id, e),
            }
        }

        status
    }

    async fn sample_usage(&self, container_id: &str) -> SandboxResult<(UsageSample, UsageSample)> {
        let first = self.read_usage(container_id).await?;
        tokio::time::sleep(Duration::from_millis(self.config.stats_sample_ms)).await;
        let second = self.read_usage(container_id).await?;
        Ok((first, second))
    }

    async fn read_usage(&self, container_id: &str) -> SandboxResult<UsageSample> {
        let output = self
            .runtime
            .exec(
                container_id,
                &["sh", "-c", USAGE_SCRIPT],
                None,
                Duration::from_secs(10),
            )
            .await?;
        parse_usage_sample(&output.stdout)
            .map_err(|e| SandboxError::OperationFailed(format!("{e:#}")))
    }

    /// Containers labelled with this user's ID.
    pub async fn list_user_containers(&self, user_id: &str) -> SandboxResult<Vec<ManagedContainer>> {
        Ok(self
            .list_managed_containers()
            .await?
            .into_iter()
            .filter(|c| c.user_id.as_deref() == Some(user_id))
            .collect())
    }

    /// Every container carrying the user label, whatever its state.
    pub async fn list_managed_containers(&self) -> SandboxResult<Vec<ManagedContainer>> {
        let containers = self.runtime.list_containers(LABEL_USER_ID).await?;
        Ok(containers.into_iter().map(ManagedContainer::from).collect())
    }
}
