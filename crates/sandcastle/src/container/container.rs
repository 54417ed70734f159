//! Container types and configuration.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use super::error::{ContainerError, ContainerResult};

/// Deserialize a field that can be either a string or an integer (Unix timestamp).
fn deserialize_string_or_int<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct StringOrInt;

    impl<'de> Visitor<'de> for StringOrInt {
        type Value = String;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or an integer")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
            Ok(value.to_string())
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
            Ok(value.to_string())
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
            Ok(value.to_string())
        }
    }

    deserializer.deserialize_any(StringOrInt)
}

/// Container names arrive as a comma-separated string (docker) or a list (podman).
fn deserialize_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Names {
        Joined(String),
        List(Vec<String>),
    }

    Ok(match Names::deserialize(deserializer)? {
        Names::Joined(joined) => joined
            .split(',')
            .map(|name| name.trim().trim_start_matches('/').to_string())
            .filter(|name| !name.is_empty())
            .collect(),
        Names::List(list) => list
            .into_iter()
            .map(|name| name.trim_start_matches('/').to_string())
            .collect(),
    })
}

/// Labels arrive as `k=v,k=v` (docker) or as an object (podman).
fn deserialize_labels<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Labels {
        Joined(String),
        Map(BTreeMap<String, String>),
        Missing(()),
    }

    Ok(match Labels::deserialize(deserializer)? {
        Labels::Joined(joined) => joined
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect(),
        Labels::Map(map) => map,
        Labels::Missing(()) => BTreeMap::new(),
    })
}

/// A named volume mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Named volume on the host.
    pub source: String,
    /// Absolute path inside the container.
    pub target: String,
    pub read_only: bool,
}

/// Resource ceilings enforced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU cores, converted to a period-based quota.
    pub cpu_cores: f64,
    /// Memory limit in MiB. Swap is pinned to the same value.
    pub memory_mb: u64,
    /// Maximum number of processes.
    pub pids_limit: u32,
}

/// CFS scheduler period used to derive the CPU quota.
pub const CPU_PERIOD_MICROS: u64 = 100_000;

impl ResourceLimits {
    pub fn cpu_quota(&self) -> u64 {
        (self.cpu_cores * CPU_PERIOD_MICROS as f64) as u64
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_cores: 1.0,
            memory_mb: 512,
            pids_limit: 50,
        }
    }
}

/// Configuration for creating a new container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name.
    pub name: Option<String>,
    /// Docker/OCI image to use.
    pub image: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Labels for the container.
    pub labels: BTreeMap<String, String>,
    /// Named volume mounts.
    pub volumes: Vec<VolumeMount>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// Network to attach at creation.
    pub network_mode: Option<String>,
    /// Keep stdin open and allocate a tty so the default shell stays alive.
    pub interactive: bool,
    pub limits: Option<ResourceLimits>,
    pub cap_drop: Vec<String>,
    pub cap_add: Vec<String>,
    pub security_opts: Vec<String>,
}

impl ContainerConfig {
    /// Create a new container config with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn volume(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.volumes.push(VolumeMount {
            source: source.into(),
            target: target.into(),
            read_only: false,
        });
        self
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network_mode = Some(network.into());
        self
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Drop every Linux capability, then re-add only the listed ones.
    pub fn drop_capabilities_except(mut self, keep: &[&str]) -> Self {
        self.cap_drop = vec!["ALL".to_string()];
        self.cap_add = keep.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn security_opt(mut self, opt: impl Into<String>) -> Self {
        self.security_opts.push(opt.into());
        self
    }

    /// Validate all container configuration fields.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }

        for key in self.labels.keys() {
            validate_label_key(key)?;
        }

        for mount in &self.volumes {
            validate_volume_name(&mount.source)?;
            validate_container_path(&mount.target)?;
        }

        if let Some(ref workdir) = self.workdir {
            validate_container_path(workdir)?;
        }

        if let Some(ref network) = self.network_mode {
            validate_container_name(network)?;
        }

        if let Some(limits) = self.limits {
            if !(limits.cpu_cores > 0.0 && limits.cpu_cores.is_finite()) {
                return Err(ContainerError::InvalidInput(format!(
                    "cpu limit must be a positive number of cores, got {}",
                    limits.cpu_cores
                )));
            }
            if limits.memory_mb == 0 {
                return Err(ContainerError::InvalidInput(
                    "memory limit must be greater than zero".to_string(),
                ));
            }
            if limits.pids_limit == 0 {
                return Err(ContainerError::InvalidInput(
                    "pids limit must be greater than zero".to_string(),
                ));
            }
        }

        for cap in self.cap_drop.iter().chain(self.cap_add.iter()) {
            if cap.is_empty() || !cap.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
                return Err(ContainerError::InvalidInput(format!(
                    "capability '{}' is not a valid capability name",
                    cap
                )));
            }
        }

        Ok(())
    }

    /// Build the `create` argument list for the CLI (without the binary).
    pub fn to_create_args(&self) -> Vec<String> {
        let mut args = vec!["create".to_string()];

        if self.interactive {
            args.push("-i".to_string());
            args.push("-t".to_string());
        }

        if let Some(ref name) = self.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }

        if let Some(ref network) = self.network_mode {
            args.push("--network".to_string());
            args.push(network.clone());
        }

        for mount in &self.volumes {
            args.push("-v".to_string());
            let mode = if mount.read_only { "ro" } else { "rw" };
            args.push(format!("{}:{}:{}", mount.source, mount.target, mode));
        }

        if let Some(ref workdir) = self.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }

        if let Some(limits) = self.limits {
            args.push("--cpu-period".to_string());
            args.push(CPU_PERIOD_MICROS.to_string());
            args.push("--cpu-quota".to_string());
            args.push(limits.cpu_quota().to_string());
            args.push("--memory".to_string());
            args.push(format!("{}m", limits.memory_mb));
            args.push("--memory-swap".to_string());
            args.push(format!("{}m", limits.memory_mb));
            args.push("--pids-limit".to_string());
            args.push(limits.pids_limit.to_string());
        }

        for cap in &self.cap_drop {
            args.push("--cap-drop".to_string());
            args.push(cap.clone());
        }
        for cap in &self.cap_add {
            args.push("--cap-add".to_string());
            args.push(cap.clone());
        }
        for opt in &self.security_opts {
            args.push("--security-opt".to_string());
            args.push(opt.clone());
        }

        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(self.image.clone());
        args
    }
}

/// Container state as reported by `ps`/`inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Removing => "removing",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One row of `ps --format json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    #[serde(alias = "ID", alias = "Id")]
    pub id: String,

    #[serde(default, alias = "Names", deserialize_with = "deserialize_names")]
    pub names: Vec<String>,

    #[serde(default, alias = "Image")]
    pub image: String,

    #[serde(default, alias = "State")]
    pub state: ContainerState,

    #[serde(default, alias = "Labels", deserialize_with = "deserialize_labels")]
    pub labels: BTreeMap<String, String>,

    #[serde(
        default,
        alias = "CreatedAt",
        alias = "Created",
        deserialize_with = "deserialize_string_or_int"
    )]
    pub created: String,
}

/// Parse `ps --format json` output.
///
/// Podman prints a JSON array, docker prints one object per line.
pub fn parse_container_list(stdout: &str) -> ContainerResult<Vec<Container>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map_err(|e| ContainerError::ParseError(e.to_string()));
    }

    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| ContainerError::ParseError(e.to_string()))
        })
        .collect()
}

/// Subset of `inspect` output the sandbox layer needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInspect {
    #[serde(alias = "Id")]
    pub id: String,
    #[serde(default, alias = "Created")]
    pub created: String,
    #[serde(alias = "State")]
    pub state: InspectState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectState {
    #[serde(default, alias = "Status")]
    pub status: ContainerState,
    #[serde(default, alias = "Running")]
    pub running: bool,
    #[serde(default, alias = "StartedAt")]
    pub started_at: String,
}

/// Output of a command run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || ".-_/:@".contains(c);
    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container or network name.
///
/// Names must start with an alphanumeric character and contain only
/// alphanumerics, `-`, `_` and `.`.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    let Some(first) = name.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    };

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }

    if !first.is_ascii_alphanumeric() {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.';
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{}' contains invalid characters; only alphanumeric, '-', '_', '.' are allowed",
            name
        )));
    }

    Ok(())
}

/// Validate a container ID or name passed to lifecycle commands.
pub fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }
    validate_container_name(id)
}

/// Named volumes share the container naming rules.
pub fn validate_volume_name(name: &str) -> ContainerResult<()> {
    validate_container_name(name).map_err(|_| {
        ContainerError::InvalidInput(format!("volume name '{}' is not valid", name))
    })
}

/// Validate an environment variable key (POSIX rules).
fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    let Some(first) = key.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    };

    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }

    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters",
            key
        )));
    }

    Ok(())
}

fn validate_label_key(key: &str) -> ContainerResult<()> {
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
    {
        return Err(ContainerError::InvalidInput(format!(
            "label key '{}' is not valid",
            key
        )));
    }
    Ok(())
}

/// Validate an absolute path inside the container.
fn validate_container_path(path: &str) -> ContainerResult<()> {
    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(format!(
            "container path '{}' must be absolute",
            path
        )));
    }

    if path.contains("..") || path.contains('\0') || path.contains(':') {
        return Err(ContainerError::InvalidInput(format!(
            "container path '{}' contains forbidden sequences",
            path
        )));
    }

    Ok(())
}
