//! Application configuration.
//!
//! Layered with the `config` crate: built-in defaults, then the TOML file in
//! the XDG config directory, then `SANDCASTLE__SECTION__KEY` environment
//! variables.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::cleanup::CleanupConfig;
use crate::container::{ContainerRuntime, RuntimeType};
use crate::environment::EnvironmentServiceConfig;
use crate::sandbox::SandboxConfig;

pub const APP_NAME: &str = "sandcastle";

const DATABASE_FILE: &str = "sandcastle.db";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
    pub container: ContainerRuntimeConfig,
    pub sandbox: SandboxConfig,
    pub environments: EnvironmentServiceConfig,
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Directory overrides. Unset entries fall back to the XDG locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: Option<String>,
    pub state_dir: Option<String>,
    /// SQLite file. Defaults to `<data_dir>/sandcastle.db`.
    pub database: Option<String>,
}

/// Which engine CLI to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeSelection {
    /// Docker if on PATH, else Podman.
    #[default]
    Auto,
    Docker,
    Podman,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerRuntimeConfig {
    pub runtime: RuntimeSelection,
    /// Custom path to the engine binary.
    pub binary: Option<String>,
}

impl ContainerRuntimeConfig {
    pub fn build_runtime(&self) -> ContainerRuntime {
        let runtime_type = match self.runtime {
            RuntimeSelection::Auto => None,
            RuntimeSelection::Docker => Some(RuntimeType::Docker),
            RuntimeSelection::Podman => Some(RuntimeType::Podman),
        };

        match (runtime_type, self.binary.as_deref()) {
            (Some(kind), Some(binary)) => ContainerRuntime::with_binary(kind, binary),
            (None, Some(binary)) => {
                ContainerRuntime::with_binary(ContainerRuntime::new().runtime_type(), binary)
            }
            (Some(kind), None) => ContainerRuntime::with_type(kind),
            (None, None) => ContainerRuntime::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
    pub state_dir: PathBuf,
    pub database_file: PathBuf,
}

impl AppPaths {
    pub fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        let data_dir = default_data_dir()?;
        let state_dir = default_state_dir()?;
        let database_file = data_dir.join(DATABASE_FILE);

        Ok(Self {
            config_file,
            data_dir,
            state_dir,
            database_file,
        })
    }

    pub fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
            self.database_file = self.data_dir.join(DATABASE_FILE);
        }
        if let Some(ref state_override) = cfg.paths.state_dir {
            self.state_dir = expand_str_path(state_override)?;
        }
        if let Some(ref database) = cfg.paths.database {
            self.database_file = expand_str_path(database)?;
        }
        Ok(self)
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}, state: {}, database: {}",
            self.config_file.display(),
            self.data_dir.display(),
            self.state_dir.display(),
            self.database_file.display()
        )
    }
}

/// Load the layered configuration. A missing file is not an error.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()
        .with_context(|| format!("loading configuration from {}", path.display()))?;

    let config: AppConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;

    if config.sandbox.cpu_cores <= 0.0 {
        return Err(anyhow!("sandbox.cpu_cores must be positive"));
    }
    if config.environments.max_log_limit < 1 {
        return Err(anyhow!("environments.max_log_limit must be at least 1"));
    }

    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    format!(
        "# Configuration for {APP_NAME}\n# File: {}\n# Environment overrides: {}__SECTION__KEY\n\n",
        path.display(),
        env_prefix()
    )
}

pub fn expand_path(path: PathBuf) -> Result<PathBuf> {
    match path.to_str() {
        Some(text) => expand_str_path(text),
        None => Ok(path),
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

/// `$XDG_*` first, then the platform directory, then `~/<fallback>`.
fn app_dir(
    xdg_var: &str,
    platform: fn() -> Option<PathBuf>,
    fallback: &[&str],
    what: &str,
) -> Result<PathBuf> {
    let base = env::var_os(xdg_var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(platform)
        .or_else(|| {
            dirs::home_dir().map(|home| fallback.iter().fold(home, |path, part| path.join(part)))
        })
        .ok_or_else(|| anyhow!("unable to determine {what} directory"))?;
    Ok(base.join(APP_NAME))
}

fn default_config_dir() -> Result<PathBuf> {
    app_dir("XDG_CONFIG_HOME", dirs::config_dir, &[".config"], "configuration")
}

fn default_data_dir() -> Result<PathBuf> {
    app_dir("XDG_DATA_HOME", dirs::data_dir, &[".local", "share"], "data")
}

fn default_state_dir() -> Result<PathBuf> {
    app_dir("XDG_STATE_HOME", dirs::state_dir, &[".local", "state"], "state")
}

/// Prefix for environment overrides, e.g. `SANDCASTLE__SANDBOX__MEMORY_MB`.
pub fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase().replace('-', "_")
}
