//! Environment service.
//!
//! Every public operation resolves the caller's record, validates input,
//! drives the sandbox, persists the resulting state and appends an audit
//! entry. Records owned by another user are reported as not found.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::instrument;
use uuid::Uuid;

use super::models::{
    ActionType, Environment, EnvironmentLog, EnvironmentSession, EnvironmentStatus,
    EnvironmentType, LogStatus, NewEnvironment, NewEnvironmentLog, format_db_timestamp,
};
use super::registry::EnvironmentRegistry;
use crate::error::{SandboxError, SandboxResult};
use crate::files::{FileEntry, FileInfo, FileManager, workspace_path};
use crate::packages::{PackageManager, PackageOutput};
use crate::sandbox::{ContainerStatus, CreateSandbox, SandboxManager};
use crate::security::{Severity, validate_command, validate_environment_name};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentServiceConfig {
    pub default_log_limit: i64,
    pub max_log_limit: i64,
    pub session_ttl_minutes: i64,
}

impl Default for EnvironmentServiceConfig {
    fn default() -> Self {
        Self {
            default_log_limit: 50,
            max_log_limit: 100,
            session_ttl_minutes: 60,
        }
    }
}

/// Result of a command run through [`EnvironmentService::execute_command`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    /// Seconds.
    pub execution_time: f64,
    /// `warning` when the command matched a risky-but-allowed pattern.
    pub severity: Severity,
}

/// A record together with the live container state, when there is one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentDetails {
    #[serde(flatten)]
    pub environment: Environment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerStatus>,
}

pub struct EnvironmentService {
    registry: Arc<dyn EnvironmentRegistry>,
    sandbox: Arc<SandboxManager>,
    packages: PackageManager,
    files: FileManager,
    locks: DashMap<i64, Arc<Mutex<()>>>,
    config: EnvironmentServiceConfig,
}

impl EnvironmentService {
    pub fn new(
        registry: Arc<dyn EnvironmentRegistry>,
        sandbox: Arc<SandboxManager>,
        config: EnvironmentServiceConfig,
    ) -> Self {
        Self {
            packages: PackageManager::new(sandbox.clone()),
            files: FileManager::new(sandbox.clone()),
            registry,
            sandbox,
            locks: DashMap::new(),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<dyn EnvironmentRegistry> {
        &self.registry
    }

    pub fn sandbox(&self) -> &Arc<SandboxManager> {
        &self.sandbox
    }

    /// Serialise lifecycle changes on one environment.
    pub(crate) async fn lock(&self, id: i64) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    fn forget_lock(&self, id: i64) {
        self.locks.remove(&id);
    }

    /// Append an audit entry. Failures are logged and swallowed.
    async fn record(&self, log: NewEnvironmentLog) {
        if let Err(e) = self.registry.append_log(&log).await {
            warn!(
                "Failed to record {} for environment {}: {:#}",
                log.action_type, log.environment_id, e
            );
        }
    }

    async fn set_status(&self, id: i64, status: EnvironmentStatus) {
        if let Err(e) = self.registry.update_status(id, status).await {
            warn!("Failed to set environment {} to {}: {:#}", id, status, e);
        }
    }

    /// Bump the access time and reflect an implicit start.
    async fn accessed(&self, env: &Environment) {
        if let Err(e) = self.registry.touch_access(env.id).await {
            warn!("Failed to touch environment {}: {:#}", env.id, e);
        }
        if env.status != EnvironmentStatus::Running {
            self.set_status(env.id, EnvironmentStatus::Running).await;
        }
    }

    async fn resolve(&self, owner: &str, id: i64) -> SandboxResult<Environment> {
        self.registry
            .get_for_owner(id, owner)
            .await?
            .ok_or(SandboxError::EnvironmentNotFound(id))
    }

    /// Resolve a record that still has a usable container.
    async fn resolve_active(&self, owner: &str, id: i64) -> SandboxResult<(Environment, String)> {
        let env = self.resolve(owner, id).await?;
        if env.is_destroyed() {
            return Err(SandboxError::State(
                "Environment has been destroyed".to_string(),
            ));
        }
        let container_id = env
            .require_container()
            .map_err(SandboxError::State)?
            .to_string();
        Ok((env, container_id))
    }

    async fn reload(&self, id: i64) -> SandboxResult<Environment> {
        self.registry
            .get(id)
            .await?
            .ok_or(SandboxError::EnvironmentNotFound(id))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    #[instrument(skip(self), fields(user_id = %owner))]
    pub async fn create_environment(
        &self,
        owner: &str,
        name: &str,
        env_type: &str,
    ) -> SandboxResult<Environment> {
        validate_environment_name(name).map_err(SandboxError::Validation)?;
        let environment_type: EnvironmentType =
            env_type.parse().map_err(SandboxError::Validation)?;

        let defaults = self.sandbox.config();
        let env = self
            .registry
            .create(&NewEnvironment {
                user_id: owner.to_string(),
                name: name.to_string(),
                environment_type,
                cpu_limit: defaults.cpu_cores,
                memory_limit: defaults.memory_mb as i64,
                disk_limit: defaults.disk_mb as i64,
            })
            .await?;

        let _guard = self.lock(env.id).await;
        let request = CreateSandbox {
            user_id: owner.to_string(),
            env_id: env.id,
            env_type: environment_type,
            name: name.to_string(),
            cpu_cores: Some(env.cpu_limit),
            memory_mb: Some(env.memory_limit as u64),
        };

        match self.sandbox.create(&request).await {
            Ok(provisioned) => {
                self.registry
                    .set_container(env.id, &provisioned.container_id, &provisioned.volume_name)
                    .await?;
                self.registry
                    .update_status(env.id, EnvironmentStatus::Stopped)
                    .await?;
                self.record(NewEnvironmentLog::new(env.id, ActionType::Create, LogStatus::Success))
                    .await;
                info!("Created environment {} ({}) for {}", env.id, environment_type, owner);
                self.reload(env.id).await
            }
            Err(e) => {
                self.set_status(env.id, EnvironmentStatus::Error).await;
                self.record(
                    NewEnvironmentLog::new(env.id, ActionType::Create, LogStatus::Error)
                        .output(&e.to_string()),
                )
                .await;
                Err(e)
            }
        }
    }

    pub async fn list_environments(&self, owner: &str) -> SandboxResult<Vec<Environment>> {
        Ok(self.registry.list_for_owner(owner).await?)
    }

    pub async fn get_environment(&self, owner: &str, id: i64) -> SandboxResult<EnvironmentDetails> {
        let environment = self.resolve(owner, id).await?;
        let container = match (&environment.container_id, environment.is_destroyed()) {
            (Some(container_id), false) => Some(self.sandbox.get_status(container_id).await),
            _ => None,
        };
        Ok(EnvironmentDetails {
            environment,
            container,
        })
    }

    #[instrument(skip(self), fields(user_id = %owner))]
    pub async fn start_environment(&self, owner: &str, id: i64) -> SandboxResult<Environment> {
        self.resolve_active(owner, id).await?;
        let (_guard, env) = self.lock_live(id).await?;
        let container_id = env.require_container().map_err(SandboxError::State)?;

        match self.sandbox.start(container_id).await {
            Ok(()) => {
                self.registry
                    .update_status(id, EnvironmentStatus::Running)
                    .await?;
                self.registry.touch_access(id).await?;
                self.record(NewEnvironmentLog::new(id, ActionType::Start, LogStatus::Success))
                    .await;
                self.reload(id).await
            }
            Err(e) => {
                self.fail_transition(id, ActionType::Start, &e).await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(user_id = %owner))]
    pub async fn stop_environment(&self, owner: &str, id: i64) -> SandboxResult<Environment> {
        self.resolve(owner, id).await?;
        self.stop_record(id).await?;
        self.reload(id).await
    }

    /// Take the environment's lock, then re-read the record under it.
    /// Destroyed records are rejected.
    async fn lock_live(&self, id: i64) -> SandboxResult<(OwnedMutexGuard<()>, Environment)> {
        let guard = self.lock(id).await;
        let env = self.reload(id).await?;
        if env.is_destroyed() {
            return Err(SandboxError::State(
                "Environment has been destroyed".to_string(),
            ));
        }
        Ok((guard, env))
    }

    /// Stop an environment's container and mark it `stopped`.
    pub(crate) async fn stop_record(&self, id: i64) -> SandboxResult<()> {
        let (_guard, env) = self.lock_live(id).await?;
        self.stop_locked(&env).await
    }

    /// Stop the environment only if it is still running and has not been
    /// accessed for `idle_minutes`. Returns whether it was stopped.
    pub(crate) async fn stop_if_idle(&self, id: i64, idle_minutes: i64) -> SandboxResult<bool> {
        let _guard = self.lock(id).await;
        let env = self.reload(id).await?;
        let cutoff = Utc::now() - chrono::Duration::minutes(idle_minutes);
        if env.status != EnvironmentStatus::Running || !env.accessed_before(cutoff) {
            debug!("Environment {} is no longer idle, skipping", id);
            return Ok(false);
        }
        self.stop_locked(&env).await?;
        Ok(true)
    }

    /// Caller holds the lock and `env` was read under it.
    async fn stop_locked(&self, env: &Environment) -> SandboxResult<()> {
        let container_id = env.require_container().map_err(SandboxError::State)?;
        match self.sandbox.stop(container_id, None).await {
            Ok(()) => {
                self.registry
                    .update_status(env.id, EnvironmentStatus::Stopped)
                    .await?;
                self.record(NewEnvironmentLog::new(env.id, ActionType::Stop, LogStatus::Success))
                    .await;
                Ok(())
            }
            Err(e) => {
                self.fail_transition(env.id, ActionType::Stop, &e).await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(user_id = %owner))]
    pub async fn destroy_environment(&self, owner: &str, id: i64) -> SandboxResult<()> {
        self.resolve(owner, id).await?;
        self.destroy_record(id).await
    }

    /// Remove container and volume, then mark the record `destroyed`.
    pub(crate) async fn destroy_record(&self, id: i64) -> SandboxResult<()> {
        let guard = self.lock(id).await;
        let env = self.reload(id).await?;
        if env.is_destroyed() {
            return Err(SandboxError::State(
                "Environment already destroyed".to_string(),
            ));
        }
        self.destroy_locked(&env, guard).await
    }

    /// Destroy the environment only if it is still in one of `statuses` and
    /// has not been accessed for `days`. Returns whether it was destroyed.
    pub(crate) async fn destroy_if_inactive(
        &self,
        id: i64,
        statuses: &[EnvironmentStatus],
        days: i64,
    ) -> SandboxResult<bool> {
        let guard = self.lock(id).await;
        let env = self.reload(id).await?;
        let cutoff = Utc::now() - chrono::Duration::days(days);
        if !statuses.contains(&env.status) || !env.accessed_before(cutoff) {
            debug!("Environment {} was used again, skipping", id);
            return Ok(false);
        }
        self.destroy_locked(&env, guard).await?;
        Ok(true)
    }

    async fn destroy_locked(
        &self,
        env: &Environment,
        guard: OwnedMutexGuard<()>,
    ) -> SandboxResult<()> {
        let result = self
            .sandbox
            .destroy(env.container_id.as_deref(), env.volume_name.as_deref())
            .await;
        match result {
            Ok(()) => {
                self.registry.mark_destroyed(env.id).await?;
                self.record(NewEnvironmentLog::new(env.id, ActionType::Destroy, LogStatus::Success))
                    .await;
                info!("Destroyed environment {}", env.id);
                drop(guard);
                self.forget_lock(env.id);
                Ok(())
            }
            Err(e) => {
                self.fail_transition(env.id, ActionType::Destroy, &e).await;
                Err(e)
            }
        }
    }

    async fn fail_transition(&self, id: i64, action: ActionType, err: &SandboxError) {
        warn!("Environment {} {} failed: {}", id, action, err);
        self.set_status(id, EnvironmentStatus::Error).await;
        self.record(NewEnvironmentLog::new(id, action, LogStatus::Error).output(&err.to_string()))
            .await;
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    #[instrument(skip(self, command), fields(user_id = %owner))]
    pub async fn execute_command(
        &self,
        owner: &str,
        id: i64,
        command: &str,
        timeout_secs: Option<u64>,
    ) -> SandboxResult<CommandOutcome> {
        let (env, container_id) = self.resolve_active(owner, id).await?;

        let verdict = validate_command(command);
        if !verdict.is_allowed() {
            warn!("Blocked command in environment {}: {}", id, verdict.reason);
            self.record(
                NewEnvironmentLog::new(id, ActionType::Command, LogStatus::Blocked)
                    .command(command)
                    .output(&verdict.reason),
            )
            .await;
            return Err(SandboxError::CommandBlocked {
                reason: verdict.reason,
            });
        }
        if verdict.severity == Severity::Warning {
            warn!("Risky command in environment {}: {}", id, verdict.reason);
        }

        let started = Instant::now();
        let result = self
            .sandbox
            .execute(&container_id, command, timeout_secs.map(Duration::from_secs))
            .await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(output) => {
                self.accessed(&env).await;
                let status = if output.success() {
                    LogStatus::Success
                } else {
                    LogStatus::Error
                };
                let combined = format!("{}{}", output.stdout, output.stderr);
                self.record(
                    NewEnvironmentLog::new(id, ActionType::Command, status)
                        .command(command)
                        .output(&combined)
                        .execution_time(elapsed),
                )
                .await;
                Ok(CommandOutcome {
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    execution_time: elapsed,
                    severity: verdict.severity,
                })
            }
            Err(e) => {
                self.record(
                    NewEnvironmentLog::new(id, ActionType::Command, LogStatus::Error)
                        .command(command)
                        .output(&e.to_string())
                        .execution_time(elapsed),
                )
                .await;
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Packages
    // ------------------------------------------------------------------

    async fn record_package_result(
        &self,
        env: &Environment,
        action: ActionType,
        summary: &str,
        result: &SandboxResult<PackageOutput>,
        elapsed: f64,
    ) {
        let log = match result {
            Ok(output) => {
                self.accessed(env).await;
                let status = if output.success {
                    LogStatus::Success
                } else {
                    LogStatus::Error
                };
                NewEnvironmentLog::new(env.id, action, status)
                    .output(&format!("{}{}", output.stdout, output.stderr))
            }
            Err(e) => NewEnvironmentLog::new(env.id, action, LogStatus::Error).output(&e.to_string()),
        };
        self.record(log.command(summary).execution_time(elapsed)).await;
    }

    #[instrument(skip(self), fields(user_id = %owner))]
    pub async fn install_packages(
        &self,
        owner: &str,
        id: i64,
        manager: &str,
        packages: &[String],
    ) -> SandboxResult<PackageOutput> {
        let (env, container_id) = self.resolve_active(owner, id).await?;
        let _guard = self.lock(id).await;

        let started = Instant::now();
        let result = self
            .packages
            .install_packages(&container_id, manager, packages)
            .await;
        let summary = format!("{} install {}", manager, packages.join(" "));
        self.record_package_result(
            &env,
            ActionType::Install,
            &summary,
            &result,
            started.elapsed().as_secs_f64(),
        )
        .await;
        result
    }

    pub async fn list_packages(
        &self,
        owner: &str,
        id: i64,
        manager: &str,
    ) -> SandboxResult<PackageOutput> {
        let (env, container_id) = self.resolve_active(owner, id).await?;
        let output = self.packages.list_packages(&container_id, manager).await?;
        self.accessed(&env).await;
        Ok(output)
    }

    #[instrument(skip(self), fields(user_id = %owner))]
    pub async fn uninstall_packages(
        &self,
        owner: &str,
        id: i64,
        manager: &str,
        packages: &[String],
    ) -> SandboxResult<PackageOutput> {
        let (env, container_id) = self.resolve_active(owner, id).await?;
        let _guard = self.lock(id).await;

        let started = Instant::now();
        let result = self
            .packages
            .uninstall_packages(&container_id, manager, packages)
            .await;
        let summary = format!("{} uninstall {}", manager, packages.join(" "));
        self.record_package_result(
            &env,
            ActionType::Uninstall,
            &summary,
            &result,
            started.elapsed().as_secs_f64(),
        )
        .await;
        result
    }

    pub async fn package_info(
        &self,
        owner: &str,
        id: i64,
        manager: &str,
        package: &str,
    ) -> SandboxResult<PackageOutput> {
        let (env, container_id) = self.resolve_active(owner, id).await?;
        let output = self
            .packages
            .get_package_info(&container_id, manager, package)
            .await?;
        self.accessed(&env).await;
        Ok(output)
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// Audit a mutating file operation and pass its result through.
    async fn record_file_result(
        &self,
        env: &Environment,
        action: ActionType,
        target: &str,
        result: SandboxResult<()>,
    ) -> SandboxResult<()> {
        match &result {
            Ok(()) => {
                self.accessed(env).await;
                self.record(NewEnvironmentLog::new(env.id, action, LogStatus::Success).command(target))
                    .await;
            }
            Err(e) => {
                self.record(
                    NewEnvironmentLog::new(env.id, action, LogStatus::Error)
                        .command(target)
                        .output(&e.to_string()),
                )
                .await;
            }
        }
        result
    }

    pub async fn list_files(
        &self,
        owner: &str,
        id: i64,
        path: Option<&str>,
    ) -> SandboxResult<Vec<FileEntry>> {
        let (env, container_id) = self.resolve_active(owner, id).await?;
        let path = workspace_path(path.unwrap_or_default());
        let entries = self.files.list_directory(&container_id, Some(&path)).await?;
        self.accessed(&env).await;
        Ok(entries)
    }

    pub async fn read_file(&self, owner: &str, id: i64, path: &str) -> SandboxResult<String> {
        let (env, container_id) = self.resolve_active(owner, id).await?;
        let content = self
            .files
            .read_file(&container_id, &workspace_path(path))
            .await?;
        self.accessed(&env).await;
        Ok(content)
    }

    #[instrument(skip(self, content), fields(user_id = %owner, bytes = content.len()))]
    pub async fn write_file(
        &self,
        owner: &str,
        id: i64,
        path: &str,
        content: &[u8],
        append: bool,
    ) -> SandboxResult<()> {
        let (env, container_id) = self.resolve_active(owner, id).await?;
        let path = workspace_path(path);
        let action = if append {
            ActionType::FileAppend
        } else {
            ActionType::FileWrite
        };
        let result = self
            .files
            .write_file(&container_id, &path, content, append)
            .await;
        self.record_file_result(&env, action, &path, result).await
    }

    pub async fn delete_file(
        &self,
        owner: &str,
        id: i64,
        path: &str,
        recursive: bool,
    ) -> SandboxResult<()> {
        let (env, container_id) = self.resolve_active(owner, id).await?;
        let path = workspace_path(path);
        let result = self.files.delete_file(&container_id, &path, recursive).await;
        self.record_file_result(&env, ActionType::FileDelete, &path, result)
            .await
    }

    pub async fn create_directory(&self, owner: &str, id: i64, path: &str) -> SandboxResult<()> {
        let (env, container_id) = self.resolve_active(owner, id).await?;
        let path = workspace_path(path);
        let result = self.files.create_directory(&container_id, &path).await;
        self.record_file_result(&env, ActionType::Mkdir, &path, result)
            .await
    }

    pub async fn move_file(
        &self,
        owner: &str,
        id: i64,
        source: &str,
        destination: &str,
    ) -> SandboxResult<()> {
        let (env, container_id) = self.resolve_active(owner, id).await?;
        let (source, destination) = (workspace_path(source), workspace_path(destination));
        let result = self
            .files
            .move_file(&container_id, &source, &destination)
            .await;
        let target = format!("{} -> {}", source, destination);
        self.record_file_result(&env, ActionType::FileMove, &target, result)
            .await
    }

    pub async fn copy_file(
        &self,
        owner: &str,
        id: i64,
        source: &str,
        destination: &str,
    ) -> SandboxResult<()> {
        let (env, container_id) = self.resolve_active(owner, id).await?;
        let (source, destination) = (workspace_path(source), workspace_path(destination));
        let result = self
            .files
            .copy_file(&container_id, &source, &destination)
            .await;
        let target = format!("{} -> {}", source, destination);
        self.record_file_result(&env, ActionType::FileCopy, &target, result)
            .await
    }

    pub async fn file_info(&self, owner: &str, id: i64, path: &str) -> SandboxResult<FileInfo> {
        let (env, container_id) = self.resolve_active(owner, id).await?;
        let info = self
            .files
            .get_file_info(&container_id, &workspace_path(path))
            .await?;
        self.accessed(&env).await;
        Ok(info)
    }

    // ------------------------------------------------------------------
    // Audit log and sessions
    // ------------------------------------------------------------------

    /// Audit entries, newest first. `limit` defaults to 50 and is capped at 100.
    pub async fn get_logs(
        &self,
        owner: &str,
        id: i64,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> SandboxResult<Vec<EnvironmentLog>> {
        let env = self.resolve(owner, id).await?;
        let limit = limit
            .unwrap_or(self.config.default_log_limit)
            .clamp(1, self.config.max_log_limit);
        let offset = offset.unwrap_or(0).max(0);
        Ok(self.registry.list_logs(env.id, limit, offset).await?)
    }

    /// Grant time-limited access to an owned environment.
    pub async fn open_session(
        &self,
        owner: &str,
        id: i64,
        ttl_minutes: Option<i64>,
    ) -> SandboxResult<EnvironmentSession> {
        let (env, _) = self.resolve_active(owner, id).await?;
        let ttl = ttl_minutes.unwrap_or(self.config.session_ttl_minutes);
        if ttl <= 0 {
            return Err(SandboxError::Validation(
                "Session lifetime must be positive".to_string(),
            ));
        }
        let token = Uuid::new_v4().to_string();
        let expires_at = format_db_timestamp(Utc::now() + chrono::Duration::minutes(ttl));
        Ok(self
            .registry
            .create_session(env.id, &token, &expires_at)
            .await?)
    }

    /// Look up an active, unexpired session.
    pub async fn validate_session(&self, token: &str) -> SandboxResult<EnvironmentSession> {
        match self.registry.get_session(token).await? {
            Some(session) if session.is_valid() => Ok(session),
            _ => Err(SandboxError::Validation(
                "Invalid or expired session".to_string(),
            )),
        }
    }

    /// Revoke a session on one of the caller's environments.
    pub async fn revoke_session(&self, owner: &str, token: &str) -> SandboxResult<bool> {
        let Some(session) = self.registry.get_session(token).await? else {
            return Ok(false);
        };
        self.resolve(owner, session.environment_id).await?;
        Ok(self.registry.deactivate_session(token).await?)
    }
}
