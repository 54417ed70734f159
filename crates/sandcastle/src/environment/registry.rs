//! Environment persistence.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;

use super::models::{
    Environment, EnvironmentLog, EnvironmentSession, EnvironmentStatus, NewEnvironment,
    NewEnvironmentLog,
};

/// All environment columns for SELECT queries.
const ENVIRONMENT_COLUMNS: &str = r#"
    id, user_id, name, environment_type, container_id, volume_name, status,
    cpu_limit, memory_limit, disk_limit, created_at, last_accessed_at, destroyed_at
"#;

const LOG_COLUMNS: &str =
    "id, environment_id, action_type, command, status, output, execution_time, created_at";

const SESSION_COLUMNS: &str = "id, environment_id, session_token, is_active, expires_at, created_at";

/// Storage for environment records, their audit log and access sessions.
#[async_trait]
pub trait EnvironmentRegistry: Send + Sync {
    /// Insert a record in `creating` state.
    async fn create(&self, new: &NewEnvironment) -> Result<Environment>;
    async fn get(&self, id: i64) -> Result<Option<Environment>>;
    /// Fetch a record only if `user_id` owns it.
    async fn get_for_owner(&self, id: i64, user_id: &str) -> Result<Option<Environment>>;
    /// Non-destroyed records of a user, newest first.
    async fn list_for_owner(&self, user_id: &str) -> Result<Vec<Environment>>;
    async fn list_by_status(&self, status: EnvironmentStatus) -> Result<Vec<Environment>>;
    /// Running records not accessed for more than `idle_minutes`.
    async fn list_idle(&self, idle_minutes: i64) -> Result<Vec<Environment>>;
    /// Records in one of `statuses` not accessed for more than `days`.
    async fn list_inactive(
        &self,
        statuses: &[EnvironmentStatus],
        days: i64,
    ) -> Result<Vec<Environment>>;
    async fn find_by_container_id(&self, container_id: &str) -> Result<Option<Environment>>;
    /// Container IDs of every non-destroyed record.
    async fn list_container_ids(&self) -> Result<Vec<String>>;
    async fn set_container(&self, id: i64, container_id: &str, volume_name: &str) -> Result<()>;
    /// No-op once the record is `destroyed`.
    async fn update_status(&self, id: i64, status: EnvironmentStatus) -> Result<()>;
    /// Set `destroyed` and stamp `destroyed_at`.
    async fn mark_destroyed(&self, id: i64) -> Result<()>;
    async fn touch_access(&self, id: i64) -> Result<()>;
    async fn append_log(&self, log: &NewEnvironmentLog) -> Result<()>;
    /// Newest first.
    async fn list_logs(&self, environment_id: i64, limit: i64, offset: i64)
    -> Result<Vec<EnvironmentLog>>;
    async fn count_by_status(&self) -> Result<Vec<(EnvironmentStatus, i64)>>;
    async fn create_session(
        &self,
        environment_id: i64,
        token: &str,
        expires_at: &str,
    ) -> Result<EnvironmentSession>;
    async fn get_session(&self, token: &str) -> Result<Option<EnvironmentSession>>;
    /// Returns whether an active session was revoked.
    async fn deactivate_session(&self, token: &str) -> Result<bool>;
}

/// SQLite-backed registry.
#[derive(Debug, Clone)]
pub struct SqliteEnvironmentRegistry {
    pool: SqlitePool,
}

impl SqliteEnvironmentRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_required(&self, id: i64) -> Result<Environment> {
        self.get(id)
            .await?
            .with_context(|| format!("environment {} disappeared after insert", id))
    }
}

#[async_trait]
impl EnvironmentRegistry for SqliteEnvironmentRegistry {
    async fn create(&self, new: &NewEnvironment) -> Result<Environment> {
        let result = sqlx::query(
            r#"
            INSERT INTO environments (user_id, name, environment_type, status, cpu_limit, memory_limit, disk_limit)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.user_id)
        .bind(&new.name)
        .bind(new.environment_type.as_str())
        .bind(EnvironmentStatus::Creating.to_string())
        .bind(new.cpu_limit)
        .bind(new.memory_limit)
        .bind(new.disk_limit)
        .execute(&self.pool)
        .await
        .context("creating environment")?;

        self.fetch_required(result.last_insert_rowid()).await
    }

    async fn get(&self, id: i64) -> Result<Option<Environment>> {
        let query = format!("SELECT {} FROM environments WHERE id = ?", ENVIRONMENT_COLUMNS);
        let env = sqlx::query_as::<_, Environment>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching environment")?;
        Ok(env)
    }

    async fn get_for_owner(&self, id: i64, user_id: &str) -> Result<Option<Environment>> {
        let query = format!(
            "SELECT {} FROM environments WHERE id = ? AND user_id = ?",
            ENVIRONMENT_COLUMNS
        );
        let env = sqlx::query_as::<_, Environment>(&query)
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching environment for owner")?;
        Ok(env)
    }

    async fn list_for_owner(&self, user_id: &str) -> Result<Vec<Environment>> {
        let query = format!(
            "SELECT {} FROM environments WHERE user_id = ? AND status != 'destroyed' ORDER BY created_at DESC, id DESC",
            ENVIRONMENT_COLUMNS
        );
        let envs = sqlx::query_as::<_, Environment>(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .context("listing environments for user")?;
        Ok(envs)
    }

    async fn list_by_status(&self, status: EnvironmentStatus) -> Result<Vec<Environment>> {
        let query = format!(
            "SELECT {} FROM environments WHERE status = ? ORDER BY id",
            ENVIRONMENT_COLUMNS
        );
        let envs = sqlx::query_as::<_, Environment>(&query)
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await
            .context("listing environments by status")?;
        Ok(envs)
    }

    async fn list_idle(&self, idle_minutes: i64) -> Result<Vec<Environment>> {
        let query = format!(
            "SELECT {} FROM environments WHERE status = 'running' AND datetime(last_accessed_at) < datetime('now', ? || ' minutes') ORDER BY datetime(last_accessed_at) ASC",
            ENVIRONMENT_COLUMNS
        );
        let envs = sqlx::query_as::<_, Environment>(&query)
            .bind(-idle_minutes) // negative for "X minutes ago"
            .fetch_all(&self.pool)
            .await
            .context("listing idle environments")?;
        Ok(envs)
    }

    async fn list_inactive(
        &self,
        statuses: &[EnvironmentStatus],
        days: i64,
    ) -> Result<Vec<Environment>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let query = format!(
            "SELECT {} FROM environments WHERE status IN ({}) AND datetime(last_accessed_at) < datetime('now', ? || ' days') ORDER BY datetime(last_accessed_at) ASC",
            ENVIRONMENT_COLUMNS, placeholders
        );
        let mut q = sqlx::query_as::<_, Environment>(&query);
        for status in statuses {
            q = q.bind(status.to_string());
        }
        let envs = q
            .bind(-days)
            .fetch_all(&self.pool)
            .await
            .context("listing inactive environments")?;
        Ok(envs)
    }

    async fn find_by_container_id(&self, container_id: &str) -> Result<Option<Environment>> {
        let query = format!(
            "SELECT {} FROM environments WHERE container_id = ?",
            ENVIRONMENT_COLUMNS
        );
        let env = sqlx::query_as::<_, Environment>(&query)
            .bind(container_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching environment by container ID")?;
        Ok(env)
    }

    async fn list_container_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT container_id FROM environments WHERE container_id IS NOT NULL AND status != 'destroyed'",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing container IDs")?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn set_container(&self, id: i64, container_id: &str, volume_name: &str) -> Result<()> {
        sqlx::query("UPDATE environments SET container_id = ?, volume_name = ? WHERE id = ?")
            .bind(container_id)
            .bind(volume_name)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("recording environment container")?;
        Ok(())
    }

    async fn update_status(&self, id: i64, status: EnvironmentStatus) -> Result<()> {
        // `destroyed` is terminal.
        sqlx::query("UPDATE environments SET status = ? WHERE id = ? AND status != 'destroyed'")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating environment status")?;
        Ok(())
    }

    async fn mark_destroyed(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE environments SET status = 'destroyed', destroyed_at = datetime('now') WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking environment destroyed")?;
        Ok(())
    }

    async fn touch_access(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE environments SET last_accessed_at = datetime('now') WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("touching environment access time")?;
        Ok(())
    }

    async fn append_log(&self, log: &NewEnvironmentLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO environment_logs (environment_id, action_type, command, status, output, execution_time)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(log.environment_id)
        .bind(log.action_type.as_str())
        .bind(&log.command)
        .bind(log.status.to_string())
        .bind(&log.output)
        .bind(log.execution_time)
        .execute(&self.pool)
        .await
        .context("appending environment log")?;
        Ok(())
    }

    async fn list_logs(
        &self,
        environment_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<EnvironmentLog>> {
        let query = format!(
            "SELECT {} FROM environment_logs WHERE environment_id = ? ORDER BY id DESC LIMIT ? OFFSET ?",
            LOG_COLUMNS
        );
        let logs = sqlx::query_as::<_, EnvironmentLog>(&query)
            .bind(environment_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .context("listing environment logs")?;
        Ok(logs)
    }

    async fn count_by_status(&self) -> Result<Vec<(EnvironmentStatus, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM environments GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .context("counting environments by status")?;

        rows.into_iter()
            .map(|(status, count)| {
                let status = status
                    .parse::<EnvironmentStatus>()
                    .map_err(anyhow::Error::msg)?;
                Ok((status, count))
            })
            .collect()
    }

    async fn create_session(
        &self,
        environment_id: i64,
        token: &str,
        expires_at: &str,
    ) -> Result<EnvironmentSession> {
        sqlx::query(
            "INSERT INTO environment_sessions (environment_id, session_token, expires_at) VALUES (?, ?, ?)",
        )
        .bind(environment_id)
        .bind(token)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .context("creating environment session")?;

        self.get_session(token)
            .await?
            .context("environment session disappeared after insert")
    }

    async fn get_session(&self, token: &str) -> Result<Option<EnvironmentSession>> {
        let query = format!(
            "SELECT {} FROM environment_sessions WHERE session_token = ?",
            SESSION_COLUMNS
        );
        let session = sqlx::query_as::<_, EnvironmentSession>(&query)
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .context("fetching environment session")?;
        Ok(session)
    }

    async fn deactivate_session(&self, token: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE environment_sessions SET is_active = 0 WHERE session_token = ? AND is_active = 1",
        )
        .bind(token)
        .execute(&self.pool)
        .await
        .context("revoking environment session")?;
        Ok(result.rows_affected() > 0)
    }
}
