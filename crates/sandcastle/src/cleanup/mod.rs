//! Background reconciliation of environments against the engine.
//!
//! Three sweeps: stop idle running environments, destroy long-unused
//! stopped/errored ones, and remove labelled containers no record claims.
//! Each sweep logs and skips per-item failures and reports how many items
//! it handled.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::environment::{EnvironmentService, EnvironmentStatus};
use crate::error::SandboxResult;
use crate::sandbox::ManagedContainer;

/// Statuses the age sweep may destroy.
const OLD_STATUSES: &[EnvironmentStatus] = &[EnvironmentStatus::Stopped, EnvironmentStatus::Error];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Run sweeps periodically while serving.
    pub enabled: bool,
    pub interval_secs: u64,
    pub idle_minutes: i64,
    pub old_days: i64,
    /// Sweep orphans once at startup.
    pub orphans_on_start: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            idle_minutes: 30,
            old_days: 7,
            orphans_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupStats {
    /// Non-destroyed records.
    pub total: i64,
    pub running: i64,
    pub stopped: i64,
    pub error: i64,
    pub idle_candidates: usize,
    pub old_candidates: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub idle_stopped: usize,
    pub old_destroyed: usize,
    pub orphans_removed: usize,
}

pub struct EnvironmentCleanup {
    service: Arc<EnvironmentService>,
    config: CleanupConfig,
}

impl EnvironmentCleanup {
    pub fn new(service: Arc<EnvironmentService>, config: CleanupConfig) -> Self {
        Self { service, config }
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    /// Stop running environments not accessed for `idle_minutes` (default from config).
    pub async fn cleanup_idle(&self, idle_minutes: Option<i64>) -> SandboxResult<usize> {
        let idle_minutes = idle_minutes.unwrap_or(self.config.idle_minutes);
        let idle = self.service.registry().list_idle(idle_minutes).await?;

        let mut stopped = 0;
        for env in idle {
            // The snapshot may be stale; the service re-checks under the lock.
            match self.service.stop_if_idle(env.id, idle_minutes).await {
                Ok(true) => {
                    info!(
                        "Stopped idle environment {} (last access {})",
                        env.id, env.last_accessed_at
                    );
                    stopped += 1;
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to stop idle environment {}: {}", env.id, e),
            }
        }
        Ok(stopped)
    }

    /// Destroy stopped or errored environments not accessed for `days`.
    pub async fn cleanup_old(&self, days: Option<i64>) -> SandboxResult<usize> {
        let days = days.unwrap_or(self.config.old_days);
        let old = self
            .service
            .registry()
            .list_inactive(OLD_STATUSES, days)
            .await?;

        let mut destroyed = 0;
        for env in old {
            match self
                .service
                .destroy_if_inactive(env.id, OLD_STATUSES, days)
                .await
            {
                Ok(true) => {
                    info!("Destroyed old environment {}", env.id);
                    destroyed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to destroy old environment {}: {}", env.id, e),
            }
        }
        Ok(destroyed)
    }

    /// Remove labelled containers that no live record refers to.
    pub async fn cleanup_orphans(&self) -> SandboxResult<usize> {
        let containers = self.service.sandbox().list_managed_containers().await?;
        let known: HashSet<String> = self
            .service
            .registry()
            .list_container_ids()
            .await?
            .into_iter()
            .collect();

        let mut removed = 0;
        for container in containers {
            if known.contains(&container.container_id) {
                continue;
            }
            match self.remove_orphan(&container).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    "Failed to remove orphan container {}: {}",
                    container.container_id, e
                ),
            }
        }

        if removed > 0 {
            info!("Removed {} orphan container(s)", removed);
        }
        Ok(removed)
    }

    async fn remove_orphan(&self, container: &ManagedContainer) -> SandboxResult<bool> {
        // A create in flight holds the environment's lock until the
        // container ID is recorded, so re-check under that lock.
        let _guard = match container.env_id.as_deref().and_then(|v| v.parse::<i64>().ok()) {
            Some(env_id) => Some(self.service.lock(env_id).await),
            None => None,
        };
        if let Some(env) = self
            .service
            .registry()
            .find_by_container_id(&container.container_id)
            .await?
            && !env.is_destroyed()
        {
            debug!(
                "Container {} was claimed by environment {}",
                container.container_id, env.id
            );
            return Ok(false);
        }

        self.service
            .sandbox()
            .destroy(Some(&container.container_id), None)
            .await?;
        info!(
            "Removed orphan container {} ({})",
            container.container_id, container.name
        );
        Ok(true)
    }

    pub async fn stats(&self) -> SandboxResult<CleanupStats> {
        let registry = self.service.registry();
        let mut stats = CleanupStats::default();
        for (status, count) in registry.count_by_status().await? {
            match status {
                EnvironmentStatus::Running => stats.running = count,
                EnvironmentStatus::Stopped => stats.stopped = count,
                EnvironmentStatus::Error => stats.error = count,
                _ => {}
            }
            if status != EnvironmentStatus::Destroyed {
                stats.total += count;
            }
        }
        stats.idle_candidates = registry.list_idle(self.config.idle_minutes).await?.len();
        stats.old_candidates = registry
            .list_inactive(OLD_STATUSES, self.config.old_days)
            .await?
            .len();
        Ok(stats)
    }

    /// Run every sweep once. A failed sweep counts as zero.
    pub async fn run_once(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        match self.cleanup_idle(None).await {
            Ok(n) => report.idle_stopped = n,
            Err(e) => warn!("Idle environment sweep failed: {}", e),
        }
        match self.cleanup_old(None).await {
            Ok(n) => report.old_destroyed = n,
            Err(e) => warn!("Old environment sweep failed: {}", e),
        }
        match self.cleanup_orphans().await {
            Ok(n) => report.orphans_removed = n,
            Err(e) => warn!("Orphan container sweep failed: {}", e),
        }
        report
    }

    pub fn spawn_periodic(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        info!(
            "Starting environment cleanup task (every {}s, idle {}min, old {}d)",
            self.config.interval_secs, self.config.idle_minutes, self.config.old_days
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
            // The first tick fires immediately.
            interval.tick().await;

            loop {
                interval.tick().await;
                let report = self.run_once().await;
                debug!("Cleanup pass finished: {:?}", report);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::environment::{EnvironmentServiceConfig, SqliteEnvironmentRegistry};
    use crate::sandbox::{LABEL_ENV_ID, LABEL_USER_ID, SandboxConfig, SandboxManager};
    use crate::testing::FakeRuntime;

    struct Harness {
        db: Database,
        fake: Arc<FakeRuntime>,
        service: Arc<EnvironmentService>,
        cleanup: EnvironmentCleanup,
    }

    async fn harness() -> Harness {
        let db = Database::in_memory().await.unwrap();
        let registry = Arc::new(SqliteEnvironmentRegistry::new(db.pool().clone()));
        let fake = Arc::new(FakeRuntime::new());
        let sandbox = Arc::new(SandboxManager::new(
            fake.clone(),
            SandboxConfig {
                start_settle_ms: 0,
                stats_sample_ms: 0,
                ..Default::default()
            },
        ));
        let service = Arc::new(EnvironmentService::new(
            registry,
            sandbox,
            EnvironmentServiceConfig::default(),
        ));
        let cleanup = EnvironmentCleanup::new(service.clone(), CleanupConfig::default());
        Harness {
            db,
            fake,
            service,
            cleanup,
        }
    }

    async fn backdate(db: &Database, id: i64, minutes: i64) {
        sqlx::query(
            "UPDATE environments SET last_accessed_at = datetime('now', ? || ' minutes') WHERE id = ?",
        )
        .bind(-minutes)
        .bind(id)
        .execute(db.pool())
        .await
        .unwrap();
    }

    async fn running_env(h: &Harness, name: &str) -> i64 {
        let env = h.service.create_environment("u1", name, "nodejs").await.unwrap();
        h.service.start_environment("u1", env.id).await.unwrap();
        env.id
    }

    async fn status(h: &Harness, id: i64) -> EnvironmentStatus {
        h.service
            .registry()
            .get(id)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn test_idle_threshold() {
        let h = harness().await;
        let stale = running_env(&h, "stale").await;
        let fresh = running_env(&h, "fresh").await;
        backdate(&h.db, stale, 31).await;
        backdate(&h.db, fresh, 29).await;

        assert_eq!(h.cleanup.cleanup_idle(Some(30)).await.unwrap(), 1);
        assert_eq!(status(&h, stale).await, EnvironmentStatus::Stopped);
        assert_eq!(status(&h, fresh).await, EnvironmentStatus::Running);
    }

    #[tokio::test]
    async fn test_idle_sweep_skips_failures() {
        let h = harness().await;
        let a = running_env(&h, "a").await;
        backdate(&h.db, a, 60).await;
        h.fake.fail("stop_container");

        assert_eq!(h.cleanup.cleanup_idle(None).await.unwrap(), 0);
        assert_eq!(status(&h, a).await, EnvironmentStatus::Error);
    }

    #[tokio::test]
    async fn test_old_environments_destroyed() {
        let h = harness().await;
        let old = h.service.create_environment("u1", "old", "python").await.unwrap();
        let recent = h.service.create_environment("u1", "recent", "python").await.unwrap();
        backdate(&h.db, old.id, 8 * 24 * 60).await;

        assert_eq!(h.cleanup.cleanup_old(Some(7)).await.unwrap(), 1);
        assert_eq!(status(&h, old.id).await, EnvironmentStatus::Destroyed);
        assert_eq!(status(&h, recent.id).await, EnvironmentStatus::Stopped);
        assert!(!h.fake.has_container(old.container_id.as_deref().unwrap()));
    }

    #[tokio::test]
    async fn test_old_sweep_spares_environment_started_after_listing() {
        let h = harness().await;
        let env = h.service.create_environment("u1", "revived", "python").await.unwrap();
        backdate(&h.db, env.id, 8 * 24 * 60).await;

        let listed = h
            .service
            .registry()
            .list_inactive(OLD_STATUSES, 7)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        // The user comes back between the listing and the destroy.
        h.service.start_environment("u1", env.id).await.unwrap();

        let destroyed = h
            .service
            .destroy_if_inactive(listed[0].id, OLD_STATUSES, 7)
            .await
            .unwrap();
        assert!(!destroyed);
        assert_eq!(status(&h, env.id).await, EnvironmentStatus::Running);
        assert!(h.fake.has_container(env.container_id.as_deref().unwrap()));
    }

    #[tokio::test]
    async fn test_idle_sweep_cannot_resurrect_destroyed_environment() {
        let h = harness().await;
        let id = running_env(&h, "gone").await;
        backdate(&h.db, id, 60).await;

        let listed = h.service.registry().list_idle(30).await.unwrap();
        assert_eq!(listed.len(), 1);

        h.service.destroy_environment("u1", id).await.unwrap();

        assert!(!h.service.stop_if_idle(listed[0].id, 30).await.unwrap());
        assert!(h.service.stop_record(listed[0].id).await.is_err());
        assert_eq!(h.cleanup.cleanup_idle(Some(30)).await.unwrap(), 0);
        assert_eq!(status(&h, id).await, EnvironmentStatus::Destroyed);
    }

    #[tokio::test]
    async fn test_stop_waits_for_environment_lock() {
        let h = harness().await;
        let id = running_env(&h, "locked").await;

        let guard = h.service.lock(id).await;
        let service = h.service.clone();
        let handle = tokio::spawn(async move { service.stop_environment("u1", id).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        assert_eq!(status(&h, id).await, EnvironmentStatus::Running);

        drop(guard);
        let env = handle.await.unwrap().unwrap();
        assert_eq!(env.status, EnvironmentStatus::Stopped);
    }

    #[tokio::test]
    async fn test_orphans_removed() {
        let h = harness().await;
        let env = h.service.create_environment("u1", "kept", "nodejs").await.unwrap();
        h.fake
            .insert_container("orphan1", &[(LABEL_USER_ID, "u9"), (LABEL_ENV_ID, "999")], true);
        h.fake.insert_container("unrelated", &[("other.label", "x")], true);

        assert_eq!(h.cleanup.cleanup_orphans().await.unwrap(), 1);
        assert!(!h.fake.has_container("orphan1"));
        assert!(h.fake.has_container("unrelated"));
        assert!(h.fake.has_container(env.container_id.as_deref().unwrap()));
    }

    #[tokio::test]
    async fn test_stats_and_run_once() {
        let h = harness().await;
        let idle = running_env(&h, "idle").await;
        h.service.create_environment("u1", "stopped", "cpp").await.unwrap();
        backdate(&h.db, idle, 45).await;

        let stats = h.cleanup.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.stopped, 1);
        assert_eq!(stats.idle_candidates, 1);
        assert_eq!(stats.old_candidates, 0);

        let report = h.cleanup.run_once().await;
        assert_eq!(report.idle_stopped, 1);
        assert_eq!(report.old_destroyed, 0);
        assert_eq!(report.orphans_removed, 0);
    }
}
