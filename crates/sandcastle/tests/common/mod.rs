//! Shared helpers for integration tests.

use sandcastle::db::Database;
use sandcastle::environment::{
    Environment, EnvironmentRegistry, EnvironmentType, NewEnvironment, SqliteEnvironmentRegistry,
};

pub struct TestRegistry {
    pub db: Database,
    pub registry: SqliteEnvironmentRegistry,
}

pub async fn registry() -> TestRegistry {
    let db = Database::in_memory()
        .await
        .expect("in-memory database should open");
    let registry = SqliteEnvironmentRegistry::new(db.pool().clone());
    TestRegistry { db, registry }
}

pub async fn create_env(
    registry: &SqliteEnvironmentRegistry,
    user: &str,
    name: &str,
    environment_type: EnvironmentType,
) -> Environment {
    registry
        .create(&NewEnvironment {
            user_id: user.to_string(),
            name: name.to_string(),
            environment_type,
            cpu_limit: 1.0,
            memory_limit: 512,
            disk_limit: 1024,
        })
        .await
        .expect("create should succeed")
}

/// Move `last_accessed_at` into the past.
pub async fn backdate(db: &Database, id: i64, minutes: i64) {
    sqlx::query(
        "UPDATE environments SET last_accessed_at = datetime('now', ? || ' minutes') WHERE id = ?",
    )
    .bind(-minutes)
    .bind(id)
    .execute(db.pool())
    .await
    .expect("backdate should succeed");
}
