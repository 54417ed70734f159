//! Environment data models.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Maximum stored length of an audit log's output.
pub const LOG_OUTPUT_LIMIT: usize = 5000;

/// Base toolchain of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EnvironmentType {
    Nodejs,
    Python,
    Fullstack,
    Cpp,
}

impl EnvironmentType {
    pub const ALL: [EnvironmentType; 4] = [
        EnvironmentType::Nodejs,
        EnvironmentType::Python,
        EnvironmentType::Fullstack,
        EnvironmentType::Cpp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Nodejs => "nodejs",
            EnvironmentType::Python => "python",
            EnvironmentType::Fullstack => "fullstack",
            EnvironmentType::Cpp => "cpp",
        }
    }
}

impl std::fmt::Display for EnvironmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EnvironmentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nodejs" => Ok(EnvironmentType::Nodejs),
            "python" => Ok(EnvironmentType::Python),
            "fullstack" => Ok(EnvironmentType::Fullstack),
            "cpp" => Ok(EnvironmentType::Cpp),
            _ => Err(
                "Invalid environment type. Must be: nodejs, python, fullstack, or cpp".to_string(),
            ),
        }
    }
}

impl TryFrom<String> for EnvironmentType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Environment lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    /// Record exists, container not yet created.
    Creating,
    Running,
    Stopped,
    /// A lifecycle transition failed. Destroy is still allowed.
    Error,
    /// Container and volume reclaimed. Terminal.
    Destroyed,
}

impl std::fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvironmentStatus::Creating => write!(f, "creating"),
            EnvironmentStatus::Running => write!(f, "running"),
            EnvironmentStatus::Stopped => write!(f, "stopped"),
            EnvironmentStatus::Error => write!(f, "error"),
            EnvironmentStatus::Destroyed => write!(f, "destroyed"),
        }
    }
}

impl std::str::FromStr for EnvironmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "creating" => Ok(EnvironmentStatus::Creating),
            "running" => Ok(EnvironmentStatus::Running),
            "stopped" => Ok(EnvironmentStatus::Stopped),
            "error" => Ok(EnvironmentStatus::Error),
            "destroyed" => Ok(EnvironmentStatus::Destroyed),
            _ => Err(format!("unknown environment status: {}", s)),
        }
    }
}

impl TryFrom<String> for EnvironmentStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, <Self as TryFrom<String>>::Error> {
        value.parse()
    }
}

/// A user-owned sandboxed workspace.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Environment {
    pub id: i64,
    pub user_id: String,
    pub name: String,
    #[sqlx(try_from = "String")]
    #[serde(rename = "type")]
    pub environment_type: EnvironmentType,
    /// Set only once container creation has succeeded.
    pub container_id: Option<String>,
    pub volume_name: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: EnvironmentStatus,
    /// CPU cores.
    pub cpu_limit: f64,
    /// Memory in MiB.
    pub memory_limit: i64,
    /// Disk in MiB.
    pub disk_limit: i64,
    pub created_at: String,
    pub last_accessed_at: String,
    pub destroyed_at: Option<String>,
}

impl Environment {
    pub fn is_destroyed(&self) -> bool {
        self.status == EnvironmentStatus::Destroyed
    }

    /// Container ID, or a state error if creation never succeeded.
    pub fn require_container(&self) -> Result<&str, String> {
        self.container_id
            .as_deref()
            .ok_or_else(|| "Environment has no container".to_string())
    }

    /// Last access strictly before `cutoff`. An unparseable timestamp counts as recent.
    pub fn accessed_before(&self, cutoff: DateTime<Utc>) -> bool {
        parse_db_timestamp(&self.last_accessed_at).is_some_and(|at| at < cutoff)
    }
}

/// Fields supplied when inserting a new environment record.
#[derive(Debug, Clone)]
pub struct NewEnvironment {
    pub user_id: String,
    pub name: String,
    pub environment_type: EnvironmentType,
    pub cpu_limit: f64,
    pub memory_limit: i64,
    pub disk_limit: i64,
}

/// Kind of audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Create,
    Start,
    Stop,
    Destroy,
    Command,
    Install,
    Uninstall,
    FileWrite,
    FileAppend,
    FileDelete,
    FileMove,
    FileCopy,
    Mkdir,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Create => "create",
            ActionType::Start => "start",
            ActionType::Stop => "stop",
            ActionType::Destroy => "destroy",
            ActionType::Command => "command",
            ActionType::Install => "install",
            ActionType::Uninstall => "uninstall",
            ActionType::FileWrite => "file_write",
            ActionType::FileAppend => "file_append",
            ActionType::FileDelete => "file_delete",
            ActionType::FileMove => "file_move",
            ActionType::FileCopy => "file_copy",
            ActionType::Mkdir => "mkdir",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded for an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Error,
    Blocked,
}

impl std::fmt::Display for LogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogStatus::Success => write!(f, "success"),
            LogStatus::Error => write!(f, "error"),
            LogStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Append-only audit entry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EnvironmentLog {
    pub id: i64,
    pub environment_id: i64,
    pub action_type: String,
    pub command: Option<String>,
    pub status: String,
    pub output: Option<String>,
    /// Seconds.
    pub execution_time: Option<f64>,
    pub created_at: String,
}

/// Audit entry before insertion.
#[derive(Debug, Clone)]
pub struct NewEnvironmentLog {
    pub environment_id: i64,
    pub action_type: ActionType,
    pub command: Option<String>,
    pub status: LogStatus,
    pub output: Option<String>,
    pub execution_time: Option<f64>,
}

impl NewEnvironmentLog {
    pub fn new(environment_id: i64, action_type: ActionType, status: LogStatus) -> Self {
        Self {
            environment_id,
            action_type,
            command: None,
            status,
            output: None,
            execution_time: None,
        }
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Store output, truncated to [`LOG_OUTPUT_LIMIT`] characters. Empty output is dropped.
    pub fn output(mut self, output: &str) -> Self {
        if !output.is_empty() {
            self.output = Some(truncate_chars(output, LOG_OUTPUT_LIMIT));
        }
        self
    }

    pub fn execution_time(mut self, seconds: f64) -> Self {
        self.execution_time = Some(seconds);
        self
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Time-limited access grant to an environment.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EnvironmentSession {
    pub id: i64,
    pub environment_id: i64,
    pub session_token: String,
    pub is_active: bool,
    pub expires_at: String,
    pub created_at: String,
}

impl EnvironmentSession {
    /// Active and not yet expired.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        match parse_db_timestamp(&self.expires_at) {
            Some(expires) => now < expires,
            None => false,
        }
    }
}

/// Parse timestamps written either by SQLite `datetime('now')` or as RFC 3339.
pub fn parse_db_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Format a timestamp the way SQLite `datetime()` does, so string comparisons stay valid.
pub fn format_db_timestamp(value: DateTime<Utc>) -> String {
    value.format("%Y-%m-%d %H:%M:%S").to_string()
}
