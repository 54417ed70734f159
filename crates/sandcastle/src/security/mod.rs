//! Input validation for untrusted commands, package names and paths.
//!
//! All validation is pure (no side effects) and fully testable. Path-like
//! validators return `Ok(())` or `Err(String)` with a human-readable message;
//! command validation returns a [`CommandVerdict`] because warnings are
//! allowed through.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::packages::PackageManagerKind;

/// The only in-container prefix file operations may touch.
pub const WORKSPACE_ROOT: &str = "/workspace";

/// Maximum accepted command length in characters.
pub const MAX_COMMAND_LENGTH: usize = 10_000;

/// Maximum accepted file payload in bytes (10 MiB).
pub const MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

/// npm's own limit, applied to every manager.
pub const MAX_PACKAGE_NAME_LENGTH: usize = 214;

/// Maximum environment name length.
pub const MAX_ENVIRONMENT_NAME_LENGTH: usize = 100;

/// Patterns that block a command outright. Order matters: the first match
/// is reported.
pub const DANGEROUS_PATTERNS: &[&str] = &[
    r"\b(sudo|su)\b",
    r"\brm\s+-rf\s+/",
    r"\bchmod\s+777",
    r"\bchown\s+root",
    r"\bkill\s+-9\s+1\b",
    r"\bkillall\s+",
    r"\b(nmap|netcat|nc)\b",
    r"\b(wget|curl).*\|\s*sh",
    r"\b(wget|curl).*\|\s*bash",
    r":\(\)\{.*:\|:",
    r"\bdd\s+if=/dev/zero",
    r"/etc/passwd",
    r"/etc/shadow",
    r"\bsetuid\b",
    r"/proc/self/exe",
    r"/var/run/docker.sock",
    r"\bmount\b",
    r"\bunshare\b",
];

/// Patterns that are allowed but flagged.
pub const WARNING_PATTERNS: &[&str] = &[r"\brm\s+-rf", r"\brm\s+-fr", r"\bformat\b", r"\bmkfs\b"];

/// Characters that would let a package name escape into the shell.
pub const PACKAGE_NAME_FORBIDDEN_CHARS: &[char] =
    &['&', '|', ';', '$', '`', '(', ')', '<', '>', '\n', '\r'];

/// Absolute prefixes that are never valid targets.
pub const SENSITIVE_PATH_PREFIXES: &[&str] =
    &["/etc", "/proc", "/sys", "/dev", "/root", "/var/run"];

/// File extensions rejected for uploads.
pub const BLOCKED_EXTENSIONS: &[&str] =
    &[".exe", ".dll", ".so", ".dylib", ".bat", ".cmd", ".com"];

const ELF_MAGIC: &[u8] = b"\x7fELF";
const PE_MAGIC: &[u8] = b"MZ";

static DANGEROUS_REGEXES: Lazy<Vec<(&'static str, Regex)>> =
    Lazy::new(|| compile_patterns(DANGEROUS_PATTERNS));

static WARNING_REGEXES: Lazy<Vec<(&'static str, Regex)>> =
    Lazy::new(|| compile_patterns(WARNING_PATTERNS));

static PACKAGE_NAME_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[@A-Za-z0-9._/-]+$").expect("Invalid regex pattern for package names")
});

static ENVIRONMENT_NAME_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9 _-]+$").expect("Invalid regex pattern for environment names")
});

fn compile_patterns(patterns: &[&'static str]) -> Vec<(&'static str, Regex)> {
    patterns
        .iter()
        .map(|pattern| {
            let re = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .expect("Invalid regex pattern in command table");
            (*pattern, re)
        })
        .collect()
}

/// Classification of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Safe,
    Warning,
    Blocked,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Safe => write!(f, "safe"),
            Severity::Warning => write!(f, "warning"),
            Severity::Blocked => write!(f, "blocked"),
        }
    }
}

/// Result of [`validate_command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandVerdict {
    pub severity: Severity,
    pub reason: String,
}

impl CommandVerdict {
    fn new(severity: Severity, reason: impl Into<String>) -> Self {
        Self {
            severity,
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.severity != Severity::Blocked
    }
}

/// Classify a shell command as safe, warning or blocked.
///
/// Matching is a case-insensitive regex search. The first dangerous match
/// short-circuits.
pub fn validate_command(command: &str) -> CommandVerdict {
    if command.chars().count() > MAX_COMMAND_LENGTH {
        return CommandVerdict::new(
            Severity::Blocked,
            format!("Command exceeds maximum length of {MAX_COMMAND_LENGTH} characters"),
        );
    }

    if command.contains('\0') {
        return CommandVerdict::new(Severity::Blocked, "Command contains null bytes");
    }

    if let Some((pattern, _)) = DANGEROUS_REGEXES.iter().find(|(_, re)| re.is_match(command)) {
        return CommandVerdict::new(
            Severity::Blocked,
            format!("Command contains dangerous pattern: {pattern}"),
        );
    }

    if let Some((pattern, _)) = WARNING_REGEXES.iter().find(|(_, re)| re.is_match(command)) {
        return CommandVerdict::new(
            Severity::Warning,
            format!("Command contains potentially risky operation: {pattern}"),
        );
    }

    CommandVerdict::new(Severity::Safe, "Command is safe to execute")
}

/// Validate a package name before it is interpolated into an install command.
///
/// Scoped npm names (`@scope/name`) are the only form allowed to contain `/`.
pub fn validate_package_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("Package name cannot be empty".into());
    }

    // Would be parsed as an option by the package manager.
    if name.starts_with('-') {
        return Err("Package name cannot start with '-'".into());
    }

    if name.chars().count() > MAX_PACKAGE_NAME_LENGTH {
        return Err(format!(
            "Package name too long (max {MAX_PACKAGE_NAME_LENGTH} characters)"
        ));
    }

    if let Some(c) = name.chars().find(|c| PACKAGE_NAME_FORBIDDEN_CHARS.contains(c)) {
        return Err(format!(
            "Package name contains invalid character: {}",
            c.escape_default()
        ));
    }

    if name.contains("..") || name.contains('\\') {
        return Err("Package name contains path traversal".into());
    }

    if name.contains('/') && !is_scoped_package(name) {
        return Err("Package name contains path traversal".into());
    }

    if !PACKAGE_NAME_FORMAT.is_match(name) {
        return Err("Package name has invalid format".into());
    }

    Ok(())
}

/// `@scope/name` with exactly one slash and both halves non-empty.
fn is_scoped_package(name: &str) -> bool {
    let Some(rest) = name.strip_prefix('@') else {
        return false;
    };
    match rest.split_once('/') {
        Some((scope, pkg)) => {
            !scope.is_empty() && !pkg.is_empty() && !pkg.contains('/') && !pkg.starts_with('@')
        }
        None => false,
    }
}

/// Validate an in-container path for file operations.
///
/// Rules:
/// - Must not be empty or contain null bytes
/// - Must not contain `..` anywhere
/// - Absolute paths must live under the workspace root
/// - Sensitive system prefixes are always rejected
pub fn validate_file_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("File path cannot be empty".into());
    }

    if path.contains('\0') {
        return Err("File path contains null bytes".into());
    }

    if path.contains("..") {
        return Err("Path traversal not allowed".into());
    }

    for prefix in SENSITIVE_PATH_PREFIXES {
        if has_path_prefix(path, prefix) {
            return Err(format!("Access to {prefix} is not allowed"));
        }
    }

    if path.starts_with('/') && !has_path_prefix(path, WORKSPACE_ROOT) {
        return Err(format!("Absolute paths must be within {WORKSPACE_ROOT}"));
    }

    Ok(())
}

/// Prefix match on a path component boundary (`/workspace2` is not under `/workspace`).
fn has_path_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Validate file content before it is written into a sandbox.
pub fn validate_file_content(content: &[u8], filename: &str) -> Result<(), String> {
    if content.len() > MAX_FILE_SIZE {
        return Err(format!(
            "File exceeds maximum size of {} MB",
            MAX_FILE_SIZE / (1024 * 1024)
        ));
    }

    if content.starts_with(ELF_MAGIC) || content.starts_with(PE_MAGIC) {
        return Err("Executable files are not allowed".into());
    }

    let lower = filename.to_lowercase();
    if let Some(ext) = BLOCKED_EXTENSIONS.iter().find(|ext| lower.ends_with(*ext)) {
        return Err(format!("File type {ext} is not allowed"));
    }

    Ok(())
}

/// Validate a human-facing environment name.
pub fn validate_environment_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Environment name cannot be empty".into());
    }

    if name.chars().count() > MAX_ENVIRONMENT_NAME_LENGTH {
        return Err(format!(
            "Environment name too long (max {MAX_ENVIRONMENT_NAME_LENGTH} characters)"
        ));
    }

    if !ENVIRONMENT_NAME_FORMAT.is_match(name) {
        return Err(
            "Environment name can only contain letters, numbers, spaces, hyphens, and underscores"
                .into(),
        );
    }

    Ok(())
}

/// Resolve a package manager name against the allow-list.
pub fn validate_package_manager(name: &str) -> Result<PackageManagerKind, String> {
    name.parse::<PackageManagerKind>().map_err(|_| {
        let allowed: Vec<&str> = PackageManagerKind::ALL.iter().map(|k| k.as_str()).collect();
        format!("Package manager not allowed. Allowed: {}", allowed.join(", "))
    })
}

/// Strip null bytes and surrounding whitespace.
pub fn sanitize_command(command: &str) -> String {
    command.replace('\0', "").trim().to_string()
}

/// Default per-environment resource ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourcePolicy {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub max_processes: u32,
    pub max_open_files: u32,
    pub network_enabled: bool,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            cpu_cores: 1.0,
            memory_mb: 512,
            disk_mb: 1024,
            max_processes: 50,
            max_open_files: 1024,
            network_enabled: false,
        }
    }
}
