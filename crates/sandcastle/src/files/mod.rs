//! File operations inside an environment's workspace.
//!
//! Every operation is a single shell round-trip through
//! [`SandboxManager::execute`]. Paths are validated first and single-quoted
//! in the generated command.

use std::sync::Arc;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::container::ExecOutput;
use crate::error::{SandboxError, SandboxResult};
use crate::sandbox::SandboxManager;
use crate::security::{WORKSPACE_ROOT, validate_file_content, validate_file_path};

const SENTINEL: &str = "ERROR:";
const SHORT_TIMEOUT: Duration = Duration::from_secs(10);
const LONG_TIMEOUT: Duration = Duration::from_secs(30);
/// Raw bytes per write command. A multiple of 3, so each chunk encodes
/// without padding to 64 KiB of base64.
const WRITE_CHUNK_BYTES: usize = 48 * 1024;

/// One `ls -l` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    /// `directory` or `file`.
    #[serde(rename = "type")]
    pub entry_type: String,
    /// Human-readable size as printed by `ls -h`.
    pub size: String,
    pub permissions: String,
    pub owner: String,
    pub group: String,
    pub modified: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub size: u64,
    /// As reported by `stat %F`, e.g. `regular file`, `directory`.
    pub file_type: String,
    /// Unix seconds.
    pub modified_timestamp: i64,
    pub permissions: String,
}

/// Where the sentinel must appear for the output to count as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SentinelMatch {
    Anywhere,
    Leading,
}

/// Quote a value for POSIX `sh`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Resolve a user-supplied path against `/workspace`.
pub fn workspace_path(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() || path == "." {
        WORKSPACE_ROOT.to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", WORKSPACE_ROOT, path.trim_start_matches("./"))
    }
}

fn check_path(path: &str) -> SandboxResult<()> {
    validate_file_path(path).map_err(SandboxError::Validation)
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

fn basename(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

/// Split off at most `n` whitespace-separated fields; the last keeps its spaces.
fn split_fields(line: &str, n: usize) -> Vec<&str> {
    let mut fields = Vec::with_capacity(n);
    let mut rest = line.trim_start();
    while fields.len() + 1 < n {
        match rest.find(char::is_whitespace) {
            Some(end) => {
                fields.push(&rest[..end]);
                rest = rest[end..].trim_start();
            }
            None => break,
        }
    }
    if !rest.is_empty() {
        fields.push(rest);
    }
    fields
}

/// Parse `ls -lAh` output. `total` and malformed lines are skipped.
pub fn parse_listing(dir: &str, stdout: &str) -> Vec<FileEntry> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with("total"))
        .filter_map(|line| {
            let fields = split_fields(line, 9);
            if fields.len() < 9 {
                return None;
            }
            let permissions = fields[0];
            // Symlinks print as `name -> target`.
            let name = fields[8].split(" -> ").next().unwrap_or(fields[8]);
            Some(FileEntry {
                name: name.to_string(),
                path: join_path(dir, name),
                entry_type: if permissions.starts_with('d') {
                    "directory".to_string()
                } else {
                    "file".to_string()
                },
                size: fields[4].to_string(),
                permissions: permissions.to_string(),
                owner: fields[2].to_string(),
                group: fields[3].to_string(),
                modified: format!("{} {} {}", fields[5], fields[6], fields[7]),
            })
        })
        .collect()
}

/// Parse `stat -c "%n|%s|%F|%Y|%A"` output.
pub fn parse_stat(stdout: &str) -> Option<FileInfo> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let parts: Vec<&str> = line.trim().split('|').collect();
    if parts.len() != 5 {
        return None;
    }
    Some(FileInfo {
        name: basename(parts[0]).to_string(),
        path: parts[0].to_string(),
        size: parts[1].parse().ok()?,
        file_type: parts[2].to_string(),
        modified_timestamp: parts[3].parse().ok()?,
        permissions: parts[4].to_string(),
    })
}

fn failure_message(output: &ExecOutput, fallback: &str) -> String {
    let stdout = output.stdout.trim();
    let stderr = output.stderr.trim();
    if !stdout.is_empty() {
        stdout.to_string()
    } else if !stderr.is_empty() {
        stderr.to_string()
    } else {
        fallback.to_string()
    }
}

pub struct FileManager {
    sandbox: Arc<SandboxManager>,
}

impl FileManager {
    pub fn new(sandbox: Arc<SandboxManager>) -> Self {
        Self { sandbox }
    }

    /// Run `command || echo "ERROR: <message>"` and turn a sentinel hit into a failure.
    async fn run_sentinel(
        &self,
        container_id: &str,
        command: &str,
        message: &str,
        timeout: Duration,
        matcher: SentinelMatch,
    ) -> SandboxResult<String> {
        let full = format!("{} || echo \"{} {}\"", command, SENTINEL, message);
        let output = self
            .sandbox
            .execute(container_id, &full, Some(timeout))
            .await?;

        let hit = match matcher {
            SentinelMatch::Anywhere => output.stdout.contains(SENTINEL),
            SentinelMatch::Leading => output.stdout.starts_with(SENTINEL),
        };
        if hit {
            let reason = output.stdout.replace(&format!("{} ", SENTINEL), "");
            return Err(SandboxError::OperationFailed(reason.trim().to_string()));
        }
        Ok(output.stdout)
    }

    /// Run a command that reports failure only through its exit status.
    async fn run_checked(
        &self,
        container_id: &str,
        command: &str,
        timeout: Duration,
        fallback: &str,
    ) -> SandboxResult<()> {
        let output = self
            .sandbox
            .execute(container_id, command, Some(timeout))
            .await?;
        if !output.success() {
            return Err(SandboxError::OperationFailed(failure_message(&output, fallback)));
        }
        Ok(())
    }

    pub async fn list_directory(
        &self,
        container_id: &str,
        path: Option<&str>,
    ) -> SandboxResult<Vec<FileEntry>> {
        let path = path.unwrap_or(WORKSPACE_ROOT);
        check_path(path)?;

        // -A and -h are understood by BusyBox ls on Alpine images too.
        let command = format!("ls -lAh {} 2>&1", shell_quote(path));
        let stdout = self
            .run_sentinel(
                container_id,
                &command,
                "Directory not found or inaccessible",
                SHORT_TIMEOUT,
                SentinelMatch::Anywhere,
            )
            .await?;
        Ok(parse_listing(path, &stdout))
    }

    pub async fn read_file(&self, container_id: &str, path: &str) -> SandboxResult<String> {
        check_path(path)?;
        let command = format!("cat {} 2>/dev/null", shell_quote(path));
        self.run_sentinel(
            container_id,
            &command,
            "File not found or inaccessible",
            LONG_TIMEOUT,
            SentinelMatch::Leading,
        )
        .await
    }

    /// Content travels base64-encoded so quotes, newlines and non-ASCII survive the shell.
    /// Large contents are written in several appends so no single command line
    /// exceeds the kernel's per-argument limit.
    pub async fn write_file(
        &self,
        container_id: &str,
        path: &str,
        content: &[u8],
        append: bool,
    ) -> SandboxResult<()> {
        check_path(path)?;
        validate_file_content(content, path).map_err(SandboxError::Validation)?;

        debug!("Writing {} bytes to {}", content.len(), path);
        let quoted = shell_quote(path);
        let mut chunks: Vec<&[u8]> = content.chunks(WRITE_CHUNK_BYTES).collect();
        if chunks.is_empty() {
            // Still create or truncate the file.
            chunks.push(&[]);
        }
        for (index, chunk) in chunks.into_iter().enumerate() {
            let operator = if append || index > 0 { ">>" } else { ">" };
            let command = format!(
                "echo '{}' | base64 -d {} {} 2>&1",
                STANDARD.encode(chunk),
                operator,
                quoted
            );
            self.run_checked(container_id, &command, LONG_TIMEOUT, "Failed to write file")
                .await?;
        }
        Ok(())
    }

    pub async fn delete_file(
        &self,
        container_id: &str,
        path: &str,
        recursive: bool,
    ) -> SandboxResult<()> {
        check_path(path)?;
        let normalized = path.trim_end_matches('/');
        if normalized == WORKSPACE_ROOT || normalized == format!("{}/.", WORKSPACE_ROOT) {
            return Err(SandboxError::Validation(
                "Cannot delete workspace root directory".to_string(),
            ));
        }

        let flags = if recursive { "-rf" } else { "-f" };
        let command = format!("rm {} {} 2>&1", flags, shell_quote(path));
        self.run_checked(container_id, &command, SHORT_TIMEOUT, "Failed to delete file")
            .await
    }

    pub async fn create_directory(&self, container_id: &str, path: &str) -> SandboxResult<()> {
        check_path(path)?;
        let command = format!("mkdir -p {} 2>&1", shell_quote(path));
        self.run_checked(
            container_id,
            &command,
            SHORT_TIMEOUT,
            "Failed to create directory",
        )
        .await
    }

    fn check_pair(source: &str, destination: &str) -> SandboxResult<()> {
        validate_file_path(source)
            .map_err(|e| SandboxError::Validation(format!("Invalid source path: {}", e)))?;
        validate_file_path(destination)
            .map_err(|e| SandboxError::Validation(format!("Invalid destination path: {}", e)))?;
        Ok(())
    }

    pub async fn move_file(
        &self,
        container_id: &str,
        source: &str,
        destination: &str,
    ) -> SandboxResult<()> {
        Self::check_pair(source, destination)?;
        let command = format!(
            "mv {} {} 2>&1",
            shell_quote(source),
            shell_quote(destination)
        );
        self.run_checked(container_id, &command, SHORT_TIMEOUT, "Failed to move file")
            .await
    }

    pub async fn copy_file(
        &self,
        container_id: &str,
        source: &str,
        destination: &str,
    ) -> SandboxResult<()> {
        Self::check_pair(source, destination)?;
        let command = format!(
            "cp -r {} {} 2>&1",
            shell_quote(source),
            shell_quote(destination)
        );
        self.run_checked(container_id, &command, LONG_TIMEOUT, "Failed to copy file")
            .await
    }

    pub async fn get_file_info(&self, container_id: &str, path: &str) -> SandboxResult<FileInfo> {
        check_path(path)?;
        let command = format!("stat -c \"%n|%s|%F|%Y|%A\" {} 2>&1", shell_quote(path));
        let stdout = self
            .run_sentinel(
                container_id,
                &command,
                "File not found",
                SHORT_TIMEOUT,
                SentinelMatch::Anywhere,
            )
            .await
            .map_err(|e| match e {
                SandboxError::OperationFailed(_) => {
                    SandboxError::OperationFailed("File not found".to_string())
                }
                other => other,
            })?;

        parse_stat(&stdout).ok_or_else(|| {
            SandboxError::OperationFailed("Failed to parse file information".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvironmentType;
    use crate::sandbox::{CreateSandbox, SandboxConfig};
    use crate::testing::FakeRuntime;

    async fn setup() -> (Arc<FakeRuntime>, FileManager, String) {
        let fake = Arc::new(FakeRuntime::new());
        let config = SandboxConfig {
            start_settle_ms: 0,
            ..Default::default()
        };
        let sandbox = Arc::new(SandboxManager::new(fake.clone(), config));
        let id = sandbox
            .create(&CreateSandbox {
                user_id: "u1".to_string(),
                env_id: 1,
                env_type: EnvironmentType::Nodejs,
                name: "files".to_string(),
                cpu_cores: None,
                memory_mb: None,
            })
            .await
            .unwrap()
            .container_id;
        (fake, FileManager::new(sandbox), id)
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/workspace/a b"), "'/workspace/a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_workspace_path() {
        assert_eq!(workspace_path(""), "/workspace");
        assert_eq!(workspace_path("src/main.py"), "/workspace/src/main.py");
        assert_eq!(workspace_path("./x"), "/workspace/x");
        assert_eq!(workspace_path("/workspace/y"), "/workspace/y");
    }

    #[test]
    fn test_parse_listing() {
        let stdout = "total 12K\n\
drwxr-xr-x    2 root     root        4.0K Jan  5 10:00 src\n\
-rw-r--r--    1 root     root          12 Jan  5 10:01 my notes.txt\n\
lrwxrwxrwx    1 root     root           4 Jan  5 10:02 link -> src\n";
        let entries = parse_listing("/workspace", stdout);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].entry_type, "directory");
        assert_eq!(entries[1].name, "my notes.txt");
        assert_eq!(entries[1].path, "/workspace/my notes.txt");
        assert_eq!(entries[1].modified, "Jan 5 10:01");
        assert_eq!(entries[2].name, "link");
    }

    #[test]
    fn test_parse_stat() {
        let info = parse_stat("/workspace/app.py|42|regular file|1700000000|-rw-r--r--\n").unwrap();
        assert_eq!(info.name, "app.py");
        assert_eq!(info.size, 42);
        assert_eq!(info.modified_timestamp, 1_700_000_000);
        assert!(parse_stat("garbage").is_none());
    }

    #[tokio::test]
    async fn test_write_read_roundtrip_awkward_content() {
        let (_fake, files, id) = setup().await;
        let content = "line 1\nit's \"quoted\" `backticks` $HOME\nünïcødé ✓\n";

        files
            .write_file(&id, "/workspace/notes.txt", content.as_bytes(), false)
            .await
            .unwrap();
        let read = files.read_file(&id, "/workspace/notes.txt").await.unwrap();
        assert_eq!(read, content);

        files
            .write_file(&id, "/workspace/notes.txt", b"more\n", true)
            .await
            .unwrap();
        let read = files.read_file(&id, "/workspace/notes.txt").await.unwrap();
        assert!(read.ends_with("✓\nmore\n"));
    }

    #[tokio::test]
    async fn test_large_write_is_split_across_commands() {
        let (fake, files, id) = setup().await;
        let content: String = (0..6000)
            .map(|i| format!("row {i:05} {}\n", "x".repeat(30)))
            .collect();
        assert!(content.len() >= 200 * 1024);

        fake.clear_history();
        files
            .write_file(&id, "/workspace/big.txt", content.as_bytes(), false)
            .await
            .unwrap();

        let writes = fake.exec_history();
        assert!(writes.len() > 1);
        for exec in &writes {
            assert_eq!(exec.container_id, id);
            assert!(exec.command.len() < 128 * 1024);
        }
        assert!(writes[0].command.contains(" > '/workspace/big.txt'"));
        assert!(writes[1..]
            .iter()
            .all(|exec| exec.command.contains(" >> '/workspace/big.txt'")));

        let read = files.read_file(&id, "/workspace/big.txt").await.unwrap();
        assert_eq!(read, content);

        // Rewriting truncates rather than appending to the old contents.
        files
            .write_file(&id, "/workspace/big.txt", b"", false)
            .await
            .unwrap();
        assert_eq!(files.read_file(&id, "/workspace/big.txt").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_read_missing_file_fails() {
        let (_fake, files, id) = setup().await;
        let err = files.read_file(&id, "/workspace/missing").await.unwrap_err();
        assert_eq!(err.to_string(), "File not found or inaccessible");
    }

    #[tokio::test]
    async fn test_workspace_root_cannot_be_deleted() {
        let (fake, files, id) = setup().await;
        fake.clear_history();
        for path in ["/workspace", "/workspace/"] {
            for recursive in [false, true] {
                let err = files.delete_file(&id, path, recursive).await.unwrap_err();
                assert_eq!(err.to_string(), "Cannot delete workspace root directory");
            }
        }
        assert!(fake.exec_history().is_empty());
    }

    #[tokio::test]
    async fn test_traversal_rejected_before_exec() {
        let (fake, files, id) = setup().await;
        fake.clear_history();
        assert!(files.read_file(&id, "/workspace/a/../../etc/passwd").await.is_err());
        let err = files
            .move_file(&id, "/workspace/a", "/etc/passwd")
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Invalid destination path: "));
        let err = files.copy_file(&id, "../x", "/workspace/b").await.unwrap_err();
        assert!(err.to_string().starts_with("Invalid source path: "));
        assert!(fake.exec_history().is_empty());
    }

    #[tokio::test]
    async fn test_binary_content_rejected() {
        let (_fake, files, id) = setup().await;
        let err = files
            .write_file(&id, "/workspace/a.out", b"\x7fELF\x02\x01", false)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
    }

    #[tokio::test]
    async fn test_directory_operations() {
        let (_fake, files, id) = setup().await;
        files.create_directory(&id, "/workspace/src").await.unwrap();
        files
            .write_file(&id, "/workspace/src/app.js", b"console.log(1)\n", false)
            .await
            .unwrap();
        files
            .copy_file(&id, "/workspace/src/app.js", "/workspace/app.js")
            .await
            .unwrap();
        files
            .move_file(&id, "/workspace/app.js", "/workspace/main.js")
            .await
            .unwrap();

        let entries = files.list_directory(&id, None).await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"src"));
        assert!(names.contains(&"main.js"));
        assert!(!names.contains(&"app.js"));

        let info = files.get_file_info(&id, "/workspace/main.js").await.unwrap();
        assert_eq!(info.size, 15);
        assert_eq!(info.file_type, "regular file");

        files.delete_file(&id, "/workspace/src", true).await.unwrap();
        let err = files.get_file_info(&id, "/workspace/src/app.js").await.unwrap_err();
        assert_eq!(err.to_string(), "File not found");
    }

    #[tokio::test]
    async fn test_list_missing_directory() {
        let (_fake, files, id) = setup().await;
        let err = files
            .list_directory(&id, Some("/workspace/nope"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Directory not found or inaccessible"));
    }
}
