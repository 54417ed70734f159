//! In-memory container engine for unit tests.
//!
//! `FakeRuntime` keeps containers, volumes and a tiny workspace filesystem
//! behind a mutex and understands the shell shapes the file layer emits,
//! so tests can exercise real round-trips without docker.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};

use crate::container::{
    Container, ContainerConfig, ContainerError, ContainerInspect, ContainerResult,
    ContainerRuntimeApi, ContainerState, ExecOutput, InspectState,
};
use crate::sandbox::USAGE_SCRIPT;
use crate::security::WORKSPACE_ROOT;

#[derive(Debug, Clone)]
pub(crate) struct ExecRecord {
    pub container_id: String,
    pub command: String,
    /// Whether any network was attached when the command ran.
    pub networked: bool,
}

struct FakeContainer {
    config: ContainerConfig,
    running: bool,
    started_once: bool,
    networks: BTreeSet<String>,
    usage_tick: u64,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    containers: HashMap<String, FakeContainer>,
    volumes: HashSet<String>,
    images: HashSet<String>,
    pulled: Vec<String>,
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    execs: Vec<ExecRecord>,
    network_calls: Vec<String>,
    failures: HashSet<String>,
    hangs: Vec<String>,
    responses: Vec<(String, ExecOutput)>,
}

pub(crate) struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let mut state = FakeState::default();
        state.dirs.insert(WORKSPACE_ROOT.to_string());
        Self {
            state: Mutex::new(state),
        }
    }

    /// Make every call of the named trait method fail with a generic engine error.
    pub fn fail(&self, operation: &str) {
        self.state.lock().unwrap().failures.insert(operation.to_string());
    }

    /// Exec commands containing `needle` time out.
    pub fn hang_on(&self, needle: &str) {
        self.state.lock().unwrap().hangs.push(needle.to_string());
    }

    /// Exec commands containing `needle` return the given output.
    pub fn respond(&self, needle: &str, exit_code: i64, stdout: &str, stderr: &str) {
        self.state.lock().unwrap().responses.push((
            needle.to_string(),
            ExecOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        ));
    }

    pub fn clear_history(&self) {
        let mut state = self.state.lock().unwrap();
        state.execs.clear();
        state.network_calls.clear();
    }

    pub fn exec_history(&self) -> Vec<ExecRecord> {
        self.state.lock().unwrap().execs.clone()
    }

    pub fn network_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().network_calls.clone()
    }

    pub fn networks(&self, container_id: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .map(|c| c.networks.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_running(&self, container_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .is_some_and(|c| c.running)
    }

    pub fn has_container(&self, container_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .containers
            .contains_key(container_id)
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state.lock().unwrap().volumes.contains(name)
    }

    pub fn container_config(&self, container_id: &str) -> Option<ContainerConfig> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .map(|c| c.config.clone())
    }

    pub fn pulled_images(&self) -> Vec<String> {
        self.state.lock().unwrap().pulled.clone()
    }

    /// Register a container the registry knows nothing about.
    pub fn insert_container(&self, id: &str, labels: &[(&str, &str)], running: bool) {
        let mut config = ContainerConfig::new("alpine:latest").name(format!("stray_{id}"));
        for (key, value) in labels {
            config = config.label(*key, *value);
        }
        self.state.lock().unwrap().containers.insert(
            id.to_string(),
            FakeContainer {
                config,
                running,
                started_once: running,
                networks: BTreeSet::new(),
                usage_tick: 0,
            },
        );
    }

    fn check(state: &FakeState, operation: &str) -> ContainerResult<()> {
        if state.failures.contains(operation) {
            return Err(ContainerError::CommandFailed {
                command: operation.to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn container_mut<'a>(
        state: &'a mut FakeState,
        id: &str,
    ) -> ContainerResult<&'a mut FakeContainer> {
        state
            .containers
            .get_mut(id)
            .ok_or_else(|| ContainerError::ContainerNotFound(id.to_string()))
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_volume(&self, name: &str, _labels: &[(String, String)]) -> ContainerResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "create_volume")?;
        state.volumes.insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> ContainerResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "remove_volume")?;
        if !state.volumes.remove(name) {
            return Err(ContainerError::VolumeNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        let state = self.state.lock().unwrap();
        Self::check(&state, "image_exists")?;
        Ok(state.images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> ContainerResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "pull_image")?;
        state.images.insert(image.to_string());
        state.pulled.push(image.to_string());
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "create_container")?;
        state.next_id += 1;
        let id = format!("{:064x}", state.next_id);
        let networks = config.network_mode.iter().cloned().collect();
        state.containers.insert(
            id.clone(),
            FakeContainer {
                config: config.clone(),
                running: false,
                started_once: false,
                networks,
                usage_tick: 0,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "start_container")?;
        let container = Self::container_mut(&mut state, container_id)?;
        container.running = true;
        container.started_once = true;
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "stop_container")?;
        Self::container_mut(&mut state, container_id)?.running = false;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "remove_container")?;
        state
            .containers
            .remove(container_id)
            .map(|_| ())
            .ok_or_else(|| ContainerError::ContainerNotFound(container_id.to_string()))
    }

    async fn inspect_container(&self, container_id: &str) -> ContainerResult<ContainerInspect> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "inspect_container")?;
        let container = Self::container_mut(&mut state, container_id)?;
        let status = if container.running {
            ContainerState::Running
        } else if container.started_once {
            ContainerState::Exited
        } else {
            ContainerState::Created
        };
        Ok(ContainerInspect {
            id: container_id.to_string(),
            created: "2024-01-01T00:00:00Z".to_string(),
            state: InspectState {
                status,
                running: container.running,
                started_at: if container.started_once {
                    "2024-01-01T00:00:01Z".to_string()
                } else {
                    String::new()
                },
            },
        })
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &[&str],
        _workdir: Option<&str>,
        timeout: Duration,
    ) -> ContainerResult<ExecOutput> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "exec")?;
        let container = Self::container_mut(&mut state, container_id)?;
        if !container.running {
            return Err(ContainerError::from_stderr(
                "exec",
                container_id,
                &format!("Error response from daemon: container {container_id} is not running"),
            ));
        }
        let networked = !container.networks.is_empty();

        let script = match command {
            ["sh", "-c", script] => script.to_string(),
            other => other.join(" "),
        };

        if script == USAGE_SCRIPT {
            container.usage_tick += 1;
            let tick = container.usage_tick;
            return Ok(ExecOutput {
                exit_code: 0,
                stdout: format!(
                    "usage_usec {}\ncpu  {} 0 0 0 0 0 0 0\nmemory_current 134217728\nmemory_max 536870912\n",
                    tick * 20_000,
                    tick * 1_000
                ),
                stderr: String::new(),
            });
        }

        state.execs.push(ExecRecord {
            container_id: container_id.to_string(),
            command: script.clone(),
            networked,
        });

        if state.hangs.iter().any(|needle| script.contains(needle.as_str())) {
            return Err(ContainerError::Timeout {
                command: "exec".to_string(),
                seconds: timeout.as_secs(),
            });
        }

        if let Some((_, output)) = state
            .responses
            .iter()
            .find(|(needle, _)| script.contains(needle.as_str()))
        {
            return Ok(output.clone());
        }

        Ok(run_script(&mut state, &script))
    }

    async fn connect_network(&self, network: &str, container_id: &str) -> ContainerResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "connect_network")?;
        state
            .network_calls
            .push(format!("connect {network} {container_id}"));
        let container = Self::container_mut(&mut state, container_id)?;
        if !container.networks.insert(network.to_string()) {
            return Err(ContainerError::CommandFailed {
                command: "network connect".to_string(),
                message: format!(
                    "Error response from daemon: endpoint with name {container_id} already exists in network {network}"
                ),
            });
        }
        Ok(())
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container_id: &str,
        _force: bool,
    ) -> ContainerResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "disconnect_network")?;
        state
            .network_calls
            .push(format!("disconnect {network} {container_id}"));
        let container = Self::container_mut(&mut state, container_id)?;
        if !container.networks.remove(network) {
            return Err(ContainerError::CommandFailed {
                command: "network disconnect".to_string(),
                message: format!(
                    "Error response from daemon: container {container_id} is not connected to network {network}"
                ),
            });
        }
        Ok(())
    }

    async fn list_containers(&self, label: &str) -> ContainerResult<Vec<Container>> {
        let state = self.state.lock().unwrap();
        Self::check(&state, "list_containers")?;
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| c.config.labels.contains_key(label))
            .map(|(id, c)| Container {
                id: id.clone(),
                names: c.config.name.iter().cloned().collect(),
                image: c.config.image.clone(),
                state: if c.running {
                    ContainerState::Running
                } else {
                    ContainerState::Exited
                },
                labels: c.config.labels.clone(),
                created: "2024-01-01T00:00:00Z".to_string(),
            })
            .collect())
    }
}

/// Split a command line into words, honouring single and double quotes.
fn shell_words(script: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = script.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '"' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '"' {
                        break;
                    }
                    current.push(q);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

fn parent_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => WORKSPACE_ROOT.to_string(),
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_under(path: &str, dir: &str) -> bool {
    path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

fn listing(state: &FakeState, dir: &str) -> String {
    let mut out = String::from("total 0\n");
    for sub in state.dirs.iter().filter(|d| parent_of(d) == dir) {
        out.push_str(&format!(
            "drwxr-xr-x    2 root     root        4.0K Jan  1 00:00 {}\n",
            name_of(sub)
        ));
    }
    for (path, bytes) in state.files.iter().filter(|(p, _)| parent_of(p) == dir) {
        out.push_str(&format!(
            "-rw-r--r--    1 root     root    {:>8} Jan  1 00:00 {}\n",
            bytes.len(),
            name_of(path)
        ));
    }
    out
}

fn copy_tree(state: &mut FakeState, source: &str, destination: &str, remove: bool) -> bool {
    let destination = if state.dirs.contains(destination) {
        format!("{}/{}", destination, name_of(source))
    } else {
        destination.to_string()
    };

    if let Some(bytes) = state.files.get(source).cloned() {
        state.files.insert(destination, bytes);
        if remove {
            state.files.remove(source);
        }
        return true;
    }

    if !state.dirs.contains(source) {
        return false;
    }
    let dirs: Vec<String> = state
        .dirs
        .iter()
        .filter(|d| *d == source || is_under(d, source))
        .cloned()
        .collect();
    let files: Vec<(String, Vec<u8>)> = state
        .files
        .iter()
        .filter(|(p, _)| is_under(p, source))
        .map(|(p, b)| (p.clone(), b.clone()))
        .collect();
    for dir in dirs {
        let moved = format!("{}{}", destination, &dir[source.len()..]);
        state.dirs.insert(moved);
        if remove {
            state.dirs.remove(&dir);
        }
    }
    for (path, bytes) in files {
        let moved = format!("{}{}", destination, &path[source.len()..]);
        state.files.insert(moved, bytes);
        if remove {
            state.files.remove(&path);
        }
    }
    true
}

/// Returns `Ok(stdout)` or `Err(error message)`.
fn run_simple(state: &mut FakeState, words: &[String]) -> Result<String, String> {
    let arg = |i: usize| words.get(i).map(String::as_str).unwrap_or_default();
    match arg(0) {
        "echo" if words.iter().any(|w| w == "base64") => {
            let encoded = arg(1);
            let append = arg(5) == ">>";
            let path = arg(6).to_string();
            if !state.dirs.contains(&parent_of(&path)) {
                return Err(format!("sh: can't create {path}: nonexistent directory"));
            }
            let bytes = STANDARD
                .decode(encoded)
                .map_err(|_| "base64: invalid input".to_string())?;
            let entry = state.files.entry(path).or_default();
            if !append {
                entry.clear();
            }
            entry.extend_from_slice(&bytes);
            Ok(String::new())
        }
        "echo" => Ok(format!("{}\n", words[1..].join(" "))),
        "cat" => state
            .files
            .get(arg(1))
            .map(|bytes| String::from_utf8_lossy(bytes).to_string())
            .ok_or_else(|| format!("cat: can't open '{}': No such file or directory", arg(1))),
        "ls" => {
            let path = arg(2);
            if state.dirs.contains(path) {
                Ok(listing(state, path))
            } else {
                Err(format!("ls: {path}: No such file or directory"))
            }
        }
        "mkdir" => {
            let mut path = arg(2).to_string();
            while path.len() > 1 && !state.dirs.contains(&path) {
                state.dirs.insert(path.clone());
                path = parent_of(&path);
            }
            Ok(String::new())
        }
        "rm" => {
            let recursive = arg(1) == "-rf";
            let path = arg(2).to_string();
            if state.dirs.contains(&path) {
                if !recursive {
                    return Err(format!("rm: '{path}' is a directory"));
                }
                state.dirs.retain(|d| *d != path && !is_under(d, &path));
                state.files.retain(|p, _| !is_under(p, &path));
            } else {
                state.files.remove(&path);
            }
            Ok(String::new())
        }
        "mv" | "cp" => {
            let offset = if arg(1) == "-r" { 2 } else { 1 };
            let source = arg(offset).to_string();
            let destination = arg(offset + 1).to_string();
            if copy_tree(state, &source, &destination, arg(0) == "mv") {
                Ok(String::new())
            } else {
                Err(format!("{}: can't stat '{source}': No such file or directory", arg(0)))
            }
        }
        "stat" => {
            let path = arg(3);
            if let Some(bytes) = state.files.get(path) {
                Ok(format!("{path}|{}|regular file|1700000000|-rw-r--r--\n", bytes.len()))
            } else if state.dirs.contains(path) {
                Ok(format!("{path}|4096|directory|1700000000|drwxr-xr-x\n"))
            } else {
                Err(format!("stat: can't stat '{path}': No such file or directory"))
            }
        }
        _ => Ok(String::new()),
    }
}

fn run_script(state: &mut FakeState, script: &str) -> ExecOutput {
    let words = shell_words(script);
    let (primary, fallback) = match words.iter().position(|w| w == "||") {
        Some(idx) => (&words[..idx], Some(&words[idx + 1..])),
        None => (&words[..], None),
    };

    let merge_stderr = primary.iter().any(|w| w == "2>&1");
    let drop_stderr = primary.iter().any(|w| w == "2>/dev/null");

    match run_simple(state, primary) {
        Ok(stdout) => ExecOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        },
        Err(message) => {
            let (mut stdout, stderr) = if merge_stderr {
                (format!("{message}\n"), String::new())
            } else if drop_stderr {
                (String::new(), String::new())
            } else {
                (String::new(), format!("{message}\n"))
            };
            match fallback {
                Some(echo) if echo.first().map(String::as_str) == Some("echo") => {
                    stdout.push_str(&format!("{}\n", echo[1..].join(" ")));
                    ExecOutput {
                        exit_code: 0,
                        stdout,
                        stderr,
                    }
                }
                _ => ExecOutput {
                    exit_code: 1,
                    stdout,
                    stderr,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_words_handles_quote_escapes() {
        let words = shell_words("cat 'it'\\''s here' 2>&1 || echo \"ERROR: nope\"");
        assert_eq!(words, vec!["cat", "it's here", "2>&1", "||", "echo", "ERROR: nope"]);
    }
}
