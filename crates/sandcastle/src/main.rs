use std::env;
use std::fs;
use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use log::{LevelFilter, debug, info, warn};
use serde::Serialize;

use sandcastle::cleanup::EnvironmentCleanup;
use sandcastle::config::{APP_NAME, AppConfig, AppPaths, load_config, write_default_config};
use sandcastle::container::ContainerRuntime;
use sandcastle::db::Database;
use sandcastle::environment::{
    Environment, EnvironmentService, EnvironmentStatus, SqliteEnvironmentRegistry,
};
use sandcastle::error::SandboxError;
use sandcastle::packages::PackageOutput;
use sandcastle::sandbox::SandboxManager;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        let code = match err.downcast_ref::<SandboxError>() {
            Some(e) if e.is_client_error() => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

#[tokio::main]
async fn async_env(ctx: RuntimeContext, cmd: EnvCommand) -> Result<()> {
    handle_env(&ctx, cmd).await
}

#[tokio::main]
async fn async_cleanup(ctx: RuntimeContext, cmd: CleanupCommand) -> Result<()> {
    handle_cleanup(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Env(cmd) => async_env(ctx, cmd),
        Command::Cleanup { command } => async_cleanup(ctx, command),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Sandcastle - sandboxed per-user development environments.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Maximum seconds to allow a command to run inside an environment
    #[arg(long = "timeout", value_name = "SECONDS", global = true)]
    timeout: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the background cleanup loop until interrupted
    Serve(ServeCommand),
    /// Manage environments
    Env(EnvCommand),
    /// Run cleanup sweeps by hand
    Cleanup {
        #[command(subcommand)]
        command: CleanupCommand,
    },
    /// Create a default config file
    Init(InitCommand),
    /// Inspect or reset configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Skip the startup orphan sweep
    #[arg(long = "no-orphan-sweep")]
    no_orphan_sweep: bool,
    /// Stop running environments when shutting down
    #[arg(long = "stop-on-shutdown")]
    stop_on_shutdown: bool,
}

#[derive(Debug, Args)]
struct EnvCommand {
    /// Owner the operation acts on behalf of
    #[arg(long, short = 'u', env = "SANDCASTLE_USER", default_value = "local", global = true)]
    user: String,
    #[command(subcommand)]
    action: EnvAction,
}

#[derive(Debug, Subcommand)]
enum EnvAction {
    /// Create an environment (nodejs, python, fullstack, cpp)
    Create {
        name: String,
        #[arg(long = "type", short = 't', default_value = "nodejs")]
        env_type: String,
    },
    /// List your environments
    List,
    /// Show one environment with live container status
    Get { id: i64 },
    Start { id: i64 },
    Stop { id: i64 },
    /// Remove the container and volume, keep the record
    Destroy { id: i64 },
    /// Run a shell command in /workspace
    Exec {
        id: i64,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Install packages (network is enabled for the install only)
    Install {
        id: i64,
        manager: String,
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// List installed packages
    Packages { id: i64, manager: String },
    Uninstall {
        id: i64,
        manager: String,
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Show package details
    Info {
        id: i64,
        manager: String,
        package: String,
    },
    /// List a workspace directory
    Ls { id: i64, path: Option<String> },
    Read { id: i64, path: String },
    /// Write a file from --content, --from or stdin
    Write {
        id: i64,
        path: String,
        #[arg(long, conflicts_with = "from")]
        content: Option<String>,
        /// Local file to upload
        #[arg(long, value_name = "PATH")]
        from: Option<PathBuf>,
        #[arg(long)]
        append: bool,
    },
    Rm {
        id: i64,
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },
    Mkdir { id: i64, path: String },
    Mv {
        id: i64,
        source: String,
        destination: String,
    },
    Cp {
        id: i64,
        source: String,
        destination: String,
    },
    Stat { id: i64, path: String },
    /// Show the audit log, newest first
    Logs {
        id: i64,
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long)]
        offset: Option<i64>,
    },
    /// Manage access sessions
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    /// Issue a session token for an environment
    Open {
        id: i64,
        /// Lifetime in minutes
        #[arg(long)]
        ttl: Option<i64>,
    },
    /// Check whether a token is active and unexpired
    Check { token: String },
    Revoke { token: String },
}

#[derive(Debug, Subcommand)]
enum CleanupCommand {
    /// Stop running environments idle longer than the threshold
    Idle {
        #[arg(long)]
        minutes: Option<i64>,
    },
    /// Destroy stopped or errored environments unused for days
    Old {
        #[arg(long)]
        days: Option<i64>,
    },
    /// Remove labelled containers no record refers to
    Orphans,
    Stats,
    /// Run every sweep once
    Run,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        if !paths.config_file.exists() {
            write_default_config(&paths.config_file)?;
        }
        let config = load_config(&paths.config_file)?;
        let paths = paths.apply_overrides(&config)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    /// One tracing subscriber on stderr. `log` records reach it through the
    /// subscriber's log bridge. `RUST_LOG` overrides the computed filter.
    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{APP_NAME}={},sqlx=warn", self.log_level()))
        });
        let layer = fmt::layer().with_writer(io::stderr).with_target(false);
        let registry = tracing_subscriber::registry().with(filter);

        let installed = if self.common.json {
            registry.with(layer.json()).try_init()
        } else {
            let ansi = env::var_os("NO_COLOR").is_none() && io::stderr().is_terminal();
            registry.with(layer.with_ansi(ansi)).try_init()
        };
        installed.context("installing log subscriber")
    }

    /// `--quiet` and `-v` win over `logging.level`.
    fn log_level(&self) -> String {
        let level = if self.common.quiet {
            LevelFilter::Error
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        };
        level.as_str().to_ascii_lowercase()
    }

    fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.paths.data_dir, &self.paths.state_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Print `value` as JSON/YAML when requested, else the text rendering.
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
        let rendered = if self.common.json {
            serde_json::to_string_pretty(value).context("serializing output to JSON")?
        } else if self.common.yaml {
            serde_yaml::to_string(value).context("serializing output to YAML")?
        } else {
            text(value)
        };
        println!("{rendered}");
        Ok(())
    }
}

struct Services {
    environments: Arc<EnvironmentService>,
    cleanup: Arc<EnvironmentCleanup>,
}

async fn build_services(ctx: &RuntimeContext) -> Result<Services> {
    let db = Database::new(&ctx.paths.database_file).await?;
    let registry = Arc::new(SqliteEnvironmentRegistry::new(db.pool().clone()));

    let runtime: ContainerRuntime = ctx.config.container.build_runtime();
    debug!("using container runtime {}", runtime.runtime_type());
    let sandbox = Arc::new(SandboxManager::new(
        Arc::new(runtime),
        ctx.config.sandbox.clone(),
    ));

    let environments = Arc::new(EnvironmentService::new(
        registry,
        sandbox,
        ctx.config.environments.clone(),
    ));
    let cleanup = Arc::new(EnvironmentCleanup::new(
        environments.clone(),
        ctx.config.cleanup.clone(),
    ));

    Ok(Services {
        environments,
        cleanup,
    })
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !cmd.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    write_default_config(&ctx.paths.config_file)?;
    info!("wrote default config to {}", ctx.paths.config_file.display());
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => ctx.emit(&ctx.config, |config| format!("{config:#?}")),
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => write_default_config(&ctx.paths.config_file),
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let services = build_services(ctx).await?;

    match ctx.config.container.build_runtime().health_check().await {
        Ok(_) => debug!("container runtime is reachable"),
        Err(e) => warn!("Container runtime health check failed: {}", e),
    }

    if ctx.config.cleanup.orphans_on_start && !cmd.no_orphan_sweep {
        match services.cleanup.cleanup_orphans().await {
            Ok(n) => info!("Startup orphan sweep removed {} container(s)", n),
            Err(e) => warn!("Startup orphan sweep failed: {}", e),
        }
    }

    let task = if ctx.config.cleanup.enabled {
        Some(services.cleanup.clone().spawn_periodic())
    } else {
        info!("Periodic cleanup disabled");
        None
    };

    info!("Sandcastle running (database {})", ctx.paths.database_file.display());
    shutdown_signal().await;
    info!("Shutdown signal received");

    if let Some(task) = task {
        task.abort();
    }

    if cmd.stop_on_shutdown {
        stop_running_environments(&services.environments).await;
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Stop every running environment during shutdown.
async fn stop_running_environments(service: &EnvironmentService) {
    let running = match service
        .registry()
        .list_by_status(EnvironmentStatus::Running)
        .await
    {
        Ok(running) => running,
        Err(e) => {
            warn!("Failed to list running environments: {:?}", e);
            return;
        }
    };

    for env in running {
        match service.stop_environment(&env.user_id, env.id).await {
            Ok(_) => info!("Stopped environment {}", env.id),
            Err(e) => warn!("Failed to stop environment {}: {}", env.id, e),
        }
    }
}

async fn handle_env(ctx: &RuntimeContext, cmd: EnvCommand) -> Result<()> {
    let services = build_services(ctx).await?;
    let service = &services.environments;
    let owner = cmd.user.as_str();

    match cmd.action {
        EnvAction::Create { name, env_type } => {
            let env = service.create_environment(owner, &name, &env_type).await?;
            ctx.emit(&env, |env| {
                format!("Created environment {} ({}, {})", env.id, env.name, env.status)
            })
        }
        EnvAction::List => {
            let envs = service.list_environments(owner).await?;
            ctx.emit(&envs, |envs| render_environments(envs))
        }
        EnvAction::Get { id } => {
            let details = service.get_environment(owner, id).await?;
            ctx.emit(&details, |details| {
                let mut out = render_environments(std::slice::from_ref(&details.environment));
                if let Some(ref c) = details.container {
                    out.push_str(&format!(
                        "\ncontainer: {} cpu {:.2}% mem {:.2} MB ({:.2}%)",
                        c.status, c.cpu_percent, c.memory_usage_mb, c.memory_percent
                    ));
                    if let Some(ref err) = c.error {
                        out.push_str(&format!(" error: {err}"));
                    }
                }
                out
            })
        }
        EnvAction::Start { id } => {
            let env = service.start_environment(owner, id).await?;
            ctx.emit(&env, |env| format!("Environment {} is {}", env.id, env.status))
        }
        EnvAction::Stop { id } => {
            let env = service.stop_environment(owner, id).await?;
            ctx.emit(&env, |env| format!("Environment {} is {}", env.id, env.status))
        }
        EnvAction::Destroy { id } => {
            service.destroy_environment(owner, id).await?;
            ctx.emit(&serde_json::json!({ "id": id, "destroyed": true }), |_| {
                format!("Destroyed environment {id}")
            })
        }
        EnvAction::Exec { id, command } => {
            let command = command.join(" ");
            let outcome = service
                .execute_command(owner, id, &command, ctx.common.timeout)
                .await?;
            if ctx.common.json || ctx.common.yaml {
                return ctx.emit(&outcome, |_| String::new());
            }
            print!("{}", outcome.stdout);
            eprint!("{}", outcome.stderr);
            io::stdout().flush().ok();
            if outcome.exit_code != 0 {
                return Err(anyhow!("command exited with status {}", outcome.exit_code));
            }
            Ok(())
        }
        EnvAction::Install {
            id,
            manager,
            packages,
        } => {
            let output = service
                .install_packages(owner, id, &manager, &packages)
                .await?;
            emit_package_output(ctx, &output)
        }
        EnvAction::Packages { id, manager } => {
            let output = service.list_packages(owner, id, &manager).await?;
            emit_package_output(ctx, &output)
        }
        EnvAction::Uninstall {
            id,
            manager,
            packages,
        } => {
            let output = service
                .uninstall_packages(owner, id, &manager, &packages)
                .await?;
            emit_package_output(ctx, &output)
        }
        EnvAction::Info {
            id,
            manager,
            package,
        } => {
            let output = service.package_info(owner, id, &manager, &package).await?;
            emit_package_output(ctx, &output)
        }
        EnvAction::Ls { id, path } => {
            let entries = service.list_files(owner, id, path.as_deref()).await?;
            ctx.emit(&entries, |entries| {
                entries
                    .iter()
                    .map(|e| {
                        format!(
                            "{} {:>8} {:<8} {:<8} {} {}",
                            e.permissions, e.size, e.owner, e.group, e.modified, e.name
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        EnvAction::Read { id, path } => {
            let content = service.read_file(owner, id, &path).await?;
            ctx.emit(&content, |content| content.trim_end_matches('\n').to_string())
        }
        EnvAction::Write {
            id,
            path,
            content,
            from,
            append,
        } => {
            let bytes = match (content, from) {
                (Some(content), _) => content.into_bytes(),
                (None, Some(from)) => fs::read(&from)
                    .with_context(|| format!("reading {}", from.display()))?,
                (None, None) => {
                    let mut buffer = Vec::new();
                    io::stdin()
                        .read_to_end(&mut buffer)
                        .context("reading content from stdin")?;
                    buffer
                }
            };
            service.write_file(owner, id, &path, &bytes, append).await?;
            ctx.emit(&serde_json::json!({ "path": path, "bytes": bytes.len() }), |_| {
                format!("Wrote {} bytes to {}", bytes.len(), path)
            })
        }
        EnvAction::Rm {
            id,
            path,
            recursive,
        } => {
            service.delete_file(owner, id, &path, recursive).await?;
            ctx.emit(&serde_json::json!({ "deleted": path }), |_| {
                format!("Deleted {path}")
            })
        }
        EnvAction::Mkdir { id, path } => {
            service.create_directory(owner, id, &path).await?;
            ctx.emit(&serde_json::json!({ "created": path }), |_| {
                format!("Created {path}")
            })
        }
        EnvAction::Mv {
            id,
            source,
            destination,
        } => {
            service.move_file(owner, id, &source, &destination).await?;
            ctx.emit(
                &serde_json::json!({ "source": source, "destination": destination }),
                |_| format!("Moved {source} -> {destination}"),
            )
        }
        EnvAction::Cp {
            id,
            source,
            destination,
        } => {
            service.copy_file(owner, id, &source, &destination).await?;
            ctx.emit(
                &serde_json::json!({ "source": source, "destination": destination }),
                |_| format!("Copied {source} -> {destination}"),
            )
        }
        EnvAction::Stat { id, path } => {
            let info = service.file_info(owner, id, &path).await?;
            ctx.emit(&info, |info| {
                format!(
                    "{}\n  type: {}\n  size: {}\n  permissions: {}\n  modified: {}",
                    info.path, info.file_type, info.size, info.permissions, info.modified_timestamp
                )
            })
        }
        EnvAction::Logs { id, limit, offset } => {
            let logs = service.get_logs(owner, id, limit, offset).await?;
            ctx.emit(&logs, |logs| {
                logs.iter()
                    .map(|log| {
                        format!(
                            "{} {:<18} {:<8} {}",
                            log.created_at,
                            log.action_type,
                            log.status,
                            log.command.as_deref().unwrap_or("-")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        EnvAction::Session { command } => match command {
            SessionCommand::Open { id, ttl } => {
                let session = service.open_session(owner, id, ttl).await?;
                ctx.emit(&session, |s| {
                    format!("{} (expires {})", s.session_token, s.expires_at)
                })
            }
            SessionCommand::Check { token } => {
                let session = service.validate_session(&token).await?;
                ctx.emit(&session, |s| {
                    format!(
                        "Session valid for environment {} until {}",
                        s.environment_id, s.expires_at
                    )
                })
            }
            SessionCommand::Revoke { token } => {
                let revoked = service.revoke_session(owner, &token).await?;
                ctx.emit(&serde_json::json!({ "revoked": revoked }), |_| {
                    if revoked {
                        "Session revoked".to_string()
                    } else {
                        "No active session with that token".to_string()
                    }
                })
            }
        },
    }
}

fn emit_package_output(ctx: &RuntimeContext, output: &PackageOutput) -> Result<()> {
    ctx.emit(output, |output| {
        let mut text = output.stdout.trim_end().to_string();
        if !output.stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(output.stderr.trim_end());
        }
        text
    })?;
    if !output.success {
        return Err(anyhow!("package manager reported failure"));
    }
    Ok(())
}

fn render_environments(envs: &[Environment]) -> String {
    if envs.is_empty() {
        return "No environments".to_string();
    }
    let mut lines = vec![format!(
        "{:>5}  {:<24} {:<10} {:<10} {}",
        "ID", "NAME", "TYPE", "STATUS", "LAST ACCESSED"
    )];
    for env in envs {
        lines.push(format!(
            "{:>5}  {:<24} {:<10} {:<10} {}",
            env.id, env.name, env.environment_type, env.status, env.last_accessed_at
        ));
    }
    lines.join("\n")
}

async fn handle_cleanup(ctx: &RuntimeContext, cmd: CleanupCommand) -> Result<()> {
    let services = build_services(ctx).await?;
    let cleanup = &services.cleanup;

    match cmd {
        CleanupCommand::Idle { minutes } => {
            let stopped = cleanup.cleanup_idle(minutes).await?;
            ctx.emit(&serde_json::json!({ "stopped": stopped }), |_| {
                format!("Stopped {stopped} idle environment(s)")
            })
        }
        CleanupCommand::Old { days } => {
            let destroyed = cleanup.cleanup_old(days).await?;
            ctx.emit(&serde_json::json!({ "destroyed": destroyed }), |_| {
                format!("Destroyed {destroyed} old environment(s)")
            })
        }
        CleanupCommand::Orphans => {
            let removed = cleanup.cleanup_orphans().await?;
            ctx.emit(&serde_json::json!({ "removed": removed }), |_| {
                format!("Removed {removed} orphan container(s)")
            })
        }
        CleanupCommand::Stats => {
            let stats = cleanup.stats().await?;
            ctx.emit(&stats, |s| {
                format!(
                    "total: {}\nrunning: {}\nstopped: {}\nerror: {}\nidle candidates: {}\nold candidates: {}",
                    s.total, s.running, s.stopped, s.error, s.idle_candidates, s.old_candidates
                )
            })
        }
        CleanupCommand::Run => {
            let report = cleanup.run_once().await;
            ctx.emit(&report, |r| {
                format!(
                    "idle stopped: {}\nold destroyed: {}\norphans removed: {}",
                    r.idle_stopped, r.old_destroyed, r.orphans_removed
                )
            })
        }
    }
}
