//! Deciding how to run `hi-friend` for a project and spawning it.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{LspError, LspResult};
use crate::process::ServerProcess;

/// Executable name of the server.
pub const SERVER_NAME: &str = "hi-friend";

/// Manifest whose presence means the server comes from the bundle.
const MANIFEST_FILE: &str = "Gemfile";

/// Dependency-manager prefix used when the manifest exists.
const BUNDLE_EXEC: &str = "bundle exec";

/// Shells that get login-shell treatment so version managers are initialized.
const LOGIN_SHELLS: [&str; 3] = ["bash", "zsh", "fish"];

/// What the server is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerMode {
    /// Print `hi-friend <version>` and exit.
    Version,
    /// Start serving and print the address record.
    Lsp,
}

impl ServerMode {
    pub fn arg(self) -> &'static str {
        match self {
            Self::Version => "--version",
            Self::Lsp => "--lsp",
        }
    }
}

/// The parts of the ambient environment that influence how a command runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchEnvironment {
    /// Value of `$SHELL`.
    pub shell: Option<String>,
    /// Whether the host is Windows.
    pub windows: bool,
    /// Value of `%SYSTEMROOT%`.
    pub system_root: Option<String>,
}

impl LaunchEnvironment {
    /// Capture the current process environment.
    pub fn from_env() -> Self {
        Self {
            shell: std::env::var("SHELL").ok().filter(|s| !s.is_empty()),
            windows: cfg!(windows),
            system_root: std::env::var("SYSTEMROOT").ok(),
        }
    }

    /// An environment that always executes argv directly.
    pub fn direct() -> Self {
        Self::default()
    }
}

/// A fully resolved invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl LaunchPlan {
    /// Human readable command line, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Pick the command line for the server in `dir`.
///
/// First match wins: a project-local `bin/hi-friend`, the configured path,
/// `bundle exec` when a Gemfile exists, then the bare name from `PATH`.
pub fn resolve_command(dir: &Path, server_path: Option<&str>) -> String {
    if dir.join("bin").join(SERVER_NAME).exists() {
        format!("./bin/{SERVER_NAME}")
    } else if let Some(path) = server_path.filter(|p| !p.is_empty()) {
        path.to_string()
    } else if dir.join(MANIFEST_FILE).exists() {
        format!("{BUNDLE_EXEC} {SERVER_NAME}")
    } else {
        SERVER_NAME.to_string()
    }
}

/// Wrap a command line according to the shell and platform.
pub fn plan(
    dir: &Path,
    mode: ServerMode,
    server_path: Option<&str>,
    env: &LaunchEnvironment,
) -> LaunchPlan {
    let cmd = format!("{} {}", resolve_command(dir, server_path), mode.arg());
    let cwd = dir.to_path_buf();

    if let Some(shell) = env
        .shell
        .as_deref()
        .filter(|shell| LOGIN_SHELLS.iter().any(|name| shell.ends_with(name)))
    {
        let mut args = Vec::new();
        if shell.ends_with("zsh") {
            // rbenv and friends are usually initialized from .zshrc, which
            // only interactive shells read.
            args.push("-i".to_string());
        }
        args.extend(["-l".to_string(), "-c".to_string(), cmd]);
        return LaunchPlan {
            program: shell.to_string(),
            args,
            cwd,
        };
    }

    if env.windows {
        let root = env.system_root.as_deref().unwrap_or(r"C:\Windows");
        return LaunchPlan {
            program: format!(r"{root}\System32\cmd.exe"),
            args: vec!["/c".to_string(), cmd],
            cwd,
        };
    }

    let mut parts = cmd.split_whitespace().map(str::to_string);
    let program = parts.next().unwrap_or_else(|| SERVER_NAME.to_string());
    LaunchPlan {
        program,
        args: parts.collect(),
        cwd,
    }
}

/// Something that can start a server process for a project directory.
pub trait Launcher: Send + Sync {
    fn launch(&self, dir: &Path, mode: ServerMode) -> LspResult<ServerProcess>;
}

/// Launches real processes with tokio.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    server_path: Option<String>,
    env: LaunchEnvironment,
}

impl ProcessLauncher {
    pub fn new(server_path: Option<String>) -> Self {
        Self {
            server_path,
            env: LaunchEnvironment::from_env(),
        }
    }

    /// Override the captured environment.
    pub fn with_environment(mut self, env: LaunchEnvironment) -> Self {
        self.env = env;
        self
    }

    pub fn plan(&self, dir: &Path, mode: ServerMode) -> LaunchPlan {
        plan(dir, mode, self.server_path.as_deref(), &self.env)
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, dir: &Path, mode: ServerMode) -> LspResult<ServerProcess> {
        let plan = self.plan(dir, mode);
        info!(command = %plan.display(), cwd = %plan.cwd.display(), "Starting hi-friend");

        let mut cmd = Command::new(&plan.program);
        cmd.args(&plan.args)
            .current_dir(&plan.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| LspError::Spawn {
            command: plan.display(),
            source,
        })?;
        debug!(pid = ?child.id(), "hi-friend spawned");

        Ok(ServerProcess::from_child(child)?)
    }
}
