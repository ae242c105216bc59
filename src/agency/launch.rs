//! Finding agent executables and starting agent processes.
//!
//! # Agent Layout
//!
//! ```text
//! <agent_dir>/
//! ├── test-agent            agents for 2.x and later runtimes
//! ├── test-agent-x86        32-bit variant
//! └── net-1.1/
//!     └── test-agent        agents for 1.x runtimes on a 2.x+ host
//! ```
//!
//! # Launch Strategy
//!
//! | Runtime | Command |
//! |---------|---------|
//! | Mono | `<mono> --runtime=v<clr> [--debug] <agent> <args>` |
//! | Net | `<agent> <args>` with `COMPLUS_Version=v<clr>` |
//! | Others | `<agent> <args>` |

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tracing::debug;
use uuid::Uuid;

use super::{AgencyError, AgencyResult};
use crate::config::AgencyConfig;
use crate::runtime::{HostEnvironment, RuntimeFramework, RuntimeType, Version};

/// Subdirectory holding agents for 1.x runtimes.
pub const LEGACY_AGENT_DIR: &str = "net-1.1";

/// Environment variable selecting the CLR version of a .NET process.
pub const CLR_VERSION_ENV: &str = "COMPLUS_Version";

/// Locates agent executables for a target runtime.
#[derive(Debug, Clone)]
pub struct AgentLocator {
    agent_dir: PathBuf,
    agent_name: String,
}

impl AgentLocator {
    pub fn new(agent_dir: impl Into<PathBuf>, agent_name: impl Into<String>) -> Self {
        Self {
            agent_dir: agent_dir.into(),
            agent_name: agent_name.into(),
        }
    }

    /// Uses the configured directory, or the directory of the running
    /// executable.
    pub fn from_config(config: &AgencyConfig) -> Self {
        let dir = config.agent_dir.clone().unwrap_or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf))
                .unwrap_or_else(|| PathBuf::from("."))
        });
        Self::new(dir, config.agent_name.clone())
    }

    pub fn agent_dir(&self) -> &Path {
        &self.agent_dir
    }

    /// Directory holding agents able to run `version` on a host whose CLR
    /// is `current`, if there is one.
    pub fn bin_directory(&self, version: &Version, current: &Version) -> Option<PathBuf> {
        if version.is_default() {
            return Some(self.agent_dir.clone());
        }

        match (version.major, current.major) {
            (v, c) if v >= 2 && c >= 2 => Some(self.agent_dir.clone()),
            (1, 1) => Some(self.agent_dir.clone()),
            (1, c) if c >= 2 => {
                let legacy = self.agent_dir.join(LEGACY_AGENT_DIR);
                legacy.is_dir().then_some(legacy)
            }
            _ => None,
        }
    }

    /// Returns true if an agent directory exists for `version`.
    pub fn supports_version(&self, version: &Version, current: &Version) -> bool {
        self.bin_directory(version, current).is_some()
    }

    /// Path of the agent executable for `version`.
    ///
    /// # Errors
    ///
    /// Returns [`AgencyError::AgentNotFound`] when no directory serves the
    /// version or the executable is missing from it.
    pub fn agent_path(&self, version: &Version, current: &Version, x86: bool) -> AgencyResult<PathBuf> {
        let file_name = if x86 {
            format!("{}-x86{}", self.agent_name, std::env::consts::EXE_SUFFIX)
        } else {
            format!("{}{}", self.agent_name, std::env::consts::EXE_SUFFIX)
        };

        let dir = self
            .bin_directory(version, current)
            .ok_or_else(|| AgencyError::AgentNotFound(format!("no agent directory for CLR {}", version)))?;

        let path = dir.join(file_name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(AgencyError::AgentNotFound(path.display().to_string()))
        }
    }
}

/// Process command line for an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Give the agent the engine's stdin, so a paused agent can be resumed.
    pub inherit_stdin: bool,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            inherit_stdin: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn inherit_stdin(mut self, inherit: bool) -> Self {
        self.inherit_stdin = inherit;
        self
    }

    /// Command line for logs.
    pub fn to_shell_string(&self) -> String {
        shell_words::join(std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str)))
    }
}

/// Per-launch switches taken from the package.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    pub x86: bool,
    /// Start the agent paused, waiting for a debugger.
    pub debug: bool,
    pub verbose: bool,
}

/// Builds and spawns agent processes.
pub struct AgentLauncher {
    locator: Arc<AgentLocator>,
    host: Arc<dyn HostEnvironment>,
    mono_path: String,
}

impl AgentLauncher {
    pub fn new(locator: Arc<AgentLocator>, host: Arc<dyn HostEnvironment>, mono_path: impl Into<String>) -> Self {
        Self {
            locator,
            host,
            mono_path: mono_path.into(),
        }
    }

    /// Builds the command line for an agent running `framework`.
    ///
    /// # Errors
    ///
    /// Returns [`AgencyError::AgentNotFound`] if no agent executable serves
    /// the framework's CLR version.
    pub fn command(
        &self,
        id: Uuid,
        framework: &RuntimeFramework,
        options: LaunchOptions,
        agency_url: &str,
    ) -> AgencyResult<AgentCommand> {
        let current = self.host.current_framework().clr_version();
        let agent = self
            .locator
            .agent_path(&framework.clr_version(), &current, options.x86)?;
        let agent = agent.display().to_string();

        let mut agent_args = vec![id.to_string(), agency_url.to_string()];
        if options.debug {
            agent_args.push("--pause".to_string());
        }
        if options.verbose {
            agent_args.push("--verbose".to_string());
        }

        let command = match framework.runtime() {
            RuntimeType::Mono => {
                let mut command = AgentCommand::new(&self.mono_path)
                    .arg(format!("--runtime=v{}", framework.clr_version()));
                if options.debug {
                    command = command.arg("--debug");
                }
                command.arg(agent).args(agent_args)
            }
            RuntimeType::Net => {
                let resolved = self.host.best_available(framework);
                AgentCommand::new(agent)
                    .args(agent_args)
                    .env(CLR_VERSION_ENV, format!("v{}", resolved.clr_version()))
            }
            _ => AgentCommand::new(agent).args(agent_args),
        };

        Ok(command.inherit_stdin(options.debug))
    }

    /// Starts the agent process. Its output is forwarded to the log.
    ///
    /// # Errors
    ///
    /// Returns [`AgencyError::LaunchFailed`] if the process cannot start.
    pub fn spawn(&self, id: Uuid, command: &AgentCommand) -> AgencyResult<Child> {
        let mut process = tokio::process::Command::new(&command.program);
        process.args(&command.args);
        for (key, value) in &command.env {
            process.env(key, value);
        }

        process.stdin(if command.inherit_stdin {
            Stdio::inherit()
        } else {
            Stdio::null()
        });
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);

        let mut child = process.spawn().map_err(|source| AgencyError::LaunchFailed {
            path: PathBuf::from(&command.program),
            source,
        })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(id, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(id, stderr);
        }

        Ok(child)
    }
}

fn forward_output<R>(id: Uuid, stream: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[agent {}] {}", id, line);
        }
    });
}
