//! Configuration schema for the test engine.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a working configuration.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RuntimeConfig     - Hosting runtime, installed runtimes, image inspection
//! ├── AgencyConfig      - Agent launch, registration polling, shutdown
//! ├── DomainConfig      - Shadow copy cache location, unload timeout
//! └── ExecutionConfig   - Parallelism for aggregate runs
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
///
/// # TOML Structure
///
/// ```toml
/// [runtime]
/// current = "net-4.0"
/// available = ["net-2.0", "net-4.0", "mono-4.0"]
///
/// [agency]
/// poll_interval_ms = 200
/// registration_timeout_secs = 60
///
/// [domain]
/// shadow_copy_path = "$HOME/.cache/testagency/shadow"
///
/// [execution]
/// max_agents = 4
/// ```
///
/// # Example
///
/// ```
/// use testagency::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [agency]
///     poll_interval_ms = 50
/// "#).unwrap();
/// assert_eq!(config.agency.poll_interval_ms, 50);
/// assert_eq!(config.domain.unload_timeout_secs, 30);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub agency: AgencyConfig,

    #[serde(default)]
    pub domain: DomainConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Runtime environment settings.
///
/// | Field | Default |
/// |-------|---------|
/// | `current` | `net-4.0` |
/// | `available` | `["net-2.0", "net-4.0"]` |
/// | `inspect_images` | true |
/// | `mono_path` | `mono` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Framework string of the runtime hosting the engine.
    #[serde(default = "default_current_runtime")]
    pub current: String,

    /// Framework strings of every installed runtime.
    #[serde(default = "default_available_runtimes")]
    pub available: Vec<String>,

    /// Select the target runtime by reading test binary headers.
    ///
    /// When disabled, packages without an explicit framework run under the
    /// current runtime.
    #[serde(default = "default_true")]
    pub inspect_images: bool,

    /// Launcher used to host agents on the Mono runtime.
    #[serde(default = "default_mono_path")]
    pub mono_path: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            current: default_current_runtime(),
            available: default_available_runtimes(),
            inspect_images: true,
            mono_path: default_mono_path(),
        }
    }
}

fn default_current_runtime() -> String {
    "net-4.0".to_string()
}

fn default_available_runtimes() -> Vec<String> {
    vec!["net-2.0".to_string(), "net-4.0".to_string()]
}

fn default_mono_path() -> String {
    "mono".to_string()
}

fn default_true() -> bool {
    true
}

/// Settings for the test agency and the agents it launches.
///
/// | Field | Default |
/// |-------|---------|
/// | `bind` | `127.0.0.1:0` (ephemeral port) |
/// | `poll_interval_ms` | 200 |
/// | `registration_timeout_secs` | 60 (0 waits forever) |
/// | `agent_dir` | directory of the running executable |
/// | `agent_name` | `test-agent` |
/// | `evict_exited_agents` | true |
/// | `stop_timeout_secs` | 10 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgencyConfig {
    /// Address the agency listens on for agent callbacks.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Interval between registration checks while waiting for an agent.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long to wait for a launched agent to register.
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_secs: u64,

    /// Directory holding the agent executables.
    pub agent_dir: Option<PathBuf>,

    /// Base name of the agent executable. The 32-bit agent appends `-x86`.
    #[serde(default = "default_agent_name")]
    pub agent_name: String,

    /// Remove agent records as soon as their process exits.
    #[serde(default = "default_true")]
    pub evict_exited_agents: bool,

    /// Grace period for agents to exit on shutdown before they are killed.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl AgencyConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Registration wait, `None` meaning wait forever.
    pub fn registration_timeout(&self) -> Option<Duration> {
        match self.registration_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl Default for AgencyConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            poll_interval_ms: default_poll_interval(),
            registration_timeout_secs: default_registration_timeout(),
            agent_dir: None,
            agent_name: default_agent_name(),
            evict_exited_agents: true,
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:0".to_string()
}

fn default_poll_interval() -> u64 {
    200
}

fn default_registration_timeout() -> u64 {
    60
}

fn default_agent_name() -> String {
    "test-agent".to_string()
}

fn default_stop_timeout() -> u64 {
    10
}

/// Settings for in-process isolation domains.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DomainConfig {
    /// Root of the shadow copy cache.
    ///
    /// Environment variables and `~` are expanded. Defaults to
    /// `ShadowCopyCache` next to the running executable.
    pub shadow_copy_path: Option<String>,

    /// How long an unload may take before the domain is abandoned.
    ///
    /// Default: 30
    #[serde(default = "default_unload_timeout")]
    pub unload_timeout_secs: u64,
}

impl DomainConfig {
    pub fn unload_timeout(&self) -> Duration {
        Duration::from_secs(self.unload_timeout_secs)
    }
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            shadow_copy_path: None,
            unload_timeout_secs: default_unload_timeout(),
        }
    }
}

fn default_unload_timeout() -> u64 {
    30
}

/// Parallelism for runs that fan out over several runners.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Upper bound on concurrently running agent processes.
    ///
    /// Defaults to the number of CPUs.
    pub max_agents: Option<usize>,

    /// Number of domains run at once by a multiple-domain run.
    ///
    /// Default: 1 (sequential)
    pub level_of_parallelism: Option<usize>,
}

impl ExecutionConfig {
    pub fn max_agents(&self) -> usize {
        self.max_agents
            .filter(|n| *n > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
    }

    pub fn level_of_parallelism(&self) -> usize {
        self.level_of_parallelism.filter(|n| *n > 0).unwrap_or(1)
    }
}
