//! The test agency: launches agent processes and hands them to runners.
//!
//! An agent is a `test-agent` process running one package on behalf of a
//! [`ProcessRunner`](crate::runner::ProcessRunner). The agency picks the
//! runtime and bitness for the package, starts the agent with a fresh id and
//! the agency's callback address, and waits for the agent to call back and
//! register.
//!
//! ```text
//! get_agent(package)
//!   ├─ resolve runtime (explicit setting, else RuntimeFrameworkService)
//!   ├─ AgentLauncher: locate executable, build command, spawn
//!   │     └─ watcher task: wait for exit or kill request
//!   └─ wait for registration
//!         ├─ registered ─────────────────────────► Some(RemoteAgent)
//!         ├─ process exited first ───────────────► None
//!         └─ deadline passed: kill the process ──► None
//! ```
//!
//! # Agent States
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `Starting` | Launched, not yet reported in |
//! | `Ready` | Idle, can take work |
//! | `Busy` | Running tests |
//! | `Stopping` | Asked to exit |
//! | `Unknown` | Process gone, record kept |

pub mod database;
pub mod launch;
pub mod protocol;
pub mod remote;
pub mod server;

use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::select;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{AgencyConfig, Config};
use crate::package::{PackageError, PackageOptions, TestPackage};
use crate::runtime::{RuntimeFrameworkService, RuntimeType, Version};
use crate::service::{Service, ServiceContext, ServiceError, ServiceResult, ServiceStatus, StatusCell};

pub use database::{AgentDataBase, AgentProcess, AgentRecord};
pub use launch::{AgentCommand, AgentLauncher, AgentLocator, LaunchOptions};
pub use protocol::{ProtocolError, ProtocolResult};
pub use remote::RemoteAgent;
pub use server::AgencyServer;

/// Result type for agency operations.
pub type AgencyResult<T> = Result<T, AgencyError>;

/// Errors raised by the agency and its agents.
#[derive(Debug, thiserror::Error)]
pub enum AgencyError {
    #[error("Unknown agent {0}")]
    UnknownAgent(Uuid),

    #[error("The {0} framework is not available")]
    RuntimeUnavailable(String),

    #[error("Agent executable not found: {0}")]
    AgentNotFound(String),

    #[error("Failed to launch agent {path}: {source}")]
    LaunchFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("The test agency is not running")]
    NotStarted,

    #[error("Agent connection closed")]
    ConnectionClosed,

    #[error("Agent error: {0}")]
    Remote(String),

    #[error("Unexpected reply from agent: {0}")]
    UnexpectedReply(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle state of an agent as last reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Unknown,
    Starting,
    Ready,
    Busy,
    Stopping,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Unknown => "unknown",
            AgentStatus::Starting => "starting",
            AgentStatus::Ready => "ready",
            AgentStatus::Busy => "busy",
            AgentStatus::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Service launching and tracking test agents.
pub struct TestAgency {
    config: AgencyConfig,
    mono_path: String,
    database: Arc<AgentDataBase>,
    locator: Arc<AgentLocator>,
    selector: OnceLock<Arc<RuntimeFrameworkService>>,
    server: Mutex<Option<AgencyServer>>,
    status: StatusCell,
}

impl TestAgency {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.agency.clone(),
            mono_path: config.runtime.mono_path.clone(),
            database: Arc::new(AgentDataBase::new()),
            locator: Arc::new(AgentLocator::from_config(&config.agency)),
            selector: OnceLock::new(),
            server: Mutex::new(None),
            status: StatusCell::new(),
        }
    }

    pub fn database(&self) -> &Arc<AgentDataBase> {
        &self.database
    }

    pub fn locator(&self) -> &Arc<AgentLocator> {
        &self.locator
    }

    /// Default registration wait from the configuration.
    pub fn registration_timeout(&self) -> Option<Duration> {
        self.config.registration_timeout()
    }

    /// Callback address agents connect to, once started.
    pub fn server_url(&self) -> Option<String> {
        self.server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(AgencyServer::url)
    }

    /// Records a callback from a launched agent.
    ///
    /// # Errors
    ///
    /// Returns [`AgencyError::UnknownAgent`] if the agency never launched
    /// an agent with that id.
    pub fn register(&self, agent: Arc<RemoteAgent>) -> AgencyResult<()> {
        self.database.register(agent)
    }

    /// # Errors
    ///
    /// Returns [`AgencyError::UnknownAgent`] for an id the agency does not
    /// track.
    pub fn report_status(&self, id: Uuid, status: AgentStatus) -> AgencyResult<()> {
        self.database.report_status(id, status)
    }

    /// Returns true if an agent can be launched for CLR `version`.
    pub fn is_runtime_version_supported(&self, version: &Version) -> bool {
        match self.selector.get() {
            Some(selector) => self
                .locator
                .supports_version(version, &selector.current_framework().clr_version()),
            None => false,
        }
    }

    /// Launches an agent for `package` and waits for it to register.
    ///
    /// `wait` bounds the registration wait; `None` waits for as long as the
    /// agent process lives. Returns `Ok(None)` when the agent exits before
    /// registering or does not register in time; a late agent is killed.
    ///
    /// # Errors
    ///
    /// Fails if the agency is not running, the target runtime is not
    /// installed, or the agent cannot be launched.
    pub async fn get_agent(
        &self,
        package: &TestPackage,
        wait: Option<Duration>,
    ) -> AgencyResult<Option<Arc<RemoteAgent>>> {
        let id = self.launch_agent(package)?;
        let deadline = wait.map(|w| Instant::now() + w);
        let poll_interval = self.config.poll_interval();

        loop {
            let registered = self.database.registered();

            if let Some(agent) = self.database.agent(id) {
                info!("Agent {} is ready", id);
                return Ok(Some(agent));
            }

            let Some(process) = self.database.process(id) else {
                error!("Agent {} is gone before registering", id);
                return Ok(None);
            };
            if process.has_exited() {
                error!("Agent {} exited before registering", id);
                return Ok(None);
            }

            let mut nap = poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    error!("Agent {} did not register within {:?}, killing it", id, wait);
                    process.kill.cancel();
                    return Ok(None);
                }
                nap = nap.min(deadline - now);
            }

            select! {
                _ = registered => {}
                _ = process.exited.cancelled() => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// Marks an agent idle again. Unknown agents are logged and ignored.
    pub fn release_agent(&self, agent: &RemoteAgent) {
        if let Err(e) = self.database.report_status(agent.id(), AgentStatus::Ready) {
            warn!("Unable to release agent: {}", e);
        }
    }

    fn launch_agent(&self, package: &TestPackage) -> AgencyResult<Uuid> {
        let selector = self.selector.get().ok_or(AgencyError::NotStarted)?;
        let url = self.server_url().ok_or(AgencyError::NotStarted)?;
        let options = PackageOptions::from_package(package)?;

        let current = selector.current_framework();
        let mut framework = options
            .runtime_framework
            .clone()
            .unwrap_or_else(|| selector.resolve_runtime_framework(package));
        if framework.runtime() == RuntimeType::Any {
            framework = framework.with_runtime(current.runtime());
        }
        if framework.allow_any_version() {
            framework = if framework.runtime() == current.runtime() {
                current.clone()
            } else {
                selector
                    .host()
                    .available_frameworks()
                    .iter()
                    .filter(|f| f.runtime() == framework.runtime())
                    .max()
                    .cloned()
                    .ok_or_else(|| AgencyError::RuntimeUnavailable(framework.display_name()))?
            };
        }

        if !selector.host().is_available(&framework) {
            return Err(AgencyError::RuntimeUnavailable(framework.display_name()));
        }

        let launcher = AgentLauncher::new(
            self.locator.clone(),
            selector.host().clone(),
            self.mono_path.clone(),
        );
        let launch = LaunchOptions {
            x86: options.run_as_x86,
            debug: options.agent_debug,
            verbose: options.verbose,
        };

        let id = Uuid::new_v4();
        let command = launcher.command(id, &framework, launch, &url)?;
        info!("Launching agent {} for {}", id, framework.display_name());
        debug!("Agent command: {}", command.to_shell_string());

        let process = AgentProcess::new();
        self.database.add(AgentRecord::new(id, process.clone()));

        let child = match launcher.spawn(id, &command) {
            Ok(child) => child,
            Err(e) => {
                self.database.remove(id);
                return Err(e);
            }
        };
        self.database.attach_pid(id, child.id());
        self.watch(id, child, process);

        Ok(id)
    }

    fn watch(&self, id: Uuid, mut child: Child, process: AgentProcess) {
        let database = self.database.clone();
        let evict = self.config.evict_exited_agents;

        tokio::spawn(async move {
            let status = select! {
                status = child.wait() => status,
                _ = process.kill.cancelled() => {
                    debug!("Killing agent {}", id);
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill agent {}: {}", id, e);
                    }
                    child.wait().await
                }
            };

            match status {
                Ok(status) => debug!("Agent {} exited with {}", id, status),
                Err(e) => warn!("Lost track of agent {}: {}", id, e),
            }
            process.exited.cancel();

            if evict {
                database.remove(id);
            } else if let Err(e) = database.report_status(id, AgentStatus::Unknown) {
                debug!("Exited agent no longer tracked: {}", e);
            }
        });
    }
}

#[async_trait]
impl Service for TestAgency {
    fn name(&self) -> &'static str {
        "TestAgency"
    }

    fn status(&self) -> ServiceStatus {
        self.status.get()
    }

    async fn start_service(&self, context: &ServiceContext) -> ServiceResult<()> {
        let selector = match context.require::<RuntimeFrameworkService>() {
            Ok(selector) => selector,
            Err(e) => {
                error!("TestAgency requires a running RuntimeFrameworkService: {}", e);
                self.status.set(ServiceStatus::Error);
                return Ok(());
            }
        };
        let _ = self.selector.set(selector);

        let server = AgencyServer::bind(&self.config.bind, self.database.clone())
            .await
            .map_err(|e| ServiceError::StartFailed {
                name: self.name().to_string(),
                reason: e.to_string(),
            })?;
        *self.server.lock().unwrap_or_else(PoisonError::into_inner) = Some(server);

        self.status.set(ServiceStatus::Started);
        Ok(())
    }

    async fn stop_service(&self) -> ServiceResult<()> {
        let records = self.database.snapshot();
        let stop_timeout = self.config.stop_timeout();

        let stops = records.iter().filter_map(|r| r.agent.clone()).map(|agent| async move {
            match tokio::time::timeout(stop_timeout, agent.stop()).await {
                Ok(Ok(())) => debug!("Agent {} acknowledged stop", agent.id()),
                Ok(Err(e)) => warn!("Agent {} did not stop cleanly: {}", agent.id(), e),
                Err(_) => warn!("Agent {} did not answer the stop request", agent.id()),
            }
        });
        join_all(stops).await;

        let exits = join_all(records.iter().map(|r| r.process.exited.cancelled()));
        if tokio::time::timeout(stop_timeout, exits).await.is_err() {
            warn!("Agents still running after {:?}, killing them", stop_timeout);
        }

        let survivors: Vec<&AgentRecord> = records.iter().filter(|r| !r.process.has_exited()).collect();
        for record in &survivors {
            record.process.kill.cancel();
        }
        let killed = join_all(survivors.iter().map(|r| r.process.exited.cancelled()));
        if tokio::time::timeout(Duration::from_secs(5), killed).await.is_err() {
            error!("Some agents could not be killed");
        }

        for record in self.database.clear() {
            if let Some(agent) = record.agent {
                agent.close();
            }
        }

        if let Some(server) = self.server.lock().unwrap_or_else(PoisonError::into_inner).take() {
            server.shutdown();
        }

        self.status.set(ServiceStatus::Stopped);
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::TempDir;
    use tokio::io::BufReader;
    use tokio::net::TcpStream;

    use super::protocol::{AgencyMessage, AgentMessage, AgentRequest, MessageReader, MessageWriter, ReplyOutcome};
    use super::*;
    use crate::package::keys;
    use crate::runtime::{ConfiguredHost, PeImageInspector, RuntimeFramework};

    fn config(agent_dir: &Path) -> Config {
        let mut config = Config::default();
        config.agency.agent_dir = Some(agent_dir.to_path_buf());
        config.agency.poll_interval_ms = 20;
        config.agency.stop_timeout_secs = 1;
        config.runtime.current = "net-4.0".to_string();
        config.runtime.available = vec!["net-4.0".to_string()];
        config
    }

    async fn started_agency(config: &Config) -> (ServiceContext, Arc<TestAgency>) {
        let context = ServiceContext::new();
        let host = ConfiguredHost::from_config(&config.runtime).unwrap();
        let selector = Arc::new(
            RuntimeFrameworkService::new(Arc::new(host), Arc::new(PeImageInspector))
                .with_image_inspection(false),
        );
        selector.start_service(&context).await.unwrap();
        context.add(selector);

        let agency = Arc::new(TestAgency::new(config));
        agency.start_service(&context).await.unwrap();
        context.add(agency.clone());
        (context, agency)
    }

    #[cfg(unix)]
    fn install_agent(dir: &Path, script: &str) {
        crate::driver::executable::tests::write_test_executable(dir, "test-agent", script);
    }

    #[tokio::test]
    async fn test_start_requires_selector() {
        let agency = TestAgency::new(&Config::default());
        agency.start_service(&ServiceContext::new()).await.unwrap();
        assert_eq!(agency.status(), ServiceStatus::Error);
        assert!(agency.server_url().is_none());
    }

    #[tokio::test]
    async fn test_start_binds_callback_address() {
        let dir = TempDir::new().unwrap();
        let (_context, agency) = started_agency(&config(dir.path())).await;
        assert_eq!(agency.status(), ServiceStatus::Started);
        assert!(agency.server_url().unwrap().starts_with("tcp://127.0.0.1:"));

        agency.stop_service().await.unwrap();
        assert!(agency.server_url().is_none());
    }

    #[tokio::test]
    async fn test_unknown_ids_are_rejected() {
        let dir = TempDir::new().unwrap();
        let (_context, agency) = started_agency(&config(dir.path())).await;
        let id = Uuid::new_v4();

        assert!(matches!(
            agency.report_status(id, AgentStatus::Ready),
            Err(AgencyError::UnknownAgent(_))
        ));
        assert!(matches!(
            agency.register(RemoteAgent::detached(id)),
            Err(AgencyError::UnknownAgent(_))
        ));
        // Releasing an unknown agent is only logged.
        agency.release_agent(&RemoteAgent::detached(id));
    }

    #[tokio::test]
    async fn test_unavailable_runtime_is_an_error() {
        let dir = TempDir::new().unwrap();
        let (_context, agency) = started_agency(&config(dir.path())).await;

        let mut package = TestPackage::new(dir.path().join("a.tests"));
        package.set(keys::RUNTIME_FRAMEWORK, "net-2.0");
        let result = agency.get_agent(&package, Some(Duration::from_secs(1))).await;
        assert!(matches!(result, Err(AgencyError::RuntimeUnavailable(_))));
        assert!(agency.database().is_empty());
    }

    #[tokio::test]
    async fn test_requested_family_is_not_swapped_for_current() {
        let dir = TempDir::new().unwrap();
        let (_context, agency) = started_agency(&config(dir.path())).await;

        let mut package = TestPackage::new(dir.path().join("a.tests"));
        package.set(keys::RUNTIME_FRAMEWORK, "mono");
        let result = agency.get_agent(&package, Some(Duration::from_secs(1))).await;
        assert!(matches!(result, Err(AgencyError::RuntimeUnavailable(_))));
        assert!(agency.database().is_empty());
    }

    #[tokio::test]
    async fn test_missing_agent_executable() {
        let dir = TempDir::new().unwrap();
        let (_context, agency) = started_agency(&config(dir.path())).await;

        let package = TestPackage::new(dir.path().join("a.tests"));
        let result = agency.get_agent(&package, Some(Duration::from_secs(1))).await;
        assert!(matches!(result, Err(AgencyError::AgentNotFound(_))));
    }

    #[test]
    fn test_runtime_version_support_needs_start() {
        let agency = TestAgency::new(&Config::default());
        assert!(!agency.is_runtime_version_supported(&Version::with_build(4, 0, 30319)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_agent_exiting_early_yields_none() {
        let dir = TempDir::new().unwrap();
        install_agent(dir.path(), "#!/bin/sh\nexit 3\n");
        let (_context, agency) = started_agency(&config(dir.path())).await;

        let package = TestPackage::new(dir.path().join("a.tests"));
        let agent = tokio::time::timeout(Duration::from_secs(5), agency.get_agent(&package, None))
            .await
            .unwrap()
            .unwrap();
        assert!(agent.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_registration_timeout_kills_agent() {
        let dir = TempDir::new().unwrap();
        install_agent(dir.path(), "#!/bin/sh\nexec sleep 30\n");
        let (_context, agency) = started_agency(&config(dir.path())).await;

        let package = TestPackage::new(dir.path().join("a.tests"));
        let agent = agency
            .get_agent(&package, Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(agent.is_none());

        tokio::time::timeout(Duration::from_secs(5), async {
            while !agency.database().is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Agent script that records its arguments and then idles.
    #[cfg(unix)]
    const RECORDING_AGENT: &str = r#"#!/bin/sh
echo "$1 $2" > "$(dirname "$0")/agent-args.txt"
exec sleep 30
"#;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_registered_agent_is_returned_and_stopped() {
        let dir = TempDir::new().unwrap();
        install_agent(dir.path(), RECORDING_AGENT);
        let (_context, agency) = started_agency(&config(dir.path())).await;

        // Plays the agent's side of the conversation once the script has run.
        let args_file = dir.path().join("agent-args.txt");
        let fake_agent = tokio::spawn(async move {
            let args = loop {
                match std::fs::read_to_string(&args_file) {
                    Ok(text) if text.ends_with('\n') => break text,
                    _ => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            };
            let mut parts = args.split_whitespace();
            let id: Uuid = parts.next().unwrap().parse().unwrap();
            let url = parts.next().unwrap().trim_start_matches("tcp://").to_string();

            let (read, write) = TcpStream::connect(url).await.unwrap().into_split();
            let mut reader = MessageReader::new(BufReader::new(read));
            let mut writer = MessageWriter::new(write);
            writer.send(&AgentMessage::Register { agent_id: id }).await.unwrap();
            assert_eq!(reader.expect::<AgencyMessage>().await.unwrap(), AgencyMessage::Registered);
            writer
                .send(&AgentMessage::Status {
                    agent_id: id,
                    status: AgentStatus::Ready,
                })
                .await
                .unwrap();

            while let Ok(Some(AgencyMessage::Request { id: request, request: op })) = reader.recv().await {
                let stop = op == AgentRequest::Stop;
                writer
                    .send(&AgentMessage::Reply {
                        request,
                        outcome: ReplyOutcome::Done,
                    })
                    .await
                    .unwrap();
                if stop {
                    break;
                }
            }
            id
        });

        let package = TestPackage::new(dir.path().join("a.tests"));
        let agent = agency
            .get_agent(&package, Some(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        agency.release_agent(&agent);
        assert_eq!(agency.database().status(agent.id()), Some(AgentStatus::Ready));
        assert!(agency.is_runtime_version_supported(&RuntimeFramework::parse("net-4.0").unwrap().clr_version()));

        // The script ignores the stop request, so shutdown has to kill it.
        let process = agency.database().process(agent.id()).unwrap();
        agency.stop_service().await.unwrap();
        assert_eq!(fake_agent.await.unwrap(), agent.id());
        assert!(process.has_exited());
        assert!(agency.database().is_empty());
    }
}
