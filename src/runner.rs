//! Test runners and the factories that pick them.
//!
//! A runner owns one package for its whole life and carries it through
//! load, explore, run and unload. Which runner a package gets depends on
//! its isolation settings:
//!
//! ```text
//! MasterTestRunner (validate, select runtime, pick runner)
//!   └── DefaultTestRunnerFactory         ProcessModel
//!         ├── ProcessRunner              Separate, one runtime
//!         ├── AggregateTestRunner        Separate with mixed runtimes,
//!         │     └── ProcessRunner ...    or Multiple
//!         └── InProcessTestRunnerFactory DomainUsage
//!               ├── DirectTestRunner     None (Local) or Single
//!               └── AggregateTestRunner  Multiple
//!                     └── DirectTestRunner ...
//! ```
//!
//! Factories record the kind of runner they built in the package's
//! `RunnerKind` setting, so a later request for the same package can tell
//! whether the runner it already has still fits.

pub mod aggregate;
pub mod direct;
pub mod factory;
pub mod master;
pub mod process;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::agency::AgencyError;
use crate::domain::DomainError;
use crate::driver::DriverError;
use crate::package::{PackageError, TestPackage};
use crate::result::{TestEngineResult, TestEventListener, TestFilter};
use crate::runtime::RuntimeFramework;
use crate::service::{ProjectError, ServiceError};

pub use aggregate::AggregateTestRunner;
pub use direct::DirectTestRunner;
pub use factory::{DefaultTestRunnerFactory, InProcessTestRunnerFactory, TestRunnerFactory};
pub use master::MasterTestRunner;
pub use process::ProcessRunner;

/// Result type for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors raised by runners and runner factories.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Package(#[from] PackageError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Agency(#[from] AgencyError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Project(#[from] ProjectError),

    /// No agent registered for the package in time.
    #[error("Unable to acquire remote process agent for {0}")]
    AgentUnavailable(String),

    #[error("Invalid package settings: {0}")]
    InvalidSettings(String),

    #[error("Cannot run tests in process - a 32 bit process is required.")]
    Requires32Bit,
}

/// The kinds of runner a factory can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunnerKind {
    /// Directly in the engine, without a domain.
    Local,
    /// In one isolation domain.
    SingleDomain,
    /// One domain per sub-package.
    MultipleDomains,
    /// In one agent process.
    Process,
    /// Several agent processes.
    MultipleProcesses,
}

impl RunnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerKind::Local => "Local",
            RunnerKind::SingleDomain => "SingleDomain",
            RunnerKind::MultipleDomains => "MultipleDomains",
            RunnerKind::Process => "Process",
            RunnerKind::MultipleProcesses => "MultipleProcesses",
        }
    }
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Local" => Ok(RunnerKind::Local),
            "SingleDomain" => Ok(RunnerKind::SingleDomain),
            "MultipleDomains" => Ok(RunnerKind::MultipleDomains),
            "Process" => Ok(RunnerKind::Process),
            "MultipleProcesses" => Ok(RunnerKind::MultipleProcesses),
            _ => Err(format!("unknown runner kind '{}'", s)),
        }
    }
}

/// Loads and runs the tests of one package.
///
/// Calls other than `load` load the package first if needed.
#[async_trait]
pub trait TestEngineRunner: Send + Sync {
    fn kind(&self) -> RunnerKind;

    /// Runtime framework the tests run under.
    fn runtime(&self) -> RuntimeFramework;

    fn package(&self) -> &TestPackage;

    /// Runners this one delegates to.
    fn children(&self) -> Vec<Arc<dyn TestEngineRunner>> {
        Vec::new()
    }

    async fn load(&self) -> RunnerResult<TestEngineResult>;

    async fn reload(&self) -> RunnerResult<TestEngineResult>;

    async fn unload(&self) -> RunnerResult<()>;

    async fn explore(&self, filter: &TestFilter) -> RunnerResult<TestEngineResult>;

    async fn count_test_cases(&self, filter: &TestFilter) -> RunnerResult<usize>;

    async fn run(
        &self,
        listener: Arc<dyn TestEventListener>,
        filter: &TestFilter,
    ) -> RunnerResult<TestEngineResult>;

    /// Stops a run in progress; `force` abandons work still running.
    async fn stop_run(&self, force: bool) -> RunnerResult<()>;
}
