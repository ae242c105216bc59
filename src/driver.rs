//! Test drivers: the code that actually discovers and runs tests in a file.
//!
//! The engine never looks inside a test file itself. For each file it asks
//! the [`DriverService`] for a [`TestDriver`] and drives it through the
//! load / explore / run lifecycle:
//!
//! ```text
//! DriverService::get_driver(path) ──► TestDriver
//!                                       ├─ load(ctx)          discover cases
//!                                       ├─ explore(filter)    list cases
//!                                       ├─ count_test_cases   count cases
//!                                       ├─ run(listener, ..)  execute, stream events
//!                                       └─ stop_run(force)    graceful or hard stop
//! ```
//!
//! The stock driver, [`ExecutableDriver`], treats every test file as a
//! libtest-style test executable.

pub mod executable;

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::result::{TestEngineResult, TestEventListener, TestFilter};
use crate::service::{Service, ServiceContext, ServiceResult, ServiceStatus, StatusCell};

pub use executable::ExecutableDriver;

/// Environment variable carrying the private bin path into test processes.
pub const PRIVATE_BIN_PATH_ENV: &str = "TEST_PRIVATE_BIN_PATH";

/// Environment variable carrying the configuration file into test processes.
pub const CONFIG_FILE_ENV: &str = "TEST_CONFIG_FILE";

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors raised by test drivers.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Test file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to start {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to discover tests in {path}: {message}")]
    Discovery { path: PathBuf, message: String },

    #[error("Driver for {0} has not been loaded")]
    NotLoaded(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where and how a driver runs its tests.
///
/// Built by the runner from the package or from the domain the tests run
/// in. The tokens belong to whoever owns the execution boundary: the stop
/// token asks for a graceful finish, the abort token demands an immediate
/// kill of anything the driver started.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub working_dir: PathBuf,
    pub private_bin_path: Option<String>,
    pub config_file: Option<PathBuf>,
    /// Copy test executables here before running them.
    pub shadow_copy_dir: Option<PathBuf>,
    /// Worker threads requested inside each test executable.
    pub workers: Option<usize>,
    stop: CancellationToken,
    abort: CancellationToken,
}

impl ExecutionContext {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self::with_tokens(working_dir, CancellationToken::new(), CancellationToken::new())
    }

    pub fn with_tokens(
        working_dir: impl Into<PathBuf>,
        stop: CancellationToken,
        abort: CancellationToken,
    ) -> Self {
        Self {
            working_dir: working_dir.into(),
            private_bin_path: None,
            config_file: None,
            shadow_copy_dir: None,
            workers: None,
            stop,
            abort,
        }
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    /// Environment exported to test processes.
    pub fn environment(&self) -> Vec<(&'static str, String)> {
        let mut env = Vec::new();
        if let Some(bin) = &self.private_bin_path {
            env.push((PRIVATE_BIN_PATH_ENV, bin.clone()));
        }
        if let Some(config) = &self.config_file {
            env.push((CONFIG_FILE_ENV, config.display().to_string()));
        }
        env
    }
}

/// Discovers and runs the tests of a single test file.
#[async_trait]
pub trait TestDriver: Send + Sync {
    /// The test file this driver handles.
    fn path(&self) -> &Path;

    /// Discovers the test cases. Returns the suite with its cases, none of
    /// which has an outcome yet.
    async fn load(&self, context: &ExecutionContext) -> DriverResult<TestEngineResult>;

    async fn count_test_cases(&self, filter: &TestFilter) -> DriverResult<usize>;

    async fn explore(&self, filter: &TestFilter) -> DriverResult<TestEngineResult>;

    /// Runs the selected cases, reporting progress to `listener`.
    async fn run(
        &self,
        listener: Arc<dyn TestEventListener>,
        filter: &TestFilter,
        context: &ExecutionContext,
    ) -> DriverResult<TestEngineResult>;

    /// Stops a run in progress. A forced stop kills the test process.
    fn stop_run(&self, force: bool);
}

/// Builds a driver for a test file.
pub type DriverFactory = dyn Fn(&Path) -> Arc<dyn TestDriver> + Send + Sync;

/// Service handing out drivers for test files.
pub struct DriverService {
    factory: Box<DriverFactory>,
    status: StatusCell,
}

impl DriverService {
    /// A service that runs every file as a test executable.
    pub fn new() -> Self {
        Self::with_driver_factory(|path| Arc::new(ExecutableDriver::new(path)))
    }

    pub fn with_driver_factory<F>(factory: F) -> Self
    where
        F: Fn(&Path) -> Arc<dyn TestDriver> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            status: StatusCell::new(),
        }
    }

    /// Returns a fresh driver for `path`.
    pub fn get_driver(&self, path: &Path) -> Arc<dyn TestDriver> {
        (self.factory)(path)
    }
}

impl Default for DriverService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Service for DriverService {
    fn name(&self) -> &'static str {
        "DriverService"
    }

    fn status(&self) -> ServiceStatus {
        self.status.get()
    }

    async fn start_service(&self, _context: &ServiceContext) -> ServiceResult<()> {
        self.status.set(ServiceStatus::Started);
        Ok(())
    }

    async fn stop_service(&self) -> ServiceResult<()> {
        self.status.set(ServiceStatus::Stopped);
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::result::{Outcome, ResultKind, TestEvent};

    /// Driver serving a fixed table of case outcomes.
    pub(crate) struct ScriptedDriver {
        path: PathBuf,
        cases: Vec<(String, Outcome)>,
        pub(crate) stopped: AtomicBool,
    }

    impl ScriptedDriver {
        pub(crate) fn new(path: &Path, cases: &[(&str, Outcome)]) -> Self {
            Self {
                path: path.to_path_buf(),
                cases: cases.iter().map(|(n, o)| (n.to_string(), *o)).collect(),
                stopped: AtomicBool::new(false),
            }
        }

        fn suite(&self, filter: &TestFilter, with_outcomes: bool) -> TestEngineResult {
            let children = self
                .cases
                .iter()
                .filter(|(name, _)| filter.pass(name))
                .map(|(name, outcome)| {
                    let mut case = TestEngineResult::new(name, ResultKind::Case);
                    if with_outcomes {
                        case.outcome = Some(*outcome);
                    }
                    case
                })
                .collect();
            TestEngineResult::new(self.path.display().to_string(), ResultKind::Suite)
                .with_children(children)
        }
    }

    #[async_trait]
    impl TestDriver for ScriptedDriver {
        fn path(&self) -> &Path {
            &self.path
        }

        async fn load(&self, _context: &ExecutionContext) -> DriverResult<TestEngineResult> {
            Ok(self.suite(&TestFilter::empty(), false))
        }

        async fn count_test_cases(&self, filter: &TestFilter) -> DriverResult<usize> {
            Ok(self.cases.iter().filter(|(n, _)| filter.pass(n)).count())
        }

        async fn explore(&self, filter: &TestFilter) -> DriverResult<TestEngineResult> {
            Ok(self.suite(filter, false))
        }

        async fn run(
            &self,
            listener: Arc<dyn TestEventListener>,
            filter: &TestFilter,
            _context: &ExecutionContext,
        ) -> DriverResult<TestEngineResult> {
            let suite = self.suite(filter, true);
            for case in &suite.children {
                listener.on_event(&TestEvent::TestFinished {
                    name: case.name.clone(),
                    outcome: case.outcome(),
                    duration_ms: 0,
                    message: None,
                });
            }
            Ok(suite)
        }

        fn stop_run(&self, _force: bool) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    /// Driver service answering from per-file case tables.
    pub(crate) fn scripted_service(table: &[(&Path, &[(&str, Outcome)])]) -> DriverService {
        let table: HashMap<PathBuf, Vec<(String, Outcome)>> = table
            .iter()
            .map(|(path, cases)| {
                (
                    path.to_path_buf(),
                    cases.iter().map(|(n, o)| (n.to_string(), *o)).collect(),
                )
            })
            .collect();
        let table = Mutex::new(table);

        DriverService::with_driver_factory(move |path| {
            let cases = table
                .lock()
                .ok()
                .and_then(|t| t.get(path).cloned())
                .unwrap_or_default();
            let cases: Vec<(&str, Outcome)> = cases.iter().map(|(n, o)| (n.as_str(), *o)).collect();
            Arc::new(ScriptedDriver::new(path, &cases))
        })
    }

    #[test]
    fn test_context_environment() {
        let mut context = ExecutionContext::new("/work");
        assert!(context.environment().is_empty());

        context.private_bin_path = Some("lib".into());
        context.config_file = Some(PathBuf::from("/work/a.config"));
        let env = context.environment();
        assert_eq!(env[0], (PRIVATE_BIN_PATH_ENV, "lib".to_string()));
        assert_eq!(env[1], (CONFIG_FILE_ENV, "/work/a.config".to_string()));
    }

    #[tokio::test]
    async fn test_driver_service_uses_factory() {
        let path = Path::new("/tests/a");
        let service = scripted_service(&[(path, &[("one", Outcome::Passed)])]);

        let driver = service.get_driver(path);
        assert_eq!(driver.path(), path);
        assert_eq!(driver.count_test_cases(&TestFilter::empty()).await.unwrap(), 1);
    }
}
