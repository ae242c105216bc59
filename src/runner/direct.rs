//! Runs a package's test files directly through their drivers.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{RunnerKind, RunnerResult, TestEngineRunner};
use crate::domain::{DomainManager, TestDomain, UnloadOutcome};
use crate::driver::{DriverService, ExecutionContext, TestDriver};
use crate::package::TestPackage;
use crate::result::{ResultKind, TestEngineResult, TestEventListener, TestFilter};
use crate::runtime::RuntimeFramework;

/// A test file and the driver that loaded it.
#[derive(Clone)]
struct LoadedFile {
    path: PathBuf,
    driver: Option<Arc<dyn TestDriver>>,
    /// Why the file could not be loaded.
    error: Option<String>,
}

impl LoadedFile {
    fn error_node(&self) -> TestEngineResult {
        TestEngineResult::error(
            self.path.display().to_string(),
            ResultKind::Suite,
            self.error.clone().unwrap_or_default(),
        )
    }
}

#[derive(Default)]
struct DirectState {
    loaded: bool,
    files: Vec<LoadedFile>,
    domain: Option<Arc<TestDomain>>,
    context: Option<ExecutionContext>,
    stop: CancellationToken,
}

/// Runs tests in the engine's process, optionally inside a [`TestDomain`].
pub struct DirectTestRunner {
    package: TestPackage,
    runtime: RuntimeFramework,
    drivers: Arc<DriverService>,
    domains: Option<Arc<DomainManager>>,
    state: Mutex<DirectState>,
}

impl DirectTestRunner {
    /// A runner without a domain.
    pub fn local(package: TestPackage, runtime: RuntimeFramework, drivers: Arc<DriverService>) -> Self {
        Self::new(package, runtime, drivers, None)
    }

    /// A runner that creates a domain on load and unloads it on unload.
    pub fn in_domain(
        package: TestPackage,
        runtime: RuntimeFramework,
        drivers: Arc<DriverService>,
        domains: Arc<DomainManager>,
    ) -> Self {
        Self::new(package, runtime, drivers, Some(domains))
    }

    fn new(
        package: TestPackage,
        runtime: RuntimeFramework,
        drivers: Arc<DriverService>,
        domains: Option<Arc<DomainManager>>,
    ) -> Self {
        Self {
            package,
            runtime,
            drivers,
            domains,
            state: Mutex::new(DirectState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, DirectState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The domain the tests run in, once loaded.
    pub fn domain(&self) -> Option<Arc<TestDomain>> {
        self.state().domain.clone()
    }

    fn local_context(&self) -> RunnerResult<ExecutionContext> {
        let options = self.package.options()?;
        let dir = self
            .package
            .full_name()
            .and_then(Path::parent)
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let mut context = ExecutionContext::new(dir);
        context.workers = options.number_of_test_workers;
        Ok(context)
    }

    async fn ensure_loaded(&self) -> RunnerResult<()> {
        if !self.state().loaded {
            self.load().await?;
        }
        Ok(())
    }

    fn loaded(&self) -> (Vec<LoadedFile>, Option<ExecutionContext>) {
        let state = self.state();
        (state.files.clone(), state.context.clone())
    }

    fn package_node(&self, children: Vec<TestEngineResult>) -> TestEngineResult {
        TestEngineResult::new(self.package.display_name(), ResultKind::Package).with_children(children)
    }
}

#[async_trait]
impl TestEngineRunner for DirectTestRunner {
    fn kind(&self) -> RunnerKind {
        if self.domains.is_some() {
            RunnerKind::SingleDomain
        } else {
            RunnerKind::Local
        }
    }

    fn runtime(&self) -> RuntimeFramework {
        self.runtime.clone()
    }

    fn package(&self) -> &TestPackage {
        &self.package
    }

    async fn load(&self) -> RunnerResult<TestEngineResult> {
        let (domain, context) = match &self.domains {
            Some(manager) => {
                let domain = manager.create_domain(&self.package)?;
                let context = domain.execution_context();
                (Some(domain), context)
            }
            None => (None, self.local_context()?),
        };

        let mut files = Vec::new();
        let mut children = Vec::new();
        for path in self.package.test_files() {
            let path = path.to_path_buf();
            if !path.exists() {
                warn!("Test file not found: {}", path.display());
                let file = LoadedFile {
                    error: Some(format!("File not found: {}", path.display())),
                    path,
                    driver: None,
                };
                children.push(file.error_node());
                files.push(file);
                continue;
            }

            let driver = self.drivers.get_driver(&path);
            match driver.load(&context).await {
                Ok(suite) => {
                    children.push(suite);
                    files.push(LoadedFile {
                        path,
                        driver: Some(driver),
                        error: None,
                    });
                }
                Err(e) => {
                    warn!("Failed to load {}: {}", path.display(), e);
                    let file = LoadedFile {
                        path,
                        driver: None,
                        error: Some(e.to_string()),
                    };
                    children.push(file.error_node());
                    files.push(file);
                }
            }
        }

        let previous = {
            let mut state = self.state();
            state.loaded = true;
            state.files = files;
            state.context = Some(context);
            std::mem::replace(&mut state.domain, domain)
        };
        if let (Some(previous), Some(manager)) = (previous, &self.domains) {
            manager.unload(&previous).await;
        }

        debug!("Loaded {} ({})", self.package.display_name(), self.kind());
        Ok(self.package_node(children))
    }

    async fn reload(&self) -> RunnerResult<TestEngineResult> {
        self.load().await
    }

    async fn unload(&self) -> RunnerResult<()> {
        let domain = {
            let mut state = self.state();
            state.loaded = false;
            state.files.clear();
            state.context = None;
            state.domain.take()
        };

        if let (Some(domain), Some(manager)) = (domain, &self.domains) {
            if manager.unload(&domain).await == UnloadOutcome::Abandoned {
                warn!("Domain {} was abandoned", domain.name());
            }
        }
        Ok(())
    }

    async fn explore(&self, filter: &TestFilter) -> RunnerResult<TestEngineResult> {
        self.ensure_loaded().await?;
        let (files, _) = self.loaded();

        let mut children = Vec::new();
        for file in &files {
            match &file.driver {
                Some(driver) => children.push(driver.explore(filter).await?),
                None => children.push(file.error_node()),
            }
        }
        Ok(self.package_node(children))
    }

    async fn count_test_cases(&self, filter: &TestFilter) -> RunnerResult<usize> {
        self.ensure_loaded().await?;
        let (files, _) = self.loaded();

        let mut count = 0;
        for driver in files.iter().filter_map(|f| f.driver.as_ref()) {
            count += driver.count_test_cases(filter).await?;
        }
        Ok(count)
    }

    async fn run(
        &self,
        listener: Arc<dyn TestEventListener>,
        filter: &TestFilter,
    ) -> RunnerResult<TestEngineResult> {
        self.ensure_loaded().await?;

        let stop = CancellationToken::new();
        let (files, context, domain) = {
            let mut state = self.state();
            state.stop = stop.clone();
            (state.files.clone(), state.context.clone(), state.domain.clone())
        };
        let context = match context {
            Some(context) => context,
            None => self.local_context()?,
        };
        let _activity = domain.as_ref().map(|d| d.enter());

        info!("Running {}", self.package.display_name());
        let start = Utc::now();
        let mut children = Vec::new();
        for file in &files {
            if stop.is_cancelled() || context.stop_token().is_cancelled() {
                children.push(TestEngineResult::cancelled(
                    file.path.display().to_string(),
                    ResultKind::Suite,
                    "Not run: the run was stopped",
                ));
                continue;
            }

            let Some(driver) = &file.driver else {
                children.push(file.error_node());
                continue;
            };

            match driver.run(listener.clone(), filter, &context).await {
                Ok(suite) => children.push(suite),
                Err(e) => {
                    warn!("Run of {} failed: {}", file.path.display(), e);
                    children.push(TestEngineResult::error(
                        file.path.display().to_string(),
                        ResultKind::Suite,
                        e.to_string(),
                    ));
                }
            }
        }

        let mut result = self.package_node(children);
        result.stamp(start, Utc::now());
        Ok(result)
    }

    async fn stop_run(&self, force: bool) -> RunnerResult<()> {
        let (stop, files) = {
            let state = self.state();
            (state.stop.clone(), state.files.clone())
        };

        stop.cancel();
        for driver in files.iter().filter_map(|f| f.driver.as_ref()) {
            driver.stop_run(force);
        }
        Ok(())
    }
}
