//! The runner handed out to engine clients.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing::{debug, info};

use super::{RunnerError, RunnerResult, TestEngineRunner, TestRunnerFactory};
use crate::package::{PackageOptions, ProcessModel, TestPackage};
use crate::result::{EventDispatcher, ResultKind, TestEngineResult, TestEvent, TestEventListener, TestFilter};
use crate::runtime::RuntimeFrameworkService;
use crate::service::ProjectService;

/// Validates a package, picks its runtime and drives the runner built for
/// it.
///
/// The concrete runner is created lazily on the first call that needs it
/// and kept until the package is unloaded or replaced.
pub struct MasterTestRunner {
    factory: Arc<dyn TestRunnerFactory>,
    selector: Arc<RuntimeFrameworkService>,
    projects: Option<Arc<ProjectService>>,
    package: Mutex<TestPackage>,
    runner: tokio::sync::Mutex<Option<Arc<dyn TestEngineRunner>>>,
}

impl MasterTestRunner {
    pub fn new(
        factory: Arc<dyn TestRunnerFactory>,
        selector: Arc<RuntimeFrameworkService>,
        package: TestPackage,
    ) -> Self {
        Self {
            factory,
            selector,
            projects: None,
            package: Mutex::new(package),
            runner: tokio::sync::Mutex::new(None),
        }
    }

    /// Expands project files found in packages before they are loaded.
    pub fn with_projects(mut self, projects: Arc<ProjectService>) -> Self {
        self.projects = Some(projects);
        self
    }

    fn locked_package(&self) -> MutexGuard<'_, TestPackage> {
        self.package.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The package as it stands after runtime selection and runner
    /// construction.
    pub fn package(&self) -> TestPackage {
        self.locked_package().clone()
    }

    /// The runner currently in use, if one was built.
    pub async fn runner(&self) -> Option<Arc<dyn TestEngineRunner>> {
        self.runner.lock().await.clone()
    }

    /// Checks the package's requested settings against this host.
    fn validate(&self, package: &TestPackage) -> RunnerResult<()> {
        let options = PackageOptions::from_package(package)?;

        if let Some(requested) = &options.runtime_framework {
            if !self.selector.host().is_available(requested) {
                return Err(RunnerError::InvalidSettings(format!(
                    "The requested framework {} is unknown or not available.",
                    requested
                )));
            }

            let current = self.selector.current_framework();
            if options.process_model() == ProcessModel::Single && !current.supports(requested) {
                return Err(RunnerError::InvalidSettings(format!(
                    "Cannot run {} framework in process already running {}.",
                    requested, current
                )));
            }
        }
        Ok(())
    }

    /// Validates, selects the runtime and builds a runner for `package`.
    fn prepare(&self, package: &mut TestPackage) -> RunnerResult<Arc<dyn TestEngineRunner>> {
        if let Some(projects) = &self.projects {
            projects.expand_projects(package)?;
        }
        self.validate(package)?;
        self.selector.select_runtime_framework(package);

        let options = PackageOptions::from_package(package)?;
        if options.process_model() == ProcessModel::Single
            && options.run_as_x86
            && self.selector.host().is_64bit_process()
        {
            return Err(RunnerError::Requires32Bit);
        }

        let runner = self.factory.make_test_runner(package)?;
        debug!("Using {} runner for {}", runner.kind(), package.display_name());
        Ok(runner)
    }

    async fn current_runner(&self) -> RunnerResult<Arc<dyn TestEngineRunner>> {
        let mut slot = self.runner.lock().await;
        if let Some(runner) = slot.as_ref() {
            return Ok(runner.clone());
        }

        let mut package = self.package();
        let runner = self.prepare(&mut package)?;
        *self.locked_package() = package;
        *slot = Some(runner.clone());
        Ok(runner)
    }

    /// Loads the package.
    ///
    /// # Errors
    ///
    /// Fails on invalid settings or when the runner cannot load.
    pub async fn load(&self) -> RunnerResult<TestEngineResult> {
        let runner = self.current_runner().await?;
        runner.load().await
    }

    pub async fn reload(&self) -> RunnerResult<TestEngineResult> {
        let runner = self.current_runner().await?;
        runner.reload().await
    }

    /// Unloads and drops the current runner. A no-op when nothing is
    /// loaded.
    pub async fn unload(&self) -> RunnerResult<()> {
        let runner = self.runner.lock().await.take();
        match runner {
            Some(runner) => runner.unload().await,
            None => Ok(()),
        }
    }

    pub async fn explore(&self, filter: &TestFilter) -> RunnerResult<TestEngineResult> {
        let runner = self.current_runner().await?;
        runner.explore(filter).await
    }

    pub async fn count_test_cases(&self, filter: &TestFilter) -> RunnerResult<usize> {
        let runner = self.current_runner().await?;
        runner.count_test_cases(filter).await
    }

    /// Runs the selected tests and returns the whole result tree.
    ///
    /// `listener` sees `RunStarted` before any test event and `RunFinished`
    /// after the last one.
    pub async fn run(
        &self,
        listener: Arc<dyn TestEventListener>,
        filter: &TestFilter,
    ) -> RunnerResult<TestEngineResult> {
        let runner = self.current_runner().await?;
        let count = runner.count_test_cases(filter).await?;
        let dispatcher: Arc<dyn TestEventListener> = Arc::new(EventDispatcher::new().with(listener));

        info!("Running {} tests", count);
        dispatcher.on_event(&TestEvent::RunStarted { count });

        let start = Utc::now();
        let package_result = runner.run(dispatcher.clone(), filter).await?;
        let mut result = TestEngineResult::new("run", ResultKind::Run).with_children(vec![package_result]);
        result.stamp(start, Utc::now());

        dispatcher.on_event(&TestEvent::RunFinished {
            outcome: result.outcome(),
            duration_ms: result.duration.as_millis() as u64,
        });
        Ok(result)
    }

    pub async fn stop_run(&self, force: bool) -> RunnerResult<()> {
        match self.runner().await {
            Some(runner) => runner.stop_run(force).await,
            None => Ok(()),
        }
    }

    /// Switches to `package`, reusing the current runner when it still
    /// fits.
    ///
    /// A reused runner is reloaded; otherwise the old runner is unloaded
    /// and a new one is built and loaded.
    pub async fn load_package(&self, package: TestPackage) -> RunnerResult<TestEngineResult> {
        let mut package = package;
        if let Some(projects) = &self.projects {
            projects.expand_projects(&mut package)?;
        }
        let mut slot = self.runner.lock().await;

        if let Some(runner) = slot.clone() {
            let same_files = runner.package().test_files() == package.test_files();
            if same_files && self.factory.can_reuse(runner.as_ref(), &package) {
                debug!("Reusing {} runner for {}", runner.kind(), package.display_name());
                *self.locked_package() = package;
                return runner.reload().await;
            }

            debug!("Replacing {} runner", runner.kind());
            *slot = None;
            runner.unload().await?;
        }

        let runner = self.prepare(&mut package)?;
        *self.locked_package() = package;
        *slot = Some(runner.clone());
        drop(slot);
        runner.load().await
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::driver::DriverService;
    use crate::driver::tests::scripted_service;
    use crate::package::keys;
    use crate::result::Outcome;
    use crate::result::tests::RecordingListener;
    use crate::runner::factory::tests::fixture;
    use crate::runner::{InProcessTestRunnerFactory, RunnerKind};

    fn touch(dir: &std::path::Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"").unwrap();
        path
    }

    /// An in-process factory whose drivers answer from `table`.
    fn scripted_factory(
        f: &crate::runner::factory::tests::Fixture,
        drivers: DriverService,
    ) -> Arc<dyn TestRunnerFactory> {
        let domains = Arc::new(crate::domain::DomainManager::new(
            f.dir.path().join("scripted-cache"),
            std::time::Duration::from_secs(5),
        ));
        Arc::new(InProcessTestRunnerFactory::new(
            Arc::new(drivers),
            domains,
            f.selector.clone(),
            2,
        ))
    }

    #[tokio::test]
    async fn test_run_brackets_events_and_stamps_result() {
        let f = fixture("net-4.0", &["net-4.0"], true).await;
        let a = touch(f.dir.path(), "a.tests");
        let drivers = scripted_service(&[(&a, &[("one", Outcome::Passed), ("two", Outcome::Failed)])]);
        let master = MasterTestRunner::new(scripted_factory(&f, drivers), f.selector.clone(), TestPackage::new(&a));

        let listener = Arc::new(RecordingListener::default());
        let result = master.run(listener.clone(), &TestFilter::empty()).await.unwrap();

        let events = listener.events();
        assert_eq!(events.first(), Some(&TestEvent::RunStarted { count: 2 }));
        assert!(matches!(
            events.last(),
            Some(TestEvent::RunFinished {
                outcome: Outcome::Failed,
                ..
            })
        ));
        assert_eq!(result.kind, ResultKind::Run);
        assert!(result.start_time.is_some() && result.end_time.is_some());
        assert_eq!(result.summary().total, 2);

        let package = master.package();
        assert_eq!(package.get_string(keys::RUNTIME_FRAMEWORK).as_deref(), Some("net-4.0"));
        assert_eq!(package.get_string(keys::RUNNER_KIND).as_deref(), Some("SingleDomain"));
        master.unload().await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_framework_is_rejected() {
        let f = fixture("net-4.0", &["net-4.0"], true).await;
        let mut package = TestPackage::new("/t/a.tests");
        package.set(keys::RUNTIME_FRAMEWORK, "net-2.0");
        let master = MasterTestRunner::new(f.factory.clone(), f.selector.clone(), package);

        let err = master.load().await.err().unwrap();
        assert_eq!(
            err.to_string(),
            "Invalid package settings: The requested framework net-2.0 is unknown or not available."
        );
    }

    #[tokio::test]
    async fn test_single_process_with_unsupported_framework_is_rejected() {
        let f = fixture("net-2.0", &["net-2.0", "net-4.0"], true).await;
        let mut package = TestPackage::new("/t/a.tests");
        package.set(keys::RUNTIME_FRAMEWORK, "net-4.0");
        package.set(keys::PROCESS_MODEL, "Single");
        let master = MasterTestRunner::new(f.factory.clone(), f.selector.clone(), package);

        assert!(matches!(
            master.explore(&TestFilter::empty()).await,
            Err(RunnerError::InvalidSettings(_))
        ));
    }

    #[tokio::test]
    async fn test_single_process_x86_on_64bit_host_is_rejected() {
        let f = fixture("net-4.0", &["net-4.0"], true).await;
        let mut package = TestPackage::new("/t/a.tests");
        package.set(keys::PROCESS_MODEL, "Single");
        package.set(keys::RUN_AS_X86, true);
        let master = MasterTestRunner::new(f.factory.clone(), f.selector.clone(), package);

        let err = master.load().await.err().unwrap();
        assert!(matches!(err, RunnerError::Requires32Bit));
        assert!(master.runner().await.is_none());
    }

    #[tokio::test]
    async fn test_load_package_reuses_matching_runner() {
        let f = fixture("net-4.0", &["net-4.0"], true).await;
        let a = touch(f.dir.path(), "a.tests");
        let b = touch(f.dir.path(), "b.tests");
        let drivers = scripted_service(&[(&a, &[("one", Outcome::Passed)]), (&b, &[("two", Outcome::Passed)])]);
        let master = MasterTestRunner::new(scripted_factory(&f, drivers), f.selector.clone(), TestPackage::new(&a));

        master.load().await.unwrap();
        let first = master.runner().await.unwrap();

        master.load_package(master.package()).await.unwrap();
        let reused = master.runner().await.unwrap();
        assert!(Arc::ptr_eq(&first, &reused));

        let mut local = TestPackage::new(&a);
        local.set(keys::DOMAIN_USAGE, "None");
        master.load_package(local).await.unwrap();
        let replaced = master.runner().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &replaced));
        assert_eq!(replaced.kind(), RunnerKind::Local);

        master.load_package(TestPackage::new(&b)).await.unwrap();
        let other = master.runner().await.unwrap();
        assert_eq!(other.package().test_files(), vec![b.as_path()]);
        assert_eq!(master.count_test_cases(&TestFilter::empty()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_project_file_expands_before_load() {
        let f = fixture("net-4.0", &["net-4.0"], true).await;
        let a = touch(f.dir.path(), "a.tests");
        let b = touch(f.dir.path(), "b.tests");
        let project = f.dir.path().join("suite.testproj");
        std::fs::write(
            &project,
            "[[config]]\nname = \"debug\"\nfiles = [\"a.tests\", \"b.tests\"]\n",
        )
        .unwrap();

        let drivers = scripted_service(&[(&a, &[("one", Outcome::Passed)]), (&b, &[("two", Outcome::Failed)])]);
        let master = MasterTestRunner::new(scripted_factory(&f, drivers), f.selector.clone(), TestPackage::new(&project))
            .with_projects(Arc::new(ProjectService::new()));

        let result = master.run(Arc::new(RecordingListener::default()), &TestFilter::empty()).await.unwrap();
        assert_eq!(result.summary().passed, 1);
        assert_eq!(result.summary().failed, 1);

        let package = master.package();
        assert_eq!(package.test_files(), vec![a.as_path(), b.as_path()]);
        assert_eq!(package.get_string(keys::RUNNER_KIND).as_deref(), Some("MultipleDomains"));
        master.unload().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_and_unload_without_runner() {
        let f = fixture("net-4.0", &["net-4.0"], true).await;
        let master = MasterTestRunner::new(f.factory.clone(), f.selector.clone(), TestPackage::new("/t/a.tests"));
        master.stop_run(false).await.unwrap();
        master.unload().await.unwrap();
    }
}
