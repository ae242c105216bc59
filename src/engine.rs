//! The test engine: services wired together in dependency order.

use std::sync::Arc;

use tracing::info;

use crate::agency::TestAgency;
use crate::config::Config;
use crate::domain::DomainManager;
use crate::driver::DriverService;
use crate::package::TestPackage;
use crate::runner::{DefaultTestRunnerFactory, InProcessTestRunnerFactory, MasterTestRunner, TestRunnerFactory};
use crate::runtime::RuntimeFrameworkService;
use crate::service::{ProjectService, ServiceError, ServiceManager, ServiceResult, SettingsService};

/// Entry point for loading and running test packages.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use testagency::config::Config;
/// use testagency::engine::TestEngine;
/// use testagency::package::TestPackage;
/// use testagency::result::{NullListener, TestFilter};
///
/// # async fn example() -> anyhow::Result<()> {
/// let mut engine = TestEngine::new(Config::default())?;
/// engine.initialize().await?;
///
/// let runner = engine.get_runner(TestPackage::new("target/debug/deps/my_tests"));
/// let result = runner.run(Arc::new(NullListener), &TestFilter::empty()).await?;
/// println!("{:?}", result.summary());
///
/// runner.unload().await?;
/// engine.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct TestEngine {
    config: Config,
    services: ServiceManager,
    selector: Arc<RuntimeFrameworkService>,
    projects: Arc<ProjectService>,
    factory: Arc<dyn TestRunnerFactory>,
    agency: Option<Arc<TestAgency>>,
}

impl TestEngine {
    /// An engine that can send packages to agent processes.
    ///
    /// # Errors
    ///
    /// Fails if the runtime section of `config` is malformed.
    pub fn new(config: Config) -> ServiceResult<Self> {
        Self::with_drivers(config, Arc::new(DriverService::new()))
    }

    /// Like [`new`](Self::new), with a custom driver service.
    pub fn with_drivers(config: Config, drivers: Arc<DriverService>) -> ServiceResult<Self> {
        let selector = Arc::new(selector(&config)?);
        let domains = Arc::new(DomainManager::from_config(&config.domain));
        let agency = Arc::new(TestAgency::new(&config));
        let in_process = Arc::new(InProcessTestRunnerFactory::new(
            drivers.clone(),
            domains.clone(),
            selector.clone(),
            config.execution.level_of_parallelism(),
        ));
        let factory = Arc::new(DefaultTestRunnerFactory::new(
            in_process,
            agency.clone(),
            selector.clone(),
            config.execution.max_agents(),
        ));

        let projects = Arc::new(ProjectService::new());
        let mut services = ServiceManager::new();
        services.add_service(Arc::new(SettingsService::new(config.clone())));
        services.add_service(projects.clone());
        services.add_service(selector.clone());
        services.add_service(drivers);
        services.add_service(domains);
        services.add_service(agency.clone());
        services.add_service(factory.clone());

        Ok(Self {
            config,
            services,
            selector,
            projects,
            factory,
            agency: Some(agency),
        })
    }

    /// An engine that runs everything in its own process, as used inside
    /// a test agent.
    pub fn for_agent(config: Config) -> ServiceResult<Self> {
        let selector = Arc::new(selector(&config)?);
        let drivers = Arc::new(DriverService::new());
        let domains = Arc::new(DomainManager::from_config(&config.domain));
        let factory = Arc::new(InProcessTestRunnerFactory::new(
            drivers.clone(),
            domains.clone(),
            selector.clone(),
            config.execution.level_of_parallelism(),
        ));

        let projects = Arc::new(ProjectService::new());
        let mut services = ServiceManager::new();
        services.add_service(Arc::new(SettingsService::new(config.clone())));
        services.add_service(projects.clone());
        services.add_service(selector.clone());
        services.add_service(drivers);
        services.add_service(domains);
        services.add_service(factory.clone());

        Ok(Self {
            config,
            services,
            selector,
            projects,
            factory,
            agency: None,
        })
    }

    /// Starts every service.
    ///
    /// # Errors
    ///
    /// Fails with the first service that cannot start.
    pub async fn initialize(&mut self) -> ServiceResult<()> {
        if !self.services.services_started() {
            self.services.start_services().await?;
            info!("Test engine initialized");
        }
        Ok(())
    }

    /// A runner for `package`. Nothing is loaded until it is used.
    pub fn get_runner(&self, package: TestPackage) -> MasterTestRunner {
        MasterTestRunner::new(self.factory.clone(), self.selector.clone(), package)
            .with_projects(self.projects.clone())
    }

    /// Stops every service, agents included.
    pub async fn shutdown(&mut self) {
        self.services.stop_services().await;
        info!("Test engine shut down");
    }

    pub fn services(&self) -> &ServiceManager {
        &self.services
    }

    pub fn selector(&self) -> &Arc<RuntimeFrameworkService> {
        &self.selector
    }

    pub fn projects(&self) -> &Arc<ProjectService> {
        &self.projects
    }

    pub fn factory(&self) -> &Arc<dyn TestRunnerFactory> {
        &self.factory
    }

    /// The agency, unless this is an agent-side engine.
    pub fn agency(&self) -> Option<&Arc<TestAgency>> {
        self.agency.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

fn selector(config: &Config) -> ServiceResult<RuntimeFrameworkService> {
    RuntimeFrameworkService::from_config(config).map_err(|e| ServiceError::StartFailed {
        name: "RuntimeFrameworkService".to_string(),
        reason: e.to_string(),
    })
}
