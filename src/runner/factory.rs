//! Runner factories.
//!
//! Two factories split the isolation decision between them:
//!
//! | Factory | Setting | Value | Runner |
//! |---------|---------|-------|--------|
//! | Default | `ProcessModel` | `Separate`, one runtime | `ProcessRunner` |
//! | Default | `ProcessModel` | `Separate`, mixed runtimes | aggregate of `ProcessRunner` per runtime |
//! | Default | `ProcessModel` | `Multiple` | aggregate of `ProcessRunner` per sub-package |
//! | Default | `ProcessModel` | `Default`, target not supported here | as `Separate` |
//! | Default | `ProcessModel` | `Single` or `Default` | delegate to in-process |
//! | In-process | `DomainUsage` | `None` | `DirectTestRunner` without a domain |
//! | In-process | `DomainUsage` | `Multiple` | aggregate of one domain per sub-package |
//! | In-process | `DomainUsage` | `Single`/`Default`, several sub-packages | as `Multiple` |
//! | In-process | `DomainUsage` | `Single`/`Default`, otherwise | one domain |
//!
//! A setting that drove a decision is removed from the package (and its
//! sub-packages) so that the runners built for the parts do not take the
//! same decision again.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{
    AggregateTestRunner, DirectTestRunner, ProcessRunner, RunnerKind, RunnerResult,
    TestEngineRunner,
};
use crate::agency::TestAgency;
use crate::domain::DomainManager;
use crate::driver::DriverService;
use crate::package::{DomainUsage, PackageOptions, ProcessModel, TestPackage, keys};
use crate::runtime::{RuntimeFramework, RuntimeFrameworkService};
use crate::service::{Service, ServiceContext, ServiceError, ServiceResult, ServiceStatus, StatusCell};

/// Builds the runner for a package.
pub trait TestRunnerFactory: Send + Sync {
    /// Builds a runner for `package`.
    ///
    /// Records the kind of runner built in the package's `RunnerKind`
    /// setting and removes the isolation settings it consumed.
    ///
    /// # Errors
    ///
    /// Fails if the package settings are malformed.
    fn make_test_runner(&self, package: &mut TestPackage) -> RunnerResult<Arc<dyn TestEngineRunner>>;

    /// Returns true if `runner` would be built again for `package`.
    ///
    /// Does not modify anything.
    fn can_reuse(&self, runner: &dyn TestEngineRunner, package: &TestPackage) -> bool;
}

fn require_started(service: &dyn Service) -> ServiceResult<()> {
    if service.status() == ServiceStatus::Started {
        Ok(())
    } else {
        Err(ServiceError::MissingDependency(service.name()))
    }
}

fn mark(package: &mut TestPackage, kind: RunnerKind) {
    package.set(keys::RUNNER_KIND, kind.as_str());
}

/// The kind recorded by an earlier `make_test_runner` call, if any.
fn recorded_kind(package: &TestPackage) -> Option<RunnerKind> {
    package.get_string(keys::RUNNER_KIND)?.parse().ok()
}

/// Builds runners that execute in the engine's own process.
pub struct InProcessTestRunnerFactory {
    drivers: Arc<DriverService>,
    domains: Arc<DomainManager>,
    selector: Arc<RuntimeFrameworkService>,
    level_of_parallelism: usize,
    status: StatusCell,
}

impl InProcessTestRunnerFactory {
    pub fn new(
        drivers: Arc<DriverService>,
        domains: Arc<DomainManager>,
        selector: Arc<RuntimeFrameworkService>,
        level_of_parallelism: usize,
    ) -> Self {
        Self {
            drivers,
            domains,
            selector,
            level_of_parallelism: level_of_parallelism.max(1),
            status: StatusCell::new(),
        }
    }

    /// The kind of runner the `DomainUsage` table picks for `package`.
    pub fn resolve_kind(package: &TestPackage) -> RunnerResult<RunnerKind> {
        let options = PackageOptions::from_package(package)?;
        Ok(match options.domain_usage() {
            DomainUsage::None => RunnerKind::Local,
            DomainUsage::Multiple => RunnerKind::MultipleDomains,
            DomainUsage::Single | DomainUsage::Default if package.sub_packages().len() > 1 => {
                RunnerKind::MultipleDomains
            }
            DomainUsage::Single | DomainUsage::Default => RunnerKind::SingleDomain,
        })
    }

    fn derive_kind(package: &TestPackage) -> RunnerResult<RunnerKind> {
        if !package.contains(keys::DOMAIN_USAGE) {
            if let Some(kind) = recorded_kind(package) {
                return Ok(kind);
            }
        }
        Self::resolve_kind(package)
    }

    fn domain_runner(&self, package: TestPackage, runtime: RuntimeFramework) -> Arc<dyn TestEngineRunner> {
        Arc::new(DirectTestRunner::in_domain(
            package,
            runtime,
            self.drivers.clone(),
            self.domains.clone(),
        ))
    }
}

impl TestRunnerFactory for InProcessTestRunnerFactory {
    fn make_test_runner(&self, package: &mut TestPackage) -> RunnerResult<Arc<dyn TestEngineRunner>> {
        let kind = Self::resolve_kind(package)?;
        let runtime = self.selector.resolve_runtime_framework(package);
        debug!("In-process runner for {}: {}", package.display_name(), kind);

        let runner: Arc<dyn TestEngineRunner> = match kind {
            RunnerKind::MultipleDomains => {
                package.remove_recursive(keys::DOMAIN_USAGE);
                mark(package, kind);

                let mut parts: Vec<TestPackage> = package.sub_packages().to_vec();
                if parts.is_empty() {
                    parts.push(package.clone());
                }
                let children = parts
                    .into_iter()
                    .map(|mut part| {
                        mark(&mut part, RunnerKind::SingleDomain);
                        let runtime = self.selector.resolve_runtime_framework(&part);
                        self.domain_runner(part, runtime)
                    })
                    .collect();

                Arc::new(AggregateTestRunner::new(
                    kind,
                    package.clone(),
                    runtime,
                    children,
                    self.level_of_parallelism,
                ))
            }
            RunnerKind::Local => {
                mark(package, kind);
                Arc::new(DirectTestRunner::local(package.clone(), runtime, self.drivers.clone()))
            }
            _ => {
                mark(package, RunnerKind::SingleDomain);
                self.domain_runner(package.clone(), runtime)
            }
        };
        Ok(runner)
    }

    fn can_reuse(&self, runner: &dyn TestEngineRunner, package: &TestPackage) -> bool {
        match Self::derive_kind(package) {
            Ok(kind) => {
                kind == runner.kind() && self.selector.resolve_runtime_framework(package) == runner.runtime()
            }
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Service for InProcessTestRunnerFactory {
    fn name(&self) -> &'static str {
        "InProcessTestRunnerFactory"
    }

    fn status(&self) -> ServiceStatus {
        self.status.get()
    }

    async fn start_service(&self, _context: &ServiceContext) -> ServiceResult<()> {
        let started = require_started(self.drivers.as_ref())
            .and_then(|_| require_started(self.domains.as_ref()))
            .and_then(|_| require_started(self.selector.as_ref()));
        if let Err(e) = started {
            self.status.set(ServiceStatus::Error);
            return Err(e);
        }
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

/// Builds runners for the engine, sending work to agents when the process
/// model asks for it.
pub struct DefaultTestRunnerFactory {
    in_process: Arc<InProcessTestRunnerFactory>,
    agency: Arc<TestAgency>,
    selector: Arc<RuntimeFrameworkService>,
    registration_timeout: Option<Duration>,
    max_agents: usize,
    status: StatusCell,
}

impl DefaultTestRunnerFactory {
    pub fn new(
        in_process: Arc<InProcessTestRunnerFactory>,
        agency: Arc<TestAgency>,
        selector: Arc<RuntimeFrameworkService>,
        max_agents: usize,
    ) -> Self {
        let registration_timeout = agency.registration_timeout();
        Self {
            in_process,
            agency,
            selector,
            registration_timeout,
            max_agents: max_agents.max(1),
            status: StatusCell::new(),
        }
    }

    pub fn in_process(&self) -> &Arc<InProcessTestRunnerFactory> {
        &self.in_process
    }

    /// The process model after resolving `Default`.
    fn effective_model(&self, package: &TestPackage, options: &PackageOptions) -> ProcessModel {
        match options.process_model() {
            ProcessModel::Default => {
                let target = self.selector.resolve_runtime_framework(package);
                let current = self.selector.current_framework();
                let needs_x86 = options.run_as_x86 && self.selector.host().is_64bit_process();
                if !current.supports(&target) || needs_x86 {
                    debug!(
                        "{} cannot run under {}, using a separate process",
                        package.display_name(),
                        current
                    );
                    ProcessModel::Separate
                } else {
                    ProcessModel::Default
                }
            }
            model => model,
        }
    }

    /// Leaf packages grouped by the runtime they resolve to, in first-seen
    /// order.
    fn runtime_groups(&self, package: &TestPackage) -> Vec<(RuntimeFramework, Vec<TestPackage>)> {
        let mut groups: Vec<(RuntimeFramework, Vec<TestPackage>)> = Vec::new();
        for sub in package.sub_packages() {
            let runtime = self.selector.resolve_runtime_framework(sub);
            match groups.iter_mut().find(|(r, _)| *r == runtime) {
                Some((_, members)) => members.push(sub.clone()),
                None => groups.push((runtime, vec![sub.clone()])),
            }
        }
        groups
    }

    /// The kind of runner the `ProcessModel` table picks for `package`.
    pub fn resolve_kind(&self, package: &TestPackage) -> RunnerResult<RunnerKind> {
        let options = PackageOptions::from_package(package)?;
        match self.effective_model(package, &options) {
            ProcessModel::Separate if self.runtime_groups(package).len() > 1 => Ok(RunnerKind::MultipleProcesses),
            ProcessModel::Separate => Ok(RunnerKind::Process),
            ProcessModel::Multiple => Ok(RunnerKind::MultipleProcesses),
            ProcessModel::Single | ProcessModel::Default => InProcessTestRunnerFactory::resolve_kind(package),
        }
    }

    fn derive_kind(&self, package: &TestPackage) -> RunnerResult<RunnerKind> {
        let has_request = package.contains(keys::PROCESS_MODEL) || package.contains(keys::DOMAIN_USAGE);
        if !has_request {
            if let Some(kind) = recorded_kind(package) {
                return Ok(kind);
            }
        }
        self.resolve_kind(package)
    }

    fn process_runner(&self, mut package: TestPackage, runtime: RuntimeFramework) -> Arc<dyn TestEngineRunner> {
        mark(&mut package, RunnerKind::Process);
        Arc::new(ProcessRunner::new(
            package,
            runtime,
            self.agency.clone(),
            self.registration_timeout,
        ))
    }

    fn max_agents(&self, options: &PackageOptions) -> usize {
        options.max_agents.unwrap_or(self.max_agents).max(1)
    }

    fn make_separate(&self, package: &mut TestPackage, options: &PackageOptions) -> Arc<dyn TestEngineRunner> {
        package.remove_recursive(keys::PROCESS_MODEL);
        let runtime = self.selector.resolve_runtime_framework(package);
        let groups = self.runtime_groups(package);

        if groups.len() <= 1 {
            mark(package, RunnerKind::Process);
            return self.process_runner(package.clone(), runtime);
        }

        info!(
            "{} targets {} runtimes, one agent each",
            package.display_name(),
            groups.len()
        );
        mark(package, RunnerKind::MultipleProcesses);
        let children = groups
            .into_iter()
            .map(|(group_runtime, members)| {
                let mut group = TestPackage::anonymous();
                for (key, value) in package.settings() {
                    group.set(key.clone(), value.clone());
                }
                group.set(keys::RUNTIME_FRAMEWORK, group_runtime.to_string());
                for member in members {
                    group.add_sub_package(member);
                }
                self.process_runner(group, group_runtime)
            })
            .collect();

        Arc::new(AggregateTestRunner::new(
            RunnerKind::MultipleProcesses,
            package.clone(),
            runtime,
            children,
            self.max_agents(options),
        ))
    }

    fn make_multiple(&self, package: &mut TestPackage, options: &PackageOptions) -> Arc<dyn TestEngineRunner> {
        package.remove_recursive(keys::PROCESS_MODEL);
        let runtime = self.selector.resolve_runtime_framework(package);
        mark(package, RunnerKind::MultipleProcesses);

        let mut parts: Vec<TestPackage> = package.sub_packages().to_vec();
        if parts.is_empty() {
            parts.push(package.clone());
        }
        let children = parts
            .into_iter()
            .map(|part| {
                let runtime = self.selector.resolve_runtime_framework(&part);
                self.process_runner(part, runtime)
            })
            .collect();

        Arc::new(AggregateTestRunner::new(
            RunnerKind::MultipleProcesses,
            package.clone(),
            runtime,
            children,
            self.max_agents(options),
        ))
    }
}

impl TestRunnerFactory for DefaultTestRunnerFactory {
    fn make_test_runner(&self, package: &mut TestPackage) -> RunnerResult<Arc<dyn TestEngineRunner>> {
        let options = PackageOptions::from_package(package)?;
        let model = self.effective_model(package, &options);
        debug!("Process model for {}: {}", package.display_name(), model);

        match model {
            ProcessModel::Separate => Ok(self.make_separate(package, &options)),
            ProcessModel::Multiple => Ok(self.make_multiple(package, &options)),
            ProcessModel::Single | ProcessModel::Default => self.in_process.make_test_runner(package),
        }
    }

    fn can_reuse(&self, runner: &dyn TestEngineRunner, package: &TestPackage) -> bool {
        match self.derive_kind(package) {
            Ok(kind) => {
                kind == runner.kind() && self.selector.resolve_runtime_framework(package) == runner.runtime()
            }
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Service for DefaultTestRunnerFactory {
    fn name(&self) -> &'static str {
        "DefaultTestRunnerFactory"
    }

    fn status(&self) -> ServiceStatus {
        self.status.get()
    }

    async fn start_service(&self, context: &ServiceContext) -> ServiceResult<()> {
        if self.in_process.status() != ServiceStatus::Started {
            self.in_process.start_service(context).await?;
        }

        if let Err(e) = require_started(self.agency.as_ref()) {
            self.status.set(ServiceStatus::Error);
            return Err(e);
        }
        self.status.set(ServiceStatus::Started);
        Ok(())
    }

    async fn stop_service(&self) -> ServiceResult<()> {
        self.in_process.stop_service().await?;
        self.status.set(ServiceStatus::Stopped);
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
