//! Runs a package inside a test agent process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{RunnerError, RunnerKind, RunnerResult, TestEngineRunner};
use crate::agency::{RemoteAgent, TestAgency};
use crate::package::TestPackage;
use crate::result::{ResultKind, TestEngineResult, TestEventListener, TestFilter};
use crate::runtime::RuntimeFramework;

/// Proxies every runner call to an agent launched through the [`TestAgency`].
///
/// The agent is acquired on load and stopped on unload. A runner never
/// shares its agent with another runner.
pub struct ProcessRunner {
    package: TestPackage,
    runtime: RuntimeFramework,
    agency: Arc<TestAgency>,
    registration_timeout: Option<Duration>,
    agent: Mutex<Option<Arc<RemoteAgent>>>,
}

impl ProcessRunner {
    pub fn new(
        package: TestPackage,
        runtime: RuntimeFramework,
        agency: Arc<TestAgency>,
        registration_timeout: Option<Duration>,
    ) -> Self {
        Self {
            package,
            runtime,
            agency,
            registration_timeout,
            agent: Mutex::new(None),
        }
    }

    /// The agent serving this runner, once loaded.
    pub async fn agent(&self) -> Option<Arc<RemoteAgent>> {
        self.agent.lock().await.clone()
    }

    async fn acquire(&self) -> RunnerResult<Arc<RemoteAgent>> {
        let mut slot = self.agent.lock().await;
        if let Some(agent) = slot.as_ref().filter(|a| !a.is_closed()) {
            return Ok(agent.clone());
        }

        let agent = self
            .agency
            .get_agent(&self.package, self.registration_timeout)
            .await?
            .ok_or_else(|| RunnerError::AgentUnavailable(self.package.display_name()))?;
        info!("Agent {} acquired for {}", agent.id(), self.package.display_name());
        *slot = Some(agent.clone());
        Ok(agent)
    }

    async fn loaded_agent(&self) -> RunnerResult<Arc<RemoteAgent>> {
        if let Some(agent) = self.agent().await.filter(|a| !a.is_closed()) {
            return Ok(agent);
        }
        self.load().await?;
        self.agent()
            .await
            .ok_or_else(|| RunnerError::AgentUnavailable(self.package.display_name()))
    }
}

#[async_trait]
impl TestEngineRunner for ProcessRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Process
    }

    fn runtime(&self) -> RuntimeFramework {
        self.runtime.clone()
    }

    fn package(&self) -> &TestPackage {
        &self.package
    }

    async fn load(&self) -> RunnerResult<TestEngineResult> {
        let agent = self.acquire().await?;
        Ok(agent.load(&self.package).await?)
    }

    async fn reload(&self) -> RunnerResult<TestEngineResult> {
        match self.agent().await.filter(|a| !a.is_closed()) {
            Some(agent) => Ok(agent.reload().await?),
            None => self.load().await,
        }
    }

    async fn unload(&self) -> RunnerResult<()> {
        let Some(agent) = self.agent.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = agent.unload().await {
            warn!("Agent {} failed to unload: {}", agent.id(), e);
        }
        self.agency.release_agent(&agent);
        if let Err(e) = agent.stop().await {
            debug!("Agent {} did not acknowledge stop: {}", agent.id(), e);
        }
        Ok(())
    }

    async fn explore(&self, filter: &TestFilter) -> RunnerResult<TestEngineResult> {
        Ok(self.loaded_agent().await?.explore(filter).await?)
    }

    async fn count_test_cases(&self, filter: &TestFilter) -> RunnerResult<usize> {
        Ok(self.loaded_agent().await?.count_test_cases(filter).await?)
    }

    async fn run(
        &self,
        listener: Arc<dyn TestEventListener>,
        filter: &TestFilter,
    ) -> RunnerResult<TestEngineResult> {
        let agent = self.loaded_agent().await?;
        match agent.run(listener, filter).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!("Remote run of {} failed: {}", self.package.display_name(), e);
                Ok(TestEngineResult::error(
                    self.package.display_name(),
                    ResultKind::Package,
                    e.to_string(),
                ))
            }
        }
    }

    async fn stop_run(&self, force: bool) -> RunnerResult<()> {
        match self.agent().await {
            Some(agent) => Ok(agent.stop_run(force).await?),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agency::AgencyError;
    use crate::config::Config;
    use crate::result::tests::RecordingListener;

    #[tokio::test]
    async fn test_load_without_running_agency_fails() {
        let agency = Arc::new(TestAgency::new(&Config::default()));
        let runner = ProcessRunner::new(
            TestPackage::new("/tests/a.tests"),
            RuntimeFramework::any(),
            agency,
            Some(Duration::from_millis(50)),
        );
        assert_eq!(runner.kind(), RunnerKind::Process);

        let err = runner.load().await.unwrap_err();
        assert!(matches!(err, RunnerError::Agency(AgencyError::NotStarted)));
        assert!(runner.agent().await.is_none());
    }

    #[tokio::test]
    async fn test_unload_and_stop_without_agent_are_noops() {
        let agency = Arc::new(TestAgency::new(&Config::default()));
        let runner = ProcessRunner::new(TestPackage::new("/tests/a.tests"), RuntimeFramework::any(), agency, None);

        runner.stop_run(true).await.unwrap();
        runner.unload().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_needs_an_agent() {
        let agency = Arc::new(TestAgency::new(&Config::default()));
        let runner = ProcessRunner::new(TestPackage::new("/tests/a.tests"), RuntimeFramework::any(), agency, None);

        let result = runner
            .run(Arc::new(RecordingListener::default()), &TestFilter::empty())
            .await;
        assert!(result.is_err());
    }
}
