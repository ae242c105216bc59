//! A runner that fans out to child runners.
//!
//! Loading, exploring and unloading walk the children in order. Runs are
//! handed to a [`WorkItemDispatcher`], so children run concurrently up to
//! the configured level of parallelism and their results come back in
//! package order.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use super::{RunnerKind, RunnerResult, TestEngineRunner};
use crate::execution::{WorkContext, WorkItem, WorkItemDispatcher};
use crate::package::TestPackage;
use crate::result::{ResultKind, TestEngineResult, TestEventListener, TestFilter};
use crate::runtime::RuntimeFramework;

/// Runs a package as a set of independent child runners.
pub struct AggregateTestRunner {
    kind: RunnerKind,
    package: TestPackage,
    runtime: RuntimeFramework,
    runners: Vec<Arc<dyn TestEngineRunner>>,
    level_of_parallelism: usize,
    dispatcher: Mutex<Option<Arc<WorkItemDispatcher>>>,
}

impl AggregateTestRunner {
    pub fn new(
        kind: RunnerKind,
        package: TestPackage,
        runtime: RuntimeFramework,
        runners: Vec<Arc<dyn TestEngineRunner>>,
        level_of_parallelism: usize,
    ) -> Self {
        Self {
            kind,
            package,
            runtime,
            runners,
            level_of_parallelism: level_of_parallelism.max(1),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn level_of_parallelism(&self) -> usize {
        self.level_of_parallelism
    }

    fn package_node(&self, children: Vec<TestEngineResult>) -> TestEngineResult {
        TestEngineResult::new(self.package.display_name(), ResultKind::Package).with_children(children)
    }

    fn child_error(runner: &dyn TestEngineRunner, message: String) -> TestEngineResult {
        TestEngineResult::error(runner.package().display_name(), ResultKind::Package, message)
    }
}

/// One child run scheduled on the dispatcher.
struct RunnerWorkItem {
    name: String,
    runner: Arc<dyn TestEngineRunner>,
    listener: Arc<dyn TestEventListener>,
    filter: TestFilter,
}

#[async_trait]
impl WorkItem for RunnerWorkItem {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, context: &WorkContext) -> TestEngineResult {
        if context.is_stop_requested() {
            return TestEngineResult::cancelled(&self.name, ResultKind::Package, "Not run: the run was cancelled");
        }

        match self.runner.run(self.listener.clone(), &self.filter).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Run of {} failed: {}", self.name, e);
                TestEngineResult::error(&self.name, ResultKind::Package, e.to_string())
            }
        }
    }
}

#[async_trait]
impl TestEngineRunner for AggregateTestRunner {
    fn kind(&self) -> RunnerKind {
        self.kind
    }

    fn runtime(&self) -> RuntimeFramework {
        self.runtime.clone()
    }

    fn package(&self) -> &TestPackage {
        &self.package
    }

    fn children(&self) -> Vec<Arc<dyn TestEngineRunner>> {
        self.runners.clone()
    }

    async fn load(&self) -> RunnerResult<TestEngineResult> {
        let mut children = Vec::with_capacity(self.runners.len());
        for runner in &self.runners {
            match runner.load().await {
                Ok(result) => children.push(result),
                Err(e) => {
                    warn!("Failed to load {}: {}", runner.package().display_name(), e);
                    children.push(Self::child_error(runner.as_ref(), e.to_string()));
                }
            }
        }
        Ok(self.package_node(children))
    }

    async fn reload(&self) -> RunnerResult<TestEngineResult> {
        let mut children = Vec::with_capacity(self.runners.len());
        for runner in &self.runners {
            match runner.reload().await {
                Ok(result) => children.push(result),
                Err(e) => children.push(Self::child_error(runner.as_ref(), e.to_string())),
            }
        }
        Ok(self.package_node(children))
    }

    async fn unload(&self) -> RunnerResult<()> {
        for runner in &self.runners {
            if let Err(e) = runner.unload().await {
                warn!("Failed to unload {}: {}", runner.package().display_name(), e);
            }
        }
        Ok(())
    }

    async fn explore(&self, filter: &TestFilter) -> RunnerResult<TestEngineResult> {
        let mut children = Vec::with_capacity(self.runners.len());
        for runner in &self.runners {
            match runner.explore(filter).await {
                Ok(result) => children.push(result),
                Err(e) => children.push(Self::child_error(runner.as_ref(), e.to_string())),
            }
        }
        Ok(self.package_node(children))
    }

    async fn count_test_cases(&self, filter: &TestFilter) -> RunnerResult<usize> {
        let mut count = 0;
        for runner in &self.runners {
            count += runner.count_test_cases(filter).await?;
        }
        Ok(count)
    }

    async fn run(
        &self,
        listener: Arc<dyn TestEventListener>,
        filter: &TestFilter,
    ) -> RunnerResult<TestEngineResult> {
        let dispatcher = Arc::new(WorkItemDispatcher::new(self.level_of_parallelism));
        *self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(dispatcher.clone());

        let items: Vec<Arc<dyn WorkItem>> = self
            .runners
            .iter()
            .map(|runner| {
                Arc::new(RunnerWorkItem {
                    name: runner.package().display_name(),
                    runner: runner.clone(),
                    listener: listener.clone(),
                    filter: filter.clone(),
                }) as Arc<dyn WorkItem>
            })
            .collect();

        debug!(
            "Running {} child runners of {}, parallelism {}",
            items.len(),
            self.package.display_name(),
            self.level_of_parallelism
        );
        let start = Utc::now();
        let children = dispatcher.dispatch(items).await;
        let mut result = self.package_node(children);
        result.stamp(start, Utc::now());
        Ok(result)
    }

    async fn stop_run(&self, force: bool) -> RunnerResult<()> {
        for runner in &self.runners {
            if let Err(e) = runner.stop_run(force).await {
                warn!("Failed to stop {}: {}", runner.package().display_name(), e);
            }
        }

        let dispatcher = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(dispatcher) = dispatcher {
            dispatcher.cancel_run(force);
        }
        Ok(())
    }
}
