//! Concurrent dispatch of work items.
//!
//! A [`WorkItemDispatcher`] runs a list of [`WorkItem`]s with a bounded
//! level of parallelism and returns their results in input order.
//!
//! # Cancellation
//!
//! | Call | Items not started | Items in flight |
//! |------|-------------------|-----------------|
//! | `cancel_run(false)` | reported as not run | run to completion |
//! | `cancel_run(true)` | reported as not run | abandoned, reported cancelled |
//!
//! Work items see both tokens through their [`WorkContext`] and may stop
//! early on their own.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::result::{ResultKind, TestEngineResult};

/// Cancellation state shared by all items of one dispatch.
#[derive(Debug, Clone, Default)]
pub struct WorkContext {
    stop: CancellationToken,
    abort: CancellationToken,
}

impl WorkContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a context whose tokens are children of `parent`'s tokens.
    pub fn child_of(parent: &WorkContext) -> Self {
        Self {
            stop: parent.stop.child_token(),
            abort: parent.abort.child_token(),
        }
    }

    /// Cancelled when a graceful stop is requested.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Cancelled when in-flight work must be abandoned.
    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled() || self.abort.is_cancelled()
    }
}

/// A schedulable unit of test execution.
#[async_trait]
pub trait WorkItem: Send + Sync {
    fn name(&self) -> &str;

    /// Kind of the node reported when the item does not run.
    fn kind(&self) -> ResultKind {
        ResultKind::Package
    }

    /// Runs the item. Failures are reported in the returned result.
    async fn execute(&self, context: &WorkContext) -> TestEngineResult;
}

/// Runs work items with bounded concurrency.
pub struct WorkItemDispatcher {
    level_of_parallelism: usize,
    context: Mutex<WorkContext>,
}

impl WorkItemDispatcher {
    /// Creates a dispatcher running at most `level_of_parallelism` items at
    /// once. Zero is treated as one.
    pub fn new(level_of_parallelism: usize) -> Self {
        Self {
            level_of_parallelism: level_of_parallelism.max(1),
            context: Mutex::new(WorkContext::new()),
        }
    }

    pub fn level_of_parallelism(&self) -> usize {
        self.level_of_parallelism
    }

    /// Snapshot of the context handed to work items.
    pub fn context(&self) -> WorkContext {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Clears a previous cancellation so the dispatcher can run again.
    pub fn reset(&self) {
        *self.context.lock().unwrap_or_else(PoisonError::into_inner) = WorkContext::new();
    }

    /// Runs `items` and returns one result per item, in input order.
    pub async fn dispatch(&self, items: Vec<Arc<dyn WorkItem>>) -> Vec<TestEngineResult> {
        let context = self.context();
        debug!(
            "Dispatching {} work items, parallelism {}",
            items.len(),
            self.level_of_parallelism
        );

        let pending: Vec<BoxFuture<'static, (usize, TestEngineResult)>> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let context = context.clone();
                async move { (index, run_item(item.as_ref(), &context).await) }.boxed()
            })
            .collect();

        let mut results: Vec<(usize, TestEngineResult)> = stream::iter(pending)
            .buffer_unordered(self.level_of_parallelism)
            .collect()
            .await;

        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    /// Runs `items` and gathers their results under one parent node.
    pub async fn dispatch_tree(
        &self,
        name: impl Into<String>,
        kind: ResultKind,
        items: Vec<Arc<dyn WorkItem>>,
    ) -> TestEngineResult {
        let children = self.dispatch(items).await;
        TestEngineResult::new(name, kind).with_children(children)
    }

    /// Requests cancellation of the current dispatch.
    pub fn cancel_run(&self, force: bool) {
        let context = self.context();
        debug!("Cancelling dispatch (force: {})", force);
        context.stop.cancel();
        if force {
            context.abort.cancel();
        }
    }
}

async fn run_item(item: &dyn WorkItem, context: &WorkContext) -> TestEngineResult {
    if context.is_stop_requested() {
        return TestEngineResult::cancelled(item.name(), item.kind(), "Not run: the run was cancelled");
    }

    select! {
        biased;
        _ = context.abort.cancelled() => {
            debug!("Abandoning work item {}", item.name());
            TestEngineResult::cancelled(item.name(), item.kind(), "Abandoned: the run was aborted")
        }
        result = item.execute(context) => result,
    }
}
