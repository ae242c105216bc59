//! Test results, progress events, listeners and filters.
//!
//! Results form a tree that mirrors the runner hierarchy:
//!
//! ```text
//! Run
//! └── Package "a.tests"
//!     └── Suite "/abs/path/a.tests"
//!         ├── Case "math::adds"       Passed
//!         └── Case "math::divides"    Failed
//! ```
//!
//! Only cases carry their own outcome. Every other node reports the worst
//! outcome found below it, unless an outcome was recorded on the node
//! itself (for example a file that failed to load).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Level of a node in the result tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Run,
    Package,
    Suite,
    Case,
}

/// The outcome of a test or of a group of tests.
///
/// Variants are ordered from best to worst, so the outcome of a group is
/// the maximum of its children.
///
/// | Outcome | Counts as failure |
/// |---------|-------------------|
/// | Passed | No |
/// | Skipped | No |
/// | Cancelled | No |
/// | Failed | Yes |
/// | Error | Yes |
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Skipped,
    Cancelled,
    Failed,
    Error,
}

impl Outcome {
    /// Returns `true` if this outcome does not fail the run.
    ///
    /// # Example
    ///
    /// ```
    /// use testagency::result::Outcome;
    ///
    /// assert!(Outcome::Passed.is_success());
    /// assert!(Outcome::Skipped.is_success());
    /// assert!(!Outcome::Failed.is_success());
    /// ```
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Passed | Outcome::Skipped | Outcome::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Skipped => "skipped",
            Outcome::Cancelled => "cancelled",
            Outcome::Failed => "failed",
            Outcome::Error => "error",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in the result tree.
///
/// Results cross the agent wire, so the whole tree is serializable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestEngineResult {
    pub name: String,
    pub kind: ResultKind,

    /// Outcome recorded on this node. `None` on group nodes that simply
    /// aggregate their children.
    pub outcome: Option<Outcome>,

    /// Failure or error description.
    pub message: Option<String>,

    /// Captured output.
    #[serde(default)]
    pub output: String,

    #[serde(default)]
    pub duration: Duration,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub children: Vec<TestEngineResult>,
}

impl TestEngineResult {
    pub fn new(name: impl Into<String>, kind: ResultKind) -> Self {
        Self {
            name: name.into(),
            kind,
            outcome: None,
            message: None,
            output: String::new(),
            duration: Duration::ZERO,
            start_time: None,
            end_time: None,
            children: Vec::new(),
        }
    }

    /// A single test case with a known outcome.
    pub fn case(name: impl Into<String>, outcome: Outcome) -> Self {
        Self::new(name, ResultKind::Case).with_outcome(outcome)
    }

    /// A node describing something that could not be loaded or run.
    pub fn error(name: impl Into<String>, kind: ResultKind, message: impl Into<String>) -> Self {
        Self::new(name, kind)
            .with_outcome(Outcome::Error)
            .with_message(message)
    }

    /// A node for work that was cancelled before or while running.
    pub fn cancelled(name: impl Into<String>, kind: ResultKind, message: impl Into<String>) -> Self {
        Self::new(name, kind)
            .with_outcome(Outcome::Cancelled)
            .with_message(message)
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_children(mut self, children: Vec<TestEngineResult>) -> Self {
        self.children = children;
        self
    }

    pub fn add_child(&mut self, child: TestEngineResult) {
        self.children.push(child);
    }

    /// Records wall-clock start and end, and the duration between them.
    pub fn stamp(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self.duration = (end - start).to_std().unwrap_or_default();
    }

    /// The effective outcome: the worst of this node's own outcome and the
    /// outcomes of its children. An empty group counts as passed.
    pub fn outcome(&self) -> Outcome {
        self.children
            .iter()
            .map(TestEngineResult::outcome)
            .chain(self.outcome)
            .max()
            .unwrap_or(Outcome::Passed)
    }

    /// Counts test cases by outcome.
    ///
    /// Group nodes without children that carry an error or cancellation
    /// (an unloadable file, a work item that never started) are counted as
    /// well, so they are not silently lost from the totals.
    pub fn summary(&self) -> ResultSummary {
        let mut summary = ResultSummary::default();
        self.accumulate(&mut summary);
        summary
    }

    fn accumulate(&self, summary: &mut ResultSummary) {
        match (self.kind, self.outcome) {
            (ResultKind::Case, outcome) => summary.add(outcome.unwrap_or(Outcome::Passed)),
            (_, Some(outcome @ (Outcome::Error | Outcome::Cancelled))) if self.children.is_empty() => {
                summary.add(outcome)
            }
            _ => {}
        }

        for child in &self.children {
            child.accumulate(summary);
        }
    }

    /// Every case node in depth-first order.
    pub fn cases(&self) -> Vec<&TestEngineResult> {
        let mut cases = Vec::new();
        self.collect_cases(&mut cases);
        cases
    }

    fn collect_cases<'a>(&'a self, out: &mut Vec<&'a TestEngineResult>) {
        if self.kind == ResultKind::Case {
            out.push(self);
        }
        for child in &self.children {
            child.collect_cases(out);
        }
    }
}

/// Outcome counts for a result tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl ResultSummary {
    fn add(&mut self, outcome: Outcome) {
        self.total += 1;
        match outcome {
            Outcome::Passed => self.passed += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Error => self.errors += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Cancelled => self.cancelled += 1,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.errors == 0
    }
}

/// Progress notifications emitted while tests run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TestEvent {
    RunStarted {
        count: usize,
    },
    SuiteStarted {
        name: String,
    },
    TestStarted {
        name: String,
    },
    TestOutput {
        name: String,
        text: String,
    },
    TestFinished {
        name: String,
        outcome: Outcome,
        duration_ms: u64,
        message: Option<String>,
    },
    SuiteFinished {
        name: String,
        outcome: Outcome,
    },
    RunFinished {
        outcome: Outcome,
        duration_ms: u64,
    },
}

/// Receives progress events.
///
/// Listeners are called synchronously from the thread producing the event
/// and must not block.
pub trait TestEventListener: Send + Sync {
    fn on_event(&self, event: &TestEvent);
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl TestEventListener for NullListener {
    fn on_event(&self, _event: &TestEvent) {}
}

/// Fans events out to several listeners, in order.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    listeners: Vec<Arc<dyn TestEventListener>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<dyn TestEventListener>) {
        self.listeners.push(listener);
    }

    pub fn with(mut self, listener: Arc<dyn TestEventListener>) -> Self {
        self.add(listener);
        self
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl TestEventListener for EventDispatcher {
    fn on_event(&self, event: &TestEvent) {
        for listener in &self.listeners {
            listener.on_event(event);
        }
    }
}

/// Selects which test cases to explore or run.
///
/// An empty filter selects everything. Names match full case names exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFilter {
    names: Vec<String>,
}

impl TestFilter {
    /// The filter that selects every test.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn pass(&self, name: &str) -> bool {
        self.names.is_empty() || self.names.iter().any(|n| n == name)
    }
}
