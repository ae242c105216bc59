//! Driver for libtest-style test executables.
//!
//! Any binary that speaks the command line of Rust's built-in test harness
//! can be loaded, explored and run:
//!
//! | Step | Command | Output parsed |
//! |------|---------|---------------|
//! | Discovery | `<exe> --list --format terse` | `name: test` lines |
//! | Run all | `<exe> [--test-threads N]` | `test name ... ok` lines |
//! | Run some | `<exe> name... --exact [--test-threads N]` | same |
//!
//! Failure output is taken from the `---- name stdout ----` sections that
//! the harness prints after the last result line.
//!
//! # Stopping
//!
//! A graceful stop lets the executable finish, since the harness cannot be
//! interrupted between tests. A forced stop, or cancellation of the
//! context's abort token, kills the process. Cases that never reported are
//! then marked cancelled.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DriverError, DriverResult, ExecutionContext, TestDriver};
use crate::result::{Outcome, ResultKind, TestEngineResult, TestEvent, TestEventListener, TestFilter};

/// Runs the tests of a single test executable.
pub struct ExecutableDriver {
    path: PathBuf,
    state: Mutex<DriverState>,
}

#[derive(Default)]
struct DriverState {
    /// The file actually executed, which is a shadow copy when requested.
    program: Option<PathBuf>,
    cases: Option<Vec<String>>,
    run: Option<RunControl>,
}

#[derive(Clone, Default)]
struct RunControl {
    stop: CancellationToken,
    kill: CancellationToken,
}

enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl ExecutableDriver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(DriverState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn suite_name(&self) -> String {
        self.path.display().to_string()
    }

    fn loaded(&self) -> DriverResult<(PathBuf, Vec<String>)> {
        let state = self.state();
        match (&state.program, &state.cases) {
            (Some(program), Some(cases)) => Ok((program.clone(), cases.clone())),
            _ => Err(DriverError::NotLoaded(self.path.clone())),
        }
    }

    /// Copies the executable into the shadow copy directory when one is set.
    async fn prepare(&self, context: &ExecutionContext) -> DriverResult<PathBuf> {
        let Some(dir) = &context.shadow_copy_dir else {
            return Ok(self.path.clone());
        };
        let Some(file_name) = self.path.file_name() else {
            return Ok(self.path.clone());
        };

        tokio::fs::create_dir_all(dir).await?;
        let copy = dir.join(file_name);
        tokio::fs::copy(&self.path, &copy).await?;
        debug!("Shadow copied {} to {}", self.path.display(), copy.display());
        Ok(copy)
    }

    fn command(&self, program: &Path, context: &ExecutionContext) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(program);
        command
            .current_dir(&context.working_dir)
            .envs(context.environment())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    fn explore_cases(&self, cases: &[String], filter: &TestFilter) -> TestEngineResult {
        let children = cases
            .iter()
            .filter(|name| filter.pass(name))
            .map(|name| TestEngineResult::new(name, ResultKind::Case))
            .collect();
        TestEngineResult::new(self.suite_name(), ResultKind::Suite).with_children(children)
    }
}

#[async_trait]
impl TestDriver for ExecutableDriver {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self, context: &ExecutionContext) -> DriverResult<TestEngineResult> {
        if !self.path.is_file() {
            return Err(DriverError::FileNotFound(self.path.clone()));
        }

        let program = self.prepare(context).await?;
        let output = self
            .command(&program, context)
            .args(["--list", "--format", "terse"])
            .output()
            .await
            .map_err(|source| DriverError::Spawn {
                path: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(DriverError::Discovery {
                path: self.path.clone(),
                message: format!(
                    "exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let cases = parse_list_output(&String::from_utf8_lossy(&output.stdout));
        if cases.is_empty() {
            warn!("No tests discovered in {}", self.path.display());
        } else {
            debug!("Discovered {} tests in {}", cases.len(), self.path.display());
        }

        let suite = self.explore_cases(&cases, &TestFilter::empty());
        let mut state = self.state();
        state.program = Some(program);
        state.cases = Some(cases);
        Ok(suite)
    }

    async fn count_test_cases(&self, filter: &TestFilter) -> DriverResult<usize> {
        let (_, cases) = self.loaded()?;
        Ok(cases.iter().filter(|name| filter.pass(name)).count())
    }

    async fn explore(&self, filter: &TestFilter) -> DriverResult<TestEngineResult> {
        let (_, cases) = self.loaded()?;
        Ok(self.explore_cases(&cases, filter))
    }

    async fn run(
        &self,
        listener: Arc<dyn TestEventListener>,
        filter: &TestFilter,
        context: &ExecutionContext,
    ) -> DriverResult<TestEngineResult> {
        let (program, cases) = self.loaded()?;
        let selected: Vec<String> = cases.into_iter().filter(|name| filter.pass(name)).collect();
        let suite_name = self.suite_name();

        listener.on_event(&TestEvent::SuiteStarted {
            name: suite_name.clone(),
        });

        if selected.is_empty() {
            let suite = TestEngineResult::new(&suite_name, ResultKind::Suite);
            listener.on_event(&TestEvent::SuiteFinished {
                name: suite_name,
                outcome: suite.outcome(),
            });
            return Ok(suite);
        }

        let control = RunControl::default();
        self.state().run = Some(control.clone());

        let mut command = self.command(&program, context);
        if !filter.is_empty() {
            command.args(&selected).arg("--exact");
        }
        if let Some(workers) = context.workers {
            command.arg("--test-threads").arg(workers.max(1).to_string());
        }
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        info!("Running {} tests from {}", selected.len(), self.path.display());
        let started = chrono::Utc::now();
        let clock = Instant::now();

        let mut child = command.spawn().map_err(|source| DriverError::Spawn {
            path: program.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::Io(std::io::Error::other("stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DriverError::Io(std::io::Error::other("stderr not captured")))?;

        let stdout_stream = tokio_stream::wrappers::LinesStream::new(BufReader::new(stdout).lines())
            .map(|line: std::io::Result<String>| OutputLine::Stdout(line.unwrap_or_default()));
        let stderr_stream = tokio_stream::wrappers::LinesStream::new(BufReader::new(stderr).lines())
            .map(|line: std::io::Result<String>| OutputLine::Stderr(line.unwrap_or_default()));
        let mut lines = Box::pin(stream::select(stdout_stream, stderr_stream));

        let mut parser = LibtestParser::default();
        let mut captured = String::new();
        let mut killed = false;

        loop {
            select! {
                line = lines.next() => match line {
                    Some(OutputLine::Stdout(line)) => {
                        for event in parser.push_line(&line) {
                            listener.on_event(&event);
                        }
                    }
                    Some(OutputLine::Stderr(line)) => {
                        debug!("{}: {}", self.path.display(), line);
                        captured.push_str(&line);
                        captured.push('\n');
                    }
                    None => break,
                },
                _ = control.kill.cancelled() => {
                    killed = true;
                    break;
                }
                _ = context.abort_token().cancelled() => {
                    killed = true;
                    break;
                }
            }
        }

        if killed {
            warn!("Killing test process for {}", self.path.display());
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill {}: {}", self.path.display(), e);
            }
        }
        for event in parser.finish() {
            listener.on_event(&event);
        }

        let status = child.wait().await?;
        self.state().run = None;
        if control.stop.is_cancelled() {
            debug!("Run of {} was asked to stop and has finished", self.path.display());
        }

        let children = selected
            .iter()
            .map(|name| parser.case_result(name, killed, &status))
            .collect();
        let mut suite = TestEngineResult::new(&suite_name, ResultKind::Suite)
            .with_children(children)
            .with_output(captured);
        suite.stamp(started, chrono::Utc::now());
        suite.duration = clock.elapsed();

        listener.on_event(&TestEvent::SuiteFinished {
            name: suite_name,
            outcome: suite.outcome(),
        });
        Ok(suite)
    }

    fn stop_run(&self, force: bool) {
        if let Some(control) = &self.state().run {
            control.stop.cancel();
            if force {
                control.kill.cancel();
            }
        }
    }
}

/// Extracts test names from `--list --format terse` output.
fn parse_list_output(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_suffix(": test"))
        .map(str::to_string)
        .collect()
}

/// Parses a `test <name> ... <status>` line.
fn parse_result_line(line: &str) -> Option<(String, Outcome, Option<String>)> {
    let rest = line.strip_prefix("test ")?;
    let (name, status) = rest.split_once(" ... ")?;
    let status = status.trim();

    let (outcome, message) = if status == "ok" {
        (Outcome::Passed, None)
    } else if status.starts_with("FAILED") {
        (Outcome::Failed, None)
    } else if let Some(reason) = status.strip_prefix("ignored") {
        let reason = reason.trim_start_matches(',').trim();
        (Outcome::Skipped, (!reason.is_empty()).then(|| reason.to_string()))
    } else {
        return None;
    };

    Some((name.trim().to_string(), outcome, message))
}

/// Incremental parser for the harness's human-readable output.
#[derive(Debug, Default)]
struct LibtestParser {
    outcomes: HashMap<String, (Outcome, Option<String>)>,
    failures: HashMap<String, String>,
    section: Option<(String, Vec<String>)>,
}

impl LibtestParser {
    /// Consumes one stdout line, returning the events it completes.
    fn push_line(&mut self, line: &str) -> Vec<TestEvent> {
        let mut events = Vec::new();

        if let Some(name) = line
            .strip_prefix("---- ")
            .and_then(|l| l.strip_suffix(" stdout ----"))
        {
            events.extend(self.close_section());
            self.section = Some((name.to_string(), Vec::new()));
            return events;
        }

        if line == "failures:" || line == "successes:" {
            events.extend(self.close_section());
            return events;
        }

        if let Some((_, lines)) = &mut self.section {
            lines.push(line.to_string());
            return events;
        }

        if let Some((name, outcome, message)) = parse_result_line(line) {
            events.push(TestEvent::TestStarted { name: name.clone() });
            events.push(TestEvent::TestFinished {
                name: name.clone(),
                outcome,
                duration_ms: 0,
                message: message.clone(),
            });
            self.outcomes.insert(name, (outcome, message));
        }

        events
    }

    fn finish(&mut self) -> Vec<TestEvent> {
        self.close_section().into_iter().collect()
    }

    fn close_section(&mut self) -> Option<TestEvent> {
        let (name, lines) = self.section.take()?;
        let text = lines.join("\n").trim().to_string();
        if text.is_empty() {
            return None;
        }
        self.failures.insert(name.clone(), text.clone());
        Some(TestEvent::TestOutput { name, text })
    }

    fn case_result(&self, name: &str, killed: bool, status: &std::process::ExitStatus) -> TestEngineResult {
        match self.outcomes.get(name) {
            Some((outcome, message)) => {
                let mut case = TestEngineResult::case(name, *outcome);
                let failure = self.failures.get(name).cloned();
                case.message = message.clone().or_else(|| failure.clone());
                if let Some(output) = failure {
                    case.output = output;
                }
                case
            }
            None if killed => TestEngineResult::cancelled(
                name,
                ResultKind::Case,
                "The test process was stopped before this test finished",
            ),
            None => TestEngineResult::error(
                name,
                ResultKind::Case,
                format!("The test process exited with {} before reporting a result", status),
            ),
        }
    }
}
