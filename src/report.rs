//! Console output for runs started from the command line.

use std::sync::{Mutex, PoisonError};

use indicatif::{ProgressBar, ProgressStyle};

use crate::result::{Outcome, ResultKind, TestEngineResult, TestEvent, TestEventListener};

/// Prints the counts of a finished run, followed by the failing cases.
pub fn print_summary(result: &TestEngineResult) {
    let summary = result.summary();

    println!();
    println!("Test Results:");
    println!("  Total:     {}", summary.total);
    println!("  Passed:    {}", console::style(summary.passed).green());
    println!("  Failed:    {}", console::style(summary.failed).red());
    println!("  Skipped:   {}", console::style(summary.skipped).yellow());

    if summary.errors > 0 {
        println!("  Errors:    {}", console::style(summary.errors).red().bold());
    }
    if summary.cancelled > 0 {
        println!("  Cancelled: {}", console::style(summary.cancelled).yellow());
    }

    println!("  Duration:  {:?}", result.duration);

    println!();
    if summary.is_success() {
        println!("{}", console::style("All tests passed!").green().bold());
        return;
    }

    println!("{}", console::style("Some tests failed.").red().bold());
    println!();
    println!("Failures:");
    for failure in failures(result) {
        println!("  - {}", failure.name);
        if let Some(message) = &failure.message {
            for line in message.lines() {
                println!("    {}", console::style(line).dim());
            }
        }
    }
}

/// Failed cases, plus groups that could not be loaded or run at all.
pub fn failures(result: &TestEngineResult) -> Vec<&TestEngineResult> {
    let mut found = Vec::new();
    collect_failures(result, &mut found);
    found
}

fn collect_failures<'a>(node: &'a TestEngineResult, out: &mut Vec<&'a TestEngineResult>) {
    let own_failure = node.outcome.is_some_and(|o| !o.is_success());
    if own_failure && (node.kind == ResultKind::Case || node.children.is_empty()) {
        out.push(node);
    }
    for child in &node.children {
        collect_failures(child, out);
    }
}

/// Progress bar driven by test events.
pub struct ConsoleListener {
    progress: Mutex<Option<ProgressBar>>,
    verbose: bool,
}

impl ConsoleListener {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-")
    }
}

impl TestEventListener for ConsoleListener {
    fn on_event(&self, event: &TestEvent) {
        let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);

        match event {
            TestEvent::RunStarted { count } => {
                let bar = ProgressBar::new(*count as u64);
                bar.set_style(Self::style());
                *progress = Some(bar);
            }
            TestEvent::TestStarted { name } if self.verbose => {
                if let Some(bar) = progress.as_ref() {
                    bar.println(format!("Running: {}", name));
                }
            }
            TestEvent::TestFinished { name, outcome, .. } => {
                let Some(bar) = progress.as_ref() else {
                    return;
                };
                bar.inc(1);

                let status = match outcome {
                    Outcome::Passed => console::style("PASS").green(),
                    Outcome::Failed => console::style("FAIL").red(),
                    Outcome::Skipped => console::style("SKIP").yellow(),
                    Outcome::Cancelled => console::style("STOP").yellow(),
                    Outcome::Error => console::style("ERR ").red().bold(),
                };
                if self.verbose || *outcome != Outcome::Passed {
                    bar.println(format!("{} {}", status, name));
                }
            }
            TestEvent::RunFinished { .. } => {
                if let Some(bar) = progress.take() {
                    bar.finish_and_clear();
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_include_broken_groups() {
        let result = TestEngineResult::new("run", ResultKind::Run).with_children(vec![
            TestEngineResult::new("a", ResultKind::Suite).with_children(vec![
                TestEngineResult::case("a::ok", Outcome::Passed),
                TestEngineResult::case("a::bad", Outcome::Failed).with_message("boom"),
                TestEngineResult::case("a::skip", Outcome::Skipped),
            ]),
            TestEngineResult::error("missing.tests", ResultKind::Suite, "File not found"),
        ]);

        let names: Vec<_> = failures(&result).iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a::bad", "missing.tests"]);
    }

    #[test]
    fn test_listener_tracks_run() {
        let listener = ConsoleListener::new(false);
        listener.on_event(&TestEvent::RunStarted { count: 2 });
        listener.on_event(&TestEvent::TestFinished {
            name: "a".into(),
            outcome: Outcome::Passed,
            duration_ms: 1,
            message: None,
        });
        assert_eq!(
            listener.progress.lock().unwrap().as_ref().map(|b| b.position()),
            Some(1)
        );

        listener.on_event(&TestEvent::RunFinished {
            outcome: Outcome::Passed,
            duration_ms: 1,
        });
        assert!(listener.progress.lock().unwrap().is_none());
    }
}
