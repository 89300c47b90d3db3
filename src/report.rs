//! Test reporting and output generation.
//!
//! Both reporters are [`ExecutionListener`]s fed by the tracker:
//! [`ConsoleListener`] prints results as they arrive and a summary at the
//! end, [`JUnitListener`] writes a JUnit XML file when the run finishes.

pub mod junit;

pub use junit::JUnitListener;

use std::time::{Duration, Instant};

use crate::listener::ExecutionListener;
use crate::outcome::Outcome;
use crate::scope::{Scope, ScopeId};

/// Counts collected over one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Cases pytest ran without them being discovered beforehand.
    pub dynamic: usize,
    pub reruns: usize,
    /// Outcome of the run scope, once it finished.
    pub run_outcome: Option<Outcome>,
    pub duration: Duration,
}

impl RunSummary {
    /// Returns `true` if the run finished successfully and no case failed.
    pub fn success(&self) -> bool {
        self.failed == 0 && self.run_outcome.as_ref().is_some_and(Outcome::is_success)
    }
}

/// Prints case results and the final summary to stdout.
#[derive(Debug, Default)]
pub struct ConsoleListener {
    summary: RunSummary,
    started_at: Option<Instant>,
    verbose: bool,
}

impl ConsoleListener {
    /// Creates a console listener. Passed cases are only listed when
    /// `verbose` is set.
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            ..Default::default()
        }
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }
}

impl ExecutionListener for ConsoleListener {
    fn started(&mut self, scope: &Scope) {
        match scope.id() {
            ScopeId::Run => self.started_at = Some(Instant::now()),
            ScopeId::Group(name) if self.verbose => println!("{}", console::style(name).bold()),
            _ => {}
        }
    }

    fn finished(&mut self, scope: &Scope, outcome: &Outcome) {
        let ScopeId::Case { group, test } = scope.id() else {
            if *scope.id() == ScopeId::Run {
                self.summary.run_outcome = Some(outcome.clone());
                self.summary.duration = self.started_at.map(|t| t.elapsed()).unwrap_or_default();
            } else if !outcome.is_success() {
                println!("{} {}: {}", console::style("ABORT").yellow(), group_of(scope), outcome);
            }
            return;
        };

        self.summary.total += 1;
        let status = match outcome {
            Outcome::Success => {
                self.summary.passed += 1;
                console::style("PASS").green()
            }
            Outcome::Aborted { .. } => {
                self.summary.skipped += 1;
                console::style("SKIP").yellow()
            }
            Outcome::Failed(_) => {
                self.summary.failed += 1;
                console::style("FAIL").red()
            }
        };

        if self.verbose || !outcome.is_success() {
            println!("{} {}::{}", status, group, test);
        }
        if let Outcome::Failed(failure) = outcome {
            for line in failure.to_string().lines() {
                println!("    {}", console::style(line).dim());
            }
        }
    }

    fn dynamically_registered(&mut self, scope: &Scope) {
        if let ScopeId::Case { test, .. } = scope.id() {
            if test.contains("-pytest_rerun-") {
                self.summary.reruns += 1;
            } else {
                self.summary.dynamic += 1;
            }
        }
    }
}

fn group_of(scope: &Scope) -> &str {
    scope.id().group_name().unwrap_or(scope.display_name())
}

/// Prints a summary of test results to the console.
pub fn print_summary(summary: &RunSummary) {
    println!();
    println!("Test Results:");
    println!("  Total:   {}", summary.total);
    println!("  Passed:  {}", console::style(summary.passed).green());
    println!("  Failed:  {}", console::style(summary.failed).red());
    println!("  Skipped: {}", console::style(summary.skipped).yellow());

    if summary.reruns > 0 {
        println!("  Reruns:  {}", console::style(summary.reruns).yellow());
    }
    if summary.dynamic > 0 {
        println!("  Not discovered beforehand: {}", summary.dynamic);
    }

    println!("  Duration: {:?}", summary.duration);

    println!();
    match &summary.run_outcome {
        _ if summary.success() => {
            println!("{}", console::style("All tests passed!").green().bold());
        }
        Some(Outcome::Failed(failure)) => {
            println!("{}", console::style("pytest session failed:").red().bold());
            println!("{}", console::style(&failure.message).dim());
        }
        None => {
            println!(
                "{}",
                console::style("No test session was run.").red().bold()
            );
        }
        _ => println!("{}", console::style("Some tests failed.").red().bold()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{CollectEntry, ScopeTree};

    #[test]
    fn test_summary_counts() {
        let mut tree = ScopeTree::new();
        let a = tree.insert(&CollectEntry::new("pkg.py", "Thing", "a", "a"));
        let b = tree.insert(&CollectEntry::new("pkg.py", "Thing", "b", "b"));
        let c = tree.insert(&CollectEntry::new("pkg.py", "Thing", "c", "c"));
        let (rerun, _) = tree.add_case("pkg.Thing", "a-pytest_rerun-1");

        let mut console = ConsoleListener::new(false);
        console.started(tree.root());
        console.finished(tree.scope(&a).unwrap(), &Outcome::Success);
        console.finished(tree.scope(&b).unwrap(), &Outcome::failed("boom"));
        console.finished(tree.scope(&c).unwrap(), &Outcome::aborted("skip"));
        console.dynamically_registered(tree.scope(&rerun).unwrap());
        console.finished(tree.root(), &Outcome::Success);

        let summary = console.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.reruns, 1);
        assert!(!summary.success());
    }

    #[test]
    fn test_success_requires_finished_run() {
        let mut summary = RunSummary::default();
        assert!(!summary.success());
        summary.run_outcome = Some(Outcome::Success);
        assert!(summary.success());
        summary.run_outcome = Some(Outcome::failed("EXIT_USAGEERROR"));
        assert!(!summary.success());
    }
}
