//! Reconciliation of the plugin's message stream into lifecycle events.
//!
//! pytest reports tests one at a time and never says when a test class is
//! done. The [`ExecutionTracker`] turns the flat stream into properly nested
//! `started`/`finished` pairs over the run → group → case hierarchy:
//!
//! ```text
//! running stack          event
//! ─────────────          ─────
//! [run]                  process started
//! [run, A]               case A::a started  (group A opened implicitly)
//! [run, A, a]
//! [run, A]               case a finished
//! [run, A, b]            case A::b started
//! [run, A]               case b finished
//! [run, B, c]            case B::c started  (group A closed implicitly)
//! []                     session finished   (everything still open closed)
//! ```
//!
//! # Guarantees
//!
//! - The running stack is always a prefix of run → group → case.
//! - A scope is never started twice without finishing in between; a case
//!   that pytest runs again after it finished is reported under a new
//!   identity `<test>-pytest_rerun-<n>`.
//! - Every started scope is finished exactly once by the end of the session,
//!   with forced outcomes when pytest never said how it ended.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::artifacts::{ArtifactCollector, NoArtifacts};
use crate::config::BridgeConfig;
use crate::listener::ExecutionListener;
use crate::outcome::{CaseVerdict, Failure, FailureReport, Outcome};
use crate::output::CapturedOutput;
use crate::protocol::{Blocks, BridgeError, BridgeResult};
use crate::scope::{CollectEntry, ScopeId, ScopeTree};
use crate::trace::{FrameLocation, build_trace};

/// Reason given to a case closed because another one started.
pub const NO_RESULT_RECEIVED: &str = "No test result received";

/// Message of the session failure when pytest exits without finishing it.
pub const NO_RESULT_FROM_PYTEST: &str = "No result received from pytest";

/// Diagnostic switches of the tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerSettings {
    pub verbose: bool,
    pub debug: bool,
    /// Print captured output and collect artifacts of passed tests too.
    pub keep_output_for_passed: bool,
}

impl TrackerSettings {
    /// Debug output implies verbose output.
    pub fn is_verbose(&self) -> bool {
        self.verbose || self.debug
    }
}

impl From<&BridgeConfig> for TrackerSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            verbose: config.verbose,
            debug: config.debug,
            keep_output_for_passed: config.keep_output_for_passed,
        }
    }
}

#[derive(Debug, Clone)]
struct Running {
    /// Identity reported to the listener.
    id: ScopeId,
    /// Identity pytest used; differs from `id` for reruns.
    base: ScopeId,
}

/// The stateful core of the bridge.
///
/// Holds the scope tree, the stack of running scopes and the completion
/// counters, and emits lifecycle events to the listener `L`.
pub struct ExecutionTracker<L> {
    tree: ScopeTree,
    listener: L,
    settings: TrackerSettings,
    running: Vec<Running>,
    finished: HashMap<ScopeId, u32>,
    last_case_result: HashMap<String, Outcome>,
    internal_error: Option<String>,
    output: CapturedOutput,
    artifacts: Box<dyn ArtifactCollector + Send>,
    working_dir: PathBuf,
}

impl<L: ExecutionListener> ExecutionTracker<L> {
    /// Creates a tracker over a (possibly empty) discovered scope tree.
    pub fn new(tree: ScopeTree, listener: L, settings: TrackerSettings) -> Self {
        Self {
            tree,
            listener,
            settings,
            running: Vec::with_capacity(3),
            finished: HashMap::new(),
            last_case_result: HashMap::new(),
            internal_error: None,
            output: CapturedOutput::stdio(),
            artifacts: Box::new(NoArtifacts),
            working_dir: PathBuf::from("."),
        }
    }

    /// Sets the sinks for captured test output.
    pub fn with_output(mut self, output: CapturedOutput) -> Self {
        self.output = output;
        self
    }

    /// Sets the collector for declared test outputs, resolved against
    /// pytest's working directory.
    pub fn with_artifacts(
        mut self,
        artifacts: impl ArtifactCollector + Send + 'static,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        self.artifacts = Box::new(artifacts);
        self.working_dir = working_dir.into();
        self
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    pub fn tree(&self) -> &ScopeTree {
        &self.tree
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    pub fn into_listener(self) -> L {
        self.listener
    }

    /// Identities on the running stack, outermost first.
    pub fn running_scopes(&self) -> impl Iterator<Item = &ScopeId> {
        self.running.iter().map(|r| &r.id)
    }

    /// Returns `true` while any scope is open.
    pub fn is_running(&self) -> bool {
        !self.running.is_empty()
    }

    /// Qualified name of the running group.
    pub fn current_group(&self) -> Option<&str> {
        self.running.get(1).and_then(|r| r.id.group_name())
    }

    /// Test name of the running case, including any rerun suffix.
    pub fn current_case(&self) -> Option<&str> {
        match self.running.get(2).map(|r| &r.id) {
            Some(ScopeId::Case { test, .. }) => Some(test),
            _ => None,
        }
    }

    /// The pytest process was launched.
    pub fn process_started(&mut self) -> BridgeResult<()> {
        if self.settings.is_verbose() {
            debug!("Process started");
        }
        if self.running.is_empty() {
            self.start(ScopeId::Run)?;
        }
        Ok(())
    }

    /// pytest reported the start of its session.
    ///
    /// Opens the run unless the process start already did.
    pub fn session_started(&mut self) -> BridgeResult<()> {
        if self.settings.is_verbose() {
            debug!("Session started (running: {})", self.running.len());
        }
        if self.running.is_empty() {
            self.start(ScopeId::Run)?;
        }
        Ok(())
    }

    /// pytest is about to run a test.
    ///
    /// Registers unknown groups and cases, closes whatever the new case
    /// displaces and opens the new group and case.
    ///
    /// # Errors
    ///
    /// [`BridgeError::InvalidIdentity`] if the identity fields cannot be
    /// mapped to a group and case, [`BridgeError::Rerun`] if a finished
    /// group is started again.
    pub fn case_started(&mut self, nodeid: &str, fspath: &str, domain: &str) -> BridgeResult<()> {
        if self.settings.is_verbose() {
            debug!("Case started: {} / {} / {}", nodeid, fspath, domain);
        }

        let entry = CollectEntry::from_report(nodeid, fspath, domain).ok_or_else(|| {
            BridgeError::InvalidIdentity {
                nodeid: nodeid.to_string(),
                fspath: fspath.to_string(),
                domain: domain.to_string(),
            }
        })?;

        if self.running.is_empty() {
            warn!("Ignoring start of {} outside of a running session", nodeid);
            return Ok(());
        }

        let (group_id, new_group) = self.tree.add_group(&entry);
        if new_group {
            self.registered(&group_id);
        }
        let (case_id, new_case) = self.tree.add_case(entry.qualified_name(), entry.test());
        if new_case {
            self.registered(&case_id);
        }

        if self.running.len() == 3 && self.running[2].base != case_id {
            self.finish_top(&Outcome::aborted(NO_RESULT_RECEIVED));
        }
        if self.running.len() == 2 && self.running[1].id != group_id {
            let last = self.current_group().and_then(|g| self.last_case_result.get(g));
            let outcome = Outcome::for_group(last);
            self.finish_top(&outcome);
        }

        if self.running.len() == 1 {
            self.start(group_id)?;
        }
        if self.running.len() == 2 {
            self.start(case_id)?;
        }
        Ok(())
    }

    /// The running case finished. Ignored when no case is running.
    pub fn case_finished(&mut self, outcome: Outcome) {
        if self.settings.is_verbose() {
            debug!("Case finished: {}", outcome);
        }

        if self.running.len() != 3 {
            debug!("Ignoring case result {}: no test case running", outcome);
            return;
        }

        let group = self.current_group().map(str::to_string);
        self.finish_top(&outcome);
        if let Some(group) = group {
            self.last_case_result.insert(group, outcome);
        }
    }

    /// The running case failed; builds the failure with its stack trace.
    pub fn case_failed(&mut self, report: FailureReport) {
        let (Some(group), Some(case)) = (self.running.get(1), self.running.get(2)) else {
            debug!("Ignoring case failure: no test case running");
            return;
        };

        let declaring_scope = group.id.group_name().unwrap_or_default();
        let method = self
            .tree
            .scope(&case.id)
            .and_then(|s| s.method_name())
            .unwrap_or_default();
        let path = report.path.as_deref().unwrap_or_default();

        if self.settings.is_verbose() {
            debug!(
                "Case failed: {}:{} --> {}",
                path,
                report.line,
                report.message.as_deref().unwrap_or_default()
            );
        }

        let trace = build_trace(
            report.traceback.as_deref(),
            &FrameLocation {
                path,
                declaring_scope,
                method,
                line: report.line,
            },
        );
        let failure = Failure::new(report.message.unwrap_or_default()).with_trace(trace);
        self.case_finished(Outcome::Failed(failure));
    }

    /// Applies a classified case report.
    pub fn case_verdict(&mut self, verdict: CaseVerdict) {
        match verdict {
            CaseVerdict::Pending => {}
            CaseVerdict::Passed => self.case_finished(Outcome::Success),
            CaseVerdict::Skipped { reason } => self.case_finished(Outcome::aborted(reason)),
            CaseVerdict::Failed(report) => self.case_failed(report),
            CaseVerdict::Unknown { category, word } => {
                warn!(
                    "Got unknown result category '{}', result_word='{}'",
                    category, word
                );
                self.case_finished(Outcome::failed(format!(
                    "Unknown result category {category} / {word}"
                )));
            }
        }
    }

    /// The session ended; closes everything still open.
    ///
    /// An open case is aborted, the open group receives `outcome` and the
    /// run succeeds. If only the run is open, it receives `outcome`.
    pub fn session_finished(&mut self, outcome: Outcome) {
        if self.settings.is_verbose() {
            debug!(
                "Session finished: {} (running: {})",
                outcome,
                self.running.len()
            );
        }

        if self.running.len() == 3 {
            self.finish_top(&Outcome::aborted(NO_RESULT_RECEIVED));
        }
        let mut carried = outcome;
        if self.running.len() == 2 {
            self.finish_top(&carried);
            carried = Outcome::Success;
        }
        if self.running.len() == 1 {
            self.finish_top(&carried);
        }
        self.running.clear();
    }

    /// The pytest process exited. Fails the session if it is still open.
    pub fn process_finished(&mut self) {
        if self.settings.is_verbose() {
            debug!("Process finished");
        }
        if self.is_running() {
            self.session_finished(Outcome::failed(NO_RESULT_FROM_PYTEST));
        }
    }

    /// Running pytest failed outside of the protocol (spawn, I/O, framing,
    /// timeout). Fails the session if it is still open.
    pub fn failure(&mut self, error: impl fmt::Display) {
        if self.settings.is_verbose() {
            debug!("Failure: {}", error);
        }
        if self.is_running() {
            self.session_finished(Outcome::failed(error.to_string()));
        }
    }

    /// Attaches metadata to the running case. Dropped when no case runs.
    pub fn report_entry(&mut self, key: &str, value: &str) {
        let Some(current) = self.running.get(2) else {
            debug!("Dropping report entry '{}': no test case running", key);
            return;
        };
        if self.finished.contains_key(&current.id) {
            warn!("Not propagating report entry '{}' for finished {}", key, current.id);
            return;
        }
        if let Some(scope) = self.tree.scope(&current.id) {
            self.listener.report_entry(scope, key, value);
        }
    }

    /// Remembers an internal error reported by pytest.
    pub fn record_internal_error(&mut self, excrepr: String) {
        self.internal_error = Some(excrepr);
    }

    /// The last internal error reported by pytest.
    pub fn internal_error(&self) -> Option<&str> {
        self.internal_error.as_deref()
    }

    /// Prints captured output and collects declared outputs of a finished
    /// case. Skipped for passed cases unless configured otherwise.
    pub fn forward_case_output(&mut self, blocks: &Blocks, passed: bool) {
        if passed && !self.settings.keep_output_for_passed {
            return;
        }

        if let Err(e) = self.output.print_captured(blocks) {
            warn!("Failed to forward captured output: {}", e);
        }

        let Some(outputs) = blocks.text("outputs") else {
            return;
        };
        match (self.current_group(), self.current_case()) {
            (Some(group), Some(case)) => {
                let (group, case) = (group.to_string(), case.to_string());
                self.artifacts
                    .collect(&group, &case, &outputs, &self.working_dir);
            }
            _ => warn!("Ignoring test outputs: no test case running"),
        }
    }

    fn registered(&mut self, id: &ScopeId) {
        if self.settings.is_verbose() {
            debug!("Registered {}", id);
        }
        if let Some(scope) = self.tree.scope(id) {
            self.listener.dynamically_registered(scope);
        }
    }

    fn start(&mut self, base: ScopeId) -> BridgeResult<()> {
        let rerun = self.finished.get(&base).copied().unwrap_or(0);
        let id = if rerun > 0 {
            warn!("Detected re-run #{} of {}", rerun, base);
            let ScopeId::Case { group, test } = &base else {
                return Err(BridgeError::Rerun(base.clone()));
            };

            let mut ordinal = rerun;
            let renamed = loop {
                let candidate = format!("{test}-pytest_rerun-{ordinal}");
                if !self.finished.contains_key(&ScopeId::case(group.as_str(), candidate.as_str())) {
                    break candidate;
                }
                ordinal += 1;
            };
            let (id, new) = self.tree.add_case(group, &renamed);
            if new {
                self.registered(&id);
            }
            id
        } else {
            base.clone()
        };

        let scope = self
            .tree
            .scope(&id)
            .ok_or_else(|| BridgeError::UnknownScope(id.clone()))?;
        if self.settings.debug {
            debug!("started {}", id);
        }
        self.listener.started(scope);
        self.running.push(Running { id, base });
        Ok(())
    }

    fn finish_top(&mut self, outcome: &Outcome) {
        let Some(Running { id, base }) = self.running.pop() else {
            return;
        };

        *self.finished.entry(id.clone()).or_default() += 1;
        if base != id {
            *self.finished.entry(base).or_default() += 1;
        }

        if self.settings.debug {
            debug!("finished {} {}", id, outcome);
        }
        match self.tree.scope(&id) {
            Some(scope) => self.listener.finished(scope, outcome),
            None => warn!("Finished scope {} is not registered", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::listener::{LifecycleEvent, RecordingListener};
    use crate::output::SharedBuffer;
    use crate::protocol::{FrameReader, Message, MessageKind};
    use crate::trace::StackFrame;

    use LifecycleEvent::{Finished, Registered, ReportEntry, Started};

    fn thing_tree() -> ScopeTree {
        ScopeTree::from_entries(&[
            CollectEntry::new("pkg.py", "Thing", "a", "a"),
            CollectEntry::new("pkg.py", "Thing", "b", "b"),
        ])
    }

    fn tracker(tree: ScopeTree) -> ExecutionTracker<RecordingListener> {
        tracker_with(tree, TrackerSettings::default())
    }

    fn tracker_with(
        tree: ScopeTree,
        settings: TrackerSettings,
    ) -> ExecutionTracker<RecordingListener> {
        ExecutionTracker::new(tree, RecordingListener::new(), settings)
            .with_output(CapturedOutput::new(io::sink(), io::sink()))
    }

    fn start(t: &mut ExecutionTracker<RecordingListener>, class: &str, test: &str) {
        let method = test.split('[').next().unwrap();
        t.case_started(
            &format!("pkg.py::{class}::{method}"),
            "pkg.py",
            &format!("{class}.{test}"),
        )
        .unwrap();
    }

    fn thing() -> ScopeId {
        ScopeId::group("pkg.Thing")
    }

    fn case(test: &str) -> ScopeId {
        ScopeId::case("pkg.Thing", test)
    }

    /// Checks that starts and finishes nest properly and balance out.
    fn assert_well_formed(events: &[LifecycleEvent]) {
        let mut stack: Vec<&ScopeId> = Vec::new();
        for event in events {
            match event {
                Started(id) => {
                    assert!(!stack.contains(&id), "{id} started twice");
                    assert_eq!(id.depth(), stack.len(), "{id} started out of order");
                    stack.push(id);
                }
                Finished(id, _) => {
                    assert_eq!(stack.pop(), Some(id), "{id} finished out of order");
                }
                _ => {}
            }
        }
        assert!(stack.is_empty(), "still running: {stack:?}");
    }

    #[test]
    fn test_pass_and_fail_in_one_group() {
        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        start(&mut t, "Thing", "a");
        t.case_verdict(CaseVerdict::Passed);
        start(&mut t, "Thing", "b");
        t.case_verdict(CaseVerdict::Failed(FailureReport {
            message: Some("boom".to_string()),
            path: Some("t.py".to_string()),
            line: 10,
            traceback: None,
        }));
        t.session_finished(Outcome::Success);

        let failure = Failure::new("boom").with_trace(vec![StackFrame::new("t.py", "pkg.Thing", "b", 10)]);
        assert_eq!(
            t.listener().events,
            vec![
                Started(ScopeId::Run),
                Started(thing()),
                Started(case("a")),
                Finished(case("a"), Outcome::Success),
                Started(case("b")),
                Finished(case("b"), Outcome::Failed(failure)),
                Finished(thing(), Outcome::Success),
                Finished(ScopeId::Run, Outcome::Success),
            ]
        );
        assert!(!t.is_running());
    }

    #[test]
    fn test_rerun_of_finished_case_is_renamed() {
        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        start(&mut t, "Thing", "a");
        t.case_verdict(CaseVerdict::Passed);
        start(&mut t, "Thing", "a");
        assert_eq!(t.current_case(), Some("a-pytest_rerun-1"));
        t.case_verdict(CaseVerdict::Passed);
        start(&mut t, "Thing", "a");
        assert_eq!(t.current_case(), Some("a-pytest_rerun-2"));
        t.session_finished(Outcome::Success);

        let events = &t.listener().events;
        assert!(events.contains(&Registered(case("a-pytest_rerun-1"))));
        assert!(events.contains(&Started(case("a-pytest_rerun-1"))));
        assert!(events.contains(&Finished(case("a-pytest_rerun-1"), Outcome::Success)));
        assert!(events.contains(&Registered(case("a-pytest_rerun-2"))));
        assert_eq!(
            t.listener().outcome_of(&case("a-pytest_rerun-2")),
            Some(&Outcome::aborted(NO_RESULT_RECEIVED))
        );
        assert_well_formed(events);
    }

    #[test]
    fn test_repeated_start_of_open_case_is_noop() {
        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        start(&mut t, "Thing", "a");
        t.case_verdict(CaseVerdict::Pending);
        start(&mut t, "Thing", "a");
        t.case_verdict(CaseVerdict::Passed);

        let starts = t
            .listener()
            .events
            .iter()
            .filter(|e| **e == Started(case("a")))
            .count();
        assert_eq!(starts, 1);

        // same for a rerun that is still open
        start(&mut t, "Thing", "a");
        start(&mut t, "Thing", "a");
        assert_eq!(t.current_case(), Some("a-pytest_rerun-1"));
        t.session_finished(Outcome::Success);
        assert_well_formed(&t.listener().events);
    }

    #[test]
    fn test_new_case_aborts_unfinished_one() {
        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        start(&mut t, "Thing", "a");
        start(&mut t, "Thing", "b");

        assert_eq!(
            t.listener().outcome_of(&case("a")),
            Some(&Outcome::aborted(NO_RESULT_RECEIVED))
        );
        assert_eq!(t.current_case(), Some("b"));
        assert_eq!(t.running_scopes().count(), 3);
    }

    #[test]
    fn test_group_switch_closes_group_with_last_case_result() {
        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        start(&mut t, "Thing", "a");
        t.case_verdict(CaseVerdict::Skipped {
            reason: "not today".to_string(),
        });
        start(&mut t, "Other", "c");

        let other = ScopeId::group("pkg.Other");
        let c = ScopeId::case("pkg.Other", "c");
        assert_eq!(
            t.listener().lifecycle()[3..],
            [
                &Finished(case("a"), Outcome::aborted("not today")),
                &Finished(thing(), Outcome::aborted("test aborted")),
                &Started(other.clone()),
                &Started(c.clone()),
            ]
        );
        assert!(t.listener().events.contains(&Registered(other)));
        assert!(t.listener().events.contains(&Registered(c)));
        assert_eq!(t.current_group(), Some("pkg.Other"));
    }

    #[test]
    fn test_unfinished_case_in_other_group_closes_both() {
        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        start(&mut t, "Thing", "a");
        start(&mut t, "Other", "c");

        let lifecycle = t.listener().lifecycle();
        assert_eq!(
            lifecycle[3..5],
            [
                &Finished(case("a"), Outcome::aborted(NO_RESULT_RECEIVED)),
                &Finished(thing(), Outcome::Success),
            ]
        );
        assert_eq!(
            t.running_scopes().cloned().collect::<Vec<_>>(),
            vec![
                ScopeId::Run,
                ScopeId::group("pkg.Other"),
                ScopeId::case("pkg.Other", "c")
            ]
        );
    }

    #[test]
    fn test_group_rerun_is_fatal() {
        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        start(&mut t, "Thing", "a");
        t.case_verdict(CaseVerdict::Passed);
        start(&mut t, "Other", "c");
        t.case_verdict(CaseVerdict::Passed);

        let err = t
            .case_started("pkg.py::Thing::b", "pkg.py", "Thing.b")
            .unwrap_err();
        assert_eq!(err, BridgeError::Rerun(thing()));
    }

    #[test]
    fn test_invalid_identity() {
        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        let err = t.case_started("pkg.py::test_fn", "pkg.py", "test_fn").unwrap_err();
        assert!(matches!(err, BridgeError::InvalidIdentity { .. }));
    }

    #[test]
    fn test_case_start_without_session_is_ignored() {
        let mut t = tracker(thing_tree());
        start(&mut t, "Thing", "a");
        assert!(t.listener().events.is_empty());
        assert!(!t.is_running());
    }

    #[test]
    fn test_session_finish_forces_closure() {
        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        start(&mut t, "Thing", "a");
        t.session_finished(Outcome::failed("interrupted"));

        assert_eq!(
            t.listener().lifecycle()[3..],
            [
                &Finished(case("a"), Outcome::aborted(NO_RESULT_RECEIVED)),
                &Finished(thing(), Outcome::failed("interrupted")),
                &Finished(ScopeId::Run, Outcome::Success),
            ]
        );
    }

    #[test]
    fn test_run_alone_receives_session_outcome() {
        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        t.session_finished(Outcome::failed("EXIT_USAGEERROR"));
        assert_eq!(
            t.listener().outcome_of(&ScopeId::Run),
            Some(&Outcome::failed("EXIT_USAGEERROR"))
        );
    }

    #[test]
    fn test_process_finished_after_session_is_noop() {
        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        t.session_started().unwrap();
        t.session_finished(Outcome::Success);
        let before = t.listener().events.len();

        t.process_finished();
        t.failure("late");
        assert_eq!(t.listener().events.len(), before);
        assert_eq!(
            t.listener()
                .events
                .iter()
                .filter(|e| **e == Started(ScopeId::Run))
                .count(),
            1
        );
    }

    #[test]
    fn test_process_finished_without_session_end() {
        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        start(&mut t, "Thing", "a");
        t.case_verdict(CaseVerdict::Passed);
        t.process_finished();

        assert_eq!(
            t.listener().outcome_of(&thing()),
            Some(&Outcome::failed(NO_RESULT_FROM_PYTEST))
        );
        assert_eq!(t.listener().outcome_of(&ScopeId::Run), Some(&Outcome::Success));
        assert_well_formed(&t.listener().events);
    }

    #[test]
    fn test_unknown_category_fails_case() {
        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        start(&mut t, "Thing", "a");
        t.case_verdict(CaseVerdict::Unknown {
            category: "xfailed".to_string(),
            word: "XFAIL".to_string(),
        });
        assert_eq!(
            t.listener().outcome_of(&case("a")),
            Some(&Outcome::failed("Unknown result category xfailed / XFAIL"))
        );
    }

    #[test]
    fn test_failure_trace_from_traceback() {
        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        start(&mut t, "Thing", "b");
        t.case_failed(FailureReport {
            message: Some("boom".to_string()),
            path: Some("/src/pkg.py".to_string()),
            line: 3,
            traceback: Some(
                "  File \"/src/pkg.py\", line 3, in b\n    helper()\n  File \"/src/util.py\", line 7, in helper\n"
                    .to_string(),
            ),
        });

        let Some(Outcome::Failed(failure)) = t.listener().outcome_of(&case("b")) else {
            panic!("case b did not fail");
        };
        assert_eq!(
            failure.trace,
            vec![
                StackFrame::new("util.py", "pkg.Thing", "helper", 7),
                StackFrame::new("pkg.py", "pkg.Thing", "b", 3),
            ]
        );
    }

    #[test]
    fn test_report_entries_need_open_case() {
        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        t.report_entry("platform", "linux");
        start(&mut t, "Thing", "a");
        t.report_entry("exception", "trace");
        t.case_verdict(CaseVerdict::Passed);
        t.report_entry("late", "x");

        let entries: Vec<_> = t
            .listener()
            .events
            .iter()
            .filter(|e| matches!(e, ReportEntry { .. }))
            .collect();
        assert_eq!(
            entries,
            vec![&ReportEntry {
                scope: case("a"),
                key: "exception".to_string(),
                value: "trace".to_string(),
            }]
        );
    }

    #[derive(Clone, Default)]
    struct CollectedOutputs(Arc<Mutex<Vec<(String, String, String)>>>);

    impl ArtifactCollector for CollectedOutputs {
        fn collect(&mut self, group: &str, case: &str, outputs: &str, _working_dir: &Path) {
            self.0
                .lock()
                .unwrap()
                .push((group.to_string(), case.to_string(), outputs.to_string()));
        }
    }

    fn output_blocks(category: &str) -> Blocks {
        [
            ("result_category", category),
            ("Captured stdout call", "printed"),
            ("outputs", "logs"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_output_of_passed_case_is_dropped() {
        let stdout = SharedBuffer::default();
        let collected = CollectedOutputs::default();
        let mut t = tracker(thing_tree())
            .with_output(CapturedOutput::new(stdout.clone(), io::sink()))
            .with_artifacts(collected.clone(), "/work");
        t.process_started().unwrap();
        start(&mut t, "Thing", "a");

        t.forward_case_output(&output_blocks("passed"), true);
        assert!(stdout.contents().is_empty());
        assert!(collected.0.lock().unwrap().is_empty());

        t.forward_case_output(&output_blocks("failed"), false);
        assert!(stdout.contents().contains("printed"));
        assert_eq!(
            *collected.0.lock().unwrap(),
            vec![("pkg.Thing".to_string(), "a".to_string(), "logs".to_string())]
        );
    }

    #[test]
    fn test_output_of_passed_case_kept_on_request() {
        let stdout = SharedBuffer::default();
        let settings = TrackerSettings {
            keep_output_for_passed: true,
            ..Default::default()
        };
        let mut t = tracker_with(thing_tree(), settings)
            .with_output(CapturedOutput::new(stdout.clone(), io::sink()));
        t.process_started().unwrap();
        start(&mut t, "Thing", "a");
        t.forward_case_output(&output_blocks("passed"), true);
        assert!(stdout.contents().contains("printed"));
    }

    fn encode(kind: MessageKind, blocks: &[(&str, &str)]) -> Vec<u8> {
        Message::new(kind, blocks.iter().copied().collect()).encode()
    }

    #[test]
    fn test_message_stream_end_to_end() {
        let mut stream = Vec::new();
        stream.extend(encode(MessageKind::SessionStart, &[("platform", "linux")]));
        stream.extend(encode(
            MessageKind::CaseStart,
            &[
                ("nodeid", "pkg.py::Thing::a"),
                ("fspath", "pkg.py"),
                ("line_number", "3"),
                ("domain", "Thing.a[1]"),
            ],
        ));
        stream.extend(encode(MessageKind::CaseFinish, &[("nodeid", "pkg.py::Thing::a")]));
        stream.extend(encode(
            MessageKind::CaseFinish,
            &[("nodeid", "pkg.py::Thing::a"), ("result_category", "skipped"), ("longrepr_msg", "nope")],
        ));
        stream.extend(encode(MessageKind::InternalError, &[("excrepr", "INTERNALERROR> boom")]));
        stream.extend(encode(MessageKind::SessionFinish, &[("exitstatus", "3")]));

        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        let mut reader = FrameReader::new();
        for chunk in stream.chunks(7) {
            reader.push(chunk);
            while let Some(message) = reader.next_message().unwrap() {
                message.execute(&mut t).unwrap();
            }
        }
        reader.finish().unwrap();
        t.process_finished();

        let a = case("a[1]");
        let events = &t.listener().events;
        assert!(events.contains(&Registered(a.clone())));
        assert_eq!(t.listener().outcome_of(&a), Some(&Outcome::aborted("nope")));
        assert_eq!(t.listener().outcome_of(&thing()), Some(&Outcome::failed("INTERNALERROR> boom")));
        assert_eq!(t.listener().outcome_of(&ScopeId::Run), Some(&Outcome::Success));
        assert_eq!(t.internal_error(), Some("INTERNALERROR> boom"));
        assert_well_formed(events);
    }

    #[test]
    fn test_invalid_exit_status_is_an_error() {
        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        let message = Message::new(
            MessageKind::SessionFinish,
            [("exitstatus", "zero")].into_iter().collect(),
        );
        assert!(matches!(
            message.execute(&mut t),
            Err(BridgeError::InvalidBlock { block: "exitstatus", .. })
        ));
    }

    #[test]
    fn test_interrupted_session_message() {
        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        Message::new(
            MessageKind::SessionFinish,
            [
                ("exitstatus", "2"),
                ("kbdintr_message", "KeyboardInterrupt"),
                ("kbdintr_excinfo", "at line 4"),
            ]
            .into_iter()
            .collect(),
        )
        .execute(&mut t)
        .unwrap();
        assert_eq!(
            t.listener().outcome_of(&ScopeId::Run),
            Some(&Outcome::failed("KeyboardInterrupt\nat line 4"))
        );
    }

    fn execute(t: &mut ExecutionTracker<RecordingListener>, kind: MessageKind, blocks: &[(&str, &str)]) {
        Message::new(kind, blocks.iter().copied().collect())
            .execute(t)
            .unwrap();
    }

    #[test]
    fn test_session_finish_exit_statuses() {
        let cases: &[(&[(&str, &str)], Outcome)] = &[
            (&[], Outcome::failed("EXIT_INTERNALERROR")),
            (&[("exitstatus", "1")], Outcome::Success),
            (&[("exitstatus", "4")], Outcome::failed("EXIT_USAGEERROR")),
            (&[("exitstatus", "5")], Outcome::Success),
        ];
        for (blocks, expected) in cases {
            let mut t = tracker(thing_tree());
            t.process_started().unwrap();
            execute(&mut t, MessageKind::SessionFinish, blocks);
            assert!(!t.is_running(), "{blocks:?}");
            assert_eq!(t.listener().outcome_of(&ScopeId::Run), Some(expected), "{blocks:?}");
        }
    }

    #[test]
    fn test_unknown_exit_status_is_ignored() {
        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        start(&mut t, "Thing", "a");
        t.case_verdict(CaseVerdict::Passed);

        execute(&mut t, MessageKind::SessionFinish, &[("exitstatus", "7")]);
        assert!(t.is_running());
        assert_eq!(t.listener().outcome_of(&ScopeId::Run), None);

        t.process_finished();
        assert_eq!(
            t.listener().outcome_of(&thing()),
            Some(&Outcome::failed(NO_RESULT_FROM_PYTEST))
        );
        assert_eq!(t.listener().outcome_of(&ScopeId::Run), Some(&Outcome::Success));
        assert_well_formed(&t.listener().events);
    }

    #[test]
    fn test_exception_outside_test_becomes_report_entry() {
        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        let blocks = [
            ("node", "pkg.py::Thing::a"),
            ("call_when", "setup"),
            ("excinfo_native", "ValueError: fixture"),
            ("excinfo_long", "long repr"),
        ];

        // nothing to attach it to yet
        execute(&mut t, MessageKind::ExceptionInteract, &blocks);
        start(&mut t, "Thing", "a");
        execute(&mut t, MessageKind::ExceptionInteract, &blocks);

        let entries: Vec<_> = t
            .listener()
            .events
            .iter()
            .filter(|e| matches!(e, ReportEntry { .. }))
            .collect();
        assert_eq!(
            entries,
            vec![&ReportEntry {
                scope: case("a"),
                key: "exception".to_string(),
                value: "ValueError: fixture".to_string(),
            }]
        );
    }

    #[test]
    fn test_failed_case_message_with_traceback() {
        let mut t = tracker(thing_tree());
        t.process_started().unwrap();
        execute(
            &mut t,
            MessageKind::CaseStart,
            &[
                ("nodeid", "pkg.py::Thing::b"),
                ("fspath", "pkg.py"),
                ("line_number", "8"),
                ("domain", "Thing.b"),
            ],
        );
        execute(
            &mut t,
            MessageKind::CaseFinish,
            &[
                ("nodeid", "pkg.py::Thing::b"),
                ("result_category", "failed"),
                ("result_word", "FAILED"),
                ("excinfo_when", "call"),
                ("excinfo_msg", "assert 1 == 2"),
                ("excinfo_path", "/src/pkg.py"),
                ("excinfo_line_number", "9"),
                (
                    "excinfo_traceback",
                    "  File \"/src/pkg.py\", line 9, in b\n    check()\n  File \"/src/util.py\", line 2, in check\n",
                ),
            ],
        );
        execute(&mut t, MessageKind::SessionFinish, &[("exitstatus", "1")]);

        let failure = Failure::new("assert 1 == 2").with_trace(vec![
            StackFrame::new("util.py", "pkg.Thing", "check", 2),
            StackFrame::new("pkg.py", "pkg.Thing", "b", 9),
        ]);
        assert_eq!(
            t.listener().outcome_of(&case("b")),
            Some(&Outcome::Failed(failure))
        );
        assert_eq!(t.listener().outcome_of(&thing()), Some(&Outcome::Success));
        assert_eq!(t.listener().outcome_of(&ScopeId::Run), Some(&Outcome::Success));
        assert_well_formed(&t.listener().events);
    }

    #[test]
    fn test_stack_stays_well_formed_through_mixed_traffic() {
        let mut t = tracker(ScopeTree::new());
        t.process_started().unwrap();
        let script: &[(&str, &str, Option<CaseVerdict>)] = &[
            ("A", "x", Some(CaseVerdict::Passed)),
            ("A", "y", None),
            ("A", "y", Some(CaseVerdict::Pending)),
            ("A", "z", Some(CaseVerdict::Passed)),
            ("A", "x", Some(CaseVerdict::Passed)),
            ("B", "x", None),
            ("B", "w", Some(CaseVerdict::Skipped { reason: String::new() })),
            ("C", "v", None),
        ];
        for (class, test, verdict) in script {
            start(&mut t, class, test);
            let ids: Vec<_> = t.running_scopes().map(ScopeId::depth).collect();
            assert_eq!(ids, vec![0, 1, 2]);
            if let Some(verdict) = verdict.clone() {
                t.case_verdict(verdict);
            }
        }
        t.process_finished();

        assert!(!t.is_running());
        assert_well_formed(&t.listener().events);
        assert_eq!(t.tree().groups().len(), 3);
    }
}
