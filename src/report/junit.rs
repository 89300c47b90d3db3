//! JUnit XML report generation.
//!
//! Generates JUnit XML format test reports, which are the de facto standard
//! for CI/CD systems. Each group becomes a `<testsuite>`, each case a
//! `<testcase>`:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites name="pytest" tests="3" failures="1" errors="0" skipped="1" time="1.234">
//!   <testsuite name="tests.test_math.TestMath" tests="3" failures="1" errors="0" skipped="1" time="1.234" timestamp="2024-05-01T10:00:00">
//!     <testcase classname="tests.test_math.TestMath" name="test_add" time="0.100"/>
//!     <testcase classname="tests.test_math.TestMath" name="test_sub" time="0.150">
//!       <failure message="assert 1 == 0" type="failure">assert 1 == 0
//!     at tests.test_math.TestMath.test_sub(test_math.py:12)</failure>
//!     </testcase>
//!     <testcase classname="tests.test_math.TestMath" name="test_mul" time="0.050">
//!       <skipped message="Skipped: slow"/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! A run or group that fails on its own (interrupted session, pytest
//! internal error, timeout) is reported as an extra `<testcase>` with an
//! `<error>` element so CI systems do not mistake it for a green build.
//!
//! The file is written when the run scope finishes.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::listener::ExecutionListener;
use crate::outcome::{Failure, Outcome};
use crate::scope::{RUN_NAME, Scope, ScopeId};

struct CaseRecord {
    name: String,
    outcome: Outcome,
    time: Duration,
    properties: Vec<(String, String)>,
}

struct SuiteRecord {
    name: String,
    timestamp: DateTime<Local>,
    started: Instant,
    time: Duration,
    cases: Vec<CaseRecord>,
    error: Option<Failure>,
}

impl SuiteRecord {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            timestamp: Local::now(),
            started: Instant::now(),
            time: Duration::ZERO,
            cases: Vec::new(),
            error: None,
        }
    }

    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.cases.iter().filter(|c| pred(&c.outcome)).count()
    }

    fn errors(&self) -> usize {
        usize::from(self.error.is_some())
    }
}

/// Listener that writes a JUnit XML report at the end of the run.
///
/// # File Location
///
/// Parent directories are created automatically if they don't exist.
///
/// # Example
///
/// ```
/// use pytest_bridge::report::JUnitListener;
///
/// let listener = JUnitListener::new("build/test-results/junit.xml".into())
///     .with_testsuites_name("cassandra-dtest");
/// ```
pub struct JUnitListener {
    output_path: PathBuf,
    testsuites_name: String,
    suites: Vec<SuiteRecord>,
    case_started: Option<Instant>,
    run_started: Option<Instant>,
    pending_properties: Vec<(String, String)>,
}

impl JUnitListener {
    /// Creates a new JUnit listener that writes to the given path.
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            testsuites_name: RUN_NAME.to_string(),
            suites: Vec::new(),
            case_started: None,
            run_started: None,
            pending_properties: Vec::new(),
        }
    }

    /// Sets the name of the `<testsuites>` element.
    pub fn with_testsuites_name(mut self, name: impl Into<String>) -> Self {
        self.testsuites_name = name.into();
        self
    }

    fn suite_mut(&mut self, name: &str) -> &mut SuiteRecord {
        if let Some(i) = self.suites.iter().position(|s| s.name == name) {
            return &mut self.suites[i];
        }
        self.suites.push(SuiteRecord::new(name));
        let last = self.suites.len() - 1;
        &mut self.suites[last]
    }

    /// Generate JUnit XML content from the recorded results.
    pub fn generate_xml(&self, run_time: Duration) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let tests: usize = self.suites.iter().map(|s| s.cases.len() + s.errors()).sum();
        let failures: usize = self.suites.iter().map(|s| s.count(Outcome::is_failed)).sum();
        let errors: usize = self.suites.iter().map(SuiteRecord::errors).sum();
        let skipped: usize = self.suites.iter().map(|s| s.count(Outcome::is_aborted)).sum();

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("name", self.testsuites_name.as_str()));
        testsuites.push_attribute(("tests", tests.to_string().as_str()));
        testsuites.push_attribute(("failures", failures.to_string().as_str()));
        testsuites.push_attribute(("errors", errors.to_string().as_str()));
        testsuites.push_attribute(("skipped", skipped.to_string().as_str()));
        testsuites.push_attribute(("time", secs(run_time).as_str()));
        writer.write_event(Event::Start(testsuites))?;

        for suite in &self.suites {
            write_testsuite(&mut writer, suite)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        let xml = String::from_utf8(writer.into_inner())?;
        Ok(xml)
    }

    fn write_report(&self, run_time: Duration) {
        match self.generate_xml(run_time) {
            Ok(xml) => {
                if let Some(parent) = self.output_path.parent()
                    && !parent.as_os_str().is_empty()
                    && let Err(e) = std::fs::create_dir_all(parent)
                {
                    tracing::error!("Failed to create output directory: {}", e);
                    return;
                }

                if let Err(e) = std::fs::write(&self.output_path, xml) {
                    tracing::error!("Failed to write JUnit XML: {}", e);
                } else {
                    tracing::info!("JUnit XML written to: {}", self.output_path.display());
                }
            }
            Err(e) => {
                tracing::error!("Failed to generate JUnit XML: {}", e);
            }
        }
    }
}

impl ExecutionListener for JUnitListener {
    fn started(&mut self, scope: &Scope) {
        match scope.id() {
            ScopeId::Run => self.run_started = Some(Instant::now()),
            ScopeId::Group(name) => {
                self.suite_mut(name);
            }
            ScopeId::Case { .. } => {
                self.case_started = Some(Instant::now());
                self.pending_properties.clear();
            }
        }
    }

    fn finished(&mut self, scope: &Scope, outcome: &Outcome) {
        match scope.id() {
            ScopeId::Run => {
                if let Outcome::Failed(failure) = outcome {
                    self.suite_mut(RUN_NAME).error = Some(failure.clone());
                }
                let run_time = self.run_started.map(|t| t.elapsed()).unwrap_or_default();
                self.write_report(run_time);
            }
            ScopeId::Group(name) => {
                let suite = self.suite_mut(name);
                suite.time = suite.started.elapsed();
                if let Outcome::Failed(failure) = outcome {
                    suite.error = Some(failure.clone());
                }
            }
            ScopeId::Case { group, test } => {
                let time = self.case_started.take().map(|t| t.elapsed()).unwrap_or_default();
                let properties = std::mem::take(&mut self.pending_properties);
                self.suite_mut(group).cases.push(CaseRecord {
                    name: test.clone(),
                    outcome: outcome.clone(),
                    time,
                    properties,
                });
            }
        }
    }

    fn report_entry(&mut self, _scope: &Scope, key: &str, value: &str) {
        self.pending_properties
            .push((key.to_string(), value.to_string()));
    }
}

fn write_testsuite<W: std::io::Write>(
    writer: &mut Writer<W>,
    suite: &SuiteRecord,
) -> anyhow::Result<()> {
    let mut testsuite = BytesStart::new("testsuite");
    testsuite.push_attribute(("name", suite.name.as_str()));
    testsuite.push_attribute(("tests", (suite.cases.len() + suite.errors()).to_string().as_str()));
    testsuite.push_attribute(("failures", suite.count(Outcome::is_failed).to_string().as_str()));
    testsuite.push_attribute(("errors", suite.errors().to_string().as_str()));
    testsuite.push_attribute(("skipped", suite.count(Outcome::is_aborted).to_string().as_str()));
    testsuite.push_attribute(("time", secs(suite.time).as_str()));
    testsuite.push_attribute((
        "timestamp",
        suite.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string().as_str(),
    ));
    writer.write_event(Event::Start(testsuite))?;

    for case in &suite.cases {
        write_testcase(writer, &suite.name, case)?;
    }

    if let Some(error) = &suite.error {
        let mut testcase = BytesStart::new("testcase");
        testcase.push_attribute(("classname", suite.name.as_str()));
        testcase.push_attribute(("name", "<session>"));
        writer.write_event(Event::Start(testcase))?;
        write_problem(writer, "error", error)?;
        writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    Ok(())
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    classname: &str,
    case: &CaseRecord,
) -> anyhow::Result<()> {
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", classname));
    testcase.push_attribute(("name", case.name.as_str()));
    testcase.push_attribute(("time", secs(case.time).as_str()));

    if case.outcome.is_success() && case.properties.is_empty() {
        writer.write_event(Event::Empty(testcase))?;
        return Ok(());
    }

    writer.write_event(Event::Start(testcase))?;

    if !case.properties.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("properties")))?;
        for (key, value) in &case.properties {
            let mut property = BytesStart::new("property");
            property.push_attribute(("name", sanitize_xml(key).as_str()));
            property.push_attribute(("value", sanitize_xml(value).as_str()));
            writer.write_event(Event::Empty(property))?;
        }
        writer.write_event(Event::End(BytesEnd::new("properties")))?;
    }

    match &case.outcome {
        Outcome::Success => {}
        Outcome::Aborted { reason } => {
            let mut skipped = BytesStart::new("skipped");
            skipped.push_attribute(("message", sanitize_xml(reason).as_str()));
            writer.write_event(Event::Empty(skipped))?;
        }
        Outcome::Failed(failure) => write_problem(writer, "failure", failure)?,
    }

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

fn write_problem<W: std::io::Write>(
    writer: &mut Writer<W>,
    element: &str,
    failure: &Failure,
) -> anyhow::Result<()> {
    let mut problem = BytesStart::new(element);
    problem.push_attribute(("message", sanitize_xml(&failure.message).as_str()));
    problem.push_attribute(("type", element));
    writer.write_event(Event::Start(problem))?;
    writer.write_event(Event::Text(BytesText::new(&sanitize_xml(&failure.to_string()))))?;
    writer.write_event(Event::End(BytesEnd::new(element)))?;
    Ok(())
}

fn secs(duration: Duration) -> String {
    format!("{:.3}", duration.as_secs_f64())
}

/// Removes characters that cannot appear in XML 1.0 documents.
fn sanitize_xml(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..='\u{10FFFF}'))
        .collect()
}
