//! Configuration schema definitions for pytest-bridge.
//!
//! All sections are optional; an empty file is a valid configuration.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── BridgeConfig           - Diagnostics and output retention
//! ├── PytestConfig           - How pytest is launched
//! └── ReportConfig           - Output and reporting settings
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure for pytest-bridge.
///
/// # TOML Structure
///
/// ```toml
/// [bridge]
/// verbose = true
/// keep_output_for_passed = false
///
/// [pytest]
/// python = ".venv/bin/python"
/// working_dir = "python"
/// paths = ["tests"]
/// args = "-x --log-level=DEBUG"
/// timeout_secs = 1800
/// outputs_dir = "build/pytest-outputs"
///
/// [pytest.env]
/// CASSANDRA_DIR = "/opt/cassandra"
///
/// [report]
/// output_dir = "build/test-results"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Diagnostic switches of the bridge itself.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Settings for the pytest process.
    #[serde(default)]
    pub pytest: PytestConfig,

    /// Report configuration for output generation.
    #[serde(default)]
    pub report: ReportConfig,
}

/// Diagnostic and output-retention settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `verbose` | false |
/// | `debug` | false |
/// | `keep_output_for_passed` | false |
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Log lifecycle details of the message stream.
    #[serde(default)]
    pub verbose: bool,

    /// Log every protocol message. Implies `verbose`.
    #[serde(default)]
    pub debug: bool,

    /// Print captured output and copy declared outputs of passed tests too.
    ///
    /// Output of failed, skipped and unknown results is always kept.
    #[serde(default)]
    pub keep_output_for_passed: bool,
}

/// How pytest is launched.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `python` | `"python3"` |
/// | `working_dir` | `"."` |
/// | `paths` | `["tests"]` |
/// | `plugin_args` | `["--gradle"]` |
/// | `args` | `""` |
/// | `timeout_secs` | 3600 |
/// | `outputs_dir` | None (outputs not collected) |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PytestConfig {
    /// Python interpreter with pytest and the bridge plugin installed.
    #[serde(default = "default_python")]
    pub python: String,

    /// Directory pytest runs in. Test output paths are relative to it.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    /// Directories or files to collect tests from, relative to
    /// `working_dir`.
    #[serde(default = "default_test_paths")]
    pub paths: Vec<PathBuf>,

    /// Arguments that switch the plugin into framed-message mode.
    #[serde(default = "default_plugin_args")]
    pub plugin_args: Vec<String>,

    /// Additional pytest arguments, split like a shell would.
    #[serde(default)]
    pub args: String,

    /// Extra environment variables for pytest.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Time after which pytest is killed.
    ///
    /// Default: 3600 (one hour)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Directory receiving files tests declare as outputs, one
    /// subdirectory per group and case.
    pub outputs_dir: Option<PathBuf>,
}

impl Default for PytestConfig {
    fn default() -> Self {
        Self {
            python: default_python(),
            working_dir: default_working_dir(),
            paths: default_test_paths(),
            plugin_args: default_plugin_args(),
            args: String::new(),
            env: HashMap::new(),
            timeout_secs: default_timeout(),
            outputs_dir: None,
        }
    }
}

impl PytestConfig {
    /// `args` split into words.
    pub fn extra_args(&self) -> anyhow::Result<Vec<String>> {
        shell_words::split(&self.args)
            .map_err(|e| anyhow::anyhow!("Invalid pytest args '{}': {}", self.args, e))
    }
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_test_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("tests")]
}

fn default_plugin_args() -> Vec<String> {
    vec!["--gradle".to_string()]
}

fn default_timeout() -> u64 {
    3600
}

/// Configuration for test result reporting.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `"test-results"` |
/// | `junit` | `true` |
/// | `junit_file` | `"junit.xml"` |
///
/// # Example
///
/// ```toml
/// [report]
/// output_dir = "build/test-results"
/// junit = true
/// junit_file = "results.xml"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory where report files are written.
    ///
    /// Created automatically if it doesn't exist.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Whether to generate a JUnit XML report.
    #[serde(default = "default_true")]
    pub junit: bool,

    /// Filename for the JUnit XML report, written to
    /// `{output_dir}/{junit_file}`.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            junit: true,
            junit_file: default_junit_file(),
        }
    }
}

impl ReportConfig {
    /// Full path of the JUnit XML report.
    pub fn junit_path(&self) -> PathBuf {
        self.output_dir.join(&self.junit_file)
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_true() -> bool {
    true
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}
