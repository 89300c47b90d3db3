//! Static test discovery with `pytest --collect-only`.
//!
//! With the bridge plugin active, collect-only mode prints one line per test:
//!
//! ```text
//! tests/test_math.py::TestMath::test_add::test_add
//! tests/test_math.py::TestMath::test_div::test_div[zero]
//! ```
//!
//! that is `file::Class::method::test`. Everything else pytest prints is
//! ignored. The resulting [`ScopeTree`] seeds the
//! [`ExecutionTracker`](crate::tracker::ExecutionTracker) and selects what
//! the run executes.

use std::process::Stdio;

use tracing::{debug, warn};

use crate::config::PytestConfig;
use crate::scope::{CollectEntry, ScopeTree};

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors that can occur during test discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// pytest could not be started.
    #[error("Failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// pytest ran but collection failed.
    #[error("pytest collection failed (exit code {code:?}): {stderr}")]
    CollectionFailed { code: Option<i32>, stderr: String },

    /// The configured pytest arguments are malformed.
    #[error("Discovery error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Parses collect-only output into entries, skipping unrelated lines.
pub fn parse_collect_output(output: &str) -> Vec<CollectEntry> {
    output
        .lines()
        .filter_map(|line| CollectEntry::parse(line.trim_end()))
        .collect()
}

/// Discovers tests by running pytest in collect-only mode.
pub struct PytestDiscoverer {
    config: PytestConfig,
}

impl PytestDiscoverer {
    pub fn new(config: PytestConfig) -> Self {
        Self { config }
    }

    /// Full collect-only command line, interpreter first.
    pub fn collect_command(&self) -> DiscoveryResult<Vec<String>> {
        let mut command = vec![
            self.config.python.clone(),
            "-m".to_string(),
            "pytest".to_string(),
            "--collect-only".to_string(),
            "-q".to_string(),
        ];
        command.extend(self.config.plugin_args.iter().cloned());
        command.extend(self.config.extra_args()?);
        command.extend(
            self.config
                .paths
                .iter()
                .map(|p| p.to_string_lossy().to_string()),
        );
        Ok(command)
    }

    /// Runs the collection and builds the scope tree.
    ///
    /// # Errors
    ///
    /// Fails if pytest cannot be started, or if it exits unsuccessfully
    /// without collecting anything.
    pub async fn discover(&self) -> DiscoveryResult<ScopeTree> {
        let command = self.collect_command()?;
        debug!("Collecting tests: {}", shell_words::join(&command));

        let output = tokio::process::Command::new(&command[0])
            .args(&command[1..])
            .current_dir(&self.config.working_dir)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| DiscoveryError::Spawn {
                command: shell_words::join(&command),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let entries = parse_collect_output(&stdout);

        // exit code 5: nothing collected
        if !output.status.success() && output.status.code() != Some(5) && entries.is_empty() {
            return Err(DiscoveryError::CollectionFailed {
                code: output.status.code(),
                stderr: stderr.into_owned(),
            });
        }

        if entries.is_empty() {
            warn!(
                "No tests discovered. stdout: {}, stderr: {}",
                stdout, stderr
            );
        }

        let tree = ScopeTree::from_entries(&entries);
        debug!(
            "Discovered {} tests in {} groups",
            tree.case_count(),
            tree.groups().len()
        );
        Ok(tree)
    }
}
