//! Launching pytest and pumping its output through the bridge.
//!
//! The runner owns the child process for one session:
//!
//! 1. opens the run on the tracker and spawns pytest with the plugin active
//! 2. feeds stdout into a [`FrameReader`] and executes each message as soon
//!    as it is complete
//! 3. copies stderr through to our own stderr unchanged
//! 4. kills pytest once the configured timeout has passed
//!
//! Whatever happens, the tracker sees `process_finished` at the end, so every
//! scope the session opened is closed.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::PytestConfig;
use crate::listener::ExecutionListener;
use crate::protocol::FrameReader;
use crate::scope::ScopeTree;
use crate::tracker::ExecutionTracker;

/// How long the pipes may stay silent after pytest exited before reading stops.
const DRAIN_IDLE: Duration = Duration::from_millis(200);

/// Runs pytest sessions for a configuration.
pub struct PytestRunner {
    config: PytestConfig,
    timeout: Duration,
}

impl PytestRunner {
    pub fn new(config: PytestConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs);
        Self { config, timeout }
    }

    /// Overrides the configured timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Directory pytest runs in.
    pub fn working_dir(&self) -> PathBuf {
        self.config.working_dir.clone()
    }

    /// Command line running every group of `tree`.
    ///
    /// Returns `None` when there is nothing to select: pytest without
    /// selectors would run everything it finds.
    pub fn command_line(&self, tree: &ScopeTree) -> Result<Option<Vec<String>>> {
        let selectors = tree.selectors();
        if selectors.is_empty() {
            return Ok(None);
        }

        let mut command = vec![
            self.config.python.clone(),
            "-m".to_string(),
            "pytest".to_string(),
        ];
        command.extend(self.config.plugin_args.iter().cloned());
        command.extend(self.config.extra_args()?);
        command.extend(selectors);
        Ok(Some(command))
    }

    /// Runs `command` and drives `tracker` from its output.
    ///
    /// Returns pytest's exit code (`None` if it was killed by a signal).
    ///
    /// # Errors
    ///
    /// Fails if pytest cannot be started, its output violates the protocol,
    /// or it outlives the timeout. The session is failed with the same error
    /// before returning.
    pub async fn run<L: ExecutionListener>(
        &self,
        command: &[String],
        tracker: &mut ExecutionTracker<L>,
    ) -> Result<Option<i32>> {
        tracker.process_started()?;

        let result = self.drive(command, tracker).await;
        if let Err(e) = &result {
            tracker.failure(format!("{e:#}"));
        }
        tracker.process_finished();
        result
    }

    async fn drive<L: ExecutionListener>(
        &self,
        command: &[String],
        tracker: &mut ExecutionTracker<L>,
    ) -> Result<Option<i32>> {
        let Some((program, args)) = command.split_first() else {
            bail!("Empty pytest command line");
        };
        let shown = shell_words::join(command);
        info!("Starting pytest: {}", shown);
        debug!(
            "  in {} with environment {:?}",
            self.config.working_dir.display(),
            self.config.env
        );

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&self.config.working_dir)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start pytest: {}", shown))?;

        let mut stdout = child.stdout.take().context("pytest stdout not captured")?;
        let mut stderr = child.stderr.take().context("pytest stderr not captured")?;
        let mut passthrough = tokio::io::stderr();

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut reader = FrameReader::new();
        let mut out_buf = vec![0u8; 8192];
        let mut err_buf = vec![0u8; 4096];
        let (mut out_open, mut err_open) = (true, true);
        let mut exit = None;

        // Once pytest has exited, its pipes may still be held open by
        // processes it left behind: read until they go quiet, not until EOF.
        while out_open || err_open {
            tokio::select! {
                read = stdout.read(&mut out_buf), if out_open => {
                    let n = read.context("Failed to read pytest stdout")?;
                    if n == 0 {
                        out_open = false;
                        continue;
                    }
                    feed(&mut reader, tracker, &out_buf[..n])?;
                }
                read = stderr.read(&mut err_buf), if err_open => {
                    let n = read.context("Failed to read pytest stderr")?;
                    if n == 0 {
                        err_open = false;
                        continue;
                    }
                    passthrough.write_all(&err_buf[..n]).await?;
                    passthrough.flush().await?;
                }
                status = child.wait(), if exit.is_none() => {
                    exit = Some(status.context("Failed to wait for pytest")?);
                }
                _ = tokio::time::sleep(DRAIN_IDLE), if exit.is_some() => {
                    debug!("pytest exited, but its output pipes are still open");
                    break;
                }
                _ = &mut deadline => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill pytest: {}", e);
                    }
                    bail!("pytest did not finish within {:?}", self.timeout);
                }
            }
        }

        reader.finish()?;

        let status = match exit {
            Some(status) => status,
            None => tokio::select! {
                status = child.wait() => status.context("Failed to wait for pytest")?,
                _ = &mut deadline => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill pytest: {}", e);
                    }
                    bail!("pytest did not finish within {:?}", self.timeout);
                }
            },
        };
        match status.code() {
            Some(code) => info!("pytest finished with exit code {}", code),
            None => warn!("pytest was terminated by a signal"),
        }
        Ok(status.code())
    }
}

/// Decodes `chunk` and applies every message it completes.
fn feed<L: ExecutionListener>(
    reader: &mut FrameReader,
    tracker: &mut ExecutionTracker<L>,
    chunk: &[u8],
) -> Result<()> {
    reader.push(chunk);
    while let Some(message) = reader.next_message()? {
        message.execute(tracker)?;
    }
    Ok(())
}
