//! Forwarding of captured test output to the console.
//!
//! `runtest_logfinish` messages carry whatever pytest captured while the
//! test ran. Each non-empty block is printed under a banner naming it:
//!
//! ```text
//! ======================= Captured stdout call =======================
//! hello from the test
//! ```
//!
//! Blocks captured from stderr go to stderr, everything else to stdout.

use std::io::{self, Write};

use crate::protocol::Blocks;

/// Width of the banner line preceding each block.
pub const BANNER_WIDTH: usize = 150;

/// Captured-output blocks in print order.
pub const CAPTURED_BLOCKS: [&str; 12] = [
    "buffered_setup",
    "Captured stdout setup",
    "Captured stderr setup",
    "Captured log setup",
    "buffered_call",
    "Captured stdout call",
    "Captured stderr call",
    "Captured log call",
    "buffered_teardown",
    "Captured stdout teardown",
    "Captured stderr teardown",
    "Captured log teardown",
];

/// Target stream of a captured block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    /// Stream a block is written to.
    pub fn for_block(name: &str) -> Self {
        if name.starts_with("Captured stderr") {
            Stream::Stderr
        } else {
            Stream::Stdout
        }
    }
}

/// Banner line for a block, without the trailing newline.
pub fn banner(key: &str) -> String {
    let leftsep = BANNER_WIDTH.saturating_sub(key.len()) / 2;
    if leftsep <= 1 {
        return format!("=== {key}");
    }

    let mut line = "=".repeat(leftsep - 1);
    line.push(' ');
    line.push_str(key);
    line.push(' ');
    while line.len() < BANNER_WIDTH {
        line.push('=');
    }
    line
}

/// Sinks for captured test output.
pub struct CapturedOutput {
    stdout: Box<dyn Write + Send>,
    stderr: Box<dyn Write + Send>,
}

impl Default for CapturedOutput {
    fn default() -> Self {
        Self::stdio()
    }
}

impl CapturedOutput {
    /// Writes to the process's own stdout and stderr.
    pub fn stdio() -> Self {
        Self::new(io::stdout(), io::stderr())
    }

    /// Writes to the given sinks.
    pub fn new(stdout: impl Write + Send + 'static, stderr: impl Write + Send + 'static) -> Self {
        Self {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        }
    }

    /// Prints every non-empty captured block of a message.
    pub fn print_captured(&mut self, blocks: &Blocks) -> io::Result<()> {
        for key in CAPTURED_BLOCKS {
            let Some(text) = blocks.text(key) else {
                continue;
            };
            if text.is_empty() {
                continue;
            }

            let out = match Stream::for_block(key) {
                Stream::Stdout => &mut self.stdout,
                Stream::Stderr => &mut self.stderr,
            };
            writeln!(out, "{}", banner(key))?;
            writeln!(out, "{text}")?;
            out.flush()?;
        }
        Ok(())
    }
}

/// A cloneable in-memory sink for asserting on captured output.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct SharedBuffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

#[cfg(test)]
impl SharedBuffer {
    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[cfg(test)]
impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
