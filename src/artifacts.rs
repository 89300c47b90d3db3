//! Collection of files a test declared as outputs.
//!
//! The plugin lists paths (relative to pytest's working directory, one per
//! line) in the `outputs` block of `runtest_logfinish`. [`OutputCopier`]
//! mirrors them into `<outputs_dir>/<group>/<case>/`:
//!
//! - a listed file is copied into the case directory
//! - a listed directory has its entries copied into the case directory, so
//!   the top level is flattened while nested directories keep their shape
//!
//! Copy failures are logged and never fail the test run.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Receives the output artifacts of finished cases.
pub trait ArtifactCollector {
    /// Collects `outputs` (newline separated, relative to `working_dir`) for
    /// a case. Must not fail; problems are logged.
    fn collect(&mut self, group: &str, case: &str, outputs: &str, working_dir: &Path);
}

/// Discards all artifacts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoArtifacts;

impl ArtifactCollector for NoArtifacts {
    fn collect(&mut self, group: &str, case: &str, _outputs: &str, _working_dir: &Path) {
        debug!("Ignoring outputs of {}/{}", group, case);
    }
}

/// Copies artifacts into a per-case directory below a root.
#[derive(Debug, Clone)]
pub struct OutputCopier {
    root: PathBuf,
}

impl OutputCopier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory receiving the artifacts of a case.
    ///
    /// Names are escaped into single path components, so parameter ids
    /// such as `t[a/../b]` stay below the root.
    pub fn case_dir(&self, group: &str, case: &str) -> PathBuf {
        self.root
            .join(path_component(group))
            .join(path_component(case))
    }
}

fn path_component(name: &str) -> String {
    match name {
        "" | "." | ".." => "_".repeat(name.len().max(1)),
        _ => name.replace(['/', '\\'], "_"),
    }
}

impl ArtifactCollector for OutputCopier {
    fn collect(&mut self, group: &str, case: &str, outputs: &str, working_dir: &Path) {
        let target = self.case_dir(group, case);
        if let Err(e) = remove_tree(&target) {
            warn!("Failed to clear {}: {}", target.display(), e);
        }

        for output in outputs.lines().filter(|l| !l.trim().is_empty()) {
            let source = working_dir.join(output);
            if let Err(e) = copy_listed(&source, &target) {
                warn!(
                    "Failed to copy test output {} to {}: {}",
                    source.display(),
                    target.display(),
                    e
                );
            }
        }
    }
}

fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn copy_listed(source: &Path, target: &Path) -> io::Result<()> {
    if source.is_dir() {
        for entry in fs::read_dir(source)? {
            copy_entry(&entry?.path(), target)?;
        }
        Ok(())
    } else {
        copy_entry(source, target)
    }
}

fn copy_entry(source: &Path, target: &Path) -> io::Result<()> {
    let name = source
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let dest = target.join(name);

    if source.is_dir() {
        for entry in fs::read_dir(source)? {
            copy_entry(&entry?.path(), &dest)?;
        }
    } else {
        fs::create_dir_all(target)?;
        fs::copy(source, &dest)?;
    }
    Ok(())
}
