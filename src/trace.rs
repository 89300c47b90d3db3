//! Translation of Python tracebacks into structured stack frames.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

static TRACEBACK_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^ {2}File "(.*)", line ([0-9]+), in ([^\r]*)\r?$"#).expect("valid traceback regex")
});

/// One entry of a structured stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// File name without any directory prefix.
    pub file_name: String,
    /// Name of the scope the frame is attributed to (the qualified group).
    pub declaring_scope: String,
    /// Function or method name.
    pub frame_name: String,
    pub line: u32,
}

impl StackFrame {
    /// Creates a frame, stripping directories from `path`.
    pub fn new(
        path: &str,
        declaring_scope: impl Into<String>,
        frame_name: impl Into<String>,
        line: u32,
    ) -> Self {
        Self {
            file_name: file_base_name(path).to_string(),
            declaring_scope: declaring_scope.into(),
            frame_name: frame_name.into(),
            line,
        }
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}({}:{})",
            self.declaring_scope, self.frame_name, self.file_name, self.line
        )
    }
}

/// Where a failure was reported when no traceback is available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLocation<'a> {
    pub path: &'a str,
    pub declaring_scope: &'a str,
    pub method: &'a str,
    pub line: u32,
}

/// Strips everything up to the last `/` or `\`.
pub fn file_base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Parses the `File "...", line N, in name` lines of a native Python
/// traceback.
///
/// pytest lists the outermost call first; the returned trace has the last
/// mentioned frame first.
pub fn translate(traceback: &str, declaring_scope: &str) -> Vec<StackFrame> {
    let mut frames: Vec<StackFrame> = traceback
        .lines()
        .filter_map(|line| TRACEBACK_LINE.captures(line))
        .filter_map(|cap| {
            let line = cap[2].parse().ok()?;
            Some(StackFrame::new(&cap[1], declaring_scope, &cap[3], line))
        })
        .collect();
    frames.reverse();
    frames
}

/// Builds the trace for a failed case.
///
/// Uses the traceback when pytest supplied one and falls back to a single
/// frame at the reported location otherwise.
pub fn build_trace(traceback: Option<&str>, location: &FrameLocation<'_>) -> Vec<StackFrame> {
    match traceback {
        Some(traceback) => translate(traceback, location.declaring_scope),
        None => vec![StackFrame::new(
            location.path,
            location.declaring_scope,
            location.method,
            location.line,
        )],
    }
}
