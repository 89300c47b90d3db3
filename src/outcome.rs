//! Test outcomes and the mapping from pytest result categories onto them.
//!
//! pytest reports a `result_category` token per test (`passed`, `skipped`,
//! `failed`, `error`, or something a plugin made up). The host model only
//! knows three terminal states:
//!
//! | Category | [`Outcome`] |
//! |----------|-------------|
//! | `passed` | [`Outcome::Success`] |
//! | `skipped` | [`Outcome::Aborted`] with the skip reason |
//! | `failed`, `error` | [`Outcome::Failed`] with message, location and trace |
//! | anything else | [`Outcome::Failed`] "Unknown result category" |
//!
//! A report without any category is not a result at all; see
//! [`CaseVerdict::Pending`].

use std::fmt;

use crate::protocol::Blocks;
use crate::trace::StackFrame;

/// Terminal outcome of a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The scope completed successfully.
    Success,

    /// The scope did not run to completion (skipped, or no result arrived).
    Aborted { reason: String },

    /// The scope failed.
    Failed(Failure),
}

impl Outcome {
    /// Creates an aborted outcome.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Outcome::Aborted {
            reason: reason.into(),
        }
    }

    /// Creates a failed outcome without a trace.
    pub fn failed(message: impl Into<String>) -> Self {
        Outcome::Failed(Failure::new(message))
    }

    /// Returns `true` for [`Outcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Returns `true` for [`Outcome::Aborted`].
    pub fn is_aborted(&self) -> bool {
        matches!(self, Outcome::Aborted { .. })
    }

    /// Returns `true` for [`Outcome::Failed`].
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// Outcome of a group derived from its last case.
    ///
    /// A failing case does not fail its group; an aborted case aborts it.
    pub fn for_group(last_case: Option<&Outcome>) -> Outcome {
        match last_case {
            Some(Outcome::Aborted { .. }) => Outcome::aborted("test aborted"),
            _ => Outcome::Success,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "SUCCESSFUL"),
            Outcome::Aborted { reason } => write!(f, "ABORTED ({reason})"),
            Outcome::Failed(failure) => write!(f, "FAILED ({})", failure.message),
        }
    }
}

/// Details of a failed outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Failure {
    /// Human-readable failure message.
    pub message: String,
    /// Structured stack trace, outermost frame first. Empty for failures
    /// that did not originate in a test.
    pub trace: Vec<StackFrame>,
}

impl Failure {
    /// Creates a failure without a trace.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: Vec::new(),
        }
    }

    /// Sets the trace.
    pub fn with_trace(mut self, trace: Vec<StackFrame>) -> Self {
        self.trace = trace;
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in &self.trace {
            write!(f, "\n\tat {frame}")?;
        }
        Ok(())
    }
}

/// A pytest result category token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultCategory {
    Passed,
    Skipped,
    Failed,
    Error,
    Unknown(String),
}

impl ResultCategory {
    /// Parses a category token. Unrecognized tokens are kept verbatim.
    pub fn parse(token: &str) -> Self {
        match token {
            "passed" => ResultCategory::Passed,
            "skipped" => ResultCategory::Skipped,
            "failed" => ResultCategory::Failed,
            "error" => ResultCategory::Error,
            other => ResultCategory::Unknown(other.to_string()),
        }
    }
}

/// The fields of a `runtest_logfinish` message relevant for classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaseReport {
    pub category: Option<String>,
    pub word: Option<String>,
    /// Long representation message; carries the skip reason.
    pub longrepr_msg: String,
    pub failure: FailureReport,
}

impl CaseReport {
    /// Extracts the classification fields from message blocks.
    pub fn from_blocks(blocks: &Blocks) -> Self {
        let text = |name: &str| blocks.text(name).map(|s| s.into_owned());
        Self {
            category: text("result_category"),
            word: text("result_word"),
            longrepr_msg: blocks.text_or("longrepr_msg", ""),
            failure: FailureReport {
                message: text("excinfo_msg"),
                path: text("excinfo_path"),
                line: blocks
                    .text("excinfo_line_number")
                    .and_then(|l| l.trim().parse().ok())
                    .unwrap_or(0),
                traceback: text("excinfo_traceback"),
            },
        }
    }

    /// Returns `true` only for an explicit `passed` category.
    pub fn passed(&self) -> bool {
        self.category.as_deref() == Some("passed")
    }
}

/// Failure fields reported by pytest for `failed` and `error` results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureReport {
    pub message: Option<String>,
    pub path: Option<String>,
    pub line: u32,
    pub traceback: Option<String>,
}

/// Classification of a case report, before it is bound to a running scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseVerdict {
    /// No result category: the case has not really finished yet.
    Pending,
    Passed,
    Skipped { reason: String },
    Failed(FailureReport),
    Unknown { category: String, word: String },
}

/// Maps a case report onto a verdict.
///
/// # Example
///
/// ```
/// use pytest_bridge::outcome::{classify, CaseReport, CaseVerdict};
///
/// let report = CaseReport {
///     category: Some("skipped".into()),
///     longrepr_msg: "Skipped: not on windows".into(),
///     ..Default::default()
/// };
/// assert_eq!(
///     classify(&report),
///     CaseVerdict::Skipped { reason: "Skipped: not on windows".into() }
/// );
/// ```
pub fn classify(report: &CaseReport) -> CaseVerdict {
    let Some(category) = report.category.as_deref() else {
        return CaseVerdict::Pending;
    };

    match ResultCategory::parse(category) {
        ResultCategory::Passed => CaseVerdict::Passed,
        ResultCategory::Skipped => CaseVerdict::Skipped {
            reason: report.longrepr_msg.clone(),
        },
        ResultCategory::Failed | ResultCategory::Error => {
            CaseVerdict::Failed(report.failure.clone())
        }
        ResultCategory::Unknown(category) => CaseVerdict::Unknown {
            category,
            word: report.word.clone().unwrap_or_default(),
        },
    }
}
