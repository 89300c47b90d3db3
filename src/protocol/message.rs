//! Message kinds emitted by the pytest plugin and their effect on the
//! execution tracker.
//!
//! Each message is a flat map of named byte blocks. The block vocabulary per
//! kind is fixed by the plugin:
//!
//! | Kind | Wire name | Blocks |
//! |------|-----------|--------|
//! | [`MessageKind::SessionStart`] | `sessionstart` | `platform`, `info` |
//! | [`MessageKind::SessionFinish`] | `sessionfinish` | `exitstatus`, `kbdintr_message`, `kbdintr_excinfo` |
//! | [`MessageKind::CaseStart`] | `runtest_logstart` | `nodeid`, `fspath`, `line_number`, `domain` |
//! | [`MessageKind::CaseFinish`] | `runtest_logfinish` | `result_category`, `result_word`, `excinfo_*`, captured output, `outputs` |
//! | [`MessageKind::InternalError`] | `internalerror` | `excrepr` |
//! | [`MessageKind::ExceptionInteract`] | `exception_interact` | `node`, `call_when`, `excinfo_native`, `excinfo_long` |

use std::borrow::Cow;
use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use super::{BridgeError, BridgeResult};
use crate::listener::ExecutionListener;
use crate::outcome::{CaseReport, CaseVerdict, Outcome, classify};
use crate::tracker::ExecutionTracker;

/// pytest exit status: all tests passed.
pub const EXIT_OK: i32 = 0;
/// pytest exit status: some tests failed.
pub const EXIT_TESTSFAILED: i32 = 1;
/// pytest exit status: interrupted by the user.
pub const EXIT_INTERRUPTED: i32 = 2;
/// pytest exit status: internal error.
pub const EXIT_INTERNALERROR: i32 = 3;
/// pytest exit status: command line usage error.
pub const EXIT_USAGEERROR: i32 = 4;
/// pytest exit status: no tests were collected.
pub const EXIT_NOTESTSCOLLECTED: i32 = 5;

/// The tag of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// The pytest session started.
    SessionStart,
    /// The pytest session finished, carrying pytest's exit status.
    SessionFinish,
    /// A test case is about to run.
    CaseStart,
    /// A test case reported its result (or a partial report without one).
    CaseFinish,
    /// pytest hit an internal error; the text is kept for the session result.
    InternalError,
    /// An exception was raised outside of a running test.
    ExceptionInteract,
}

impl MessageKind {
    /// All kinds, in wire order of appearance in a typical session.
    pub const ALL: [MessageKind; 6] = [
        MessageKind::SessionStart,
        MessageKind::CaseStart,
        MessageKind::CaseFinish,
        MessageKind::ExceptionInteract,
        MessageKind::InternalError,
        MessageKind::SessionFinish,
    ];

    /// The name used on the wire after `*** START/`.
    pub fn wire_name(self) -> &'static str {
        match self {
            MessageKind::SessionStart => "sessionstart",
            MessageKind::SessionFinish => "sessionfinish",
            MessageKind::CaseStart => "runtest_logstart",
            MessageKind::CaseFinish => "runtest_logfinish",
            MessageKind::InternalError => "internalerror",
            MessageKind::ExceptionInteract => "exception_interact",
        }
    }

    /// Parses a wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.wire_name() == name)
    }
}

/// Named byte blocks of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blocks(BTreeMap<String, Vec<u8>>);

impl Blocks {
    /// Adds or replaces a block.
    pub fn insert(&mut self, name: impl Into<String>, content: Vec<u8>) {
        self.0.insert(name.into(), content);
    }

    /// Returns the raw bytes of a block.
    pub fn bytes(&self, name: &str) -> Option<&[u8]> {
        self.0.get(name).map(Vec::as_slice)
    }

    /// Returns a block decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self, name: &str) -> Option<Cow<'_, str>> {
        self.bytes(name).map(String::from_utf8_lossy)
    }

    /// Returns a block as text, or `default` if it is absent.
    pub fn text_or(&self, name: &str, default: &str) -> String {
        self.text(name)
            .map(Cow::into_owned)
            .unwrap_or_else(|| default.to_string())
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no blocks.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates blocks in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl<K: Into<String>, V: Into<Vec<u8>>> FromIterator<(K, V)> for Blocks {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    SessionStart(Blocks),
    SessionFinish(Blocks),
    CaseStart(Blocks),
    CaseFinish(Blocks),
    InternalError(Blocks),
    ExceptionInteract(Blocks),
}

impl Message {
    /// Builds a message of the given kind.
    pub fn new(kind: MessageKind, blocks: Blocks) -> Self {
        match kind {
            MessageKind::SessionStart => Message::SessionStart(blocks),
            MessageKind::SessionFinish => Message::SessionFinish(blocks),
            MessageKind::CaseStart => Message::CaseStart(blocks),
            MessageKind::CaseFinish => Message::CaseFinish(blocks),
            MessageKind::InternalError => Message::InternalError(blocks),
            MessageKind::ExceptionInteract => Message::ExceptionInteract(blocks),
        }
    }

    /// Returns the message tag.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::SessionStart(_) => MessageKind::SessionStart,
            Message::SessionFinish(_) => MessageKind::SessionFinish,
            Message::CaseStart(_) => MessageKind::CaseStart,
            Message::CaseFinish(_) => MessageKind::CaseFinish,
            Message::InternalError(_) => MessageKind::InternalError,
            Message::ExceptionInteract(_) => MessageKind::ExceptionInteract,
        }
    }

    /// Returns the message blocks.
    pub fn blocks(&self) -> &Blocks {
        match self {
            Message::SessionStart(blocks)
            | Message::SessionFinish(blocks)
            | Message::CaseStart(blocks)
            | Message::CaseFinish(blocks)
            | Message::InternalError(blocks)
            | Message::ExceptionInteract(blocks) => blocks,
        }
    }

    /// Encodes the message in wire format, the way the plugin writes it.
    pub fn encode(&self) -> Vec<u8> {
        let blocks = self.blocks();
        let mut out = Vec::new();
        out.extend_from_slice(
            format!(
                "{}{}/{}\n",
                super::frame::START_PREFIX,
                self.kind().wire_name(),
                blocks.len()
            )
            .as_bytes(),
        );
        for (name, content) in blocks.iter() {
            out.extend_from_slice(format!("{}: {}\n", name, content.len()).as_bytes());
            out.extend_from_slice(content);
            out.push(b'\n');
        }
        out.extend_from_slice(super::frame::END_MARKER.as_bytes());
        out.push(b'\n');
        out
    }

    /// Applies the message to the tracker.
    ///
    /// # Errors
    ///
    /// Fails on identity resolution errors, unparseable exit statuses and
    /// illegal reruns; all of them end the session.
    pub fn execute<L: ExecutionListener>(
        self,
        tracker: &mut ExecutionTracker<L>,
    ) -> BridgeResult<()> {
        match self {
            Message::SessionStart(blocks) => session_start(&blocks, tracker),
            Message::SessionFinish(blocks) => session_finish(&blocks, tracker),
            Message::CaseStart(blocks) => case_start(&blocks, tracker),
            Message::CaseFinish(blocks) => case_finish(&blocks, tracker),
            Message::InternalError(blocks) => {
                let excrepr = blocks.text_or("excrepr", "");
                warn!("pytest internal error: {}", excrepr);
                tracker.record_internal_error(excrepr);
                Ok(())
            }
            Message::ExceptionInteract(blocks) => {
                let node = blocks.text_or("node", "");
                let when = blocks.text_or("call_when", "");
                let native = blocks.text_or("excinfo_native", "");
                warn!("pytest raised outside of a test ({} / {}):\n{}", node, when, native);
                tracker.report_entry("exception", &native);
                Ok(())
            }
        }
    }
}

fn session_start<L: ExecutionListener>(
    blocks: &Blocks,
    tracker: &mut ExecutionTracker<L>,
) -> BridgeResult<()> {
    let platform = blocks.text("platform");
    let info = blocks.text("info");

    if tracker.settings().debug {
        trace!("pytest/sessionstart: {:?}, {:?}", platform, info);
    }

    tracker.session_started()?;
    if let Some(platform) = platform {
        tracker.report_entry("platform", &platform);
    }
    if let Some(info) = info {
        tracker.report_entry("sessionInfo", &info);
    }
    Ok(())
}

fn session_finish<L: ExecutionListener>(
    blocks: &Blocks,
    tracker: &mut ExecutionTracker<L>,
) -> BridgeResult<()> {
    let raw = blocks.text_or("exitstatus", "3");
    let exitstatus: i32 = raw
        .trim()
        .parse()
        .map_err(|_| BridgeError::InvalidBlock {
            block: "exitstatus",
            value: raw.clone(),
        })?;

    if tracker.settings().debug {
        trace!("pytest/sessionfinish: {}", exitstatus);
    }

    let outcome = match exitstatus {
        EXIT_OK | EXIT_TESTSFAILED | EXIT_NOTESTSCOLLECTED => Outcome::Success,
        EXIT_INTERRUPTED => Outcome::failed(format!(
            "{}\n{}",
            blocks.text_or("kbdintr_message", ""),
            blocks.text_or("kbdintr_excinfo", "")
        )),
        EXIT_INTERNALERROR => Outcome::failed(
            tracker
                .internal_error()
                .unwrap_or("EXIT_INTERNALERROR")
                .to_string(),
        ),
        EXIT_USAGEERROR => Outcome::failed("EXIT_USAGEERROR"),
        other => {
            debug!("Ignoring pytest session finish with exit status {}", other);
            return Ok(());
        }
    };

    tracker.session_finished(outcome);
    Ok(())
}

fn case_start<L: ExecutionListener>(
    blocks: &Blocks,
    tracker: &mut ExecutionTracker<L>,
) -> BridgeResult<()> {
    let nodeid = blocks.text_or("nodeid", "");
    let fspath = blocks.text_or("fspath", "");
    let domain = blocks.text_or("domain", "");

    if tracker.settings().debug {
        trace!(
            "pytest/runtest_logstart: '{}', '{}', '{}', '{}'",
            nodeid,
            fspath,
            blocks.text_or("line_number", ""),
            domain
        );
    }

    tracker.case_started(&nodeid, &fspath, &domain)
}

fn case_finish<L: ExecutionListener>(
    blocks: &Blocks,
    tracker: &mut ExecutionTracker<L>,
) -> BridgeResult<()> {
    let report = CaseReport::from_blocks(blocks);

    // Captured output of passed tests is only kept on request.
    tracker.forward_case_output(blocks, report.passed());

    match classify(&report) {
        CaseVerdict::Pending => {
            // pytest (notably with rerun plugins) may finish a test without a
            // result and start the same test again right away.
            if tracker.settings().is_verbose() {
                debug!(
                    "Got pytest/runtest_logfinish with no result, expecting followup messages: '{}', '{}'",
                    blocks.text_or("nodeid", ""),
                    blocks.text_or("domain", "")
                );
            }
        }
        verdict => {
            if tracker.settings().debug {
                trace!(
                    "pytest/runtest_logfinish: '{}' -> {:?} / {:?}",
                    blocks.text_or("nodeid", ""),
                    report.category,
                    report.word
                );
            }
            tracker.case_verdict(verdict);
        }
    }
    Ok(())
}
