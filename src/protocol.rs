//! The framed message protocol spoken by the companion pytest plugin.
//!
//! The plugin writes a sequence of messages to pytest's stdout. Each message
//! is a tagged set of named, length-prefixed byte blocks:
//!
//! ```text
//! *** START/runtest_logstart/4
//! nodeid: 27
//! tests/pkg.py::Thing::test_a
//! fspath: 12
//! tests/pkg.py
//! ...
//! *** END
//! ```
//!
//! # Layers
//!
//! - [`frame::FrameReader`]: turns raw, possibly fragmented bytes into
//!   complete [`Message`]s. It knows nothing about test semantics.
//! - [`message::Message`]: the tagged message kinds and their projection
//!   onto the [`ExecutionTracker`](crate::tracker::ExecutionTracker).
//!
//! Block lengths are byte counts, so captured output that is not valid UTF-8
//! survives framing untouched.

pub mod frame;
pub mod message;

pub use frame::FrameReader;
pub use message::{Blocks, Message, MessageKind};

use crate::scope::ScopeId;

/// Result type for protocol and tracker operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors raised while decoding the plugin stream or reconciling it into
/// lifecycle events.
///
/// Every variant is fatal for the session: the stream cannot be trusted
/// once one of these is seen. Recoverable anomalies (unknown result
/// categories, missing finish signals, reruns) are handled in place and
/// never surface as errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// A line did not have the shape the reader expected in its current state.
    #[error("Protocol framing violation: expected {expected}, but got '{line}'")]
    Framing {
        /// What the reader was waiting for.
        expected: &'static str,
        /// The offending line (lossily decoded).
        line: String,
    },

    /// The stream ended in the middle of a message.
    #[error("Protocol stream ended inside a message ({0} bytes pending)")]
    Truncated(usize),

    /// A `runtest_logstart` message carried an identity that cannot be mapped
    /// onto a group and a test case. Usually a plugin version mismatch.
    #[error("Invalid nodeid/fspath/domain from pytest: {nodeid} / {fspath} / {domain}")]
    InvalidIdentity {
        nodeid: String,
        fspath: String,
        domain: String,
    },

    /// A block carried a value that cannot be interpreted.
    #[error("Invalid value for block '{block}': '{value}'")]
    InvalidBlock { block: &'static str, value: String },

    /// A run or group was started again after it had finished.
    #[error("Detected re-run of {0}, only test cases may be re-run")]
    Rerun(ScopeId),

    /// A scope on the running stack is missing from the scope tree.
    #[error("Scope {0} is not registered in the scope tree")]
    UnknownScope(ScopeId),
}
