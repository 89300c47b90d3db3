//! Incremental decoder for the plugin's framed message stream.
//!
//! [`FrameReader`] is a push parser: callers [`push`](FrameReader::push)
//! whatever bytes happen to be available and then drain complete messages
//! with [`next_message`](FrameReader::next_message). It never blocks; when
//! a message is incomplete it returns `Ok(None)` and keeps its partial state
//! (the block being read, how many bytes it still needs, the blocks
//! collected so far) until more bytes arrive.
//!
//! # Grammar
//!
//! ```text
//! "*** START/" <kind> "/" <blockCount> "\n"
//! {  <blockName> ": " <blockByteLength> "\n"
//!    <exactly blockByteLength raw bytes>
//!    "\n"                                    } x blockCount
//! "*** END\n"
//! ```
//!
//! Header and terminator lines are line-oriented; block payloads are read as
//! raw bytes and may contain newlines or arbitrary binary data.

use super::message::{Blocks, Message, MessageKind};
use super::{BridgeError, BridgeResult};

/// Prefix of the line opening a message.
pub const START_PREFIX: &str = "*** START/";

/// Line closing a message.
pub const END_MARKER: &str = "*** END";

/// Upper bound for the buffer reserved up front for one block.
const MAX_BLOCK_PREALLOC: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ExpectStart,
    ExpectBlockHeader,
    ReadingBlock,
    PostBlockEol,
    ExpectEnd,
}

impl State {
    fn is_line(self) -> bool {
        !matches!(self, State::ReadingBlock)
    }
}

/// Stateful decoder turning byte chunks into [`Message`]s.
///
/// # Example
///
/// ```
/// use pytest_bridge::protocol::{FrameReader, MessageKind};
///
/// let mut reader = FrameReader::new();
/// reader.push(b"*** START/sessionfinish/1\nexitstatus: 1\n");
/// assert!(reader.next_message()?.is_none());
///
/// reader.push(b"0\n*** END\n");
/// let message = reader.next_message()?.expect("complete message");
/// assert_eq!(message.kind(), MessageKind::SessionFinish);
/// assert_eq!(message.blocks().text("exitstatus").as_deref(), Some("0"));
/// # Ok::<(), pytest_bridge::protocol::BridgeError>(())
/// ```
#[derive(Debug)]
pub struct FrameReader {
    input: Vec<u8>,
    pos: usize,
    state: State,
    kind: Option<MessageKind>,
    blocks: Blocks,
    remaining_blocks: usize,
    block_name: String,
    block_remaining: usize,
    block_buf: Vec<u8>,
    poisoned: Option<BridgeError>,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    /// Creates a reader waiting for the first `*** START/` line.
    pub fn new() -> Self {
        Self {
            input: Vec::new(),
            pos: 0,
            state: State::ExpectStart,
            kind: None,
            blocks: Blocks::default(),
            remaining_blocks: 0,
            block_name: String::new(),
            block_remaining: 0,
            block_buf: Vec::new(),
            poisoned: None,
        }
    }

    /// Appends newly available bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.pos > 0 {
            self.input.drain(..self.pos);
            self.pos = 0;
        }
        self.input.extend_from_slice(chunk);
    }

    /// Returns the next complete message, or `Ok(None)` if more bytes are
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Framing`] when a line does not match what the
    /// current state expects. The reader is poisoned afterwards and returns
    /// the same error on every call.
    pub fn next_message(&mut self) -> BridgeResult<Option<Message>> {
        if let Some(err) = &self.poisoned {
            return Err(err.clone());
        }

        match self.advance() {
            Ok(message) => Ok(message),
            Err(err) => {
                self.poisoned = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Returns an iterator draining every message that is already complete.
    ///
    /// Iteration stops at the first framing error, which is yielded once.
    pub fn messages(&mut self) -> impl Iterator<Item = BridgeResult<Message>> + '_ {
        let mut failed = false;
        std::iter::from_fn(move || {
            if failed {
                return None;
            }
            match self.next_message() {
                Ok(message) => message.map(Ok),
                Err(err) => {
                    failed = true;
                    Some(Err(err))
                }
            }
        })
    }

    /// Checks that the stream ended on a message boundary.
    ///
    /// Call once the producer has closed its end of the stream.
    pub fn finish(&self) -> BridgeResult<()> {
        if let Some(err) = &self.poisoned {
            return Err(err.clone());
        }
        let pending = self.input.len() - self.pos;
        if self.state != State::ExpectStart || pending > 0 {
            return Err(BridgeError::Truncated(pending + self.block_buf.len()));
        }
        Ok(())
    }

    /// Returns `true` if the reader is between messages.
    pub fn is_idle(&self) -> bool {
        self.state == State::ExpectStart && self.pos == self.input.len()
    }

    fn advance(&mut self) -> BridgeResult<Option<Message>> {
        loop {
            if self.state.is_line() {
                let available = &self.input[self.pos..];
                let Some(eol) = available.iter().position(|&b| b == b'\n') else {
                    return Ok(None);
                };
                let line = String::from_utf8_lossy(&available[..eol]).into_owned();
                self.pos += eol + 1;
                if let Some(message) = self.handle_line(line)? {
                    return Ok(Some(message));
                }
            } else {
                let available = self.input.len() - self.pos;
                let take = available.min(self.block_remaining);
                self.block_buf
                    .extend_from_slice(&self.input[self.pos..self.pos + take]);
                self.pos += take;
                self.block_remaining -= take;

                if self.block_remaining > 0 {
                    return Ok(None);
                }

                let name = std::mem::take(&mut self.block_name);
                let content = std::mem::take(&mut self.block_buf);
                self.blocks.insert(name, content);
                self.remaining_blocks -= 1;
                self.state = State::PostBlockEol;
            }
        }
    }

    fn handle_line(&mut self, line: String) -> BridgeResult<Option<Message>> {
        match self.state {
            State::ExpectStart => {
                let (kind, count) = parse_start_line(&line)?;
                self.kind = Some(kind);
                self.blocks = Blocks::default();
                self.remaining_blocks = count;
                self.state = self.after_block();
            }
            State::ExpectBlockHeader => {
                let Some((name, length)) = line.split_once(": ") else {
                    return Err(framing("'<block-name>: <byte-length>'", line));
                };
                let Ok(length) = length.parse::<usize>() else {
                    return Err(framing("a numeric block length", line));
                };
                self.block_name = name.to_string();
                self.block_remaining = length;
                self.block_buf = Vec::with_capacity(length.min(MAX_BLOCK_PREALLOC));
                self.state = State::ReadingBlock;
            }
            State::PostBlockEol => {
                if !line.is_empty() {
                    return Err(framing("a line break right after the block payload", line));
                }
                self.state = self.after_block();
            }
            State::ExpectEnd => {
                if line != END_MARKER {
                    return Err(framing("'*** END'", line));
                }
                self.state = State::ExpectStart;
                let blocks = std::mem::take(&mut self.blocks);
                return Ok(self.kind.take().map(|kind| Message::new(kind, blocks)));
            }
            State::ReadingBlock => unreachable!("block payloads are not line-oriented"),
        }
        Ok(None)
    }

    fn after_block(&self) -> State {
        if self.remaining_blocks > 0 {
            State::ExpectBlockHeader
        } else {
            State::ExpectEnd
        }
    }
}

fn parse_start_line(line: &str) -> BridgeResult<(MessageKind, usize)> {
    let Some(rest) = line.strip_prefix(START_PREFIX) else {
        return Err(framing("'*** START/...'", line.to_string()));
    };
    let Some((kind, count)) = rest.split_once('/') else {
        return Err(framing("'*** START/<kind>/<block-count>'", line.to_string()));
    };
    let Some(kind) = MessageKind::from_wire(kind) else {
        return Err(framing("a known message kind", line.to_string()));
    };
    let Ok(count) = count.parse::<usize>() else {
        return Err(framing("a numeric block count", line.to_string()));
    };
    Ok((kind, count))
}

fn framing(expected: &'static str, line: String) -> BridgeError {
    BridgeError::Framing { expected, line }
}
