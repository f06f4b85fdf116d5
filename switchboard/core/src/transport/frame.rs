//! Frame Protocol
//!
//! Wire format for switchboard messages: independent byte messages, each
//! terminated by a configurable delimiter (default `\r\n`) or by the fixed
//! telnet-style EOF sentinel.
//!
//! ```text
//! +------------------------------------------+----------------+
//! | Message body (variable, <= max size)     | Terminator     |
//! +------------------------------------------+----------------+
//! ```
//!
//! Exactly one framing mode is active per configured transport; there is no
//! fallback between delimiter and sentinel framing on the same stream.
//!
//! # Security
//!
//! - Maximum message size is enforced before and during accumulation to
//!   prevent memory exhaustion from a peer that never sends a terminator.
//! - A message that grows past the cap fails with
//!   [`FrameError::MaximumSize`]; it is never silently truncated.
//!
//! The codec itself is stateless per call: all partial-read state lives in
//! the caller-owned [`FrameBuffer`], so one codec instance can serve every
//! connection on a transport.

use serde::{Deserialize, Serialize};

use super::error::FrameError;

/// Default message terminator.
pub const DEFAULT_DELIMITER: &[u8] = b"\r\n";

/// Telnet-style EOF sentinel (IAC IP IAC DO TIMING-MARK), the byte sequence
/// an interactive telnet client emits on close.
pub const TELNET_EOF: &[u8] = &[0xFF, 0xF4, 0xFF, 0xFD, 0x06];

/// Minimum buffer capacity kept by a [`FrameBuffer`].
const MIN_BUFFER_CAPACITY: usize = 4096;

/// How a byte stream is split into messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FramingMode {
    /// Messages end with an arbitrary delimiter byte sequence.
    Delimiter(Vec<u8>),
    /// Messages end with the fixed 5-byte telnet EOF sentinel.
    TelnetEof,
}

impl Default for FramingMode {
    fn default() -> Self {
        Self::Delimiter(DEFAULT_DELIMITER.to_vec())
    }
}

impl FramingMode {
    /// The terminator byte sequence for this mode.
    #[must_use]
    pub fn terminator(&self) -> &[u8] {
        match self {
            Self::Delimiter(d) => d,
            Self::TelnetEof => TELNET_EOF,
        }
    }
}

/// Splits a byte stream into discrete messages and frames outgoing ones.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    terminator: Vec<u8>,
    /// Maximum message body size in bytes; 0 means unlimited.
    max_size: usize,
}

impl FrameCodec {
    /// Create a codec for the given framing mode.
    ///
    /// `max_size` is the maximum message body size in bytes: `0` means
    /// unlimited, negative values are rejected with
    /// [`FrameError::InvalidSize`]. A delimiter mode with no delimiter
    /// bytes is rejected with [`FrameError::EmptyDelimiter`]; every
    /// constructed codec has a terminator of at least one byte.
    pub fn new(mode: FramingMode, max_size: i64) -> Result<Self, FrameError> {
        if max_size < 0 {
            return Err(FrameError::InvalidSize(max_size));
        }
        let terminator = mode.terminator().to_vec();
        if terminator.is_empty() {
            return Err(FrameError::EmptyDelimiter);
        }
        Ok(Self {
            terminator,
            max_size: max_size as usize,
        })
    }

    /// Create a codec with the default `\r\n` delimiter and no size cap.
    #[must_use]
    pub fn crlf() -> Self {
        Self {
            terminator: DEFAULT_DELIMITER.to_vec(),
            max_size: 0,
        }
    }

    /// The terminator this codec frames with.
    #[must_use]
    pub fn terminator(&self) -> &[u8] {
        &self.terminator
    }

    /// Configured maximum message size (0 = unlimited).
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn over_size(&self, size: usize) -> bool {
        self.max_size != 0 && size > self.max_size
    }

    /// Frame a message for the wire, appending the terminator unless the
    /// message already ends with it. `encode` is idempotent on
    /// already-terminated input and never duplicates the terminator.
    pub fn encode(&self, msg: &[u8]) -> Result<Vec<u8>, FrameError> {
        let body_len = if msg.ends_with(&self.terminator) {
            msg.len() - self.terminator.len()
        } else {
            msg.len()
        };

        if self.over_size(body_len) {
            return Err(FrameError::MaximumSize {
                size: body_len,
                max: self.max_size,
            });
        }

        let mut framed = Vec::with_capacity(msg.len() + self.terminator.len());
        framed.extend_from_slice(msg);
        if !msg.ends_with(&self.terminator) {
            framed.extend_from_slice(&self.terminator);
        }
        Ok(framed)
    }

    /// Try to decode the next message out of `buf`.
    ///
    /// Returns:
    /// - `Ok(Some(msg))` if a complete message was delimited (terminator
    ///   stripped, bytes consumed from the buffer)
    /// - `Ok(None)` if more data is needed
    /// - `Err(FrameError::MaximumSize)` if the accumulated bytes exceed the
    ///   cap before a terminator occurs
    pub fn decode(&self, buf: &mut FrameBuffer) -> Result<Option<Vec<u8>>, FrameError> {
        let pending = buf.pending();

        match find_subsequence(pending, &self.terminator) {
            Some(at) => {
                if self.over_size(at) {
                    return Err(FrameError::MaximumSize {
                        size: at,
                        max: self.max_size,
                    });
                }
                let msg = pending[..at].to_vec();
                buf.consume(at + self.terminator.len());
                Ok(Some(msg))
            }
            None => {
                // Bytes that can still become part of a terminator straddling
                // a chunk boundary do not count against the cap.
                let settled = pending.len().saturating_sub(self.terminator.len() - 1);
                if self.over_size(settled) {
                    return Err(FrameError::MaximumSize {
                        size: settled,
                        max: self.max_size,
                    });
                }
                Ok(None)
            }
        }
    }
}

/// Accumulation buffer for partial reads on one connection.
///
/// The codec is shared; this state is not. Each connection owns exactly one
/// `FrameBuffer`.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
    /// Position we have consumed up to.
    read_pos: usize,
}

impl FrameBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, data: &[u8]) {
        // Compact if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Unconsumed bytes.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.buffer[self.read_pos..]
    }

    /// Number of unconsumed bytes.
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Whether no partial message is buffered. Read loops use this to tell a
    /// clean close (EOF on a frame boundary) from a truncated message.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    fn consume(&mut self, n: usize) {
        self.read_pos += n;
        debug_assert!(self.read_pos <= self.buffer.len());
    }

    /// Discard everything buffered.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}

/// First occurrence of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn crlf_codec(max: i64) -> FrameCodec {
        FrameCodec::new(FramingMode::default(), max).unwrap()
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let codec = crlf_codec(0);
        let framed = codec.encode(b"hello world").unwrap();
        assert_eq!(framed, b"hello world\r\n");

        let mut buf = FrameBuffer::new();
        buf.push(&framed);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, b"hello world");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_idempotent_on_terminated_input() {
        let codec = crlf_codec(0);
        let once = codec.encode(b"msg").unwrap();
        let twice = codec.encode(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let codec = crlf_codec(0);
        let mut buf = FrameBuffer::new();

        buf.push(b"par");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.push(b"tial\r");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.push(b"\nnext");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, b"partial");
        // "next" stays buffered for the following message
        assert_eq!(buf.pending(), b"next");
    }

    #[test]
    fn test_decode_multiple_messages() {
        let codec = crlf_codec(0);
        let mut buf = FrameBuffer::new();
        buf.push(b"first\r\nsecond\r\n");

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b"first");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b"second");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_empty_message() {
        let codec = crlf_codec(0);
        let mut buf = FrameBuffer::new();
        buf.push(b"\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b"");
    }

    #[test]
    fn test_max_size_exceeded_before_terminator() {
        let codec = crlf_codec(8);
        let mut buf = FrameBuffer::new();
        buf.push(b"0123456789abcdef"); // 16 bytes, no terminator

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::MaximumSize { max: 8, .. }));
    }

    #[test]
    fn test_max_size_exceeded_with_terminator_present() {
        let codec = crlf_codec(4);
        let mut buf = FrameBuffer::new();
        buf.push(b"toolong\r\n");

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::MaximumSize { size: 7, max: 4 }));
    }

    #[test]
    fn test_under_cap_not_flagged() {
        let codec = crlf_codec(16);
        let mut buf = FrameBuffer::new();
        buf.push(b"0123456789"); // under cap, no terminator yet
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_encode_too_large() {
        let codec = crlf_codec(4);
        let err = codec.encode(b"toolong").unwrap_err();
        assert!(matches!(err, FrameError::MaximumSize { size: 7, max: 4 }));
    }

    #[test]
    fn test_invalid_size_config() {
        let err = FrameCodec::new(FramingMode::default(), -1).unwrap_err();
        assert!(matches!(err, FrameError::InvalidSize(-1)));
    }

    #[test]
    fn test_empty_delimiter_rejected_at_construction() {
        let err = FrameCodec::new(FramingMode::Delimiter(Vec::new()), 8).unwrap_err();
        assert!(matches!(err, FrameError::EmptyDelimiter));
    }

    #[test]
    fn test_single_byte_delimiter_decodes() {
        let codec = FrameCodec::new(FramingMode::Delimiter(vec![b'\n']), 8).unwrap();
        let mut buf = FrameBuffer::new();
        buf.push(b"one\ntwo");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b"one");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_zero_means_unlimited() {
        let codec = crlf_codec(0);
        let big = vec![b'x'; 1 << 20];
        assert!(codec.encode(&big).is_ok());
    }

    #[test]
    fn test_telnet_eof_mode() {
        let codec = FrameCodec::new(FramingMode::TelnetEof, 0).unwrap();
        let framed = codec.encode(b"quit").unwrap();
        assert!(framed.ends_with(TELNET_EOF));

        let mut buf = FrameBuffer::new();
        buf.push(&framed);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b"quit");
    }

    #[test]
    fn test_sentinel_split_across_pushes() {
        let codec = FrameCodec::new(FramingMode::TelnetEof, 0).unwrap();
        let mut buf = FrameBuffer::new();
        buf.push(b"body\xFF\xF4");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.push(&[0xFF, 0xFD, 0x06]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b"body");
    }

    #[test]
    fn test_buffer_compaction_keeps_pending_bytes() {
        let codec = crlf_codec(0);
        let mut buf = FrameBuffer::new();

        // Push enough consumed traffic to trigger compaction, then verify
        // a straddling message still decodes.
        for _ in 0..2048 {
            buf.push(b"ping\r\n");
            assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b"ping");
        }
        buf.push(b"tail");
        buf.push(b"\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b"tail");
    }
}
