//! Frame-level buffers: a reusable writer for outgoing messages and an
//! incremental reader that reassembles incoming frames from arbitrary chunks.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{PgError, PgResult};

/// Tag byte plus the 4-byte length of a framed message.
const HEADER_LEN: usize = 5;

/// Initial capacity of a fresh writer.
const DEFAULT_WRITER_CAPACITY: usize = 256;

/// Initial capacity of a fresh reader.
const DEFAULT_READER_CAPACITY: usize = 8192;

// ============================================================================
// Message Writer
// ============================================================================

/// Serializes protocol fields into length-prefixed frames.
///
/// Every message is written behind a 5-byte slot reserved for its header.
/// [`MessageWriter::add_header`] patches the tag and length in place and
/// reserves the next slot, so several messages can be chained in one buffer
/// before a single [`MessageWriter::flush`].
#[derive(Debug)]
pub struct MessageWriter {
    buf: BytesMut,
    /// Start of the header slot of the message being built.
    header_pos: usize,
}

impl Default for MessageWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_WRITER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut buf = BytesMut::with_capacity(capacity.max(HEADER_LEN));
        buf.put_bytes(0, HEADER_LEN);
        Self { buf, header_pos: 0 }
    }

    /// Grow by half the current capacity plus what is needed.
    fn ensure(&mut self, additional: usize) {
        let remaining = self.buf.capacity() - self.buf.len();
        if remaining < additional {
            let grow = (self.buf.capacity() >> 1) + additional;
            self.buf.reserve(grow);
        }
    }

    pub fn add_i16(&mut self, v: i16) -> &mut Self {
        self.ensure(2);
        self.buf.put_i16(v);
        self
    }

    pub fn add_i32(&mut self, v: i32) -> &mut Self {
        self.ensure(4);
        self.buf.put_i32(v);
        self
    }

    /// Write a string followed by a nul terminator.
    pub fn add_cstring(&mut self, s: &str) -> &mut Self {
        self.ensure(s.len() + 1);
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
        self
    }

    /// Write a string without terminator.
    pub fn add_str(&mut self, s: &str) -> &mut Self {
        self.add_bytes(s.as_bytes())
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.ensure(bytes.len());
        self.buf.put_slice(bytes);
        self
    }

    /// Finish the current message with `tag`.
    ///
    /// The length written excludes the tag byte but includes itself.
    pub fn add_header(&mut self, tag: u8) -> &mut Self {
        let len = (self.buf.len() - self.header_pos - 1) as i32;
        self.buf[self.header_pos] = tag;
        self.buf[self.header_pos + 1..self.header_pos + HEADER_LEN]
            .copy_from_slice(&len.to_be_bytes());

        self.header_pos = self.buf.len();
        self.ensure(HEADER_LEN);
        self.buf.put_bytes(0, HEADER_LEN);
        self
    }

    /// Take every finished message, leaving any unfinished payload in place.
    pub fn flush(&mut self) -> Bytes {
        let out = self.buf.split_to(self.header_pos).freeze();
        self.header_pos = 0;
        out
    }

    /// Finish the current message with `tag` and take everything.
    pub fn frame(&mut self, tag: u8) -> Bytes {
        self.add_header(tag);
        self.flush()
    }

    /// Frame the current payload as an untagged message (startup family):
    /// a 4-byte length, counting itself, followed by the payload.
    ///
    /// Untagged messages are sent before anything else on a stream, so they
    /// never follow chained messages in the same buffer.
    pub fn frame_untagged(&mut self) -> Bytes {
        debug_assert_eq!(self.header_pos, 0, "untagged frame after chained messages");

        let len = (self.buf.len() - self.header_pos - 1) as i32;
        self.buf[self.header_pos + 1..self.header_pos + HEADER_LEN]
            .copy_from_slice(&len.to_be_bytes());

        let mut out = self.buf.split();
        out.advance(self.header_pos + 1);

        self.header_pos = 0;
        self.buf.put_bytes(0, HEADER_LEN);
        out.freeze()
    }

    /// Bytes of finished messages waiting to be flushed.
    pub fn pending_len(&self) -> usize {
        self.header_pos
    }
}

// ============================================================================
// Message Reader
// ============================================================================

/// One complete frame: the tag byte and the payload following the length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub body: Bytes,
}

/// Reassembles whole frames from incoming chunks.
///
/// Feeding the stream in one chunk or byte by byte yields the same frames.
#[derive(Debug)]
pub struct MessageReader {
    buf: BytesMut,
    header_size: usize,
    max_message_size: usize,
}

impl Default for MessageReader {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageReader {
    /// Reader for backend frames (1-byte tag header).
    pub fn new() -> Self {
        Self::with_header_size(1)
    }

    /// Reader for frames with `header_size` bytes before the length field.
    pub fn with_header_size(header_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(DEFAULT_READER_CAPACITY),
            header_size,
            max_message_size: 1 << 30,
        }
    }

    /// Reject frames whose declared length exceeds `max`.
    pub fn max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Append an incoming chunk, doubling capacity when it does not fit.
    pub fn feed(&mut self, chunk: &[u8]) {
        let remaining = self.buf.capacity() - self.buf.len();
        if remaining < chunk.len() {
            let target = (self.buf.capacity() * 2).max(self.buf.len() + chunk.len());
            self.buf.reserve(target - self.buf.len());
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Buffer to read directly into from a socket.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, or `None` until more bytes arrive.
    pub fn read(&mut self) -> PgResult<Option<Frame>> {
        let hs = self.header_size;
        if self.buf.len() < hs + 4 {
            return Ok(None);
        }

        let len = i32::from_be_bytes([
            self.buf[hs],
            self.buf[hs + 1],
            self.buf[hs + 2],
            self.buf[hs + 3],
        ]);
        if len < 4 {
            return Err(PgError::Protocol(format!("Invalid message length: {}", len)));
        }
        let len = len as usize;
        if len > self.max_message_size {
            return Err(PgError::Protocol(format!(
                "Message too large: {} > {}",
                len, self.max_message_size
            )));
        }

        if self.buf.len() < hs + len {
            return Ok(None);
        }

        let tag = if hs > 0 { self.buf[0] } else { 0 };
        self.buf.advance(hs + 4);
        let body = self.buf.split_to(len - 4).freeze();
        Ok(Some(Frame { tag, body }))
    }
}
