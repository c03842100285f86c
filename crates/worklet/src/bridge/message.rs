//! Framed messages exchanged between a worker and its manager.
//!
//! A message is a numeric id plus an opaque payload. The only payload shape
//! this crate interprets is console output: a fixed header followed by a
//! NUL-terminated text buffer.

use tokio_util::bytes::BytesMut;

use crate::error::BridgeError;

/// Reserved message id marking a payload as forwarded console output.
///
/// All other ids are application-defined and carried as opaque bytes.
pub const CONSOLE_OUTPUT: u32 = 1;

/// Upper bound on a single message payload.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// One framed unit of data exchanged over a connection.
///
/// Created through [`Connection::create_message`](crate::Connection::create_message)
/// with a zero-initialized payload, or handed out by a receive poll. Dropping a
/// message releases its buffer; an undelivered message is simply dropped.
#[derive(Debug)]
pub struct Message {
    id: u32,
    payload: BytesMut,
}

impl Message {
    pub(crate) fn new(id: u32, size: usize) -> Self {
        Self {
            id,
            payload: BytesMut::zeroed(size),
        }
    }

    pub(crate) fn from_parts(id: u32, payload: BytesMut) -> Self {
        Self { id, payload }
    }

    pub(crate) fn into_parts(self) -> (u32, BytesMut) {
        (self.id, self.payload)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Payload length in bytes. Zero is legal (header-only messages).
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }
}

/// Byte length of the fixed console-output header.
pub const CONSOLE_HEADER_SIZE: usize = 12;

/// A forwarded log statement: fixed header, then the text and its terminator.
///
/// Wire layout: `stream`, `level`, `indent` as little-endian `u32`s, followed
/// by the text bytes and a trailing NUL. Total payload size is
/// `CONSOLE_HEADER_SIZE + text.len() + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleOutput {
    pub stream: u32,
    pub level: u32,
    pub indent: u32,
    pub text: String,
}

impl ConsoleOutput {
    pub fn encoded_len(&self) -> usize {
        CONSOLE_HEADER_SIZE + self.text.len() + 1
    }

    /// Write the payload into `buf`, which must be exactly `encoded_len` bytes.
    pub fn write_to(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), self.encoded_len());
        buf[0..4].copy_from_slice(&self.stream.to_le_bytes());
        buf[4..8].copy_from_slice(&self.level.to_le_bytes());
        buf[8..12].copy_from_slice(&self.indent.to_le_bytes());
        let text_end = CONSOLE_HEADER_SIZE + self.text.len();
        buf[CONSOLE_HEADER_SIZE..text_end].copy_from_slice(self.text.as_bytes());
        buf[text_end] = 0;
    }

    pub fn decode(payload: &[u8]) -> Result<Self, BridgeError> {
        if payload.len() < CONSOLE_HEADER_SIZE + 1 {
            return Err(BridgeError::MalformedConsolePayload(
                "payload shorter than header",
            ));
        }
        let Some((0, text_bytes)) = payload[CONSOLE_HEADER_SIZE..].split_last() else {
            return Err(BridgeError::MalformedConsolePayload(
                "text is missing its NUL terminator",
            ));
        };
        let text = std::str::from_utf8(text_bytes)
            .map_err(|_| BridgeError::MalformedConsolePayload("text is not valid UTF-8"))?;

        Ok(Self {
            stream: read_u32(payload, 0),
            level: read_u32(payload, 4),
            indent: read_u32(payload, 8),
            text: text.to_string(),
        })
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
