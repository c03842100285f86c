//! Framed codec for the worker channel.
//!
//! Wraps LengthDelimitedCodec for framing; the frame body is a 4-byte
//! little-endian message id followed by the opaque payload. Works over any
//! AsyncRead/AsyncWrite (pipes, sockets, etc).

use std::io;

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::message::{MAX_MESSAGE_SIZE, Message};

const ID_FIELD_LEN: usize = 4;

/// Codec that frames messages with a length prefix and an id header.
pub struct MessageCodec {
    inner: LengthDelimitedCodec,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_MESSAGE_SIZE + ID_FIELD_LEN)
                .new_codec(),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(mut frame) => {
                if frame.len() < ID_FIELD_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "frame shorter than message header",
                    ));
                }
                let id = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
                frame.advance(ID_FIELD_LEN);
                Ok(Some(Message::from_parts(id, frame)))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (id, payload) = item.into_parts();
        // SAFETY: These logs must NOT be shipped over the channel (would create a
        // feedback loop). ConsoleForwardLayer filters out this crate's wire-path
        // targets so encoding a console message never triggers another one.
        tracing::trace!(id, size_bytes = payload.len(), "Encoding frame");
        let mut body = BytesMut::with_capacity(ID_FIELD_LEN + payload.len());
        body.put_u32_le(id);
        body.extend_from_slice(&payload);
        self.inner.encode(body.freeze(), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_roundtrip() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();

        let mut msg = Message::new(42, 5);
        msg.payload_mut().copy_from_slice(b"bytes");
        codec.encode(msg, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.id(), 42);
        assert_eq!(decoded.payload(), b"bytes");
    }

    #[test]
    fn codec_roundtrip_empty_payload() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(Message::new(7, 0), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.id(), 7);
        assert_eq!(decoded.len(), 0);
    }

    #[test]
    fn codec_preserves_order_across_frames() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();

        for i in 0..4u32 {
            let mut msg = Message::new(i, 1);
            msg.payload_mut()[0] = i as u8;
            codec.encode(msg, &mut buf).unwrap();
        }
        for i in 0..4u32 {
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.id(), i);
            assert_eq!(decoded.payload(), &[i as u8]);
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn codec_waits_for_full_frame() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();

        let mut msg = Message::new(9, 8);
        msg.payload_mut().copy_from_slice(b"deferred");
        codec.encode(msg, &mut buf).unwrap();

        let mut partial = buf.split_to(6);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap().id(), 9);
    }

    #[test]
    fn codec_rejects_truncated_header() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        // Length prefix claims a two-byte body, shorter than the id field.
        buf.extend_from_slice(&[0, 0, 0, 2, 0xaa, 0xbb]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
