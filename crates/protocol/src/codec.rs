//! Length-prefixed framing: a 4-byte big-endian body length, then a CBOR body.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::Frame;

/// Maximum frame body size (10MB by default).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Codec for encoding/decoding frames.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec with the default maximum frame size.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom maximum frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut header = &buf[..LENGTH_PREFIX];
        let len = header.get_u32() as usize;

        if len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        let frame_len = LENGTH_PREFIX + len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX);
        let body = buf.split_to(len);

        let frame = Frame::from_cbor(&body)?;
        frame.validate()?;

        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let body = frame.to_cbor()?;

        if body.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max: self.max_frame_size,
            });
        }

        buf.reserve(LENGTH_PREFIX + body.len());
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use bytes::Bytes;

    use super::*;
    use crate::frame::FrameKind;

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut codec = FrameCodec::new();
        let mut full = BytesMut::new();
        let frame = Frame::request(FrameKind::Publish, "t", Bytes::from_static(b"hello"));
        codec.encode(frame.clone(), &mut full).unwrap();

        let mut buf = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.put_u8(full[full.len() - 1]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::request(FrameKind::Subscribe, "a", Bytes::new()), &mut buf)
            .unwrap();
        codec.encode(Frame::ack(9, Ok(Bytes::new())), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().kind, FrameKind::Subscribe);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().correlation_id, 9);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::new().with_max_frame_size(8);
        let mut buf = BytesMut::new();
        buf.put_u32(9);

        assert_matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { size: 9, max: 8 })
        );

        let frame = Frame::request(FrameKind::Publish, "topic", Bytes::from_static(b"too long"));
        assert_matches!(
            codec.encode(frame, &mut BytesMut::new()),
            Err(ProtocolError::FrameTooLarge { .. })
        );
    }

    #[test]
    fn test_missing_topic_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let body = Frame::request(FrameKind::Publish, "", Bytes::new()).to_cbor().unwrap();
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);

        assert_matches!(codec.decode(&mut buf), Err(ProtocolError::Invalid(_)));
    }
}
