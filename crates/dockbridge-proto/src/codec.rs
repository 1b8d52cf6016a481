//! Codec for the exec attach wire format
//!
//! A multiplexed attach stream is a sequence of frames, each an 8-byte header
//! followed by the payload:
//!
//! ```text
//! [tag, 0, 0, 0, len_be_0, len_be_1, len_be_2, len_be_3] payload...
//! ```
//!
//! Streams attached with a TTY carry no header at all; [`MuxCodec::raw`]
//! yields whatever bytes arrive as [`StreamType::Raw`] frames.

use crate::{Frame, ProtocolError, StreamType};
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, Encoder, FramedRead};

/// Length of a multiplexed frame header
pub const HEADER_LEN: usize = 8;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodecMode {
    Multiplexed,
    Raw,
}

/// Frame codec for exec attach streams
#[derive(Debug, Clone)]
pub struct MuxCodec {
    mode: CodecMode,
    /// Maximum frame size allowed
    max_frame_size: usize,
}

impl Default for MuxCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MuxCodec {
    /// Create a codec for header-tagged streams
    pub fn new() -> Self {
        Self {
            mode: CodecMode::Multiplexed,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec for TTY streams without headers
    pub fn raw() -> Self {
        Self {
            mode: CodecMode::Raw,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a new codec with custom max frame size
    ///
    /// The header length field is 32 bits wide, so larger limits are clamped.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size.min(u32::MAX as usize);
        self
    }

    /// Largest payload this codec accepts
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Whether this codec expects frame headers
    pub fn is_multiplexed(&self) -> bool {
        self.mode == CodecMode::Multiplexed
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}

impl Decoder for MuxCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if self.mode == CodecMode::Raw {
            if src.is_empty() {
                return Ok(None);
            }
            let take = src.len().min(self.max_frame_size);
            return Ok(Some(Frame::raw(src.split_to(take).freeze())));
        }

        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let tag = src[0];
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        self.check_size(len)?;

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame::new(StreamType::from_tag(tag), payload)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::TruncatedFrame {
                remaining: src.len(),
            }),
        }
    }
}

impl Encoder<Frame> for MuxCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        self.check_size(frame.payload.len())?;

        if self.mode == CodecMode::Raw {
            dst.extend_from_slice(&frame.payload);
            return Ok(());
        }

        let tag = frame.stream_type.tag().ok_or(ProtocolError::UntaggedFrame)?;
        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u8(tag);
        dst.put_slice(&[0, 0, 0]);
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

/// Decode frames from an attach stream
pub fn frames_from_reader<R>(reader: R, codec: MuxCodec) -> FramedRead<R, MuxCodec>
where
    R: AsyncRead,
{
    FramedRead::new(reader, codec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::StreamExt;
    use proptest::prelude::*;

    fn encode_all(frames: &[Frame]) -> BytesMut {
        let mut codec = MuxCodec::new();
        let mut buf = BytesMut::new();
        for frame in frames {
            codec.encode(frame.clone(), &mut buf).unwrap();
        }
        buf
    }

    #[test]
    fn test_header_layout() {
        let buf = encode_all(&[Frame::stderr("oops")]);
        assert_eq!(&buf[..HEADER_LEN], &[2, 0, 0, 0, 0, 0, 0, 4]);
        assert_eq!(&buf[HEADER_LEN..], b"oops");
    }

    #[test]
    fn test_partial_header_and_payload() {
        let encoded = encode_all(&[Frame::stdout("hello")]);
        let mut codec = MuxCodec::new();

        let mut buf = BytesMut::from(&encoded[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[5..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[10..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::stdout("hello"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_tag_is_decoded_not_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[9, 0, 0, 0, 0, 0, 0, 1, b'x']);

        let frame = MuxCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.stream_type, StreamType::Unknown(9));
        assert_eq!(frame.payload, Bytes::from("x"));
    }

    #[test]
    fn test_frame_too_large() {
        let mut codec = MuxCodec::new().with_max_frame_size(4);
        let mut buf = BytesMut::new();
        buf.put_slice(&[1, 0, 0, 0, 0, 0, 0, 200]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { size: 200, max: 4 })
        ));

        let mut out = BytesMut::new();
        assert!(matches!(
            codec.encode(Frame::stdout("too long"), &mut out),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_max_frame_size_fits_length_field() {
        let codec = MuxCodec::new().with_max_frame_size(usize::MAX);
        assert_eq!(codec.max_frame_size(), u32::MAX as usize);

        let codec = MuxCodec::new().with_max_frame_size(1024);
        assert_eq!(codec.max_frame_size(), 1024);
    }

    #[test]
    fn test_truncated_stream() {
        let encoded = encode_all(&[Frame::stdout("hello")]);
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);

        let result = MuxCodec::new().decode_eof(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::TruncatedFrame { remaining: 12 })
        ));
    }

    #[test]
    fn test_raw_mode() {
        let mut codec = MuxCodec::raw();
        assert!(!codec.is_multiplexed());

        let mut buf = BytesMut::from(&b"\x01\x00plain tty bytes"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.stream_type, StreamType::Raw);
        assert_eq!(frame.payload, Bytes::from_static(b"\x01\x00plain tty bytes"));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_raw_frame_needs_raw_codec() {
        let mut out = BytesMut::new();
        assert!(matches!(
            MuxCodec::new().encode(Frame::raw("x"), &mut out),
            Err(ProtocolError::UntaggedFrame)
        ));

        MuxCodec::raw().encode(Frame::raw("x"), &mut out).unwrap();
        assert_eq!(&out[..], b"x");
    }

    #[tokio::test]
    async fn test_frames_from_reader() {
        let encoded = encode_all(&[
            Frame::stdout("hello"),
            Frame::stderr("warn"),
            Frame::stdout(" world"),
        ]);
        let reader: &[u8] = &encoded;

        let frames: Vec<Frame> = frames_from_reader(reader, MuxCodec::new())
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert_eq!(
            frames,
            vec![
                Frame::stdout("hello"),
                Frame::stderr("warn"),
                Frame::stdout(" world"),
            ]
        );
    }

    proptest! {
        #[test]
        fn test_chunk_boundaries_do_not_change_frames(
            payloads in prop::collection::vec(
                (0u8..3, prop::collection::vec(any::<u8>(), 0..64)),
                1..8
            ),
            chunk in 1usize..17
        ) {
            let frames: Vec<Frame> = payloads
                .into_iter()
                .map(|(tag, payload)| Frame::new(StreamType::from_tag(tag), payload))
                .collect();
            let encoded = encode_all(&frames);

            let mut codec = MuxCodec::new();
            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();
            for piece in encoded.chunks(chunk) {
                buf.extend_from_slice(piece);
                while let Some(frame) = codec.decode(&mut buf).unwrap() {
                    decoded.push(frame);
                }
            }

            prop_assert!(buf.is_empty());
            prop_assert_eq!(decoded, frames);
        }
    }
}
