//! Wire framing: `[u32 BE length][u8 version][u32 BE correlation][u8 type]`
//! followed by the payload. The length field counts everything after
//! itself, so an empty payload frame has length 6.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use trellis_core::Error;

pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed bytes after the length prefix: version + correlation id + type.
const HEADER_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Request,
    Response,
    Error,
}

impl FrameType {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(FrameType::Request),
            1 => Some(FrameType::Response),
            2 => Some(FrameType::Error),
            _ => None,
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            FrameType::Request => 0,
            FrameType::Response => 1,
            FrameType::Error => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub correlation_id: u32,
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn request(correlation_id: u32, payload: Bytes) -> Self {
        Self {
            correlation_id,
            frame_type: FrameType::Request,
            payload,
        }
    }

    pub fn response(correlation_id: u32, payload: Bytes) -> Self {
        Self {
            correlation_id,
            frame_type: FrameType::Response,
            payload,
        }
    }

    pub fn error(correlation_id: u32, payload: Bytes) -> Self {
        Self {
            correlation_id,
            frame_type: FrameType::Error,
            payload,
        }
    }
}

pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: u32) -> Self {
        Self {
            max_frame_bytes: max_frame_bytes as usize,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length < HEADER_LEN {
            return Err(Error::invalid_argument(format!(
                "frame length {length} below header size"
            )));
        }
        if length > self.max_frame_bytes {
            return Err(Error::invalid_argument(format!(
                "frame length {length} exceeds limit {}",
                self.max_frame_bytes
            )));
        }
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let version = src.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(Error::invalid_argument(format!(
                "unsupported protocol version {version}"
            )));
        }
        let correlation_id = src.get_u32();
        let type_byte = src.get_u8();
        let frame_type = FrameType::from_byte(type_byte)
            .ok_or_else(|| Error::invalid_argument(format!("unknown frame type {type_byte}")))?;
        let payload = src.split_to(length - HEADER_LEN).freeze();

        Ok(Some(Frame {
            correlation_id,
            frame_type,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        let length = HEADER_LEN + frame.payload.len();
        if length > self.max_frame_bytes {
            return Err(Error::invalid_argument(format!(
                "outbound frame length {length} exceeds limit {}",
                self.max_frame_bytes
            )));
        }
        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u32(frame.correlation_id);
        dst.put_u8(frame.frame_type.as_byte());
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: Frame) -> BytesMut {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn round_trip() {
        let frame = Frame::request(42, Bytes::from_static(b"{\"method\":\"user.get\"}"));
        let mut buf = encode(frame.clone());
        let mut codec = FrameCodec::new(1024);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn wire_layout_is_big_endian_with_version() {
        let buf = encode(Frame::response(0x0102_0304, Bytes::from_static(b"x")));
        // length = 6 + 1 payload byte
        assert_eq!(&buf[..4], &[0, 0, 0, 7]);
        assert_eq!(buf[4], PROTOCOL_VERSION);
        assert_eq!(&buf[5..9], &[1, 2, 3, 4]);
        assert_eq!(buf[9], 1);
        assert_eq!(&buf[10..], b"x");
    }

    #[test]
    fn partial_input_yields_none_until_complete() {
        let full = encode(Frame::request(7, Bytes::from_static(b"abc")));
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::new();

        for chunk in full.chunks(3) {
            buf.extend_from_slice(chunk);
            if buf.len() < full.len() {
                assert!(codec.decode(&mut buf).unwrap().is_none());
            }
        }
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.correlation_id, 7);
        assert_eq!(&frame.payload[..], b"abc");
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut buf = encode(Frame::request(1, Bytes::from_static(b"a")));
        buf.extend_from_slice(&encode(Frame::request(2, Bytes::from_static(b"b"))));
        let mut codec = FrameCodec::new(1024);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().correlation_id, 1);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().correlation_id, 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::new();
        buf.put_u32(1000);
        buf.put_slice(&[0u8; 16]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn wrong_version_rejected() {
        let mut buf = encode(Frame::request(1, Bytes::new()));
        buf[4] = 9;
        let mut codec = FrameCodec::new(1024);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn unknown_type_rejected() {
        let mut buf = encode(Frame::request(1, Bytes::new()));
        buf[9] = 7;
        let mut codec = FrameCodec::new(1024);
        assert!(codec.decode(&mut buf).is_err());
    }
}
