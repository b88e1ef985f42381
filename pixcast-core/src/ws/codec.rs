use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::StreamError;
use crate::flags::FrameFlags;
use crate::ws::frame::{FrameHeader, OpCode, apply_mask};

/// One WebSocket frame with its payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsFrame {
    pub flags: FrameFlags,
    pub opcode: OpCode,
    /// Masking key to apply when encoding (client role only).
    pub mask: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl WsFrame {
    /// A complete (FIN) unmasked frame.
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            flags: FrameFlags::FIN,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    pub fn masked(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_final(&self) -> bool {
        self.flags.is_final()
    }
}

/// `tokio_util` codec for WebSocket frames.
///
/// The server decodes with `require_mask = true`; tests playing the
/// browser side use [`WsCodec::client`].
#[derive(Debug, Clone)]
pub struct WsCodec {
    max_frame_size: u64,
    require_mask: bool,
}

impl WsCodec {
    /// Server role: inbound frames must be masked.
    pub fn server(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size as u64,
            require_mask: true,
        }
    }

    /// Client role: inbound frames must not be masked.
    pub fn client(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size as u64,
            require_mask: false,
        }
    }
}

impl tokio_util::codec::Decoder for WsCodec {
    type Item = WsFrame;
    type Error = StreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((header, header_len)) = FrameHeader::try_parse(src)? else {
            return Ok(None);
        };

        if header.payload_len > self.max_frame_size {
            return Err(StreamError::MessageTooLarge {
                size: header.payload_len,
                max: self.max_frame_size,
            });
        }
        if header.mask.is_some() != self.require_mask {
            return Err(StreamError::ProtocolViolation(if self.require_mask {
                "client frame not masked"
            } else {
                "server frame masked"
            }));
        }

        let total = header_len + header.payload_len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let mut payload = src.split_to(header.payload_len as usize);
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Some(WsFrame {
            flags: header.flags,
            opcode: header.opcode,
            mask: header.mask,
            payload: payload.freeze(),
        }))
    }
}

impl tokio_util::codec::Encoder<WsFrame> for WsCodec {
    type Error = StreamError;

    fn encode(&mut self, item: WsFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = FrameHeader {
            flags: item.flags,
            opcode: item.opcode,
            mask: item.mask,
            payload_len: item.payload.len() as u64,
        };
        let (buf, used) = header.encode();
        dst.reserve(used + item.payload.len());
        dst.put_slice(&buf[..used]);

        let start = dst.len();
        dst.put_slice(&item.payload);
        if let Some(mask) = item.mask {
            apply_mask(&mut dst[start..], mask);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn decode_masked_client_frame() {
        let mut client = WsCodec::client(1024);
        let mut server = WsCodec::server(1024);

        let mut wire = BytesMut::new();
        client
            .encode(WsFrame::new(OpCode::Text, &b"hello"[..]).masked([0x37, 0xFA, 0x21, 0x3D]), &mut wire)
            .unwrap();
        // FIN|text, MASK|len.
        assert_eq!(&wire[..2], &[0x81, 0x85]);
        assert_ne!(&wire[6..], b"hello");

        let frame = server.decode(&mut wire).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(&frame.payload[..], b"hello");
        assert!(wire.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let mut server = WsCodec::server(1024);
        let mut wire = BytesMut::new();
        WsCodec::client(1024)
            .encode(WsFrame::new(OpCode::Binary, vec![1u8; 300]).masked([1, 2, 3, 4]), &mut wire)
            .unwrap();

        let tail = wire.split_off(100);
        assert!(server.decode(&mut wire).unwrap().is_none());
        wire.unsplit(tail);
        let frame = server.decode(&mut wire).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 300);
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut server = WsCodec::server(1024);
        let mut client = WsCodec::client(1024);
        let mut wire = BytesMut::new();
        client.encode(WsFrame::new(OpCode::Ping, &b"a"[..]).masked([5; 4]), &mut wire).unwrap();
        client.encode(WsFrame::new(OpCode::Binary, &b"bc"[..]).masked([6; 4]), &mut wire).unwrap();

        assert_eq!(server.decode(&mut wire).unwrap().unwrap().opcode, OpCode::Ping);
        assert_eq!(&server.decode(&mut wire).unwrap().unwrap().payload[..], b"bc");
        assert!(server.decode(&mut wire).unwrap().is_none());
    }

    #[test]
    fn unmasked_client_frame_rejected() {
        let mut server = WsCodec::server(1024);
        let mut wire = BytesMut::from(&[0x82u8, 0x01, 0xAA][..]);
        assert!(matches!(
            server.decode(&mut wire),
            Err(StreamError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn oversized_frame_rejected_before_buffering() {
        let mut server = WsCodec::server(100);
        let mut wire = BytesMut::new();
        let (header, used) = FrameHeader {
            flags: FrameFlags::FIN,
            opcode: OpCode::Binary,
            mask: Some([0; 4]),
            payload_len: 1_000_000,
        }
        .encode();
        wire.extend_from_slice(&header[..used]);
        assert!(matches!(
            server.decode(&mut wire),
            Err(StreamError::MessageTooLarge { .. })
        ));
    }
}
