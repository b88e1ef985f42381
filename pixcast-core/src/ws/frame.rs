//! RFC 6455 frame header encoding, decoding and masking.
//!
//! ## Wire format
//!
//! ```text
//!  0               1               2               3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |                 Masking-key (0 or 4 bytes)                    |
//! +---------------------------------------------------------------+
//! ```
//!
//! Lengths below 126 use the 7-bit field, up to 65535 use the 16-bit
//! extension, anything larger the 64-bit extension (MSB clear). All
//! multi-byte fields are big-endian.

use crate::error::StreamError;
use crate::flags::FrameFlags;

/// Largest header: 2 + 8 (extended length) + 4 (mask).
pub const MAX_HEADER_LEN: usize = 14;

/// Control frames carry at most this many payload bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

// ── OpCode ───────────────────────────────────────────────────────

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// 0x3-0x7 / 0xB-0xF: decoded so the reader can log and skip them.
    Reserved(u8),
}

impl OpCode {
    pub const fn from_u8(value: u8) -> Self {
        match value & 0x0F {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            other => OpCode::Reserved(other),
        }
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Reserved(v) => v & 0x0F,
        }
    }

    /// Close, ping, pong and the reserved 0xB-0xF range.
    pub const fn is_control(self) -> bool {
        self.as_u8() & 0x08 != 0
    }
}

// ── FrameHeader ──────────────────────────────────────────────────

/// A parsed or to-be-encoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub flags: FrameFlags,
    pub opcode: OpCode,
    /// Present on client→server frames only.
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

impl FrameHeader {
    /// Unmasked single-frame header (server → client).
    pub fn new(flags: FrameFlags, opcode: OpCode, payload_len: u64) -> Self {
        Self {
            flags,
            opcode,
            mask: None,
            payload_len,
        }
    }

    /// Bytes this header occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        let ext = match self.payload_len {
            0..=125 => 0,
            126..=65535 => 2,
            _ => 8,
        };
        2 + ext + if self.mask.is_some() { 4 } else { 0 }
    }

    /// Serialize into a fixed buffer; returns it with the used length.
    pub fn encode(&self) -> ([u8; MAX_HEADER_LEN], usize) {
        let mut buf = [0u8; MAX_HEADER_LEN];
        buf[0] = self.flags.bits() | self.opcode.as_u8();
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0x00 };

        let mut pos = match self.payload_len {
            len @ 0..=125 => {
                buf[1] = mask_bit | len as u8;
                2
            }
            len @ 126..=65535 => {
                buf[1] = mask_bit | 126;
                buf[2..4].copy_from_slice(&(len as u16).to_be_bytes());
                4
            }
            len => {
                buf[1] = mask_bit | 127;
                buf[2..10].copy_from_slice(&len.to_be_bytes());
                10
            }
        };

        if let Some(mask) = self.mask {
            buf[pos..pos + 4].copy_from_slice(&mask);
            pos += 4;
        }
        (buf, pos)
    }

    /// Parse a header from the front of `data`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, otherwise the
    /// header and its encoded length.
    pub fn try_parse(data: &[u8]) -> Result<Option<(Self, usize)>, StreamError> {
        if data.len() < 2 {
            return Ok(None);
        }

        let flags = FrameFlags::from_header_byte(data[0]);
        let opcode = OpCode::from_u8(data[0]);
        let masked = data[1] & 0x80 != 0;
        let len7 = data[1] & 0x7F;

        let (payload_len, mut pos) = match len7 {
            0..=125 => (u64::from(len7), 2),
            126 => {
                if data.len() < 4 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([data[2], data[3]]);
                if len < 126 {
                    return Err(StreamError::InvalidFrame("non-minimal 16-bit length"));
                }
                (u64::from(len), 4)
            }
            _ => {
                if data.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&data[2..10]);
                let len = u64::from_be_bytes(raw);
                if len >> 63 != 0 {
                    return Err(StreamError::InvalidFrame("64-bit length has MSB set"));
                }
                if len <= 0xFFFF {
                    return Err(StreamError::InvalidFrame("non-minimal 64-bit length"));
                }
                (len, 10)
            }
        };

        let mask = if masked {
            if data.len() < pos + 4 {
                return Ok(None);
            }
            let mut key = [0u8; 4];
            key.copy_from_slice(&data[pos..pos + 4]);
            pos += 4;
            Some(key)
        } else {
            None
        };

        if opcode.is_control() {
            if !flags.is_final() {
                return Err(StreamError::InvalidFrame("fragmented control frame"));
            }
            if payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(StreamError::InvalidFrame("control payload over 125 bytes"));
            }
        }

        Ok(Some((
            Self {
                flags,
                opcode,
                mask,
                payload_len,
            },
            pos,
        )))
    }

    /// Like [`try_parse`](Self::try_parse) but a short buffer is an error.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), StreamError> {
        Self::try_parse(data)?.ok_or(StreamError::InvalidFrame("header too short"))
    }
}

// ── Masking ──────────────────────────────────────────────────────

/// XOR `payload` in place with the 4-byte key. Applying it twice with
/// the same key restores the input.
pub fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

// ── Close payloads ───────────────────────────────────────────────

/// 1000: normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// 1001: endpoint going away (server shutdown).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// 1002: protocol error.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// 1009: message too big.
pub const CLOSE_TOO_BIG: u16 = 1009;

/// Two-byte big-endian close payload.
pub fn close_payload(code: u16) -> [u8; 2] {
    code.to_be_bytes()
}

/// Status code of a close frame, `None` for an empty payload.
pub fn parse_close_code(payload: &[u8]) -> Option<u16> {
    match payload {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn binary(len: u64) -> FrameHeader {
        FrameHeader::new(FrameFlags::FIN, OpCode::Binary, len)
    }

    #[test]
    fn length_field_thresholds() {
        let cases = [(0u64, 2usize, 0u8), (125, 2, 125), (126, 4, 126), (65535, 4, 126), (65536, 10, 127)];
        for (len, header_len, len7) in cases {
            let (buf, used) = binary(len).encode();
            assert_eq!(used, header_len, "len {len}");
            assert_eq!(buf[1] & 0x7F, len7, "len {len}");

            let (parsed, consumed) = FrameHeader::decode(&buf[..used]).unwrap();
            assert_eq!(consumed, used);
            assert_eq!(parsed.payload_len, len);
        }
    }

    #[test]
    fn first_byte_layout() {
        let header = FrameHeader::new(FrameFlags::FIN | FrameFlags::RSV1, OpCode::Binary, 3);
        let (buf, _) = header.encode();
        assert_eq!(buf[0], 0xC2);
        assert_eq!(buf[1], 0x03);
    }

    #[test]
    fn masked_header_roundtrip() {
        let header = FrameHeader {
            flags: FrameFlags::FIN,
            opcode: OpCode::Text,
            mask: Some([1, 2, 3, 4]),
            payload_len: 300,
        };
        let (buf, used) = header.encode();
        assert_eq!(used, 8);
        assert_eq!(buf[1] & 0x80, 0x80);
        assert_eq!(FrameHeader::decode(&buf[..used]).unwrap(), (header, 8));
    }

    #[test]
    fn short_input_needs_more() {
        assert!(FrameHeader::try_parse(&[0x82]).unwrap().is_none());
        assert!(FrameHeader::try_parse(&[0x82, 126, 0x01]).unwrap().is_none());
        assert!(FrameHeader::try_parse(&[0x82, 0x85, 1, 2]).unwrap().is_none());
        assert!(FrameHeader::decode(&[0x82]).is_err());
    }

    #[test]
    fn rejects_invalid_length_encodings() {
        // 16-bit form carrying a length that fits in 7 bits.
        assert!(FrameHeader::try_parse(&[0x82, 126, 0x00, 0x05]).is_err());
        // 64-bit form with the most significant bit set.
        let mut bad = vec![0x82, 127];
        bad.extend_from_slice(&(1u64 << 63).to_be_bytes());
        assert!(FrameHeader::try_parse(&bad).is_err());
    }

    #[test]
    fn rejects_bad_control_frames() {
        // Ping without FIN.
        assert!(FrameHeader::try_parse(&[0x09, 0x00]).is_err());
        // Close with 126-byte payload.
        assert!(FrameHeader::try_parse(&[0x88, 126, 0x00, 126]).is_err());
    }

    #[test]
    fn reserved_opcodes_parse() {
        let (header, _) = FrameHeader::decode(&[0x83, 0x00]).unwrap();
        assert_eq!(header.opcode, OpCode::Reserved(3));
        assert!(!header.opcode.is_control());
        assert!(OpCode::Reserved(0xB).is_control());
    }

    #[test]
    fn close_code_helpers() {
        assert_eq!(close_payload(CLOSE_NORMAL), [0x03, 0xE8]);
        assert_eq!(parse_close_code(&[0x03, 0xE9]), Some(CLOSE_GOING_AWAY));
        assert_eq!(parse_close_code(&[]), None);
    }

    proptest! {
        #[test]
        fn prop_mask_is_involution(payload in prop::collection::vec(any::<u8>(), 0..2048), mask in any::<[u8; 4]>()) {
            let mut data = payload.clone();
            apply_mask(&mut data, mask);
            apply_mask(&mut data, mask);
            prop_assert_eq!(data, payload);
        }

        #[test]
        fn prop_header_length_roundtrip(len in 0u64..(1u64 << 40), masked in any::<bool>()) {
            let header = FrameHeader {
                flags: FrameFlags::FIN,
                opcode: OpCode::Binary,
                mask: masked.then_some([9, 8, 7, 6]),
                payload_len: len,
            };
            let (buf, used) = header.encode();
            prop_assert_eq!(used, header.encoded_len());
            let (parsed, consumed) = FrameHeader::decode(&buf[..used]).unwrap();
            prop_assert_eq!(consumed, used);
            prop_assert_eq!(parsed, header);
        }
    }
}
