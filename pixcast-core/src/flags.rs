//! First-byte flag bits of a WebSocket frame header.

bitflags::bitflags! {
    /// `FIN RSV1 RSV2 RSV3`, the high nibble of header byte 0.
    ///
    /// RSV1 is claimed by permessage-deflate to mark a compressed
    /// message and only ever appears on the first frame of a message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u8 {
        const FIN = 0x80;
        const RSV1 = 0x40;
        const RSV2 = 0x20;
        const RSV3 = 0x10;
    }
}

impl FrameFlags {
    /// Extract the flag nibble from header byte 0.
    pub const fn from_header_byte(b0: u8) -> Self {
        Self::from_bits_truncate(b0 & 0xF0)
    }

    /// Whether this is the final frame of a message.
    pub const fn is_final(self) -> bool {
        self.contains(Self::FIN)
    }

    /// Whether the message payload is deflate-compressed.
    pub const fn is_compressed(self) -> bool {
        self.contains(Self::RSV1)
    }
}
