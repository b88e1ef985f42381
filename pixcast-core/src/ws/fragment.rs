//! Outbound message fragmentation.
//!
//! A logical message longer than the chunk size is split into
//! `ceil(len / chunk)` frames. Only the first frame carries the real
//! opcode (and RSV1 for compressed payloads); the rest are
//! continuations. Only the last frame has FIN set.

use crate::flags::FrameFlags;
use crate::ws::frame::{FrameHeader, OpCode};

/// Default fragment payload size (16 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Iterator over `(header, chunk)` pairs of one outbound message.
pub struct Fragments<'a> {
    payload: &'a [u8],
    opcode: OpCode,
    compressed: bool,
    chunk_size: usize,
    offset: usize,
    index: usize,
    done: bool,
}

impl<'a> Fragments<'a> {
    /// # Panics
    ///
    /// Panics if `chunk_size` is zero.
    pub fn new(payload: &'a [u8], opcode: OpCode, compressed: bool, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        Self {
            payload,
            opcode,
            compressed,
            chunk_size,
            offset: 0,
            index: 0,
            done: false,
        }
    }

    /// Number of frames this message produces (at least one).
    pub fn frame_count(&self) -> usize {
        self.payload.len().div_ceil(self.chunk_size).max(1)
    }
}

impl<'a> Iterator for Fragments<'a> {
    type Item = (FrameHeader, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let end = (self.offset + self.chunk_size).min(self.payload.len());
        let chunk = &self.payload[self.offset..end];
        let first = self.index == 0;
        let last = end == self.payload.len();

        let mut flags = FrameFlags::empty();
        if last {
            flags |= FrameFlags::FIN;
        }
        if first && self.compressed {
            flags |= FrameFlags::RSV1;
        }
        let opcode = if first {
            self.opcode
        } else {
            OpCode::Continuation
        };

        self.offset = end;
        self.index += 1;
        self.done = last;

        Some((FrameHeader::new(flags, opcode, chunk.len() as u64), chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(len: usize, chunk: usize, compressed: bool) -> Vec<(FrameHeader, usize)> {
        let payload = vec![0u8; len];
        Fragments::new(&payload, OpCode::Binary, compressed, chunk)
            .map(|(h, c)| (h, c.len()))
            .collect()
    }

    #[test]
    fn frame_count_is_ceil() {
        for (len, chunk) in [(1, 16), (16, 16), (17, 16), (76_801, 16_384), (65_536, 16_384)] {
            let frames = collect(len, chunk, false);
            assert_eq!(frames.len(), len.div_ceil(chunk), "len {len} chunk {chunk}");
            assert_eq!(frames.iter().map(|(_, n)| n).sum::<usize>(), len);
        }
    }

    #[test]
    fn only_first_has_opcode_only_last_has_fin() {
        let frames = collect(76_801, 16_384, false);
        assert_eq!(frames.len(), 5);

        let real = frames.iter().filter(|(h, _)| h.opcode == OpCode::Binary).count();
        assert_eq!(real, 1);
        assert_eq!(frames[0].0.opcode, OpCode::Binary);
        for (h, _) in &frames[1..] {
            assert_eq!(h.opcode, OpCode::Continuation);
        }

        let fins: Vec<bool> = frames.iter().map(|(h, _)| h.flags.is_final()).collect();
        assert_eq!(fins, vec![false, false, false, false, true]);
        assert_eq!(frames[4].1, 76_801 - 4 * 16_384);
    }

    #[test]
    fn rsv1_only_on_first_frame() {
        let frames = collect(40_000, 16_384, true);
        assert!(frames[0].0.flags.is_compressed());
        assert!(frames[1..].iter().all(|(h, _)| !h.flags.is_compressed()));
    }

    #[test]
    fn single_frame_message() {
        let frames = collect(100, 16_384, true);
        assert_eq!(frames.len(), 1);
        let (h, n) = frames[0];
        assert_eq!(h.flags, FrameFlags::FIN | FrameFlags::RSV1);
        assert_eq!(h.opcode, OpCode::Binary);
        assert_eq!(n, 100);
    }

    #[test]
    fn empty_payload_is_one_empty_frame() {
        let payload: [u8; 0] = [];
        let fragments = Fragments::new(&payload, OpCode::Text, false, 8);
        assert_eq!(fragments.frame_count(), 1);
        let frames: Vec<_> = fragments.collect();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].0.flags.is_final());
        assert!(frames[0].1.is_empty());
    }
}
