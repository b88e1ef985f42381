//! permessage-deflate (RFC 7692) compression streams.
//!
//! Each connection that negotiated the extension owns one
//! [`CompressionContext`]: an outbound [`Deflater`] and an inbound
//! [`Inflater`], both raw DEFLATE with a 15-bit (32 KiB) window.
//!
//! ## Trailer handling
//!
//! A sync flush ends with the empty stored block `00 00 FF FF`. The
//! sender strips it from every message and the receiver appends it
//! back before inflating (RFC 7692 §7.2.1 / §7.2.2).
//!
//! ## Context takeover
//!
//! Without `*_no_context_takeover` the sliding window persists across
//! messages. With it, the affected stream is reset before each message.
//!
//! The codec never decides whether compression was worthwhile; callers
//! compare sizes and, when they throw a compressed output away, must
//! call [`Deflater::reset`] so the peer's window never sees data it
//! did not receive.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::CodecError;

/// Empty stored block emitted by a sync flush.
pub const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// The extension token in `Sec-WebSocket-Extensions`.
pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Spare room kept in output buffers between stream calls.
const MIN_SPARE: usize = 64;

// ── DeflateParams ────────────────────────────────────────────────

/// Negotiated permessage-deflate parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeflateParams {
    /// Server→client stream is reset between messages.
    pub server_no_context_takeover: bool,
    /// Client→server stream is reset between messages.
    pub client_no_context_takeover: bool,
    /// The offer named `server_max_window_bits=15`; echoed back.
    pub server_max_window_bits: bool,
}

impl DeflateParams {
    /// Render the response extension token echoed to the client.
    pub fn response_token(&self) -> String {
        let mut token = String::from(EXTENSION_NAME);
        if self.server_no_context_takeover {
            token.push_str("; server_no_context_takeover");
        }
        if self.client_no_context_takeover {
            token.push_str("; client_no_context_takeover");
        }
        if self.server_max_window_bits {
            token.push_str("; server_max_window_bits=15");
        }
        token
    }
}

// ── Deflater ─────────────────────────────────────────────────────

/// Outbound raw-deflate stream.
pub struct Deflater {
    stream: Compress,
    reset_each_message: bool,
}

impl Deflater {
    /// `level` is a zlib level, 0..=9.
    pub fn new(level: u32, no_context_takeover: bool) -> Self {
        Self {
            stream: Compress::new(Compression::new(level.min(9)), false),
            reset_each_message: no_context_takeover,
        }
    }

    /// Compress one message payload into a fresh vector.
    pub fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(input.len() / 2 + MIN_SPARE);
        self.compress_into(input, &mut out)?;
        Ok(out)
    }

    /// Compress one message payload into `out` (cleared first).
    ///
    /// `out` is grown if needed, so any pooled buffer works.
    pub fn compress_into(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
        if self.reset_each_message {
            self.stream.reset();
        }
        out.clear();

        let start = self.stream.total_in();
        loop {
            if out.capacity() - out.len() < MIN_SPARE {
                out.reserve((input.len() / 4).max(MIN_SPARE));
            }
            let consumed = (self.stream.total_in() - start) as usize;
            self.stream
                .compress_vec(&input[consumed..], out, FlushCompress::Sync)?;

            let consumed = (self.stream.total_in() - start) as usize;
            // Spare room left after a sync flush means the flush completed.
            if consumed == input.len() && out.len() < out.capacity() {
                break;
            }
        }

        if out.ends_with(&DEFLATE_TRAILER) {
            out.truncate(out.len() - DEFLATE_TRAILER.len());
        }
        Ok(())
    }

    /// Drop the sliding window. Always safe: the peer keeping extra
    /// history is harmless, us referencing history it lacks is not.
    pub fn reset(&mut self) {
        self.stream.reset();
    }
}

// ── Inflater ─────────────────────────────────────────────────────

/// Inbound raw-inflate stream.
pub struct Inflater {
    stream: Decompress,
    reset_each_message: bool,
    /// The peer ended its stream with a BFINAL block; restart on the
    /// next message.
    ended: bool,
    max_output: usize,
    scratch: Vec<u8>,
}

impl Inflater {
    /// `max_output` bounds a single inflated message.
    pub fn new(no_context_takeover: bool, max_output: usize) -> Self {
        Self {
            stream: Decompress::new(false),
            reset_each_message: no_context_takeover,
            ended: false,
            max_output,
            scratch: Vec::new(),
        }
    }

    /// Inflate one complete message payload (trailer already stripped
    /// by the sender).
    pub fn decompress(&mut self, input: &[u8]) -> Result<Vec<u8>, CodecError> {
        if self.reset_each_message || self.ended {
            self.stream.reset(false);
            self.ended = false;
        }

        self.scratch.clear();
        self.scratch.extend_from_slice(input);
        self.scratch.extend_from_slice(&DEFLATE_TRAILER);
        let data = std::mem::take(&mut self.scratch);

        let mut out = Vec::with_capacity(
            input
                .len()
                .saturating_mul(4)
                .clamp(MIN_SPARE, self.max_output.max(MIN_SPARE)),
        );
        let result = self.inflate(&data, &mut out);
        self.scratch = data;

        result.map(|()| out)
    }

    fn inflate(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
        let start = self.stream.total_in();
        loop {
            if out.len() > self.max_output {
                return Err(CodecError::OutputLimit(self.max_output));
            }
            if out.capacity() - out.len() < MIN_SPARE {
                out.reserve(out.capacity().max(MIN_SPARE));
            }

            let consumed_before = (self.stream.total_in() - start) as usize;
            let produced_before = out.len();
            let status =
                self.stream
                    .decompress_vec(&data[consumed_before..], out, FlushDecompress::Sync)?;
            let consumed = (self.stream.total_in() - start) as usize;

            if status == Status::StreamEnd {
                self.ended = true;
                break;
            }
            if consumed == data.len() && out.len() < out.capacity() {
                break;
            }
            if consumed == consumed_before && out.len() == produced_before {
                return Err(CodecError::Decompress("inflate made no progress".into()));
            }
        }

        if out.len() > self.max_output {
            return Err(CodecError::OutputLimit(self.max_output));
        }
        Ok(())
    }
}

// ── CompressionContext ───────────────────────────────────────────

/// Per-connection compression state. Exists only when the extension
/// was negotiated.
pub struct CompressionContext {
    deflater: Deflater,
    inflater: Inflater,
}

impl CompressionContext {
    pub fn new(params: DeflateParams, level: u32, max_message_size: usize) -> Self {
        Self {
            deflater: Deflater::new(level, params.server_no_context_takeover),
            inflater: Inflater::new(params.client_no_context_takeover, max_message_size),
        }
    }

    pub fn deflater(&mut self) -> &mut Deflater {
        &mut self.deflater
    }

    pub fn inflater(&mut self) -> &mut Inflater {
        &mut self.inflater
    }

    /// Split into the outbound and inbound halves, which are then
    /// owned by the connection writer and reader respectively.
    pub fn into_parts(self) -> (Deflater, Inflater) {
        (self.deflater, self.inflater)
    }
}

// ── Tests ────────────────────────────────────────────────────────
