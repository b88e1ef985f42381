//! Per-connection outbound writer and inbound message assembly.
//!
//! The write half of a socket, the connection's [`Deflater`] and a
//! scratch buffer live together behind one `tokio::sync::Mutex`. A
//! sender holds the lock for a whole logical message, so fragments of
//! two messages never interleave and deflate output is produced in the
//! order it is sent.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::deflate::Deflater;
use crate::error::StreamError;
use crate::flags::FrameFlags;
use crate::ws::codec::WsFrame;
use crate::ws::fragment::{DEFAULT_CHUNK_SIZE, Fragments};
use crate::ws::frame::{FrameHeader, MAX_CONTROL_PAYLOAD, OpCode, close_payload};

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Fragmentation and deadline settings for one writer.
#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    pub chunk_size: usize,
    /// Deadline for each frame write.
    pub send_timeout: Duration,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

struct WriterState {
    /// `None` once closed or after a failed write left a partial frame.
    io: Option<BoxedWrite>,
    deflater: Option<Deflater>,
    scratch: Vec<u8>,
}

// ── WsWriter ─────────────────────────────────────────────────────

/// Outbound side of one WebSocket connection.
pub struct WsWriter {
    state: Mutex<WriterState>,
    options: WriterOptions,
    cancel: CancellationToken,
    compression: bool,
}

impl WsWriter {
    pub fn new<W>(
        io: W,
        deflater: Option<Deflater>,
        options: WriterOptions,
        cancel: CancellationToken,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let options = WriterOptions {
            chunk_size: options.chunk_size.max(1),
            ..options
        };
        Self {
            compression: deflater.is_some(),
            state: Mutex::new(WriterState {
                io: Some(Box::new(io)),
                deflater,
                scratch: Vec::with_capacity(options.chunk_size + 16),
            }),
            options,
            cancel,
        }
    }

    /// Whether permessage-deflate was negotiated for this connection.
    pub fn compression(&self) -> bool {
        self.compression
    }

    /// Take the connection lock, waiting at most `wait`.
    pub async fn lock(&self, wait: Duration) -> Result<WriterGuard<'_>, StreamError> {
        if self.cancel.is_cancelled() {
            return Err(StreamError::ConnectionClosed);
        }
        let state = tokio::time::timeout(wait, self.state.lock())
            .await
            .map_err(|_| StreamError::WriterBusy(wait))?;
        Ok(WriterGuard {
            state,
            options: &self.options,
            cancel: &self.cancel,
        })
    }

    pub async fn send_ping(&self, payload: &[u8], wait: Duration) -> Result<usize, StreamError> {
        self.lock(wait).await?.send_control(OpCode::Ping, payload).await
    }

    pub async fn send_pong(&self, payload: &[u8], wait: Duration) -> Result<usize, StreamError> {
        self.lock(wait).await?.send_control(OpCode::Pong, payload).await
    }

    pub async fn send_close(&self, code: u16, wait: Duration) -> Result<usize, StreamError> {
        self.lock(wait)
            .await?
            .send_control(OpCode::Close, &close_payload(code))
            .await
    }

    /// Drop the socket and deflater if nobody is mid-send.
    ///
    /// Returns `false` when the lock is held; the holder's next write
    /// fails once the connection's token is cancelled.
    pub fn close(&self) -> bool {
        match self.state.try_lock() {
            Ok(mut state) => {
                state.io = None;
                state.deflater = None;
                true
            }
            Err(_) => false,
        }
    }
}

// ── WriterGuard ──────────────────────────────────────────────────

/// Exclusive access to a connection for one logical message.
pub struct WriterGuard<'a> {
    state: MutexGuard<'a, WriterState>,
    options: &'a WriterOptions,
    cancel: &'a CancellationToken,
}

impl WriterGuard<'_> {
    /// The outbound deflate stream, if negotiated.
    pub fn deflater(&mut self) -> Option<&mut Deflater> {
        self.state.deflater.as_mut()
    }

    pub fn is_open(&self) -> bool {
        self.state.io.is_some()
    }

    /// Fragment and send one data message. Returns bytes written.
    ///
    /// `compressed` sets RSV1 on the first frame; the payload must
    /// already be deflated.
    pub async fn send_message(
        &mut self,
        opcode: OpCode,
        payload: &[u8],
        compressed: bool,
    ) -> Result<usize, StreamError> {
        let mut written = 0;
        for (header, chunk) in Fragments::new(payload, opcode, compressed, self.options.chunk_size) {
            written += self.write_frame(header, chunk).await?;
        }
        self.flush().await?;
        Ok(written)
    }

    /// Send one unfragmented control frame.
    pub async fn send_control(&mut self, opcode: OpCode, payload: &[u8]) -> Result<usize, StreamError> {
        if !opcode.is_control() {
            return Err(StreamError::ProtocolViolation("not a control opcode"));
        }
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(StreamError::ProtocolViolation("control payload over 125 bytes"));
        }
        let header = FrameHeader::new(FrameFlags::FIN, opcode, payload.len() as u64);
        let written = self.write_frame(header, payload).await?;
        self.flush().await?;
        Ok(written)
    }

    async fn write_frame(&mut self, header: FrameHeader, chunk: &[u8]) -> Result<usize, StreamError> {
        let (head, head_len) = header.encode();
        let WriterState { io, scratch, .. } = &mut *self.state;
        scratch.clear();
        scratch.extend_from_slice(&head[..head_len]);
        scratch.extend_from_slice(chunk);

        trace!(opcode = ?header.opcode, fin = header.flags.is_final(), len = chunk.len(), "frame");
        let result = {
            let writer = io.as_mut().ok_or(StreamError::ConnectionClosed)?;
            Self::bounded(self.cancel, self.options.send_timeout, writer.write_all(&scratch[..])).await
        };
        if result.is_err() {
            *io = None;
        }
        result.map(|()| scratch.len())
    }

    async fn flush(&mut self) -> Result<(), StreamError> {
        let WriterState { io, .. } = &mut *self.state;
        let result = {
            let writer = io.as_mut().ok_or(StreamError::ConnectionClosed)?;
            Self::bounded(self.cancel, self.options.send_timeout, writer.flush()).await
        };
        if result.is_err() {
            *io = None;
        }
        result
    }

    async fn bounded(
        cancel: &CancellationToken,
        deadline: Duration,
        op: impl Future<Output = std::io::Result<()>>,
    ) -> Result<(), StreamError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StreamError::ConnectionClosed),
            res = tokio::time::timeout(deadline, op) => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(StreamError::Timeout(deadline)),
            },
        }
    }
}

// ── MessageAssembler ─────────────────────────────────────────────

/// A complete inbound data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub opcode: OpCode,
    /// RSV1 was set on the first frame.
    pub compressed: bool,
    pub payload: Bytes,
}

/// Reassembles fragmented inbound data frames.
///
/// Control frames are handled by the caller and never pushed here.
pub struct MessageAssembler {
    max_message_size: usize,
    partial: Option<(OpCode, bool)>,
    buf: BytesMut,
}

impl MessageAssembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            partial: None,
            buf: BytesMut::new(),
        }
    }

    /// A fragmented message is in progress.
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Feed one data frame; yields a message once FIN arrives.
    pub fn push(&mut self, frame: WsFrame) -> Result<Option<InboundMessage>, StreamError> {
        if frame.opcode.is_control() {
            return Err(StreamError::ProtocolViolation("control frame in data stream"));
        }
        if frame.flags.intersects(FrameFlags::RSV2 | FrameFlags::RSV3) {
            return Err(StreamError::ProtocolViolation("reserved bits set"));
        }

        let (opcode, compressed) = match (frame.opcode, self.partial) {
            (OpCode::Continuation, None) => {
                return Err(StreamError::ProtocolViolation("continuation without a message"));
            }
            (OpCode::Continuation, Some(started)) => {
                if frame.flags.is_compressed() {
                    return Err(StreamError::ProtocolViolation("RSV1 on continuation frame"));
                }
                started
            }
            (_, Some(_)) => {
                return Err(StreamError::ProtocolViolation("new message before previous finished"));
            }
            (opcode, None) => (opcode, frame.flags.is_compressed()),
        };

        let size = self.buf.len() + frame.payload.len();
        if size > self.max_message_size {
            self.reset();
            return Err(StreamError::MessageTooLarge {
                size: size as u64,
                max: self.max_message_size as u64,
            });
        }

        if frame.is_final() {
            let payload = if self.buf.is_empty() {
                frame.payload
            } else {
                self.buf.extend_from_slice(&frame.payload);
                self.buf.split().freeze()
            };
            self.partial = None;
            return Ok(Some(InboundMessage {
                opcode,
                compressed,
                payload,
            }));
        }

        self.buf.extend_from_slice(&frame.payload);
        self.partial = Some((opcode, compressed));
        Ok(None)
    }

    fn reset(&mut self) {
        self.partial = None;
        self.buf.clear();
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deflate::Inflater;
    use crate::ws::codec::WsCodec;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn writer(io: tokio::io::DuplexStream, chunk: usize, deflater: Option<Deflater>) -> WsWriter {
        WsWriter::new(
            io,
            deflater,
            WriterOptions {
                chunk_size: chunk,
                send_timeout: Duration::from_millis(200),
            },
            CancellationToken::new(),
        )
    }

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn fragmented_message_arrives_in_order() {
        let (server, client) = tokio::io::duplex(1 << 20);
        let writer = writer(server, 1000, None);
        let payload: Vec<u8> = (0..3500u32).map(|i| i as u8).collect();

        let written = writer
            .lock(WAIT)
            .await
            .unwrap()
            .send_message(OpCode::Binary, &payload, false)
            .await
            .unwrap();
        // 3 full frames + 1 tail, each with a 4-byte header (126 + u16).
        assert_eq!(written, 3500 + 3 * 4 + 4);

        let mut frames = FramedRead::new(client, WsCodec::client(1 << 20));
        let mut assembler = MessageAssembler::new(1 << 20);
        let mut opcodes = Vec::new();
        let message = loop {
            let frame = frames.next().await.unwrap().unwrap();
            opcodes.push(frame.opcode);
            if let Some(m) = assembler.push(frame).unwrap() {
                break m;
            }
        };
        assert_eq!(
            opcodes,
            vec![OpCode::Binary, OpCode::Continuation, OpCode::Continuation, OpCode::Continuation]
        );
        assert_eq!(message.payload, Bytes::from(payload));
        assert!(!message.compressed);
    }

    #[tokio::test]
    async fn compressed_message_sets_rsv1() {
        let (server, client) = tokio::io::duplex(1 << 16);
        let writer = writer(server, 16 * 1024, Some(Deflater::new(1, false)));
        assert!(writer.compression());

        let payload = vec![7u8; 4096];
        {
            let mut guard = writer.lock(WAIT).await.unwrap();
            let compressed = guard.deflater().unwrap().compress(&payload).unwrap();
            guard.send_message(OpCode::Binary, &compressed, true).await.unwrap();
        }

        let mut frames = FramedRead::new(client, WsCodec::client(1 << 16));
        let frame = frames.next().await.unwrap().unwrap();
        assert!(frame.flags.is_compressed());
        let mut inflater = Inflater::new(false, 1 << 16);
        assert_eq!(inflater.decompress(&frame.payload).unwrap(), payload);
    }

    #[tokio::test]
    async fn lock_is_time_bounded() {
        let (server, _client) = tokio::io::duplex(1024);
        let writer = writer(server, 1024, None);

        let _held = writer.lock(WAIT).await.unwrap();
        let err = writer.lock(Duration::from_millis(10)).await.err().unwrap();
        assert!(matches!(err, StreamError::WriterBusy(_)));
        assert!(!writer.close());
    }

    #[tokio::test]
    async fn control_frames() {
        let (server, client) = tokio::io::duplex(1024);
        let writer = writer(server, 1024, None);

        writer.send_ping(&[], WAIT).await.unwrap();
        writer.send_close(1001, WAIT).await.unwrap();
        let mut guard = writer.lock(WAIT).await.unwrap();
        assert!(guard.send_control(OpCode::Binary, b"x").await.is_err());
        assert!(guard.send_control(OpCode::Ping, &[0u8; 126]).await.is_err());
        drop(guard);

        let mut frames = FramedRead::new(client, WsCodec::client(1024));
        let ping = frames.next().await.unwrap().unwrap();
        assert_eq!(ping.opcode, OpCode::Ping);
        assert!(ping.payload.is_empty());
        let close = frames.next().await.unwrap().unwrap();
        assert_eq!(close.opcode, OpCode::Close);
        assert_eq!(&close.payload[..], &[0x03, 0xE9]);
    }

    #[tokio::test]
    async fn cancelled_connection_fails_fast() {
        let (server, _client) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        let writer = WsWriter::new(server, None, WriterOptions::default(), cancel.clone());

        let mut guard = writer.lock(WAIT).await.unwrap();
        cancel.cancel();
        let err = guard.send_message(OpCode::Binary, b"late", false).await.unwrap_err();
        assert!(err.is_disconnect());
        drop(guard);

        assert!(matches!(writer.lock(WAIT).await, Err(StreamError::ConnectionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_peer_times_out_then_stays_closed() {
        // Nobody reads the 64-byte pipe.
        let (server, _client) = tokio::io::duplex(64);
        let writer = writer(server, 1024, None);

        let mut guard = writer.lock(WAIT).await.unwrap();
        let err = guard.send_message(OpCode::Binary, &[1u8; 500], false).await.unwrap_err();
        assert!(matches!(err, StreamError::Timeout(_)));
        assert!(!guard.is_open());

        let err = guard.send_message(OpCode::Binary, b"x", false).await.unwrap_err();
        assert!(matches!(err, StreamError::ConnectionClosed));
    }

    #[test]
    fn assembler_rejects_bad_sequences() {
        let mut a = MessageAssembler::new(100);
        let cont = WsFrame::new(OpCode::Continuation, &b"x"[..]);
        assert!(a.push(cont).is_err());

        let first = WsFrame::new(OpCode::Text, &b"ab"[..]).with_flags(FrameFlags::empty());
        assert!(a.push(first).unwrap().is_none());
        assert!(a.in_progress());
        let interleaved = WsFrame::new(OpCode::Binary, &b"c"[..]);
        assert!(a.push(interleaved).is_err());

        let mut a = MessageAssembler::new(100);
        let ping = WsFrame::new(OpCode::Ping, Bytes::new());
        assert!(a.push(ping).is_err());
        let rsv2 = WsFrame::new(OpCode::Binary, &b"x"[..]).with_flags(FrameFlags::FIN | FrameFlags::RSV2);
        assert!(a.push(rsv2).is_err());
    }

    #[test]
    fn assembler_joins_and_limits() {
        let mut a = MessageAssembler::new(10);
        let first = WsFrame::new(OpCode::Binary, &b"abc"[..]).with_flags(FrameFlags::RSV1);
        assert!(a.push(first).unwrap().is_none());
        let last = WsFrame::new(OpCode::Continuation, &b"def"[..]);
        let message = a.push(last).unwrap().unwrap();
        assert_eq!(message.opcode, OpCode::Binary);
        assert!(message.compressed);
        assert_eq!(&message.payload[..], b"abcdef");
        assert!(!a.in_progress());

        let big = WsFrame::new(OpCode::Binary, vec![0u8; 6]).with_flags(FrameFlags::empty());
        a.push(big).unwrap();
        let over = WsFrame::new(OpCode::Continuation, vec![0u8; 6]);
        assert!(matches!(a.push(over), Err(StreamError::MessageTooLarge { size: 12, max: 10 })));
        assert!(!a.in_progress());
    }
}
