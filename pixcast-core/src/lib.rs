//! # pixcast-core
//!
//! Live indexed-color framebuffer streaming over WebSocket.
//!
//! This crate contains:
//! - **FrameQueue**: `FrameProducer` / `FrameConsumer`, an atomic-indexed SPSC ring
//!   between the renderer thread and the network side
//! - **Deflate**: `Deflater` / `Inflater`, RFC 7692 permessage-deflate streams
//! - **WebSocket**: handshake, frame codec, fragmentation and the locked
//!   per-connection `WsWriter`
//! - **Registry**: `ClientRegistry`, the bounded set of connected viewers
//! - **Scheduler**: `Scheduler` with its bounded queue, worker and `BufferPool`
//! - **Service**: `StreamService`, which wires all of the above to a TCP listener
//! - **Input**: decoder for the small fixed-layout viewer input messages
//! - **Error**: `StreamError`, a typed `thiserror`-based error hierarchy

pub mod deflate;
pub mod error;
pub mod flags;
pub mod frame_queue;
pub mod input;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod ws;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use deflate::{CompressionContext, DeflateParams, Deflater, Inflater};
pub use error::{CodecError, Dropped, StreamError};
pub use flags::FrameFlags;
pub use frame_queue::{FrameConsumer, FrameProducer, FrameQueue, ReadSlot, WriteSlot};
pub use input::{Buttons, InputEvent};
pub use registry::{Client, ClientConnection, ClientId, ClientRegistry, ClientState};
pub use scheduler::{
    BufferPool, Destination, PoolBuffer, PoolStats, Scheduler, SchedulerConfig, SchedulerStats,
    StatsSnapshot,
};
pub use service::{StreamService, StreamServiceConfig};
pub use ws::{FrameHeader, OpCode, WsCodec, WsFrame, WsWriter};
