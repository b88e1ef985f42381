//! Hand-rolled RFC 6455 WebSocket engine.
//!
//! - [`handshake`]: HTTP upgrade and permessage-deflate negotiation
//! - [`frame`]: header encode/decode, masking, close codes
//! - [`codec`]: `tokio_util` codec over [`WsFrame`]
//! - [`fragment`]: splitting outbound messages into frames
//! - [`connection`]: locked per-connection writer and inbound assembly

pub mod codec;
pub mod connection;
pub mod fragment;
pub mod frame;
pub mod handshake;

pub use codec::{WsCodec, WsFrame};
pub use connection::{InboundMessage, MessageAssembler, WriterGuard, WriterOptions, WsWriter};
pub use fragment::{DEFAULT_CHUNK_SIZE, Fragments};
pub use frame::{FrameHeader, OpCode, apply_mask};
pub use handshake::{HandshakeConfig, HandshakeOutcome, HandshakePhase, accept_key};
