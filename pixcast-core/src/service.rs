//! The streaming service: listener, frame pump, liveness and readers.
//!
//! ```text
//!  renderer thread                 tokio runtime
//!  ───────────────                 ───────────────────────────────────────
//!  FrameProducer ──► FrameQueue ──► pump ──► Scheduler ──► worker ──► sockets
//!                                                              ▲
//!  TcpListener ──► accept ──► handshake ──► ClientRegistry ────┘
//!                                 │
//!                                 └──► reader task ──► InputEvent channel
//! ```
//!
//! All state lives in one [`StreamService`] value; there are no globals.
//! Cancelling [`StreamService::shutdown_token`] stops every task and
//! sends each client a `1001 Going Away` close frame.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::deflate::{CompressionContext, Inflater};
use crate::error::{CodecError, StreamError};
use crate::frame_queue::{DEFAULT_DEPTH, FrameConsumer, FrameProducer, FrameQueue};
use crate::input::{self, DEFAULT_INPUT_CAPACITY, InputEvent};
use crate::registry::{Client, ClientConnection, ClientRegistry, DEFAULT_MAX_CLIENTS};
use crate::scheduler::{
    BufferPool, DEFAULT_ENQUEUE_WAIT, DEFAULT_LOCK_TIMEOUT, DEFAULT_MIN_COMPRESS_SIZE,
    DEFAULT_QUEUE_CAPACITY, Destination, Scheduler, SchedulerConfig, SchedulerStats,
    StatsSnapshot,
};
use crate::scheduler::pool::{DEFAULT_POOL_BUFFERS, DEFAULT_POOL_BUFFER_SIZE};
use crate::ws::codec::WsCodec;
use crate::ws::connection::{DEFAULT_SEND_TIMEOUT, MessageAssembler, WriterOptions, WsWriter};
use crate::ws::fragment::DEFAULT_CHUNK_SIZE;
use crate::ws::frame::{
    CLOSE_GOING_AWAY, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR, CLOSE_TOO_BIG, OpCode, parse_close_code,
};
use crate::ws::handshake::{self, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_HEADER_BYTES, HandshakeConfig};

// ── StreamServiceConfig ──────────────────────────────────────────

/// Configuration for [`StreamService`].
#[derive(Debug, Clone)]
pub struct StreamServiceConfig {
    pub bind_addr: SocketAddr,
    /// Upgrade endpoint.
    pub path: String,
    pub max_clients: usize,

    pub width: usize,
    pub height: usize,
    /// FrameQueue depth.
    pub queue_depth: usize,

    /// Offer permessage-deflate.
    pub compression: bool,
    pub compression_level: u32,
    pub min_compress_size: usize,

    pub chunk_size: usize,
    pub queue_capacity: usize,
    pub enqueue_wait: Duration,
    pub send_timeout: Duration,
    pub lock_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_header_bytes: usize,
    pub pool_buffers: usize,
    pub pool_buffer_size: usize,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    /// Largest inbound message, before and after inflation.
    pub max_message_size: usize,
    pub input_capacity: usize,
}

impl Default for StreamServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            path: handshake::DEFAULT_PATH.to_string(),
            max_clients: DEFAULT_MAX_CLIENTS,
            width: 320,
            height: 240,
            queue_depth: DEFAULT_DEPTH,
            compression: true,
            compression_level: 1,
            min_compress_size: DEFAULT_MIN_COMPRESS_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            enqueue_wait: DEFAULT_ENQUEUE_WAIT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            pool_buffers: DEFAULT_POOL_BUFFERS,
            pool_buffer_size: DEFAULT_POOL_BUFFER_SIZE,
            ping_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(10),
            max_message_size: 64 * 1024,
            input_capacity: DEFAULT_INPUT_CAPACITY,
        }
    }
}

impl StreamServiceConfig {
    /// Bytes per FrameQueue slot: palette index plus pixels.
    pub fn frame_len(&self) -> usize {
        1 + self.width * self.height
    }

    fn handshake(&self) -> HandshakeConfig {
        HandshakeConfig {
            path: self.path.clone(),
            max_header_bytes: self.max_header_bytes,
            timeout: self.handshake_timeout,
            compression: self.compression,
        }
    }

    fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            queue_capacity: self.queue_capacity,
            enqueue_wait: self.enqueue_wait,
            lock_timeout: self.lock_timeout,
            min_compress_size: self.min_compress_size,
        }
    }
}

// ── StreamService ────────────────────────────────────────────────

struct Shared {
    config: StreamServiceConfig,
    registry: Arc<ClientRegistry>,
    shutdown: CancellationToken,
    input_tx: mpsc::Sender<InputEvent>,
}

/// Owns every piece of the network side.
///
/// # Lifetime
///
/// [`new`](Self::new) returns the service and the renderer's
/// [`FrameProducer`]. [`run`](Self::run) drives everything until the
/// shutdown token is cancelled; it can only be called once.
pub struct StreamService {
    shared: Arc<Shared>,
    pool: Arc<BufferPool>,
    stats: Arc<SchedulerStats>,
    consumer: Mutex<Option<FrameConsumer>>,
    input_rx: Mutex<Option<mpsc::Receiver<InputEvent>>>,
}

impl StreamService {
    pub fn new(config: StreamServiceConfig) -> Result<(Self, FrameProducer), StreamError> {
        if config.width == 0 || config.height == 0 {
            return Err(StreamError::Other("frame dimensions must be non-zero".into()));
        }
        if config.queue_depth == 0 {
            return Err(StreamError::Other("queue depth must be non-zero".into()));
        }

        let (producer, consumer) = FrameQueue::new(config.queue_depth, config.frame_len());
        let (input_tx, input_rx) = mpsc::channel(config.input_capacity.max(1));
        let pool = Arc::new(BufferPool::new(config.pool_buffers, config.pool_buffer_size));
        let registry = Arc::new(ClientRegistry::new(config.max_clients));

        let service = Self {
            shared: Arc::new(Shared {
                config,
                registry,
                shutdown: CancellationToken::new(),
                input_tx,
            }),
            pool,
            stats: Arc::new(SchedulerStats::default()),
            consumer: Mutex::new(Some(consumer)),
            input_rx: Mutex::new(Some(input_rx)),
        };
        Ok((service, producer))
    }

    pub fn config(&self) -> &StreamServiceConfig {
        &self.shared.config
    }

    /// Cancel to stop the service.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// The decoded-input receiver. Handed out once.
    pub fn input_events(&self) -> Option<mpsc::Receiver<InputEvent>> {
        self.input_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.shared.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Bind the configured address and serve.
    pub async fn run(&self) -> Result<(), StreamError> {
        let listener = TcpListener::bind(self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), StreamError> {
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(StreamError::Other("service already running".into()))?;

        let shared = &self.shared;
        let config = &shared.config;
        let (scheduler, worker) = Scheduler::start_with_stats(
            Arc::clone(&shared.registry),
            Arc::clone(&self.pool),
            config.scheduler(),
            Arc::clone(&self.stats),
        );

        let pump = tokio::spawn(pump_frames(
            consumer,
            scheduler,
            Arc::clone(&shared.registry),
            shared.shutdown.clone(),
        ));
        let liveness = tokio::spawn(liveness_loop(Arc::clone(shared)));

        info!(
            addr = %listener.local_addr()?,
            path = %config.path,
            max_clients = config.max_clients,
            compression = config.compression,
            "stream service listening"
        );

        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept error: {e}");
                        continue;
                    }
                },
            };

            if shared.registry.is_full() {
                warn!(%peer, max = config.max_clients, "max clients reached, rejecting connection");
                drop(stream);
                continue;
            }
            tokio::spawn(handle_connection(Arc::clone(shared), stream, peer));
        }

        info!("stream service shutting down");
        let _ = pump.await;
        let _ = liveness.await;
        shared
            .registry
            .close_all(CLOSE_GOING_AWAY, config.lock_timeout.max(config.send_timeout))
            .await;
        // The pump held the last scheduler handle; the worker drains and exits.
        if tokio::time::timeout(config.send_timeout, worker).await.is_err() {
            debug!("transmission worker did not finish in time");
        }
        info!("stream service stopped");
        Ok(())
    }
}

// ── Tasks ────────────────────────────────────────────────────────

/// Move frames from the FrameQueue into the scheduler.
///
/// Each slot is copied out and released immediately so the renderer
/// never waits on the network.
async fn pump_frames(
    mut consumer: FrameConsumer,
    scheduler: Scheduler,
    registry: Arc<ClientRegistry>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = consumer.ready() => {}
        }

        let frame = {
            let Some(slot) = consumer.peek_next() else {
                continue;
            };
            registry
                .has_active()
                .then(|| (slot[0], Bytes::copy_from_slice(&slot[1..])))
        };
        consumer.release();

        if let Some((palette, pixels)) = frame {
            if scheduler.enqueue(pixels, palette, Destination::Broadcast).await.is_err() {
                trace!("frame dropped, transmission queue full");
            }
        }
    }
    debug!("frame pump stopped");
}

async fn liveness_loop(shared: Arc<Shared>) {
    let config = &shared.config;
    let mut interval = tokio::time::interval(config.ping_interval.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let removed = shared
            .registry
            .sweep(config.lock_timeout, config.idle_timeout)
            .await;
        if removed > 0 {
            debug!(removed, "liveness sweep dropped clients");
        }
    }
}

async fn handle_connection(shared: Arc<Shared>, mut stream: TcpStream, peer: SocketAddr) {
    let config = &shared.config;
    let _ = stream.set_nodelay(true);

    let outcome = match handshake::accept(&mut stream, &config.handshake()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            debug!(%peer, error = %e, "handshake rejected");
            return;
        }
    };

    let (deflater, inflater) = match outcome.deflate {
        Some(params) => {
            let (d, i) =
                CompressionContext::new(params, config.compression_level, config.max_message_size)
                    .into_parts();
            (Some(d), Some(i))
        }
        None => (None, None),
    };

    if shared.shutdown.is_cancelled() {
        return;
    }

    let (read_half, write_half) = stream.into_split();
    // Not a child of the shutdown token: clients must still be able to
    // receive their 1001 close during shutdown.
    let cancel = CancellationToken::new();
    let writer = WsWriter::new(
        write_half,
        deflater,
        WriterOptions {
            chunk_size: config.chunk_size,
            send_timeout: config.send_timeout,
        },
        cancel.clone(),
    );

    let id = match shared.registry.add(ClientConnection {
        peer: peer.to_string(),
        writer,
        cancel,
    }) {
        Ok(id) => id,
        Err(e) => {
            warn!(%peer, error = %e, "client rejected after handshake");
            return;
        }
    };
    let Some(client) = shared.registry.get(id) else {
        return;
    };

    let mut frames = FramedRead::new(read_half, WsCodec::server(config.max_message_size));
    frames.read_buffer_mut().extend_from_slice(&outcome.leftover);

    match read_loop(&shared, &client, frames, inflater).await {
        Ok(()) => {}
        Err(e) => {
            if let Some(code) = close_code_for(&e) {
                warn!(client = id, %peer, error = %e, "protocol error, closing");
                if client.begin_closing() {
                    let _ = client.writer().send_close(code, config.send_timeout).await;
                }
            } else {
                debug!(client = id, %peer, error = %e, "connection lost");
            }
        }
    }
    shared.registry.remove(id);
}

/// Close code for errors the peer caused; `None` for transport loss.
fn close_code_for(err: &StreamError) -> Option<u16> {
    match err {
        StreamError::MessageTooLarge { .. } | StreamError::Codec(CodecError::OutputLimit(_)) => {
            Some(CLOSE_TOO_BIG)
        }
        StreamError::Codec(_) => Some(CLOSE_PROTOCOL_ERROR),
        e if e.is_protocol() => Some(CLOSE_PROTOCOL_ERROR),
        _ => None,
    }
}

/// Per-client receive path. Returns `Ok` on a clean close, EOF or
/// cancellation.
async fn read_loop(
    shared: &Shared,
    client: &Client,
    mut frames: FramedRead<OwnedReadHalf, WsCodec>,
    mut inflater: Option<Inflater>,
) -> Result<(), StreamError> {
    let config = &shared.config;
    let cancel = client.cancel_token();
    let mut assembler = MessageAssembler::new(config.max_message_size);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            next = frames.next() => next,
        };
        let Some(frame) = next else {
            return Ok(());
        };
        let frame = frame?;
        client.touch();

        match frame.opcode {
            OpCode::Ping => {
                match client.writer().send_pong(&frame.payload, config.send_timeout).await {
                    Ok(_) | Err(StreamError::WriterBusy(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            OpCode::Pong => trace!(client = client.id(), "pong"),
            OpCode::Close => {
                let code = parse_close_code(&frame.payload).unwrap_or(CLOSE_NORMAL);
                debug!(client = client.id(), code, "close received");
                if client.begin_closing() {
                    let _ = client.writer().send_close(code, config.send_timeout).await;
                }
                return Ok(());
            }
            OpCode::Reserved(op) => {
                debug!(client = client.id(), opcode = op, "ignoring reserved opcode");
            }
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                let Some(message) = assembler.push(frame)? else {
                    continue;
                };
                let payload = if message.compressed {
                    let inflater = inflater
                        .as_mut()
                        .ok_or(StreamError::ProtocolViolation("RSV1 without permessage-deflate"))?;
                    Bytes::from(inflater.decompress(&message.payload)?)
                } else {
                    message.payload
                };
                route_input(shared, client, &payload);
            }
        }
    }
}

fn route_input(shared: &Shared, client: &Client, payload: &[u8]) {
    let Some(event) = input::decode(payload) else {
        debug!(client = client.id(), len = payload.len(), "unrecognized client message");
        return;
    };
    match shared.input_tx.try_send(event) {
        Ok(()) => trace!(client = client.id(), ?event, "input"),
        Err(TrySendError::Full(_)) => debug!(client = client.id(), "input channel full, event dropped"),
        Err(TrySendError::Closed(_)) => {}
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = StreamServiceConfig::default();
        assert_eq!(config.frame_len(), 76_801);
        assert_eq!(config.path, "/ws");
        assert_eq!(config.max_clients, 4);
        assert_eq!(config.scheduler().queue_capacity, 16);
        assert!(config.handshake().compression);
    }

    #[test]
    fn new_rejects_empty_frames() {
        let config = StreamServiceConfig {
            width: 0,
            ..StreamServiceConfig::default()
        };
        assert!(StreamService::new(config).is_err());
    }

    #[test]
    fn producer_matches_frame_len() {
        let (service, producer) = StreamService::new(StreamServiceConfig::default()).unwrap();
        assert_eq!(producer.frame_len(), 76_801);
        assert_eq!(producer.capacity(), 2);
        assert!(service.input_events().is_some());
        assert!(service.input_events().is_none());
        assert!(service.registry().is_empty());
    }

    #[test]
    fn close_codes() {
        assert_eq!(
            close_code_for(&StreamError::MessageTooLarge { size: 2, max: 1 }),
            Some(CLOSE_TOO_BIG)
        );
        assert_eq!(
            close_code_for(&StreamError::ProtocolViolation("x")),
            Some(CLOSE_PROTOCOL_ERROR)
        );
        assert_eq!(
            close_code_for(&CodecError::Decompress("bad".into()).into()),
            Some(CLOSE_PROTOCOL_ERROR)
        );
        assert_eq!(close_code_for(&StreamError::ConnectionClosed), None);
    }

    #[tokio::test]
    async fn serve_twice_fails() {
        let (service, _producer) = StreamService::new(StreamServiceConfig::default()).unwrap();
        let service = Arc::new(service);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let token = service.shutdown_token();

        let running = Arc::clone(&service);
        let handle = tokio::spawn(async move { running.serve(listener).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(service.serve(second).await.is_err());

        token.cancel();
        handle.await.unwrap().unwrap();
    }
}
