//! Transmission scheduler: one bounded queue, one worker.
//!
//! ```text
//!  pump ──enqueue──► [ bounded mpsc ] ──► worker
//!                                           │ per message: pool checkout, [palette | pixels]
//!                                           │ join_all over clients:
//!                                           │   lock writer (bounded wait)
//!                                           │   deflate if large enough, keep smaller
//!                                           │   fragment + send
//!                                           │ pool return
//!                                           ▼
//!                                  transport failure → registry.remove
//! ```
//!
//! The worker handles messages strictly in order, so every client sees
//! frames in submission order. A client whose writer is still busy with
//! a previous frame is skipped for this one rather than waited on.

pub mod pool;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{Dropped, StreamError};
use crate::registry::{Client, ClientId, ClientRegistry};
use crate::ws::frame::OpCode;

pub use pool::{BufferPool, PoolBuffer, PoolStats};

pub const DEFAULT_QUEUE_CAPACITY: usize = 16;
pub const DEFAULT_ENQUEUE_WAIT: Duration = Duration::from_millis(5);
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(50);
pub const DEFAULT_MIN_COMPRESS_SIZE: usize = 1024;

// ── Message ──────────────────────────────────────────────────────

/// Who receives a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Every active client.
    Broadcast,
    Client(ClientId),
}

/// A queued frame.
#[derive(Debug, Clone)]
pub struct Message {
    /// Pixel bytes; the palette index travels separately.
    pub frame: Bytes,
    pub palette_index: u8,
    pub destination: Destination,
    pub enqueued_at: Instant,
}

impl Message {
    pub fn new(frame: Bytes, palette_index: u8, destination: Destination) -> Self {
        Self {
            frame,
            palette_index,
            destination,
            enqueued_at: Instant::now(),
        }
    }

    /// Size of the `[palette | pixels]` payload on the wire.
    pub fn payload_len(&self) -> usize {
        1 + self.frame.len()
    }
}

// ── Config & stats ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub queue_capacity: usize,
    /// How long `enqueue` may wait for queue space.
    pub enqueue_wait: Duration,
    /// How long the worker waits for a client's writer.
    pub lock_timeout: Duration,
    /// Payloads shorter than this are never compressed.
    pub min_compress_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            enqueue_wait: DEFAULT_ENQUEUE_WAIT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            min_compress_size: DEFAULT_MIN_COMPRESS_SIZE,
        }
    }
}

/// Live counters, written by the scheduler only.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    client_skips: AtomicU64,
    compressed_frames: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Point-in-time copy of [`SchedulerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Frames delivered, counted per client.
    pub frames_sent: u64,
    /// Messages rejected by `enqueue`.
    pub frames_dropped: u64,
    /// Per-client sends skipped because the writer was busy.
    pub client_skips: u64,
    /// Frames delivered with RSV1 set.
    pub compressed_frames: u64,
    /// Wire bytes including frame headers.
    pub bytes_sent: u64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            client_skips: self.client_skips.load(Ordering::Relaxed),
            compressed_frames: self.compressed_frames.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }

    fn dropped(&self) -> Dropped {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        Dropped
    }
}

// ── Scheduler ────────────────────────────────────────────────────

/// Handle for submitting frames. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::Sender<Message>,
    stats: Arc<SchedulerStats>,
    enqueue_wait: Duration,
}

impl Scheduler {
    /// Spawn the worker. It exits once every `Scheduler` clone is dropped.
    pub fn start(
        registry: Arc<ClientRegistry>,
        pool: Arc<BufferPool>,
        config: SchedulerConfig,
    ) -> (Self, JoinHandle<()>) {
        Self::start_with_stats(registry, pool, config, Arc::new(SchedulerStats::default()))
    }

    /// Like [`start`](Self::start), recording into existing counters.
    pub fn start_with_stats(
        registry: Arc<ClientRegistry>,
        pool: Arc<BufferPool>,
        config: SchedulerConfig,
        stats: Arc<SchedulerStats>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));

        let worker = Worker {
            registry,
            pool,
            stats: Arc::clone(&stats),
            lock_timeout: config.lock_timeout,
            min_compress_size: config.min_compress_size,
        };
        let handle = tokio::spawn(worker.run(rx));

        (
            Self {
                tx,
                stats,
                enqueue_wait: config.enqueue_wait,
            },
            handle,
        )
    }

    /// Queue a frame, waiting at most the configured bound for space.
    pub async fn enqueue(
        &self,
        frame: Bytes,
        palette_index: u8,
        destination: Destination,
    ) -> Result<(), Dropped> {
        let message = Message::new(frame, palette_index, destination);
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                match tokio::time::timeout(self.enqueue_wait, self.tx.send(message)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) | Err(_) => Err(self.stats.dropped()),
                }
            }
            Err(TrySendError::Closed(_)) => Err(self.stats.dropped()),
        }
    }

    /// Queue a frame without waiting.
    pub fn try_enqueue(
        &self,
        frame: Bytes,
        palette_index: u8,
        destination: Destination,
    ) -> Result<(), Dropped> {
        self.tx
            .try_send(Message::new(frame, palette_index, destination))
            .map_err(|_| self.stats.dropped())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

// ── Worker ───────────────────────────────────────────────────────

struct Worker {
    registry: Arc<ClientRegistry>,
    pool: Arc<BufferPool>,
    stats: Arc<SchedulerStats>,
    lock_timeout: Duration,
    min_compress_size: usize,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<Message>) {
        info!("transmission worker started");
        while let Some(message) = rx.recv().await {
            self.dispatch(&message).await;
        }
        info!("transmission worker stopped");
    }

    async fn dispatch(&self, message: &Message) {
        let targets: Vec<Arc<Client>> = match message.destination {
            Destination::Broadcast => self.registry.active_clients(),
            Destination::Client(id) => self
                .registry
                .get(id)
                .filter(|c| c.is_active())
                .into_iter()
                .collect(),
        };
        if targets.is_empty() {
            trace!(destination = ?message.destination, "no recipients");
            return;
        }

        trace!(
            clients = targets.len(),
            queued_us = message.enqueued_at.elapsed().as_micros() as u64,
            "dispatching frame"
        );
        // `[palette | pixels]` is assembled once and shared by every send.
        let mut raw = self.pool.checkout(message.payload_len());
        raw.push(message.palette_index);
        raw.extend_from_slice(&message.frame);
        let results = join_all(targets.iter().map(|c| self.send_to(c, &raw))).await;
        self.pool.return_to_pool(raw);

        for (client, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => {}
                Err(StreamError::WriterBusy(_)) => {
                    self.stats.client_skips.fetch_add(1, Ordering::Relaxed);
                    trace!(client = client.id(), "writer busy, frame skipped");
                }
                Err(e) if e.is_disconnect() => {
                    debug!(client = client.id(), error = %e, "send failed, dropping client");
                    self.registry.remove(client.id());
                }
                Err(e) => {
                    warn!(client = client.id(), error = %e, "unexpected send error");
                    self.registry.remove(client.id());
                }
            }
        }
    }

    async fn send_to(&self, client: &Client, raw: &[u8]) -> Result<(), StreamError> {
        let mut writer = client.writer().lock(self.lock_timeout).await?;

        let len = raw.len();
        let mut compressed: Option<PoolBuffer> = None;
        if len >= self.min_compress_size {
            if let Some(deflater) = writer.deflater() {
                let mut out = self.pool.checkout(len);
                match deflater.compress_into(raw, out.as_mut_vec()) {
                    Ok(()) if out.len() < raw.len() => compressed = Some(out),
                    Ok(()) => {
                        // The peer never sees this output.
                        deflater.reset();
                        self.pool.return_to_pool(out);
                    }
                    Err(e) => {
                        debug!(client = client.id(), error = %e, "compression failed, sending raw");
                        deflater.reset();
                        self.pool.return_to_pool(out);
                    }
                }
            }
        }

        let result = match &compressed {
            Some(out) => writer.send_message(OpCode::Binary, out, true).await,
            None => writer.send_message(OpCode::Binary, raw, false).await,
        };
        drop(writer);

        let was_compressed = compressed.is_some();
        if let Some(out) = compressed {
            self.pool.return_to_pool(out);
        }

        let written = result?;
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(written as u64, Ordering::Relaxed);
        if was_compressed {
            self.stats.compressed_frames.fetch_add(1, Ordering::Relaxed);
        }
        trace!(client = client.id(), len, written, compressed = was_compressed, "frame sent");
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deflate::{Deflater, Inflater};
    use crate::registry::ClientConnection;
    use crate::ws::codec::{WsCodec, WsFrame};
    use crate::ws::connection::{WriterOptions, WsWriter};
    use futures::StreamExt;
    use tokio::io::DuplexStream;
    use tokio_util::codec::FramedRead;
    use tokio_util::sync::CancellationToken;

    type Peer = FramedRead<DuplexStream, WsCodec>;

    fn add_client(registry: &ClientRegistry, deflate: bool) -> (ClientId, Peer) {
        let (server, client) = tokio::io::duplex(1 << 20);
        let cancel = CancellationToken::new();
        let writer = WsWriter::new(
            server,
            deflate.then(|| Deflater::new(1, false)),
            WriterOptions::default(),
            cancel.clone(),
        );
        let id = registry
            .add(ClientConnection {
                peer: "test".into(),
                writer,
                cancel,
            })
            .unwrap();
        (id, FramedRead::new(client, WsCodec::client(1 << 20)))
    }

    fn setup(config: SchedulerConfig) -> (Arc<ClientRegistry>, Scheduler) {
        let registry = Arc::new(ClientRegistry::new(4));
        let pool = Arc::new(BufferPool::new(4, 80 * 1024));
        let (scheduler, _worker) = Scheduler::start(Arc::clone(&registry), pool, config);
        (registry, scheduler)
    }

    /// Reassemble one message from the peer side.
    async fn next_message(peer: &mut Peer) -> (bool, Vec<u8>) {
        let first: WsFrame = peer.next().await.unwrap().unwrap();
        let compressed = first.flags.is_compressed();
        let mut data = first.payload.to_vec();
        let mut fin = first.is_final();
        while !fin {
            let frame = peer.next().await.unwrap().unwrap();
            assert_eq!(frame.opcode, OpCode::Continuation);
            data.extend_from_slice(&frame.payload);
            fin = frame.is_final();
        }
        (compressed, data)
    }

    fn noise(len: usize, seed: u32) -> Vec<u8> {
        let mut x = seed.wrapping_mul(2_654_435_761) | 1;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect()
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client() {
        let (registry, scheduler) = setup(SchedulerConfig::default());
        let (_a, mut peer_a) = add_client(&registry, false);
        let (_b, mut peer_b) = add_client(&registry, true);

        let pixels: Vec<u8> = (0..76_800u32).map(|i| (i % 7) as u8).collect();
        scheduler
            .enqueue(Bytes::from(pixels.clone()), 3, Destination::Broadcast)
            .await
            .unwrap();

        let mut expected = vec![3u8];
        expected.extend_from_slice(&pixels);

        let (compressed, data) = next_message(&mut peer_a).await;
        assert!(!compressed);
        assert_eq!(data, expected);

        let (compressed, data) = next_message(&mut peer_b).await;
        assert!(compressed);
        let mut inflater = Inflater::new(false, 1 << 20);
        assert_eq!(inflater.decompress(&data).unwrap(), expected);

        wait_until(|| scheduler.stats().frames_sent == 2).await;
        assert_eq!(scheduler.stats().compressed_frames, 1);
    }

    #[tokio::test]
    async fn broadcast_assembles_payload_once() {
        let registry = Arc::new(ClientRegistry::new(4));
        let pool = Arc::new(BufferPool::new(2, 4096));
        let (scheduler, _worker) =
            Scheduler::start(Arc::clone(&registry), Arc::clone(&pool), SchedulerConfig::default());
        let mut peers: Vec<Peer> = (0..4).map(|_| add_client(&registry, false).1).collect();

        for round in 0..3u8 {
            scheduler
                .enqueue(Bytes::from(vec![round; 2048]), round, Destination::Broadcast)
                .await
                .unwrap();
        }
        for peer in &mut peers {
            for round in 0..3u8 {
                let (_, data) = next_message(peer).await;
                assert_eq!(data[0], round);
                assert_eq!(data.len(), 2049);
            }
        }

        wait_until(|| scheduler.stats().frames_sent == 12).await;
        wait_until(|| pool.stats().available == 2).await;
        let stats = pool.stats();
        assert_eq!(stats.checkouts, 3);
        assert_eq!(stats.fallback_allocations, 0);
    }

    #[tokio::test]
    async fn unicast_only_reaches_target() {
        let (registry, scheduler) = setup(SchedulerConfig::default());
        let (a, mut peer_a) = add_client(&registry, false);
        let (_b, mut peer_b) = add_client(&registry, false);

        scheduler
            .enqueue(Bytes::from_static(b"only-a"), 0, Destination::Client(a))
            .await
            .unwrap();
        scheduler
            .enqueue(Bytes::from_static(b"all"), 1, Destination::Broadcast)
            .await
            .unwrap();

        assert_eq!(next_message(&mut peer_a).await.1, b"\0only-a");
        assert_eq!(next_message(&mut peer_a).await.1, b"\x01all");
        assert_eq!(next_message(&mut peer_b).await.1, b"\x01all");
    }

    #[tokio::test]
    async fn incompressible_payload_goes_out_raw() {
        let (registry, scheduler) = setup(SchedulerConfig::default());
        let (_id, mut peer) = add_client(&registry, true);
        let mut inflater = Inflater::new(false, 1 << 20);

        // Noise, then a compressible frame: the second must still inflate
        // against a window that never saw the discarded output.
        let first = noise(4096, 7);
        let second = vec![9u8; 4096];
        let third = noise(512, 9);
        for frame in [&first, &second, &third] {
            scheduler
                .enqueue(Bytes::from(frame.clone()), 0, Destination::Broadcast)
                .await
                .unwrap();
        }

        let (compressed, data) = next_message(&mut peer).await;
        assert!(!compressed);
        assert_eq!(&data[1..], &first[..]);

        let (compressed, data) = next_message(&mut peer).await;
        assert!(compressed);
        assert_eq!(&inflater.decompress(&data).unwrap()[1..], &second[..]);

        // Below the size threshold: never compressed.
        let (compressed, data) = next_message(&mut peer).await;
        assert!(!compressed);
        assert_eq!(&data[1..], &third[..]);
    }

    #[tokio::test]
    async fn saturated_queue_drops_without_blocking() {
        let (registry, scheduler) = setup(SchedulerConfig {
            queue_capacity: 2,
            enqueue_wait: Duration::from_millis(5),
            lock_timeout: Duration::from_secs(30),
            min_compress_size: DEFAULT_MIN_COMPRESS_SIZE,
        });
        let (id, _peer) = add_client(&registry, false);
        let client = registry.get(id).unwrap();
        // Wedge the worker on the first message.
        let held = client.writer().lock(Duration::from_millis(50)).await.unwrap();

        let mut dropped = 0;
        let started = Instant::now();
        for i in 0..10u8 {
            if scheduler
                .enqueue(Bytes::from(vec![i; 8]), 0, Destination::Broadcast)
                .await
                .is_err()
            {
                dropped += 1;
            }
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(dropped >= 10 - 3, "dropped {dropped}");
        assert_eq!(scheduler.stats().frames_dropped, dropped);
        assert!(scheduler.try_enqueue(Bytes::new(), 0, Destination::Broadcast).is_err());
        drop(held);
    }

    #[tokio::test]
    async fn busy_writer_is_skipped() {
        let (registry, scheduler) = setup(SchedulerConfig {
            lock_timeout: Duration::from_millis(10),
            ..SchedulerConfig::default()
        });
        let (id, _peer) = add_client(&registry, false);
        let client = registry.get(id).unwrap();
        let held = client.writer().lock(Duration::from_millis(50)).await.unwrap();

        scheduler
            .enqueue(Bytes::from_static(b"x"), 0, Destination::Broadcast)
            .await
            .unwrap();
        wait_until(|| scheduler.stats().client_skips == 1).await;
        assert!(registry.is_valid(id));
        drop(held);
    }

    #[tokio::test]
    async fn dead_client_is_removed() {
        let (registry, scheduler) = setup(SchedulerConfig::default());
        let (id, peer) = add_client(&registry, false);
        drop(peer);

        scheduler
            .enqueue(Bytes::from_static(b"x"), 0, Destination::Broadcast)
            .await
            .unwrap();
        wait_until(|| !registry.is_valid(id)).await;
        assert_eq!(scheduler.stats().frames_sent, 0);
    }
}
