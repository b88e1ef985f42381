//! Configuration for the pixcast server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pixcast_core::StreamServiceConfig;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub stream: StreamConfig,
    pub compression: CompressionConfig,
    pub transmission: TransmissionConfig,
    pub logging: LoggingConfig,
}

/// Listener and admission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind.
    pub bind: IpAddr,
    pub port: u16,
    /// WebSocket upgrade endpoint.
    pub path: String,
    /// Simultaneous viewers.
    pub max_clients: usize,
}

/// Framebuffer geometry and pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub width: usize,
    pub height: usize,
    /// Frames buffered between renderer and network.
    pub queue_depth: usize,
    /// Renderer target frames per second.
    pub fps: u32,
}

/// permessage-deflate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// zlib level 0..=9.
    pub level: u32,
    /// Frames smaller than this are sent uncompressed.
    pub min_size: usize,
}

/// Queueing, fragmentation and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmissionConfig {
    pub chunk_size: usize,
    pub queue_capacity: usize,
    pub enqueue_wait_ms: u64,
    pub send_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub pool_buffers: usize,
    pub pool_buffer_size: usize,
    pub ping_interval_ms: u64,
    pub idle_timeout_ms: u64,
    pub max_message_size: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            path: "/ws".into(),
            max_clients: 4,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            queue_depth: 2,
            fps: 35,
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: 1,
            min_size: 1024,
        }
    }
}

impl Default for TransmissionConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024,
            queue_capacity: 16,
            enqueue_wait_ms: 5,
            send_timeout_ms: 1000,
            lock_timeout_ms: 50,
            handshake_timeout_ms: 5000,
            pool_buffers: 4,
            pool_buffer_size: 80 * 1024,
            ping_interval_ms: 1000,
            idle_timeout_ms: 10_000,
            max_message_size: 64 * 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Frame period for the renderer.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.stream.fps.clamp(1, 120)
    }

    /// Convert into a clamped `StreamServiceConfig`.
    pub fn to_service_config(&self) -> StreamServiceConfig {
        let t = &self.transmission;
        let ms = Duration::from_millis;
        let path = if self.network.path.starts_with('/') {
            self.network.path.clone()
        } else {
            format!("/{}", self.network.path)
        };

        StreamServiceConfig {
            bind_addr: SocketAddr::new(self.network.bind, self.network.port),
            path,
            max_clients: self.network.max_clients.clamp(1, 64),
            width: self.stream.width.clamp(1, 4096),
            height: self.stream.height.clamp(1, 4096),
            queue_depth: self.stream.queue_depth.clamp(1, 16),
            compression: self.compression.enabled,
            compression_level: self.compression.level.min(9),
            min_compress_size: self.compression.min_size,
            chunk_size: t.chunk_size.clamp(125, 1 << 20),
            queue_capacity: t.queue_capacity.clamp(1, 1024),
            enqueue_wait: ms(t.enqueue_wait_ms),
            send_timeout: ms(t.send_timeout_ms.max(1)),
            lock_timeout: ms(t.lock_timeout_ms.max(1)),
            handshake_timeout: ms(t.handshake_timeout_ms.max(1)),
            pool_buffers: t.pool_buffers,
            pool_buffer_size: t.pool_buffer_size,
            ping_interval: ms(t.ping_interval_ms.max(10)),
            idle_timeout: ms(t.idle_timeout_ms.max(t.ping_interval_ms)),
            max_message_size: t.max_message_size.max(125),
            ..StreamServiceConfig::default()
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
