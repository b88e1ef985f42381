//! pixcast-server entry point.
//!
//! ```text
//! pixcast-server                   Run in the foreground
//! pixcast-server --config <path>   Load a custom config TOML
//! pixcast-server --port <port>     Override the listen port
//! pixcast-server --gen-config      Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pixcast_core::StreamService;
use pixcast_server::config::ServerConfig;
use pixcast_server::renderer::{self, TestPattern};

const STATS_INTERVAL: Duration = Duration::from_secs(10);

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "pixcast-server", about = "Stream a live framebuffer to browsers over WebSocket")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "pixcast.toml")]
    config: PathBuf,

    /// Listen port, overriding the config file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ServerConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.network.port = port;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let service_config = config.to_service_config();
    info!("pixcast-server v{}", env!("CARGO_PKG_VERSION"));
    info!("listening on ws://{}{}", service_config.bind_addr, service_config.path);
    info!(
        "framebuffer {}x{} at {} fps, compression {}",
        service_config.width,
        service_config.height,
        config.stream.fps,
        if service_config.compression { "on" } else { "off" },
    );

    let pattern = TestPattern::new(service_config.width, service_config.height);
    let (service, producer) = StreamService::new(service_config)?;
    let service = Arc::new(service);
    let shutdown = service.shutdown_token();

    let render_thread = renderer::spawn(
        producer,
        pattern,
        service.input_events(),
        config.frame_interval(),
        shutdown.clone(),
    )?;

    // Ctrl-C handler.
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        ctrl_c.cancel();
    });

    let stats_service = Arc::clone(&service);
    tokio::spawn(async move {
        let token = stats_service.shutdown_token();
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let stats = stats_service.stats();
            let pool = stats_service.pool().stats();
            info!(
                clients = stats_service.registry().len(),
                sent = stats.frames_sent,
                dropped = stats.frames_dropped,
                skips = stats.client_skips,
                compressed = stats.compressed_frames,
                bytes = stats.bytes_sent,
                pool_fallbacks = pool.fallback_allocations,
                "stream stats"
            );
        }
    });

    let result = service.run().await;

    // The renderer only watches the token; make sure it sees it even
    // when the listener failed.
    shutdown.cancel();
    match tokio::task::spawn_blocking(move || render_thread.join()).await {
        Ok(Ok(stats)) => info!(rendered = stats.rendered, skipped = stats.skipped, "renderer joined"),
        Ok(Err(_)) => warn!("renderer thread panicked"),
        Err(e) => warn!("failed to join renderer: {e}"),
    }

    result?;
    Ok(())
}
