//! Ebb chain follower.
//!
//! Connects to a node's WebSocket bridge, negotiates an intersection and logs
//! every instruction the node sends until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use ebb_client::{
    ChainSyncClient, ChainSyncHandler, ChainSyncState, ClientConfig, ConnectionEvent, InteractionContext, RequestNext,
};
use ebb_core::{HandlerError, Point, RollBackward, RollForward};
use tokio::sync::Notify;
use tracing::{info, warn};

/// Follow a chain from a JSON-WSP node bridge.
#[derive(Parser, Debug)]
#[command(name = "ebb-sync", version, about = "Pipelined chain-sync follower")]
struct Args {
    /// Configuration file (TOML). Defaults to <config dir>/ebb/ebb.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Node host
    #[arg(long)]
    host: Option<String>,

    /// Node port
    #[arg(long)]
    port: Option<u16>,

    /// Connect with wss://
    #[arg(long)]
    tls: bool,

    /// Number of RequestNext messages kept in flight
    #[arg(long)]
    in_flight: Option<usize>,

    /// Run handlers concurrently instead of one at a time
    #[arg(long)]
    concurrent: bool,

    /// Candidate intersection points, "origin" or "<slot>@<hash>" (repeatable).
    /// Defaults to the node's current tip.
    #[arg(long = "point", value_parser = parse_point)]
    points: Vec<Point>,

    /// Stop after this many blocks
    #[arg(long)]
    max_blocks: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl Args {
    /// Layer file and environment configuration, then apply CLI overrides.
    fn client_config(&self) -> Result<ClientConfig> {
        let path = self.config.clone().or_else(|| {
            dirs::config_dir()
                .map(|dir| dir.join("ebb").join("ebb.toml"))
                .filter(|path| path.exists())
        });
        let mut config = ClientConfig::load(path.as_deref())
            .with_context(|| format!("loading configuration from {path:?}"))?;

        if let Some(host) = &self.host {
            config.connection.host = host.clone();
        }
        if let Some(port) = self.port {
            config.connection.port = port;
        }
        if self.tls {
            config.connection.tls = true;
        }
        if let Some(in_flight) = self.in_flight {
            config.in_flight = in_flight;
        }
        if self.concurrent {
            config.sequential = false;
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_point(raw: &str) -> Result<Point, String> {
    if raw == "origin" {
        return Ok(Point::Origin);
    }
    let (slot, hash) = raw
        .split_once('@')
        .ok_or_else(|| format!("expected 'origin' or '<slot>@<hash>', got '{raw}'"))?;
    let slot = slot.parse().map_err(|e| format!("invalid slot '{slot}': {e}"))?;
    if hash.is_empty() {
        return Err("empty block hash".to_string());
    }
    Ok(Point::Block {
        slot,
        hash: hash.to_string(),
    })
}

/// Logs each instruction and acknowledges it straight away.
struct LoggingHandler {
    blocks: AtomicU64,
    max_blocks: Option<u64>,
    limit_reached: Notify,
}

impl LoggingHandler {
    fn new(max_blocks: Option<u64>) -> Self {
        Self {
            blocks: AtomicU64::new(0),
            max_blocks,
            limit_reached: Notify::new(),
        }
    }
}

#[async_trait]
impl ChainSyncHandler for LoggingHandler {
    async fn roll_backward(&self, event: RollBackward, next: RequestNext) -> Result<(), HandlerError> {
        warn!(slot = ?event.point.slot(), point = %event.point, tip = %event.tip, "roll backward");
        next.request_next();
        Ok(())
    }

    async fn roll_forward(&self, event: RollForward, next: RequestNext) -> Result<(), HandlerError> {
        let count = self.blocks.fetch_add(1, Ordering::SeqCst) + 1;
        info!(era = event.block.era().unwrap_or("unknown"), tip = %event.tip, count, "roll forward");
        match self.max_blocks {
            Some(max) if count >= max => self.limit_reached.notify_one(),
            _ => next.request_next(),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, &args.log_format);

    let config = args.client_config()?;
    info!("Ebb sync v{}", env!("CARGO_PKG_VERSION"));
    info!(host = %config.connection.host, port = config.connection.port, tls = config.connection.tls, "connecting");
    info!(in_flight = config.in_flight, sequential = config.sequential, resequence = config.resequence, "pipeline");

    let context = InteractionContext::connect(config)
        .await
        .context("connecting to node")?;
    let mut events = context.connection.subscribe();

    let handler = Arc::new(LoggingHandler::new(args.max_blocks));
    let client = ChainSyncClient::from_context(&context, handler.clone());

    let points = (!args.points.is_empty()).then_some(args.points);
    let intersection = client
        .start_sync(points, None)
        .await
        .context("starting chain sync")?;
    info!(point = %intersection.point, tip = %intersection.tip, "following chain (Ctrl+C to stop)");

    let closed = async {
        while let Some(ConnectionEvent::Message(_)) = events.recv().await {}
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("installing Ctrl+C handler")?;
            info!("received Ctrl+C, shutting down");
        }
        _ = handler.limit_reached.notified() => {
            info!(blocks = handler.blocks.load(Ordering::SeqCst), "block limit reached, shutting down");
        }
        _ = closed => {
            warn!("node closed the connection");
        }
    }

    if client.state() != ChainSyncState::Closed {
        client.shutdown().await.context("shutting down")?;
    }
    info!("Ebb sync stopped");
    Ok(())
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// Pass `format = "json"` for structured JSON output. Any other value
/// defaults to human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_origin_and_block_points() {
        assert_eq!(parse_point("origin").unwrap(), Point::Origin);
        assert_eq!(
            parse_point("4492799@f8084c61b6a2").unwrap(),
            Point::Block {
                slot: 4_492_799,
                hash: "f8084c61b6a2".to_string()
            }
        );
    }

    #[test]
    fn rejects_malformed_points() {
        assert!(parse_point("4492799").is_err());
        assert!(parse_point("abc@ff").is_err());
        assert!(parse_point("12@").is_err());
    }

    #[test]
    fn cli_overrides_config() {
        let args = Args::parse_from([
            "ebb-sync",
            "--config",
            "/nonexistent/ebb.toml",
            "--host",
            "relay",
        ]);
        assert!(args.client_config().is_err());

        let args = Args::parse_from(["ebb-sync", "--host", "relay", "--port", "9000", "--in-flight", "7", "--concurrent"]);
        assert_eq!(args.host.as_deref(), Some("relay"));
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.in_flight, Some(7));
        assert!(args.concurrent);
    }
}
