mod channel_allocator;
mod config;
mod error;
mod ingest;
mod midi_engine;
mod pattern_expander;
mod pattern_registry;
mod player;
mod track;
mod types;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use channel_allocator::ChannelAllocator;
use config::SchedulerConfig;
use ingest::IngestApplier;
use midi_engine::MidirMidiEngine;
use pattern_registry::PatternRegistry;
use player::{JsonParser, PlayerLoop};

/// Address the line-delimited JSON `Updates` listener binds to. Each
/// connection is an independent producer; a line is one atomic batch.
const INBOUND_ADDR: &str = "127.0.0.1:7878";

/// Bounds how many inbound messages can be queued ahead of the ingest
/// applier before a connection's reader blocks.
const INBOUND_QUEUE_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = SchedulerConfig::default();
    let engine = MidirMidiEngine::new(None)?;
    let patterns = Arc::new(PatternRegistry::new());
    let channels = Arc::new(ChannelAllocator::new(config.melodic_channels.clone()));
    let applier = Arc::new(IngestApplier::new(Arc::clone(&engine), patterns, channels, config));

    let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    tokio::spawn(PlayerLoop::new(Arc::clone(&applier), JsonParser, rx).run());

    let listener = TcpListener::bind(INBOUND_ADDR).await?;
    log::info!("listening for live instructions on {INBOUND_ADDR}");

    loop {
        let (socket, peer) = listener.accept().await?;
        log::info!("accepted connection from {peer}");
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(socket).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(line).await.is_err() {
                            log::warn!("player loop gone, closing connection from {peer}");
                            break;
                        }
                    }
                    Ok(None) => {
                        log::info!("connection from {peer} closed");
                        break;
                    }
                    Err(e) => {
                        log::warn!("read error from {peer}: {e}");
                        break;
                    }
                }
            }
        });
    }
}
