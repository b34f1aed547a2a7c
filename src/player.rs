//! The outermost loop: reads raw inbound instructions one at a time and
//! hands each, translated into an `Updates` batch, to the ingest applier.
//! The loop's only shutdown signal is the inbound channel closing.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::ingest::IngestApplier;
use crate::midi_engine::MidiEngine;
use crate::types::Updates;

/// Translates one raw inbound message into an `Updates` batch. Kept as a
/// trait so the transport (what `T` is) can change -- raw JSON text over a
/// socket today, something else tomorrow -- without touching the loop.
pub trait UpdatesParser<T>: Send + Sync {
    fn parse(&self, raw: T) -> Updates;
}

/// The trivial parser for a transport that already hands over `Updates`
/// values directly (e.g. an in-process channel, or tests).
pub struct IdentityParser;

impl UpdatesParser<Updates> for IdentityParser {
    fn parse(&self, raw: Updates) -> Updates {
        raw
    }
}

/// Parses line-delimited JSON into `Updates`. A malformed line is logged and
/// dropped rather than killing the loop -- one bad message from an external
/// producer shouldn't take down the player.
pub struct JsonParser;

impl UpdatesParser<String> for JsonParser {
    fn parse(&self, raw: String) -> Updates {
        match serde_json::from_str(&raw) {
            Ok(updates) => updates,
            Err(e) => {
                log::warn!("dropping malformed update: {e}");
                Updates::default()
            }
        }
    }
}

/// Drains `inbound` until the sender side closes, applying each message in
/// order. There is exactly one of these per process.
pub struct PlayerLoop<E: MidiEngine, T, P: UpdatesParser<T>> {
    applier: Arc<IngestApplier<E>>,
    parser: P,
    inbound: mpsc::Receiver<T>,
}

impl<E: MidiEngine + 'static, T, P: UpdatesParser<T>> PlayerLoop<E, T, P> {
    pub fn new(applier: Arc<IngestApplier<E>>, parser: P, inbound: mpsc::Receiver<T>) -> Self {
        Self { applier, parser, inbound }
    }

    pub async fn run(mut self) {
        log::info!("player loop starting");
        while let Some(raw) = self.inbound.recv().await {
            let updates = self.parser.parse(raw);
            self.applier.apply(updates).await;
        }
        log::info!("player loop exiting: inbound channel closed");
    }
}
