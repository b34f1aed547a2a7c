//! The per-track scheduling worker: one bounded FIFO of event bursts per
//! track, drained by a single dedicated task so bursts are always scheduled
//! in arrival order. A spawn-per-burst design would keep the queue draining
//! while a prior burst is still JIT-blocked, but a single worker reading a
//! bounded channel gets the same ordering guarantee with none of the
//! bookkeeping, so that's what this does.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::channel_allocator::ChannelAllocator;
use crate::config::SchedulerConfig;
use crate::midi_engine::MidiEngine;
use crate::pattern_expander::{MaterializedNote, PatternExpander};
use crate::pattern_registry::PatternRegistry;
use crate::types::{Event, TrackId};

/// Bounds how many bursts may be queued for a track before `enqueue` starts
/// applying backpressure. A track that is JIT-blocked on a long pattern
/// wait will still accept this many further bursts without stalling ingest.
const BURST_QUEUE_CAPACITY: usize = 64;

/// Owns one track's burst queue and scheduling state. Spawned once per track
/// number, on first reference, and lives for the process's duration.
pub struct TrackScheduler<E: MidiEngine> {
    id: TrackId,
    engine: Arc<E>,
    channels: Arc<ChannelAllocator>,
    expander: PatternExpander<E>,
    config: SchedulerConfig,
    burst_tx: mpsc::Sender<Vec<Event>>,
    start_offset_ms: Mutex<i64>,
}

impl<E: MidiEngine + 'static> TrackScheduler<E> {
    /// Builds the scheduler and spawns its worker task.
    pub fn spawn(
        id: TrackId,
        engine: Arc<E>,
        channels: Arc<ChannelAllocator>,
        patterns: Arc<PatternRegistry>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let (burst_tx, mut burst_rx) = mpsc::channel::<Vec<Event>>(BURST_QUEUE_CAPACITY);
        let expander = PatternExpander::new(Arc::clone(&patterns), Arc::clone(&engine), config.clone());

        let scheduler = Arc::new(Self {
            id,
            engine,
            channels,
            expander,
            config,
            burst_tx,
            start_offset_ms: Mutex::new(0),
        });

        let worker = Arc::clone(&scheduler);
        tokio::spawn(async move {
            while let Some(burst) = burst_rx.recv().await {
                let start_offset = *worker.start_offset_ms.lock().await;
                let new_start_offset = worker.schedule_events(burst, start_offset).await;
                *worker.start_offset_ms.lock().await = new_start_offset;
            }
            log::debug!("track {}: worker exiting, burst queue closed", worker.id);
        });

        scheduler
    }

    /// Enqueues one burst. Awaits if the queue is full rather than dropping,
    /// preserving FIFO order; a closed queue (worker gone) just warns.
    pub async fn enqueue(&self, events: Vec<Event>) {
        if self.burst_tx.send(events).await.is_err() {
            log::warn!("track {}: burst queue closed, dropping burst", self.id);
        }
    }

    fn channel(&self) -> Option<u8> {
        self.channels.acquire(self.id)
    }

    /// Resolves `start_offset` against the engine's clock, dispatches each
    /// event by variant, and returns the new cursor for the next burst.
    async fn schedule_events(&self, events: Vec<Event>, start_offset: i64) -> i64 {
        let now = self.engine.current_offset_ms().round() as i64;
        let original_start_offset = start_offset;
        let mut start_offset = start_offset.max(now);
        if self.engine.is_playing() && start_offset - now < self.config.schedule_buffer_time_ms {
            start_offset += self.config.schedule_buffer_time_ms;
        }

        let mut materialized: Vec<MaterializedNote> = Vec::new();

        for event in events {
            match event {
                Event::MidiPatch { offset_ms, patch } => match self.channel() {
                    Some(channel) => self.engine.patch(start_offset + offset_ms, channel, patch),
                    None => log::warn!("track {}: no MIDI channel available, dropping patch event", self.id),
                },
                Event::MidiPercussion { offset_ms } => {
                    self.channels.force_percussion(self.id);
                    self.engine.percussion(start_offset + offset_ms, self.id);
                }
                Event::MidiNote { offset_ms, note_number, velocity, duration_ms, audible_duration_ms } => {
                    let abs_start = start_offset + offset_ms;
                    match self.channel() {
                        Some(channel) => self.engine.note(abs_start, abs_start + audible_duration_ms, channel, note_number, velocity),
                        None => log::warn!("track {}: no MIDI channel available, dropping note event", self.id),
                    }
                    materialized.push(MaterializedNote { offset_ms: abs_start, duration_ms });
                }
                Event::Pattern { offset_ms, pattern_name, times } => {
                    let channel = self.channel();
                    let notes = self
                        .expander
                        .expand(&pattern_name, offset_ms, times, start_offset, channel, self.id)
                        .await;
                    materialized.extend(notes);
                }
                Event::PatternLoop | Event::FinishLoop => {
                    // Reserved loop-bracket markers; no-op until a future
                    // revision defines their behavior.
                }
            }
        }

        if self.engine.is_playing() {
            self.engine.start_sequencer();
        }

        materialized
            .iter()
            .map(|n| n.offset_ms + n.duration_ms)
            .max()
            .unwrap_or(original_start_offset)
    }
}
