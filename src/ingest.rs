//! Applies one atomic `Updates` batch in a fixed four-phase order: teardown,
//! then pattern edits, then track enqueues, then transport-up. Phases run
//! strictly in order so a batch that both edits a pattern and enqueues a
//! track burst referencing it always sees the edit.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::channel_allocator::ChannelAllocator;
use crate::config::SchedulerConfig;
use crate::midi_engine::MidiEngine;
use crate::pattern_registry::PatternRegistry;
use crate::track::TrackScheduler;
use crate::types::{PatternAction, SystemAction, TrackAction, TrackId, Updates};

/// Owns every track's scheduler, created lazily on first reference, plus the
/// shared pattern registry and channel pool every track draws from.
pub struct IngestApplier<E: MidiEngine> {
    engine: Arc<E>,
    patterns: Arc<PatternRegistry>,
    channels: Arc<ChannelAllocator>,
    config: SchedulerConfig,
    tracks: Mutex<HashMap<TrackId, Arc<TrackScheduler<E>>>>,
}

impl<E: MidiEngine + 'static> IngestApplier<E> {
    pub fn new(engine: Arc<E>, patterns: Arc<PatternRegistry>, channels: Arc<ChannelAllocator>, config: SchedulerConfig) -> Self {
        Self {
            engine,
            patterns,
            channels,
            config,
            tracks: Mutex::new(HashMap::new()),
        }
    }

    async fn track(&self, id: TrackId) -> Arc<TrackScheduler<E>> {
        let mut tracks = self.tracks.lock().await;
        tracks
            .entry(id)
            .or_insert_with(|| {
                TrackScheduler::spawn(id, Arc::clone(&self.engine), Arc::clone(&self.channels), Arc::clone(&self.patterns), self.config.clone())
            })
            .clone()
    }

    /// Applies one batch. Phase order is load-bearing: a pattern appended in
    /// this same batch must be visible to a track burst enqueued later in
    /// the same batch, and a `STOP` must tear the sequencer down before any
    /// of this batch's edits land.
    pub async fn apply(&self, updates: Updates) {
        // Phase 1: teardown.
        for action in &updates.system_actions {
            if *action == SystemAction::Stop {
                self.engine.stop_sequencer();
            }
            if *action == SystemAction::Clear {
                log::warn!("SystemAction::Clear is reserved and has no effect yet");
            }
        }
        for (track_id, actions) in &updates.track_actions {
            for action in actions {
                match action {
                    TrackAction::Clear => log::warn!("track {track_id}: TrackAction::Clear is reserved and has no effect yet"),
                    TrackAction::Mute => log::warn!("track {track_id}: TrackAction::Mute is reserved and has no effect yet"),
                    TrackAction::Unmute => {} // handled in phase 4
                }
            }
        }
        for (pattern_name, actions) in &updates.pattern_actions {
            for action in actions {
                match action {
                    PatternAction::Clear => self.patterns.clear(pattern_name),
                }
            }
        }

        // Phase 2: pattern edits. Must fully land before phase 3 enqueues,
        // since a track burst in this batch may reference a pattern this
        // same batch is defining.
        for (pattern_name, events) in updates.pattern_events {
            self.patterns.append(&pattern_name, events);
        }

        // Phase 3: track enqueues.
        for (track_id, events) in updates.track_events {
            let track = self.track(track_id).await;
            track.enqueue(events).await;
        }

        // Phase 4: transport-up. Unmute (reserved) logs here rather than in
        // phase 1 so a future implementation can assume tracks are already
        // primed before they're unmuted.
        for (track_id, actions) in &updates.track_actions {
            for action in actions {
                if *action == TrackAction::Unmute {
                    log::warn!("track {track_id}: TrackAction::Unmute is reserved and has no effect yet");
                }
            }
        }
        if updates.system_actions.contains(&SystemAction::Play) {
            self.engine.set_playing(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi_engine::test_support::{Dispatched, FakeMidiEngine};
    use crate::types::Event;

    fn applier() -> IngestApplier<FakeMidiEngine> {
        let config = SchedulerConfig::default();
        IngestApplier::new(
            FakeMidiEngine::new(),
            Arc::new(PatternRegistry::new()),
            Arc::new(ChannelAllocator::new(config.melodic_channels.clone())),
            config,
        )
    }

    #[tokio::test]
    async fn empty_updates_is_a_no_op() {
        let applier = applier();
        applier.apply(Updates::default()).await;
        assert!(applier.engine.dispatched().is_empty());
        assert!(!applier.engine.is_playing());
    }

    #[tokio::test]
    async fn play_system_action_sets_the_transport_flag() {
        let applier = applier();
        let mut updates = Updates::default();
        updates.system_actions.push(SystemAction::Play);
        applier.apply(updates).await;
        assert!(applier.engine.is_playing());
    }

    #[tokio::test]
    async fn pattern_clear_then_append_in_the_same_batch_keeps_only_the_new_events() {
        let applier = applier();
        applier.patterns.append("verse", vec![Event::MidiPatch { offset_ms: 0, patch: 1 }]);

        let mut updates = Updates::default();
        updates.pattern_actions.insert("verse".to_string(), vec![PatternAction::Clear]);
        updates
            .pattern_events
            .insert("verse".to_string(), vec![Event::MidiPatch { offset_ms: 0, patch: 9 }]);
        applier.apply(updates).await;

        let snapshot = applier.patterns.snapshot("verse");
        assert_eq!(snapshot, vec![Event::MidiPatch { offset_ms: 0, patch: 9 }]);
    }

    #[tokio::test]
    async fn a_pattern_defined_and_referenced_in_the_same_batch_is_visible_to_the_track() {
        let applier = applier();
        let mut updates = Updates::default();
        updates
            .pattern_events
            .insert("verse".to_string(), vec![Event::MidiNote { offset_ms: 0, note_number: 60, velocity: 100, duration_ms: 200, audible_duration_ms: 200 }]);
        updates
            .track_events
            .insert(1, vec![Event::Pattern { offset_ms: 0, pattern_name: "verse".to_string(), times: 1 }]);
        applier.apply(updates).await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(
            applier.engine.dispatched(),
            vec![Dispatched::Note { start_ms: 0, end_ms: 200, channel: 0, note_number: 60, velocity: 100 }]
        );
    }

    #[tokio::test]
    async fn stop_tears_down_before_this_batchs_edits_and_enqueues_land() {
        let applier = applier();
        let mut updates = Updates::default();
        updates.system_actions.push(SystemAction::Stop);
        updates
            .track_events
            .insert(1, vec![Event::MidiNote { offset_ms: 0, note_number: 60, velocity: 100, duration_ms: 200, audible_duration_ms: 200 }]);
        applier.apply(updates).await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!applier.engine.is_playing());
        // The note still gets scheduled -- STOP tears down the transport,
        // it doesn't discard events already in this batch.
        assert_eq!(applier.engine.dispatched().len(), 1);
    }
}
