//! The JIT pattern resolver: waits on a barrier until a pattern's marker
//! time is imminent, snapshots the pattern's current events, and schedules
//! them. The critical property is that the snapshot is taken *after* the
//! wait, so a pattern edited while a track is blocked on its barrier plays
//! the edited version.

use std::sync::Arc;

use crate::config::{SchedulerConfig, MAX_PATTERN_NESTING_DEPTH};
use crate::midi_engine::MidiEngine;
use crate::pattern_registry::PatternRegistry;
use crate::types::{Event, PatternName, TrackId};

/// A note handed back up to the track scheduler after expansion, with its
/// offset already resolved to the same absolute timeline the track's direct
/// notes use. `offset_ms + duration_ms` is what `TrackScheduler` folds into
/// the new `start_offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterializedNote {
    pub offset_ms: i64,
    pub duration_ms: i64,
}

pub struct PatternExpander<E: MidiEngine> {
    patterns: Arc<PatternRegistry>,
    engine: Arc<E>,
    config: SchedulerConfig,
}

impl<E: MidiEngine> PatternExpander<E> {
    pub fn new(patterns: Arc<PatternRegistry>, engine: Arc<E>, config: SchedulerConfig) -> Self {
        Self { patterns, engine, config }
    }

    /// Expands a top-level `PatternEvent` from a track's burst. `base_offset_ms`
    /// is the track's (already past-due- and buffer-adjusted) `start_offset`;
    /// `offset_ms` is the event's own offset within the burst.
    pub async fn expand(
        &self,
        pattern_name: &PatternName,
        offset_ms: i64,
        times: i64,
        base_offset_ms: i64,
        channel: Option<u8>,
        track_id: TrackId,
    ) -> Vec<MaterializedNote> {
        let mut visiting = Vec::new();
        self.expand_inner(pattern_name, offset_ms, times, base_offset_ms, channel, track_id, 0, &mut visiting)
            .await
    }

    fn expand_inner<'a>(
        &'a self,
        pattern_name: &'a PatternName,
        offset_ms: i64,
        times: i64,
        base_offset_ms: i64,
        channel: Option<u8>,
        track_id: TrackId,
        depth: usize,
        visiting: &'a mut Vec<PatternName>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Vec<MaterializedNote>> + Send + 'a>> {
        Box::pin(async move {
            // Negative or zero repeat count: nothing to schedule.
            if times < 1 {
                return Vec::new();
            }
            if depth > MAX_PATTERN_NESTING_DEPTH {
                log::warn!(
                    "pattern `{pattern_name}` exceeded max nesting depth ({MAX_PATTERN_NESTING_DEPTH}); aborting branch"
                );
                return Vec::new();
            }
            if visiting.contains(pattern_name) {
                log::warn!("pattern `{pattern_name}` references itself; aborting branch");
                return Vec::new();
            }
            visiting.push(pattern_name.clone());

            let mut results = Vec::new();
            let mut cur_base = base_offset_ms;
            let mut cur_offset = offset_ms;

            for iteration in 0..times {
                let pattern_start = cur_base + cur_offset;
                let marker_time = (pattern_start - self.config.schedule_buffer_time_ms).max(cur_base);
                log::debug!(
                    "pattern `{pattern_name}` iteration {iteration}: marker at {marker_time}ms, pattern_start={pattern_start}ms"
                );

                let barrier = self.engine.pattern_marker(marker_time, pattern_name);
                barrier.wait().await;

                let snapshot = self.patterns.snapshot(pattern_name);
                let mut direct_reach = 0i64;
                let mut has_direct_notes = false;
                let mut has_nested = false;

                for event in &snapshot {
                    match event {
                        Event::MidiNote {
                            offset_ms,
                            note_number,
                            velocity,
                            duration_ms,
                            audible_duration_ms,
                        } => {
                            has_direct_notes = true;
                            let abs_start = pattern_start + offset_ms;
                            match channel {
                                Some(channel) => {
                                    self.engine
                                        .note(abs_start, abs_start + audible_duration_ms, channel, *note_number, *velocity);
                                }
                                None => log::warn!(
                                    "track {track_id}: no MIDI channel available, dropping note from pattern `{pattern_name}`"
                                ),
                            }
                            results.push(MaterializedNote { offset_ms: abs_start, duration_ms: *duration_ms });
                            direct_reach = direct_reach.max(offset_ms + duration_ms);
                        }
                        Event::MidiPatch { offset_ms, patch } => match channel {
                            Some(channel) => self.engine.patch(pattern_start + offset_ms, channel, *patch),
                            None => log::warn!(
                                "track {track_id}: no MIDI channel available, dropping patch from pattern `{pattern_name}`"
                            ),
                        },
                        Event::MidiPercussion { offset_ms } => {
                            self.engine.percussion(pattern_start + offset_ms, track_id);
                        }
                        Event::Pattern { offset_ms, pattern_name: nested_name, times: nested_times } => {
                            has_nested = true;
                            let nested = self
                                .expand_inner(
                                    nested_name,
                                    *offset_ms,
                                    *nested_times,
                                    pattern_start,
                                    channel,
                                    track_id,
                                    depth + 1,
                                    visiting,
                                )
                                .await;
                            results.extend(nested);
                        }
                        Event::PatternLoop | Event::FinishLoop => {}
                    }
                }

                if !has_direct_notes {
                    if has_nested {
                        // No direct notes means no natural iteration length; repeating
                        // at the same instant forever is meaningless, so we stop
                        // rather than loop `times` times in place.
                        break;
                    }
                    // Fully empty pattern: the loop still runs out after `times`
                    // iterations, each contributing nothing -- a bounded vacuous
                    // loop, not an infinite one.
                }

                cur_base = pattern_start;
                cur_offset = direct_reach;
            }

            visiting.pop();
            results
        })
    }
}
