use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Identifies a track across the lifetime of the process. The engine also
/// uses this number to derive a percussion note when the track has no
/// melodic instrument assigned (see `midi_engine::gm_percussion_note`).
pub type TrackId = u32;

/// Identifies a pattern in the pattern registry. Patterns are looked up by
/// name, not by handle, so two tracks referencing the same name share the
/// same underlying event list.
pub type PatternName = String;

/// One entry in a track's or pattern's event list. Offsets are always
/// relative to the start of whatever burst or pattern iteration the event
/// belongs to -- never to wall-clock time. Turning a relative offset into
/// an absolute one is the scheduler's job, not the caller's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// Program-change: switch the track's instrument before `offset_ms`.
    MidiPatch { offset_ms: i64, patch: u8 },
    /// A melodic note. `duration_ms` is the time the next event's offset is
    /// measured from (it advances the cursor); `audible_duration_ms` is how
    /// long the note actually rings before note-off, and may be shorter or
    /// longer than `duration_ms` (staccato or overlapping phrasing).
    MidiNote {
        offset_ms: i64,
        note_number: u8,
        velocity: u8,
        duration_ms: i64,
        audible_duration_ms: i64,
    },
    /// A percussion hit. The struck note is derived from the track number,
    /// not carried in the event, since percussion tracks don't carry an
    /// instrument patch.
    MidiPercussion { offset_ms: i64 },
    /// A reference to a named pattern, expanded just-in-time when its play
    /// time nears. `times` repeats the pattern back-to-back that many times.
    Pattern {
        offset_ms: i64,
        pattern_name: PatternName,
        times: i64,
    },
    /// Reserved for future loop-region bookkeeping. Currently a no-op.
    PatternLoop,
    /// Reserved for future loop-region bookkeeping. Currently a no-op.
    FinishLoop,
}

/// A named, mutable list of events, looked up and appended to by name.
/// `pattern_registry::PatternRegistry` is the only thing that owns the
/// backing storage; this type is just the shape of one entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pattern {
    pub events: Vec<Event>,
}

/// System-wide transport controls carried in an ingest batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemAction {
    /// Stop the sequencer and mute all sound.
    Stop,
    /// Reserved: drop all registered patterns and track state.
    Clear,
    /// Start (or resume) the sequencer.
    Play,
}

/// Per-track controls carried in an ingest batch. Mute/unmute/clear are
/// reserved for a future revision; the four-phase ordering already has a
/// slot for them so adding real behavior later won't reshuffle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackAction {
    Clear,
    Mute,
    Unmute,
}

/// Pattern-scoped controls carried in an ingest batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatternAction {
    Clear,
}

/// One atomic batch of live edits, as handed to the ingest applier. Field
/// order here documents intent only -- the actual phase ordering lives in
/// `ingest::IngestApplier::apply`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Updates {
    pub system_actions: Vec<SystemAction>,
    pub track_actions: HashMap<TrackId, Vec<TrackAction>>,
    pub pattern_actions: HashMap<PatternName, Vec<PatternAction>>,
    pub pattern_events: HashMap<PatternName, Vec<Event>>,
    pub track_events: HashMap<TrackId, Vec<Event>>,
}
