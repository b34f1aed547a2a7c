//! The `MidiEngine` capability: the low-level sequencer driver the scheduling
//! core schedules against. The core never depends on anything in this file
//! except the `MidiEngine` trait -- `MidirMidiEngine` is one concrete,
//! runnable implementation: a `midir::MidiOutputConnection` driven by a
//! dedicated clock thread that pops due entries off a min-heap of
//! timestamped MIDI primitives and pattern markers.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use midir::{MidiOutput, MidiOutputConnection};
use tokio::sync::oneshot;

use crate::error::EngineError;
use crate::types::TrackId;

/// How often the clock thread wakes up to check for due MIDI primitives and
/// pattern markers. Small enough that JIT scheduling feels instantaneous,
/// large enough not to pin a core.
const CLOCK_TICK: Duration = Duration::from_millis(2);

/// General MIDI percussion key range (channel 9, "Acoustic Bass Drum"
/// through "Open Triangle"). The spec leaves the track-number-to-drum
/// mapping up to the engine; this is our concrete choice.
const GM_PERCUSSION_BASE: u8 = 35;
const GM_PERCUSSION_SPAN: u8 = 47;

const NOTE_ON: u8 = 0x90;
const NOTE_OFF: u8 = 0x80;
const PROGRAM_CHANGE: u8 = 0xC0;
const CONTROL_CHANGE: u8 = 0xB0;
const ALL_NOTES_OFF: u8 = 123;

/// A one-shot wait for a pattern marker to be reached. Released by the
/// engine exactly once, either because the clock crossed the marker's
/// timestamp or because the engine decided it could never do so (stopped,
/// or the timestamp already passed).
pub struct Barrier(oneshot::Receiver<()>);

impl Barrier {
    pub async fn wait(self) {
        let _ = self.0.await;
    }
}

/// The capability the scheduling core consumes: timestamped primitives, a
/// monotonic offset clock, and a play/stop toggle. Implementations must
/// never block the caller -- `note`, `patch`, and `percussion` enqueue work
/// for later, they don't perform it
/// synchronously.
pub trait MidiEngine: Send + Sync {
    /// Schedules a program (instrument) change on `channel` at `at_ms`.
    fn patch(&self, at_ms: i64, channel: u8, patch: u8);

    /// Schedules a note-on at `start_ms` and the matching note-off at
    /// `end_ms`.
    fn note(&self, start_ms: i64, end_ms: i64, channel: u8, note_number: u8, velocity: u8);

    /// Schedules a percussion strike for `track_number` at `at_ms`. The
    /// engine, not the caller, maps track number to a General MIDI drum key.
    fn percussion(&self, at_ms: i64, track_number: TrackId);

    /// Requests a marker at `at_ms` for `pattern_name` and returns a barrier
    /// that releases when the playhead reaches it. Releases immediately if
    /// the engine isn't playing or `at_ms` has already passed.
    fn pattern_marker(&self, at_ms: i64, pattern_name: &str) -> Barrier;

    /// The current playhead position, in milliseconds, monotonically
    /// non-decreasing while playing.
    fn current_offset_ms(&self) -> f64;

    /// Whether the transport is (or has been asked to be) playing.
    fn is_playing(&self) -> bool;

    /// Sets the transport flag. Ingest calls this with `true` on `PLAY`;
    /// `stop_sequencer` calls it with `false`.
    fn set_playing(&self, playing: bool);

    /// Starts the clock advancing, if it isn't already. Idempotent.
    fn start_sequencer(&self);

    /// Stops the clock, releases every pending barrier immediately (so no
    /// scheduling task is left blocked forever), and silences all channels.
    /// Idempotent.
    fn stop_sequencer(&self);
}

/// Maps a track number to a General MIDI percussion key. Exposed so callers
/// (and tests) can predict what a given track will strike.
pub fn gm_percussion_note(track_number: TrackId) -> u8 {
    GM_PERCUSSION_BASE + (track_number % GM_PERCUSSION_SPAN as u32) as u8
}

enum Action {
    Midi(Vec<u8>),
    Marker(oneshot::Sender<()>),
}

struct Pending {
    at_ms: i64,
    seq: u64,
    action: Action,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.at_ms == other.at_ms && self.seq == other.seq
    }
}
impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    /// Reversed so a `BinaryHeap` (a max-heap) pops the earliest timestamp
    /// first; ties broken by arrival order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at_ms
            .cmp(&self.at_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A `midir`-backed `MidiEngine`. Owns a dedicated clock thread that polls a
/// min-heap of pending MIDI primitives and pattern markers, firing whatever
/// is due. `current_offset_ms` is derived from an `Instant` captured at
/// `start_sequencer`, with `paused_offset_ms` absorbing accumulated playtime
/// across stop/start cycles.
pub struct MidirMidiEngine {
    conn: Mutex<MidiOutputConnection>,
    pending: Mutex<BinaryHeap<Pending>>,
    seq: AtomicU64,
    playing: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    paused_offset_ms: AtomicI64,
}

impl MidirMidiEngine {
    /// Connects to the named MIDI output port, or the first available one if
    /// `port_name` is `None`, and spawns the clock thread.
    pub fn new(port_name: Option<&str>) -> Result<Arc<Self>, EngineError> {
        let midi_out = MidiOutput::new("livescore").map_err(|_| EngineError::NoOutputPorts)?;
        let ports = midi_out.ports();
        if ports.is_empty() {
            return Err(EngineError::NoOutputPorts);
        }
        let port = match port_name {
            Some(name) => ports
                .iter()
                .find(|p| midi_out.port_name(p).map(|n| n == name).unwrap_or(false))
                .cloned()
                .ok_or_else(|| EngineError::PortNotFound(name.to_string()))?,
            None => ports[0].clone(),
        };
        let conn = midi_out
            .connect(&port, "livescore")
            .map_err(|e| EngineError::ConnectFailed(e.to_string()))?;

        let engine = Arc::new(Self {
            conn: Mutex::new(conn),
            pending: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            playing: AtomicBool::new(false),
            started_at: Mutex::new(None),
            paused_offset_ms: AtomicI64::new(0),
        });

        let clock_engine = Arc::clone(&engine);
        thread::spawn(move || clock_engine.run_clock());

        Ok(engine)
    }

    fn run_clock(&self) {
        let sleeper = spin_sleep::SpinSleeper::default();
        loop {
            let now = self.current_offset_ms().round() as i64;
            let mut due = Vec::new();
            {
                let mut pending = self.pending.lock().unwrap();
                while pending.peek().map(|p| p.at_ms <= now).unwrap_or(false) {
                    due.push(pending.pop().unwrap());
                }
            }
            for p in due {
                self.fire(p.action);
            }
            sleeper.sleep(CLOCK_TICK);
        }
    }

    fn fire(&self, action: Action) {
        match action {
            Action::Midi(bytes) => {
                if let Err(e) = self.conn.lock().unwrap().send(&bytes) {
                    log::warn!("failed to send MIDI bytes: {e}");
                }
            }
            Action::Marker(tx) => {
                let _ = tx.send(());
            }
        }
    }

    fn schedule_midi(&self, at_ms: i64, bytes: Vec<u8>) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.pending.lock().unwrap().push(Pending {
            at_ms,
            seq,
            action: Action::Midi(bytes),
        });
    }

    fn all_notes_off(&self) {
        let mut conn = self.conn.lock().unwrap();
        for channel in 0..16u8 {
            if let Err(e) = conn.send(&[CONTROL_CHANGE | channel, ALL_NOTES_OFF, 0]) {
                log::warn!("failed to send all-notes-off on channel {channel}: {e}");
            }
        }
    }
}

impl MidiEngine for MidirMidiEngine {
    fn patch(&self, at_ms: i64, channel: u8, patch: u8) {
        self.schedule_midi(at_ms, vec![PROGRAM_CHANGE | (channel & 0x0F), patch]);
    }

    fn note(&self, start_ms: i64, end_ms: i64, channel: u8, note_number: u8, velocity: u8) {
        let channel = channel & 0x0F;
        self.schedule_midi(start_ms, vec![NOTE_ON | channel, note_number, velocity]);
        self.schedule_midi(end_ms, vec![NOTE_OFF | channel, note_number, 0]);
    }

    fn percussion(&self, at_ms: i64, track_number: TrackId) {
        let note = gm_percussion_note(track_number);
        self.note(at_ms, at_ms + 50, crate::channel_allocator::PERCUSSION_CHANNEL, note, 100);
    }

    fn pattern_marker(&self, at_ms: i64, pattern_name: &str) -> Barrier {
        let (tx, rx) = oneshot::channel();
        let now = self.current_offset_ms().round() as i64;
        if !self.is_playing() || at_ms <= now {
            log::trace!(
                "marker for `{pattern_name}` at {at_ms}ms released immediately (now={now}ms, playing={})",
                self.is_playing()
            );
            let _ = tx.send(());
        } else {
            let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
            self.pending.lock().unwrap().push(Pending {
                at_ms,
                seq,
                action: Action::Marker(tx),
            });
        }
        Barrier(rx)
    }

    fn current_offset_ms(&self) -> f64 {
        let base = self.paused_offset_ms.load(AtomicOrdering::Acquire) as f64;
        match *self.started_at.lock().unwrap() {
            Some(start) => base + start.elapsed().as_secs_f64() * 1000.0,
            None => base,
        }
    }

    fn is_playing(&self) -> bool {
        self.playing.load(AtomicOrdering::Acquire)
    }

    fn set_playing(&self, playing: bool) {
        self.playing.store(playing, AtomicOrdering::Release);
    }

    fn start_sequencer(&self) {
        let mut started_at = self.started_at.lock().unwrap();
        if started_at.is_none() {
            *started_at = Some(Instant::now());
            self.playing.store(true, AtomicOrdering::Release);
            log::info!("sequencer started");
        }
    }

    fn stop_sequencer(&self) {
        let mut started_at = self.started_at.lock().unwrap();
        if let Some(start) = started_at.take() {
            let elapsed_ms = start.elapsed().as_millis() as i64;
            self.paused_offset_ms
                .fetch_add(elapsed_ms, AtomicOrdering::AcqRel);
        }
        drop(started_at);
        self.playing.store(false, AtomicOrdering::Release);

        let due: Vec<Pending> = {
            let mut pending = self.pending.lock().unwrap();
            std::mem::take(&mut *pending).into_vec()
        };
        for p in due {
            if let Action::Marker(tx) = p.action {
                let _ = tx.send(());
            }
        }

        self.all_notes_off();
        log::info!("sequencer stopped");
    }
}

/// Test double for the scheduling core: records dispatched primitives in
/// memory and lets tests drive the clock and release pattern markers by
/// hand instead of waiting on real MIDI hardware or wall-clock sleeps.
#[cfg(test)]
pub mod test_support {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Dispatched {
        Patch { at_ms: i64, channel: u8, patch: u8 },
        Note { start_ms: i64, end_ms: i64, channel: u8, note_number: u8, velocity: u8 },
        Percussion { at_ms: i64, track: TrackId },
    }

    pub struct FakeMidiEngine {
        dispatched: Mutex<Vec<Dispatched>>,
        now_ms: AtomicI64,
        playing: AtomicBool,
        pending_markers: Mutex<Vec<(i64, u64, oneshot::Sender<()>)>>,
        seq: AtomicU64,
    }

    impl FakeMidiEngine {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                dispatched: Mutex::new(Vec::new()),
                now_ms: AtomicI64::new(0),
                playing: AtomicBool::new(false),
                pending_markers: Mutex::new(Vec::new()),
                seq: AtomicU64::new(0),
            })
        }

        /// Moves the fake clock to `ms` and releases any markers now due.
        pub fn advance_to(&self, ms: i64) {
            self.now_ms.store(ms, AtomicOrdering::Release);
            self.release_due();
        }

        pub fn dispatched(&self) -> Vec<Dispatched> {
            self.dispatched.lock().unwrap().clone()
        }

        /// Releases every still-pending marker regardless of timestamp, as
        /// `stop_sequencer` does on the real engine.
        pub fn release_all_pending(&self) {
            let due: Vec<_> = std::mem::take(&mut *self.pending_markers.lock().unwrap());
            for (_, _, tx) in due {
                let _ = tx.send(());
            }
        }

        fn release_due(&self) {
            let now = self.now_ms.load(AtomicOrdering::Acquire);
            let mut pending = self.pending_markers.lock().unwrap();
            let (due, remaining): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|(at_ms, _, _)| *at_ms <= now);
            *pending = remaining;
            drop(pending);
            for (_, _, tx) in due {
                let _ = tx.send(());
            }
        }
    }

    impl MidiEngine for FakeMidiEngine {
        fn patch(&self, at_ms: i64, channel: u8, patch: u8) {
            self.dispatched.lock().unwrap().push(Dispatched::Patch { at_ms, channel, patch });
        }

        fn note(&self, start_ms: i64, end_ms: i64, channel: u8, note_number: u8, velocity: u8) {
            self.dispatched.lock().unwrap().push(Dispatched::Note {
                start_ms,
                end_ms,
                channel,
                note_number,
                velocity,
            });
        }

        fn percussion(&self, at_ms: i64, track_number: TrackId) {
            self.dispatched.lock().unwrap().push(Dispatched::Percussion { at_ms, track: track_number });
        }

        fn pattern_marker(&self, at_ms: i64, pattern_name: &str) -> Barrier {
            let (tx, rx) = oneshot::channel();
            let now = self.now_ms.load(AtomicOrdering::Acquire);
            if !self.is_playing() || at_ms <= now {
                let _ = tx.send(());
            } else {
                let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
                self.pending_markers.lock().unwrap().push((at_ms, seq, tx));
            }
            let _ = pattern_name;
            Barrier(rx)
        }

        fn current_offset_ms(&self) -> f64 {
            self.now_ms.load(AtomicOrdering::Acquire) as f64
        }

        fn is_playing(&self) -> bool {
            self.playing.load(AtomicOrdering::Acquire)
        }

        fn set_playing(&self, playing: bool) {
            self.playing.store(playing, AtomicOrdering::Release);
        }

        fn start_sequencer(&self) {
            self.playing.store(true, AtomicOrdering::Release);
        }

        fn stop_sequencer(&self) {
            self.playing.store(false, AtomicOrdering::Release);
            self.release_all_pending();
        }
    }

    #[test]
    fn percussion_note_wraps_within_gm_range() {
        let note = gm_percussion_note(0);
        assert!((GM_PERCUSSION_BASE..GM_PERCUSSION_BASE + GM_PERCUSSION_SPAN).contains(&note));
        let wrapped = gm_percussion_note(GM_PERCUSSION_SPAN as u32);
        assert_eq!(wrapped, GM_PERCUSSION_BASE);
    }

    #[tokio::test]
    async fn fake_engine_releases_marker_once_clock_reaches_it() {
        let engine = FakeMidiEngine::new();
        engine.set_playing(true);
        let barrier = engine.pattern_marker(100, "verse");
        engine.advance_to(50);
        engine.advance_to(100);
        tokio::time::timeout(Duration::from_millis(50), barrier.wait())
            .await
            .expect("barrier should have released once the clock reached 100ms");
    }

    #[tokio::test]
    async fn fake_engine_releases_marker_immediately_when_stopped() {
        let engine = FakeMidiEngine::new();
        // never started playing
        let barrier = engine.pattern_marker(1_000, "verse");
        tokio::time::timeout(Duration::from_millis(50), barrier.wait())
            .await
            .expect("barrier should release immediately while stopped");
    }
}
