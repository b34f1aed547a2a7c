use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::types::TrackId;

/// MIDI channel reserved for percussion tracks, per the General MIDI convention.
pub const PERCUSSION_CHANNEL: u8 = 9;

/// Hands out MIDI channels to tracks, idempotently, from a shared pool.
///
/// Once a track has a channel it keeps it for the lifetime of the process;
/// `acquire` on an already-assigned track is a cheap read, not a fresh draw.
/// Exhaustion of the pool is not an error here -- callers decide whether a
/// missing channel means "drop the event" (see `track::schedule_events`).
pub struct ChannelAllocator {
    available: Mutex<VecDeque<u8>>,
    assigned: Mutex<HashMap<TrackId, u8>>,
}

impl ChannelAllocator {
    pub fn new(pool: impl IntoIterator<Item = u8>) -> Self {
        let mut channels: Vec<u8> = pool.into_iter().collect();
        channels.sort_unstable();
        channels.dedup();
        Self {
            available: Mutex::new(channels.into_iter().collect()),
            assigned: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the channel assigned to `track`, drawing a fresh one from the
    /// pool on first use. `None` means the pool is exhausted.
    pub fn acquire(&self, track: TrackId) -> Option<u8> {
        let mut assigned = self.assigned.lock().unwrap();
        if let Some(&channel) = assigned.get(&track) {
            return Some(channel);
        }
        let channel = self.available.lock().unwrap().pop_front()?;
        assigned.insert(track, channel);
        Some(channel)
    }

    /// Pins `track` to the percussion channel, bypassing the melodic pool.
    /// A percussion track never competes with melodic tracks for a channel,
    /// and never gives one back.
    pub fn force_percussion(&self, track: TrackId) {
        self.assigned.lock().unwrap().insert(track, PERCUSSION_CHANNEL);
    }
}
