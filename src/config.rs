use crate::channel_allocator::PERCUSSION_CHANNEL;

/// Lead time, in milliseconds, that the scheduler keeps between "now" and
/// the earliest event it will emit while the sequencer is playing. Also the
/// window before a pattern's play time at which its marker barrier fires.
pub const DEFAULT_SCHEDULE_BUFFER_TIME_MS: i64 = 400;

/// Hard cap on pattern nesting depth during JIT expansion. A pattern that
/// references itself, directly or through a longer chain, is refused past
/// this depth rather than recursed into forever.
pub const MAX_PATTERN_NESTING_DEPTH: usize = 64;

/// Tunable knobs for the scheduling core, pulled into their own value (rather
/// than inline constants) so tests can shrink the buffer instead of waiting
/// on real wall-clock time.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// See [`DEFAULT_SCHEDULE_BUFFER_TIME_MS`].
    pub schedule_buffer_time_ms: i64,
    /// The melodic channel pool a fresh [`crate::channel_allocator::ChannelAllocator`] is seeded with.
    pub melodic_channels: Vec<u8>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule_buffer_time_ms: DEFAULT_SCHEDULE_BUFFER_TIME_MS,
            melodic_channels: (0..=15).filter(|&c| c != PERCUSSION_CHANNEL).collect(),
        }
    }
}
