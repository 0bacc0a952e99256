//! Core data types shared across the preview audio engine.

/// A single note event in symbolic time.
///
/// Events are immutable once produced by the score-import pipeline; a
/// sequence of events plus a pulses-per-quarter value fully describes a
/// track for preview purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event {
    /// Onset position in ticks
    pub onset_tick: u64,
    /// Duration in ticks
    pub duration_ticks: u64,
    /// MIDI pitch (0-127)
    pub pitch: u8,
    /// General-MIDI-like program number (0-127)
    pub program: u8,
}

impl Event {
    pub fn new(onset_tick: u64, duration_ticks: u64, pitch: u8, program: u8) -> Self {
        Self {
            onset_tick,
            duration_ticks,
            pitch,
            program,
        }
    }

    /// End position in ticks (onset + duration)
    pub fn end_tick(&self) -> u64 {
        self.onset_tick + self.duration_ticks
    }
}

/// A loop selection measured in ticks.
///
/// A disabled loop means the playback range is the whole track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopRegion {
    /// Whether the loop is active
    pub enabled: bool,
    /// Loop start position in ticks
    pub start_tick: u64,
    /// Loop end position in ticks (>= start_tick)
    pub end_tick: u64,
}

impl LoopRegion {
    /// Disabled loop spanning the whole track
    pub fn full_track(duration_tick: u64) -> Self {
        Self {
            enabled: false,
            start_tick: 0,
            end_tick: duration_tick,
        }
    }
}
