//! Tick <-> wall-clock conversion under piecewise-constant tempo.
//!
//! A [`TempoMap`] is built from a normalized list of [`TempoChange`] entries
//! and is immutable afterwards; it is rebuilt whenever the tempo or the
//! change list changes.

use thiserror::Error;

/// Smallest tempo accepted anywhere in the engine; avoids division by zero.
const MIN_BPM: f64 = 1e-3;

/// Floor for ticks-per-second values derived from a tempo.
const MIN_TICKS_PER_SECOND: f64 = 1e-6;

/// Errors raised while building a [`TempoMap`]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TempoError {
    /// No tempo data after normalization; callers must supply at least a
    /// default tempo at tick 0
    #[error("tempo map requires at least one tempo change entry")]
    EmptyTempoInput,
}

/// Result type for tempo operations
pub type TempoResult<T> = Result<T, TempoError>;

/// A tempo change occurring at a specific tick position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoChange {
    pub tick: u64,
    pub bpm: f64,
}

impl TempoChange {
    pub fn new(tick: u64, bpm: f64) -> Self {
        Self { tick, bpm }
    }
}

/// Deduplicate (last write wins), floor tempos, and sort ascending by tick.
pub fn sorted_unique_tempo_changes(changes: &[TempoChange]) -> Vec<TempoChange> {
    let mut dedup: std::collections::BTreeMap<u64, f64> = std::collections::BTreeMap::new();
    for change in changes {
        dedup.insert(change.tick, change.bpm.max(MIN_BPM));
    }
    dedup
        .into_iter()
        .map(|(tick, bpm)| TempoChange { tick, bpm })
        .collect()
}

/// First tempo in chronological order, or `default` when the list is empty.
pub fn first_tempo(changes: &[TempoChange], default: f64) -> f64 {
    sorted_unique_tempo_changes(changes)
        .first()
        .map(|c| c.bpm)
        .unwrap_or_else(|| default.max(MIN_BPM))
}

/// Slowest tempo in the list, or `default` when the list is empty.
pub fn slowest_tempo(changes: &[TempoChange], default: f64) -> f64 {
    changes
        .iter()
        .map(|c| c.bpm.max(MIN_BPM))
        .fold(None, |acc: Option<f64>, bpm| {
            Some(acc.map_or(bpm, |m| m.min(bpm)))
        })
        .unwrap_or_else(|| default.max(MIN_BPM))
}

/// Scale all tempos so the first equals `target_first` while preserving the
/// ratios between changes, anchoring the result at tick 0.
///
/// Consecutive entries whose scaled tempos differ by no more than 1e-6 are
/// collapsed into one. An empty input yields a single change at tick 0.
pub fn normalized_tempo_changes(target_first: f64, changes: &[TempoChange]) -> Vec<TempoChange> {
    let desired_first = target_first.max(MIN_BPM);
    let sorted = sorted_unique_tempo_changes(changes);

    if sorted.is_empty() {
        return vec![TempoChange::new(0, desired_first)];
    }

    let base_first = sorted[0].bpm.max(MIN_BPM);
    let scale = desired_first / base_first;

    let mut normalized: Vec<TempoChange> = Vec::with_capacity(sorted.len() + 1);
    for change in &sorted {
        normalized.push(TempoChange::new(change.tick, (change.bpm * scale).max(MIN_BPM)));
    }
    if normalized[0].tick > 0 {
        normalized.insert(0, TempoChange::new(0, desired_first));
    }

    let mut deduped: Vec<TempoChange> = Vec::with_capacity(normalized.len());
    for change in normalized {
        if let Some(last) = deduped.last() {
            if (last.bpm - change.bpm).abs() <= 1e-6 {
                continue;
            }
        }
        deduped.push(change);
    }
    deduped
}

/// Scale tempos so the slowest equals `target_slowest`, preserving ratios
/// and original tick positions.
pub fn scaled_tempo_changes(changes: &[TempoChange], target_slowest: f64) -> Vec<TempoChange> {
    let sorted = sorted_unique_tempo_changes(changes);
    if sorted.is_empty() {
        return Vec::new();
    }

    let base_first = sorted[0].bpm.max(MIN_BPM);
    let scale = target_slowest.max(MIN_BPM) / base_first;

    let mut scaled: Vec<TempoChange> = Vec::with_capacity(sorted.len());
    for change in &sorted {
        let bpm = (change.bpm * scale).max(MIN_BPM);
        if let Some(last) = scaled.last() {
            if (last.bpm - bpm).abs() <= 1e-6 {
                continue;
            }
        }
        scaled.push(TempoChange::new(change.tick, bpm));
    }
    scaled
}

/// One constant-tempo span inside a [`TempoMap`]
#[derive(Debug, Clone, Copy)]
struct TempoSegment {
    start_tick: u64,
    bpm: f64,
    ticks_per_second: f64,
    seconds_at_start: f64,
}

/// Piecewise-constant mapping between tick positions and elapsed seconds.
///
/// Segments are monotonically increasing in both `start_tick` and
/// `seconds_at_start`; the map is immutable after construction.
#[derive(Debug, Clone)]
pub struct TempoMap {
    segments: Vec<TempoSegment>,
    ticks: Vec<u64>,
}

impl TempoMap {
    /// Build a map from `changes`, normalizing the input first.
    ///
    /// Fails with [`TempoError::EmptyTempoInput`] when the list is empty
    /// after normalization.
    pub fn build(pulses_per_quarter: u32, changes: &[TempoChange]) -> TempoResult<Self> {
        let ppq = pulses_per_quarter.max(1) as f64;
        let sorted = sorted_unique_tempo_changes(changes);
        let first = sorted.first().ok_or(TempoError::EmptyTempoInput)?;

        let first_bpm = first.bpm.max(MIN_BPM);
        let first_tps = ((first_bpm / 60.0) * ppq).max(MIN_TICKS_PER_SECOND);

        let mut segments = vec![TempoSegment {
            start_tick: first.tick,
            bpm: first_bpm,
            ticks_per_second: first_tps,
            seconds_at_start: 0.0,
        }];
        let mut ticks = vec![first.tick];

        let mut elapsed_seconds = 0.0;
        let mut last_tick = first.tick;
        let mut last_tps = first_tps;

        for change in &sorted[1..] {
            let bpm = change.bpm.max(MIN_BPM);
            let tps = ((bpm / 60.0) * ppq).max(MIN_TICKS_PER_SECOND);
            if change.tick == last_tick {
                // Same tick as the previous segment: last write wins.
                let last_segment = segments.last_mut().expect("segments never empty");
                last_segment.bpm = bpm;
                last_segment.ticks_per_second = tps;
                last_tps = tps;
                continue;
            }
            elapsed_seconds += (change.tick - last_tick) as f64 / last_tps;
            last_tick = change.tick;
            last_tps = tps;
            segments.push(TempoSegment {
                start_tick: change.tick,
                bpm,
                ticks_per_second: tps,
                seconds_at_start: elapsed_seconds,
            });
            ticks.push(change.tick);
        }

        Ok(Self { segments, ticks })
    }

    fn segment_for_tick(&self, tick: u64) -> &TempoSegment {
        let index = match self.ticks.binary_search(&tick) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        &self.segments[index]
    }

    /// Tempo in effect at `tick`
    pub fn tempo_at(&self, tick: u64) -> f64 {
        self.segment_for_tick(tick).bpm
    }

    /// Ticks-per-second rate in effect at `tick`
    pub fn ticks_per_second_at(&self, tick: u64) -> f64 {
        self.segment_for_tick(tick).ticks_per_second
    }

    /// Elapsed seconds at `tick` from the start of the map
    pub fn seconds_at(&self, tick: u64) -> f64 {
        let segment = self.segment_for_tick(tick);
        let offset = tick.saturating_sub(segment.start_tick);
        segment.seconds_at_start + offset as f64 / segment.ticks_per_second
    }

    /// Seconds between two tick positions; 0 when `end <= start`
    pub fn duration_between(&self, start_tick: u64, end_tick: u64) -> f64 {
        if end_tick <= start_tick {
            return 0.0;
        }
        self.seconds_at(end_tick) - self.seconds_at(start_tick)
    }

    /// Inverse lookup: the tick reached after `seconds` of playback.
    ///
    /// Before the first segment the result clamps to its start tick; past
    /// the last segment the final tempo is extrapolated linearly.
    pub fn seconds_to_tick(&self, seconds: f64) -> u64 {
        let target = seconds.max(0.0);
        let first = &self.segments[0];
        if target <= first.seconds_at_start {
            return first.start_tick;
        }

        for (index, segment) in self.segments.iter().enumerate() {
            if let Some(next) = self.segments.get(index + 1) {
                if target >= next.seconds_at_start {
                    continue;
                }
            } else {
                break;
            }
            let offset_seconds = target - segment.seconds_at_start;
            if offset_seconds <= 0.0 {
                return segment.start_tick;
            }
            let tick_offset = (offset_seconds * segment.ticks_per_second).round() as u64;
            return segment.start_tick + tick_offset;
        }

        // Past the last segment; extrapolate using the final tempo.
        let last = self.segments[self.segments.len() - 1];
        let offset_seconds = target - last.seconds_at_start;
        let tick_offset = (offset_seconds * last.ticks_per_second).round().max(0.0) as u64;
        last.start_tick + tick_offset
    }

    /// Sample index of `tick` at the given sample rate
    pub fn tick_to_sample(&self, tick: u64, sample_rate: u32) -> usize {
        let rate = sample_rate.max(1) as f64;
        (self.seconds_at(tick) * rate).round() as usize
    }
}
