//! PCM rendering: additive note synthesis and event mixing.
//!
//! `render_events` mixes a full event list into a mono 16-bit buffer under a
//! variable-tempo map, overlaying metronome clicks when enabled. Individual
//! note waveforms come from `note_segment`, which consults the shared
//! [`NoteSegmentCache`] before synthesizing.

use std::sync::Arc;

use crate::tempo::{normalized_tempo_changes, TempoChange, TempoMap};
use crate::types::Event;

use super::cache::{NoteSegmentCache, NoteSegmentKey};
use super::patches::patch_for_program;
use super::tone::midi_to_frequency;

/// Peak magnitudes at or below this are treated as full silence.
const SILENCE_PEAK: f32 = 1e-9;

/// Metronome click length in seconds
const CLICK_SECONDS: f64 = 0.08;

/// Accented (downbeat) click frequency in Hz
const ACCENT_FREQUENCY: f64 = 1760.0;

/// Weak-beat click frequency in Hz
const WEAK_FREQUENCY: f64 = 1320.0;

/// Metronome configuration for a render
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetronomeSettings {
    pub enabled: bool,
    pub beats_per_measure: u32,
    pub beat_unit: u32,
}

impl Default for MetronomeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            beats_per_measure: 4,
            beat_unit: 4,
        }
    }
}

/// Parameters for one `render_events` call
#[derive(Debug, Clone, Copy)]
pub struct RenderConfig {
    pub sample_rate: u32,
    /// Peak target as a fraction of full scale, in (0, 1]
    pub amplitude: f64,
    /// Mixing chunk size in samples between progress reports
    pub chunk_size: usize,
    pub metronome: MetronomeSettings,
}

/// Quantize a tempo for cache keying: `round(bpm * 1000)`.
///
/// Stabilizes floating-point tempos so near-identical values share a cache
/// entry.
pub fn tempo_cache_key(bpm: f64) -> u32 {
    (bpm.max(1e-3) * 1000.0).round() as u32
}

/// Loudness compensation for low pitches: `min(3.0, (f_A4 / f)^0.35)` below
/// A4, unity above.
fn pitch_normalization_gain(pitch: u8) -> f64 {
    let frequency = midi_to_frequency(pitch as i32);
    if frequency <= 0.0 {
        return 1.0;
    }
    let reference = midi_to_frequency(69);
    let ratio = reference / frequency;
    if ratio <= 1.0 {
        return 1.0;
    }
    ratio.powf(0.35).min(3.0)
}

/// Segment length in samples for a duration at a quantized tempo.
fn segment_length(
    duration_ticks: u64,
    tempo_key: u32,
    pulses_per_quarter: u32,
    sample_rate: u32,
) -> usize {
    let ticks = duration_ticks.max(1) as f64;
    let tempo = tempo_key.max(1) as f64 / 1000.0;
    let ticks_per_second = ((tempo / 60.0) * pulses_per_quarter.max(1) as f64).max(1e-6);
    let seconds = ticks / ticks_per_second;
    ((seconds * sample_rate as f64).round() as usize).max(1)
}

/// Synthesize (or fetch from cache) one note's waveform.
///
/// Notes with a non-positive frequency produce a silent buffer of the
/// correct length so downstream offsets stay consistent.
pub fn note_segment(
    cache: &NoteSegmentCache,
    program: u8,
    pitch: u8,
    duration_ticks: u64,
    tempo_key: u32,
    pulses_per_quarter: u32,
    sample_rate: u32,
) -> Arc<[f32]> {
    let key = NoteSegmentKey {
        program,
        pitch,
        duration_ticks,
        tempo_key,
        pulses_per_quarter,
        sample_rate,
    };
    if let Some(segment) = cache.get(&key) {
        return segment;
    }

    let length = segment_length(duration_ticks, tempo_key, pulses_per_quarter, sample_rate);
    let frequency = midi_to_frequency(pitch as i32);

    let segment: Arc<[f32]> = if frequency <= 0.0 {
        Arc::from(vec![0.0f32; length])
    } else {
        let patch = patch_for_program(program);
        let base_step = 2.0 * std::f64::consts::PI * frequency / sample_rate as f64;
        let vibrato_step = if patch.vibrato_hz > 0.0 {
            2.0 * std::f64::consts::PI * patch.vibrato_hz / sample_rate as f64
        } else {
            0.0
        };
        let pitch_gain = pitch_normalization_gain(pitch);

        let attack = ((length as f64 * patch.attack_ratio) as usize).clamp(1, length);
        let release = ((length as f64 * patch.release_ratio) as usize).clamp(1, length);
        let attack_scale = 1.0 / attack as f64;
        let release_scale = 1.0 / release as f64;
        let release_start = length.saturating_sub(release);

        let mut samples = vec![0.0f32; length];
        let mut base_phase = 0.0f64;
        let mut vibrato_phase = 0.0f64;

        for (index, sample) in samples.iter_mut().enumerate() {
            let envelope = if index < attack {
                index as f64 * attack_scale
            } else if index >= release_start {
                (length - index) as f64 * release_scale
            } else {
                1.0
            };

            let mut vibrato_scale = 1.0;
            if patch.vibrato_depth > 0.0 && vibrato_step > 0.0 {
                vibrato_scale += patch.vibrato_depth * vibrato_phase.sin();
                vibrato_phase += vibrato_step;
            }

            let mut value = 0.0f64;
            for &(multiple, amplitude) in patch.harmonics {
                value += (base_phase * multiple).sin() * amplitude;
            }

            *sample = (value * envelope * patch.gain * pitch_gain) as f32;
            base_phase += base_step * vibrato_scale.max(0.0);
        }
        Arc::from(samples)
    };

    cache.insert(key, Arc::clone(&segment));
    segment
}

/// Tracks completed work units and forwards monotonically non-decreasing
/// fractions to an optional callback, ending exactly at 1.0.
struct ProgressReporter<'a> {
    callback: Option<&'a dyn Fn(f32)>,
    total_work: usize,
    completed: usize,
}

impl<'a> ProgressReporter<'a> {
    fn new(callback: Option<&'a dyn Fn(f32)>, total_work: usize) -> Self {
        Self {
            callback,
            total_work,
            completed: 0,
        }
    }

    fn active(&self) -> bool {
        self.callback.is_some() && self.total_work > 0
    }

    fn start(&self) {
        if let Some(callback) = self.callback {
            if self.total_work > 0 {
                callback(0.0);
            }
        }
    }

    fn report(&mut self, units: usize) {
        let Some(callback) = self.callback else {
            return;
        };
        if self.total_work == 0 || units == 0 {
            return;
        }
        self.completed = (self.completed + units).min(self.total_work);
        callback((self.completed as f32 / self.total_work as f32).min(1.0));
    }

    fn finish(&mut self) {
        if self.active() && self.completed < self.total_work {
            let remaining = self.total_work - self.completed;
            self.report(remaining);
        } else if let Some(callback) = self.callback {
            if self.total_work == 0 {
                callback(1.0);
            }
        }
    }
}

/// Effective local tempo for an event: the tempo that makes the event's
/// tick duration occupy the seconds the map assigns to it. Picks the right
/// cached segment in variable-tempo contexts.
fn effective_tempo_key(event: &Event, tempo_map: &TempoMap, pulses_per_quarter: u32) -> u32 {
    let seconds = tempo_map.duration_between(event.onset_tick, event.end_tick());
    if seconds > 0.0 {
        let ticks_per_second = event.duration_ticks.max(1) as f64 / seconds;
        let bpm = ticks_per_second * 60.0 / pulses_per_quarter.max(1) as f64;
        tempo_cache_key(bpm)
    } else {
        tempo_cache_key(tempo_map.tempo_at(event.onset_tick))
    }
}

/// Mix `events` into a mono 16-bit little-endian PCM buffer.
///
/// Builds a [`TempoMap`] from `tempo_changes` rescaled so the first tempo
/// equals `tempo_bpm`, mixes each event's cached segment at its tick offset,
/// overlays metronome clicks when enabled, then peak-normalizes to
/// `config.amplitude`. A mix whose peak is effectively zero encodes as an
/// empty buffer, not zero-filled samples.
pub fn render_events(
    events: &[Event],
    tempo_bpm: f64,
    pulses_per_quarter: u32,
    config: &RenderConfig,
    cache: &NoteSegmentCache,
    tempo_changes: &[TempoChange],
    progress_callback: Option<&dyn Fn(f32)>,
) -> (Vec<u8>, TempoMap) {
    let sample_rate = config.sample_rate;
    let normalized = normalized_tempo_changes(tempo_bpm, tempo_changes);
    let tempo_map = TempoMap::build(pulses_per_quarter, &normalized)
        .expect("normalized tempo changes are never empty");

    if events.is_empty() {
        if let Some(callback) = progress_callback {
            callback(1.0);
        }
        return (Vec::new(), tempo_map);
    }

    let max_tick = events.iter().map(Event::end_tick).max().unwrap_or(0);
    let total_seconds = tempo_map.seconds_at(max_tick);
    let sample_count = ((total_seconds * sample_rate as f64).ceil() as usize
        + (sample_rate as f64 * 0.5) as usize)
        .max(1);
    let mut mix = vec![0.0f32; sample_count];
    let chunk_size = config.chunk_size.max(1);

    let total_work = if progress_callback.is_some() {
        let mut work = 0usize;
        for event in events {
            if midi_to_frequency(event.pitch as i32) <= 0.0 {
                continue;
            }
            let start_index = tempo_map.tick_to_sample(event.onset_tick, sample_rate);
            if start_index >= sample_count {
                continue;
            }
            let tempo_key = effective_tempo_key(event, &tempo_map, pulses_per_quarter);
            let estimated = segment_length(
                event.duration_ticks,
                tempo_key,
                pulses_per_quarter,
                sample_rate,
            );
            work += estimated.min(sample_count - start_index);
        }
        if config.metronome.enabled {
            work += estimate_metronome_samples(
                &tempo_map,
                sample_count,
                &config.metronome,
                pulses_per_quarter,
                sample_rate,
            );
        }
        work
    } else {
        0
    };

    let mut progress = ProgressReporter::new(progress_callback, total_work);
    progress.start();

    for event in events {
        if midi_to_frequency(event.pitch as i32) <= 0.0 {
            continue;
        }
        let start_index = tempo_map.tick_to_sample(event.onset_tick, sample_rate);
        if start_index >= sample_count {
            continue;
        }
        let tempo_key = effective_tempo_key(event, &tempo_map, pulses_per_quarter);
        let segment = note_segment(
            cache,
            event.program,
            event.pitch,
            event.duration_ticks,
            tempo_key,
            pulses_per_quarter,
            sample_rate,
        );
        if segment.is_empty() {
            continue;
        }
        let limit = segment.len().min(sample_count - start_index);
        let mut processed = 0;
        while processed < limit {
            let step = if progress.active() {
                (limit - processed).min(chunk_size)
            } else {
                limit - processed
            };
            let dest = &mut mix[start_index + processed..start_index + processed + step];
            let src = &segment[processed..processed + step];
            for (out, add) in dest.iter_mut().zip(src) {
                *out += add;
            }
            processed += step;
            progress.report(step);
        }
    }

    if config.metronome.enabled {
        overlay_metronome(
            &mut mix,
            &tempo_map,
            &config.metronome,
            pulses_per_quarter,
            sample_rate,
            &mut progress,
        );
    }

    progress.finish();

    let peak = mix.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
    if peak <= SILENCE_PEAK {
        return (Vec::new(), tempo_map);
    }

    let scale = (config.amplitude * 32767.0) as f32 / peak;
    let mut pcm = Vec::with_capacity(mix.len() * 2);
    for value in &mix {
        let scaled = (value * scale).clamp(-32767.0, 32767.0) as i16;
        pcm.extend_from_slice(&scaled.to_le_bytes());
    }
    (pcm, tempo_map)
}

/// Overlay percussive clicks on every beat, accenting beat 1 of each
/// measure. Click spacing is `ppq * 4 / beat_unit` ticks.
fn overlay_metronome(
    mix: &mut [f32],
    tempo_map: &TempoMap,
    settings: &MetronomeSettings,
    pulses_per_quarter: u32,
    sample_rate: u32,
    progress: &mut ProgressReporter<'_>,
) {
    let beat_length_ticks =
        ((pulses_per_quarter as f64 * 4.0) / settings.beat_unit.max(1) as f64).round() as u64;
    if beat_length_ticks == 0 {
        return;
    }
    let sample_count = mix.len();
    let click_samples = ((sample_rate as f64 * CLICK_SECONDS) as usize).max(1);
    let beats_per_measure = settings.beats_per_measure.max(1) as u64;
    let decay = ((click_samples as f64) * 0.8).max(1.0);

    let mut tick = 0u64;
    let mut beat_index = 0u64;
    loop {
        let start_sample = tempo_map.tick_to_sample(tick, sample_rate);
        if start_sample >= sample_count {
            break;
        }
        let end_sample = (start_sample + click_samples).min(sample_count);
        if end_sample <= start_sample {
            break;
        }

        let is_accent = beat_index % beats_per_measure == 0;
        let frequency = if is_accent { ACCENT_FREQUENCY } else { WEAK_FREQUENCY };
        let amplitude = if is_accent { 1.0 } else { 0.6 };
        let phase_step = 2.0 * std::f64::consts::PI * frequency / sample_rate as f64;

        let mut phase = 0.0f64;
        for (step, value) in mix[start_sample..end_sample].iter_mut().enumerate() {
            let envelope = if (step as f64) < decay {
                1.0 - step as f64 / decay
            } else {
                0.0
            };
            *value += (phase.sin() * amplitude * envelope) as f32;
            phase += phase_step;
        }
        progress.report(end_sample - start_sample);

        beat_index += 1;
        tick += beat_length_ticks;
    }
}

/// Pre-estimate how many samples the metronome overlay will touch, for
/// progress accounting.
fn estimate_metronome_samples(
    tempo_map: &TempoMap,
    sample_count: usize,
    settings: &MetronomeSettings,
    pulses_per_quarter: u32,
    sample_rate: u32,
) -> usize {
    let beat_length_ticks =
        ((pulses_per_quarter as f64 * 4.0) / settings.beat_unit.max(1) as f64).round() as u64;
    if beat_length_ticks == 0 {
        return 0;
    }
    let click_samples = ((sample_rate as f64 * CLICK_SECONDS) as usize).max(1);

    let mut tick = 0u64;
    let mut total = 0usize;
    loop {
        let start_sample = tempo_map.tick_to_sample(tick, sample_rate);
        if start_sample >= sample_count {
            break;
        }
        let end_sample = (start_sample + click_samples).min(sample_count);
        if end_sample <= start_sample {
            break;
        }
        total += end_sample - start_sample;
        tick += beat_length_ticks;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    const SAMPLE_RATE: u32 = 22050;

    fn config(metronome: MetronomeSettings) -> RenderConfig {
        RenderConfig {
            sample_rate: SAMPLE_RATE,
            amplitude: 0.45,
            chunk_size: 4096,
            metronome,
        }
    }

    #[test]
    fn test_cache_determinism_and_hit_counter() {
        let cache = NoteSegmentCache::new();
        let first = note_segment(&cache, 0, 69, 480, 120_000, 480, SAMPLE_RATE);
        let second = note_segment(&cache, 0, 69, 480, 120_000, 480, SAMPLE_RATE);
        assert_eq!(first.as_ref(), second.as_ref());
        let info = cache.info();
        assert_eq!(info.hits, 1);
        assert_eq!(info.misses, 1);
    }

    #[test]
    fn test_note_segment_length_matches_tempo() {
        let cache = NoteSegmentCache::new();
        // 480 ticks at 120bpm / ppq 480 is half a second.
        let segment = note_segment(&cache, 0, 69, 480, 120_000, 480, SAMPLE_RATE);
        assert_eq!(segment.len(), (SAMPLE_RATE / 2) as usize);
    }

    #[test]
    fn test_render_end_to_end() {
        let cache = NoteSegmentCache::new();
        let events = [Event::new(0, 480, 69, 79), Event::new(480, 480, 71, 79)];
        let (pcm, map) = render_events(
            &events,
            120.0,
            480,
            &config(MetronomeSettings::default()),
            &cache,
            &[],
            None,
        );
        assert!(!pcm.is_empty());
        assert_eq!(pcm.len() % 2, 0);
        assert!((map.seconds_at(960) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_silent_mix_encodes_as_empty_buffer() {
        let cache = NoteSegmentCache::new();
        // Pitch 255 is outside the MIDI range, so its frequency is 0, the
        // mix stays all-zero, and the encoder must return no bytes at all.
        let events = [Event::new(0, 480, 255, 0)];
        let (pcm, _map) = render_events(
            &events,
            120.0,
            480,
            &config(MetronomeSettings::default()),
            &cache,
            &[],
            None,
        );
        assert!(pcm.is_empty());
    }

    #[test]
    fn test_empty_events_report_full_progress() {
        let cache = NoteSegmentCache::new();
        let seen = RefCell::new(Vec::new());
        let callback = |p: f32| seen.borrow_mut().push(p);
        let (pcm, _map) = render_events(
            &[],
            120.0,
            480,
            &config(MetronomeSettings::default()),
            &cache,
            &[],
            Some(&callback),
        );
        assert!(pcm.is_empty());
        assert_eq!(*seen.borrow(), vec![1.0]);
    }

    #[test]
    fn test_progress_monotonic_and_finishes_at_one() {
        let cache = NoteSegmentCache::new();
        let events = [Event::new(0, 960, 60, 0), Event::new(960, 960, 64, 0)];
        let seen = RefCell::new(Vec::new());
        let callback = |p: f32| seen.borrow_mut().push(p);
        let metronome = MetronomeSettings {
            enabled: true,
            beats_per_measure: 4,
            beat_unit: 4,
        };
        render_events(&events, 120.0, 480, &config(metronome), &cache, &[], Some(&callback));
        let seen = seen.borrow();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 1.0);
    }

    #[test]
    fn test_variable_tempo_event_offsets() {
        let cache = NoteSegmentCache::new();
        let changes = [TempoChange::new(0, 120.0), TempoChange::new(480, 60.0)];
        let events = [Event::new(480, 480, 69, 0)];
        let (pcm, map) = render_events(
            &events,
            120.0,
            480,
            &config(MetronomeSettings::default()),
            &cache,
            &changes,
            None,
        );
        // Second note starts at 0.5s and lasts a full second at 60bpm.
        assert!((map.seconds_at(960) - 1.5).abs() < 1e-9);
        let expected_min = ((1.5 * SAMPLE_RATE as f64) as usize) * 2;
        assert!(pcm.len() >= expected_min);
    }

    #[test]
    fn test_metronome_adds_clicks_to_quiet_mix() {
        let cache = NoteSegmentCache::new();
        let events = [Event::new(0, 960, 60, 0)];
        let quiet = config(MetronomeSettings::default());
        let clicked = config(MetronomeSettings {
            enabled: true,
            beats_per_measure: 4,
            beat_unit: 4,
        });
        let (plain, _) = render_events(&events, 120.0, 480, &quiet, &cache, &[], None);
        let (with_clicks, _) = render_events(&events, 120.0, 480, &clicked, &cache, &[], None);
        assert_eq!(plain.len(), with_clicks.len());
        assert_ne!(plain, with_clicks);
    }
}
