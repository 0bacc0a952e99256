//! The playback state machine exposed to the UI layer.
//!
//! All public commands run on the UI/control thread and return immediately;
//! render completion arrives through the render-listener callbacks, which
//! update the shared state and notify the registered observer.

use std::sync::{Arc, Mutex, Weak};

use xxhash_rust::xxh3::xxh3_64;

use crate::playback::{build_audio_renderer, AudioRenderer, PlaybackError, RenderListener};
use crate::tempo::TempoChange;
use crate::types::{Event, LoopRegion};

use super::tracker::RenderTracker;

/// Callback invoked whenever render status changes
pub type RenderObserver = Arc<dyn Fn() + Send + Sync>;

/// Observable playback state.
///
/// Owned exclusively by [`PlaybackController`]; mutated only through its
/// command methods and render-listener callbacks. The UI reads snapshots
/// via [`PlaybackController::state`].
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    pub is_loaded: bool,
    pub is_playing: bool,
    pub position_tick: u64,
    /// Last event end in ticks
    pub duration_tick: u64,
    /// Duration rounded up to the next whole measure boundary
    pub track_end_tick: u64,
    pub pulses_per_quarter: u32,
    pub tempo_bpm: f64,
    pub beats_per_measure: u32,
    pub beat_unit: u32,
    pub metronome_enabled: bool,
    pub loop_region: LoopRegion,
    /// Output volume in [0, 1]
    pub volume: f64,
    pub last_error: Option<PlaybackError>,
    pub is_rendering: bool,
    pub render_progress: f32,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            is_loaded: false,
            is_playing: false,
            position_tick: 0,
            duration_tick: 0,
            track_end_tick: 0,
            pulses_per_quarter: 480,
            tempo_bpm: 120.0,
            beats_per_measure: 4,
            beat_unit: 4,
            metronome_enabled: false,
            loop_region: LoopRegion::default(),
            volume: 1.0,
            last_error: None,
            is_rendering: false,
            render_progress: 1.0,
        }
    }
}

/// Backend call decided under the state lock, executed after release
enum AudioAction {
    None,
    Seek(u64),
    Stop,
}

struct ControllerState {
    state: PlaybackState,
    tracker: RenderTracker,
    events: Arc<[Event]>,
    prepared_signature: Option<u64>,
    /// Playback was requested while a render is in flight; `advance` stays
    /// inert until the fresh buffer starts playing
    pending_resume: bool,
    /// Fractional wall-clock remainder carried across `advance` calls
    pending_seconds: f64,
}

impl ControllerState {
    fn new() -> Self {
        Self {
            state: PlaybackState::default(),
            tracker: RenderTracker::new(),
            events: Arc::from(Vec::new()),
            prepared_signature: None,
            pending_resume: false,
            pending_seconds: 0.0,
        }
    }
}

struct ControllerShared {
    state: Mutex<ControllerState>,
    observer: Mutex<Option<RenderObserver>>,
}

impl ControllerShared {
    fn notify_observer(&self) {
        let observer = self.observer.lock().unwrap().clone();
        if let Some(observer) = observer {
            observer();
        }
    }
}

/// Bridges worker callbacks into the controller's shared state.
struct ControllerListener {
    shared: Weak<ControllerShared>,
}

impl RenderListener for ControllerListener {
    fn render_started(&self, generation: u64) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let notify = {
            let mut guard = shared.state.lock().unwrap();
            let inner = &mut *guard;
            let events = inner.events.len();
            inner.tracker.on_render_started(&mut inner.state, generation, events)
        };
        if notify {
            shared.notify_observer();
        }
    }

    fn render_progress(&self, generation: u64, progress: f32) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let notify = {
            let mut guard = shared.state.lock().unwrap();
            let inner = &mut *guard;
            inner.tracker.on_render_progress(&mut inner.state, generation, progress)
        };
        if notify {
            shared.notify_observer();
        }
    }

    fn render_complete(&self, generation: u64, success: bool) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        {
            let mut guard = shared.state.lock().unwrap();
            let inner = &mut *guard;
            let events = inner.events.len();
            if !inner
                .tracker
                .on_render_complete(&mut inner.state, generation, success, events)
            {
                return;
            }
            if success {
                // The backend has already begun playing the fresh buffer.
                if inner.pending_resume && inner.state.is_playing {
                    inner.pending_resume = false;
                }
            } else {
                // A failed render cannot resume playback; surface the error
                // instead of leaving the pending flag stuck.
                inner.pending_resume = false;
                inner.state.is_playing = false;
                inner.state.last_error = Some(PlaybackError::RenderFailure);
            }
        }
        shared.notify_observer();
    }
}

/// State machine tying position tracking, looping, and render-readiness
/// together. One instance per preview pane.
pub struct PlaybackController {
    audio: Box<dyn AudioRenderer>,
    shared: Arc<ControllerShared>,
}

impl PlaybackController {
    pub fn new(audio: Box<dyn AudioRenderer>) -> Self {
        let shared = Arc::new(ControllerShared {
            state: Mutex::new(ControllerState::new()),
            observer: Mutex::new(None),
        });
        audio.set_render_listener(Some(Arc::new(ControllerListener {
            shared: Arc::downgrade(&shared),
        })));
        Self { audio, shared }
    }

    /// Construct with the best backend available on this system.
    pub fn with_default_backend() -> Self {
        Self::new(build_audio_renderer())
    }

    /// Register (or clear) the callback notified on render status changes.
    pub fn set_render_observer(&mut self, observer: Option<RenderObserver>) {
        *self.shared.observer.lock().unwrap() = observer;
    }

    /// Snapshot of the observable playback state
    pub fn state(&self) -> PlaybackState {
        self.shared.state.lock().unwrap().state.clone()
    }

    /// Load a track for preview.
    ///
    /// A content signature over events + ppq + tempo changes decides whether
    /// the audio buffer must be re-rendered; reloading identical content
    /// only re-applies metronome and time-signature settings.
    pub fn load(
        &mut self,
        events: &[Event],
        pulses_per_quarter: u32,
        tempo_bpm: Option<f64>,
        tempo_changes: &[TempoChange],
        beats_per_measure: u32,
        beat_unit: u32,
    ) {
        let ppq = pulses_per_quarter.max(1);
        let signature = compute_signature(events, ppq, tempo_changes);
        let (was_loaded, was_playing, events_changed) = {
            let guard = self.shared.state.lock().unwrap();
            (
                guard.state.is_loaded,
                guard.state.is_playing,
                guard.prepared_signature != Some(signature),
            )
        };
        log::debug!(
            "load requested: events={} ppq={} was_loaded={} was_playing={} changed={}",
            events.len(),
            ppq,
            was_loaded,
            was_playing,
            events_changed
        );

        if was_playing {
            self.stop();
        } else if was_loaded {
            if events_changed {
                self.audio.stop();
            } else {
                self.audio.seek(0);
            }
            let mut guard = self.shared.state.lock().unwrap();
            guard.pending_seconds = 0.0;
            guard.state.last_error = None;
        }

        let duration = events.iter().map(Event::end_tick).max().unwrap_or(0);
        let beats = beats_per_measure.max(1);
        let unit = beat_unit.max(1);
        let track_end = round_up_to_measure(duration, ppq, beats, unit);

        let (tempo, loop_region) = {
            let mut guard = self.shared.state.lock().unwrap();
            let inner = &mut *guard;
            inner.events = Arc::from(events.to_vec());
            inner.pending_seconds = 0.0;
            inner.pending_resume = false;

            let state = &mut inner.state;
            state.is_loaded = true;
            state.is_playing = false;
            state.position_tick = 0;
            state.duration_tick = duration;
            state.track_end_tick = track_end;
            state.pulses_per_quarter = ppq;
            state.beats_per_measure = beats;
            state.beat_unit = unit;
            state.loop_region = LoopRegion::full_track(duration);
            state.last_error = None;
            state.metronome_enabled = false;
            if let Some(tempo) = tempo_bpm {
                state.tempo_bpm = normalize_tempo(tempo);
            }
            (state.tempo_bpm, state.loop_region)
        };

        // Ensure the renderer discards any previously configured loop.
        self.audio.set_loop(loop_region);

        if events_changed {
            let notify = {
                let mut guard = self.shared.state.lock().unwrap();
                let inner = &mut *guard;
                inner.prepared_signature = Some(signature);
                let count = inner.events.len();
                inner.tracker.mark_pending(&mut inner.state, count)
            };
            if notify {
                self.shared.notify_observer();
            }
            self.audio.prepare(events, ppq, tempo_changes);
            log::debug!("load: scheduled async render for {} events", events.len());
        } else {
            let mut guard = self.shared.state.lock().unwrap();
            let inner = &mut *guard;
            inner.prepared_signature = Some(signature);
            inner.tracker.mark_idle(&mut inner.state, 1.0);
            log::debug!("load: reused existing render for {} events", events.len());
        }

        self.audio.set_tempo(tempo);
        self.shared.notify_observer();
        self.audio.set_metronome(false, beats, unit);

        if events.is_empty() {
            {
                let mut guard = self.shared.state.lock().unwrap();
                let inner = &mut *guard;
                inner.tracker.mark_idle(&mut inner.state, 1.0);
            }
            self.shared.notify_observer();
        }
        log::debug!(
            "load: events={} duration={} track_end={}",
            events.len(),
            duration,
            track_end
        );
    }

    /// Start or pause playback. Returns the resulting playing flag.
    pub fn toggle_playback(&mut self) -> bool {
        let (is_loaded, is_playing) = {
            let guard = self.shared.state.lock().unwrap();
            (guard.state.is_loaded, guard.state.is_playing)
        };
        if !is_loaded {
            log::debug!("toggle_playback ignored: nothing loaded");
            return false;
        }
        if is_playing {
            {
                let mut guard = self.shared.state.lock().unwrap();
                guard.state.is_playing = false;
                guard.pending_resume = false;
                log::debug!("toggle_playback: pausing at tick={}", guard.state.position_tick);
            }
            self.audio.pause();
            return false;
        }

        if !self.audio.supports_audio() {
            let mut guard = self.shared.state.lock().unwrap();
            guard.state.last_error = Some(PlaybackError::NoAudioBackendAvailable);
            log::debug!("toggle_playback failed: no audio backend available");
            return false;
        }

        let restart_tick = {
            let guard = self.shared.state.lock().unwrap();
            let end = active_loop_end(&guard.state);
            if guard.state.position_tick >= end {
                Some(if guard.state.loop_region.enabled {
                    guard.state.loop_region.start_tick
                } else {
                    0
                })
            } else {
                None
            }
        };
        if let Some(tick) = restart_tick {
            log::debug!("toggle_playback restarting at tick={} due to loop end", tick);
            self.seek_to(tick);
        }

        let (position, tempo) = {
            let guard = self.shared.state.lock().unwrap();
            (guard.state.position_tick, guard.state.tempo_bpm)
        };
        let started = self.audio.start(position, tempo);
        {
            let mut guard = self.shared.state.lock().unwrap();
            guard.state.is_playing = started;
            if started {
                guard.state.last_error = None;
                if guard.state.is_rendering {
                    guard.pending_resume = true;
                }
                log::debug!(
                    "toggle_playback: started at tick={} tempo={:.3}",
                    position,
                    tempo
                );
            } else {
                guard.state.last_error = Some(PlaybackError::PlaybackStartFailure);
                guard.pending_resume = false;
                log::debug!("toggle_playback: backend refused to start at tick={}", position);
            }
        }
        started
    }

    /// Advance the playback cursor by elapsed wall-clock time.
    ///
    /// Uses the published tempo map when available, falling back to a
    /// flat-tempo approximation. A fractional remainder is carried across
    /// calls so repeated small steps stay rounding-stable.
    pub fn advance(&mut self, elapsed_seconds: f64) {
        if elapsed_seconds <= 0.0 {
            return;
        }
        let tempo_map = self.audio.tempo_map();
        let action = {
            let mut guard = self.shared.state.lock().unwrap();
            let inner = &mut *guard;
            if !inner.state.is_loaded || !inner.state.is_playing || inner.pending_resume {
                return;
            }

            let position = inner.state.position_tick;
            let whole_ticks = match &tempo_map {
                Some(map) => {
                    let seconds_now =
                        map.seconds_at(position) + inner.pending_seconds + elapsed_seconds;
                    let target = map.seconds_to_tick(seconds_now);
                    let whole = target.saturating_sub(position);
                    inner.pending_seconds = seconds_now - map.seconds_at(position + whole);
                    whole
                }
                None => {
                    let ticks_per_second = (inner.state.tempo_bpm / 60.0)
                        * inner.state.pulses_per_quarter as f64;
                    let total = inner.pending_seconds + elapsed_seconds;
                    let whole = (total * ticks_per_second).floor();
                    inner.pending_seconds = total - whole / ticks_per_second.max(1e-9);
                    whole as u64
                }
            };
            if whole_ticks == 0 {
                return;
            }
            move_forward(inner, whole_ticks)
        };

        match action {
            AudioAction::Seek(tick) => self.audio.seek(tick),
            AudioAction::Stop => self.audio.stop(),
            AudioAction::None => {}
        }
    }

    /// Move the cursor, clamped into the track and the active loop.
    pub fn seek_to(&mut self, tick: u64) {
        let target = {
            let mut guard = self.shared.state.lock().unwrap();
            if !guard.state.is_loaded {
                log::debug!("seek_to ignored: nothing loaded");
                return;
            }
            let mut target = tick.min(guard.state.track_end_tick);
            if guard.state.loop_region.enabled {
                let (loop_start, loop_end) = normalized_loop(&guard.state);
                if loop_end > loop_start {
                    target = target.clamp(loop_start, loop_end);
                }
            }
            guard.state.position_tick = target;
            guard.pending_seconds = 0.0;
            target
        };
        self.audio.seek(target);
        log::debug!("seek_to: moved cursor to tick={}", target);
    }

    /// Change the preview tempo (clamped into 30-400 bpm). Requires a fresh
    /// render; playback resumes automatically once it completes.
    pub fn set_tempo(&mut self, tempo_bpm: f64) {
        let tempo = normalize_tempo(tempo_bpm);
        let notify = {
            let mut guard = self.shared.state.lock().unwrap();
            let inner = &mut *guard;
            if (tempo - inner.state.tempo_bpm).abs() <= 1e-6 {
                return;
            }
            inner.state.tempo_bpm = tempo;
            let count = inner.events.len();
            let notify = inner.tracker.mark_pending(&mut inner.state, count);
            if inner.state.is_playing {
                inner.pending_resume = true;
            }
            notify
        };
        self.audio.set_tempo(tempo);
        if notify {
            self.shared.notify_observer();
        }
    }

    /// Toggle the rendered metronome clicks.
    pub fn set_metronome(&mut self, enabled: bool) {
        let (beats, unit, notify) = {
            let mut guard = self.shared.state.lock().unwrap();
            let inner = &mut *guard;
            if !inner.state.is_loaded {
                inner.state.metronome_enabled = enabled;
                return;
            }
            if enabled == inner.state.metronome_enabled {
                return;
            }
            inner.state.metronome_enabled = enabled;
            let count = inner.events.len();
            let notify = inner.tracker.mark_pending(&mut inner.state, count);
            if inner.state.is_playing {
                inner.pending_resume = true;
            }
            (inner.state.beats_per_measure, inner.state.beat_unit, notify)
        };
        self.audio.set_metronome(enabled, beats, unit);
        if notify {
            self.shared.notify_observer();
        }
    }

    /// Set the loop region. Loop changes never trigger a re-render: loop
    /// windowing is cursor logic only, not baked into the PCM.
    pub fn set_loop(&mut self, loop_region: LoopRegion) {
        let (playback_loop, position) = {
            let mut guard = self.shared.state.lock().unwrap();
            if !guard.state.is_loaded {
                return;
            }
            let requested_start = loop_region.start_tick;
            let requested_end = loop_region.end_tick.max(requested_start);
            let requested = LoopRegion {
                enabled: loop_region.enabled && requested_end > requested_start,
                start_tick: requested_start,
                end_tick: requested_end,
            };

            let clamped_start = requested_start.min(guard.state.duration_tick);
            let clamped_end = requested_end.min(guard.state.duration_tick);
            let playback_loop = if clamped_end <= clamped_start {
                LoopRegion::full_track(guard.state.duration_tick)
            } else {
                LoopRegion {
                    enabled: requested.enabled,
                    start_tick: clamped_start,
                    end_tick: clamped_end,
                }
            };

            guard.state.loop_region = requested;
            (playback_loop, guard.state.position_tick)
        };
        self.audio.set_loop(playback_loop);
        self.seek_to(position);
        log::debug!(
            "set_loop: enabled={} start={} end={}",
            loop_region.enabled,
            loop_region.start_tick,
            loop_region.end_tick
        );
    }

    /// Set the output volume in [0, 1]. Volume is baked into the rendered
    /// PCM, so this schedules a fresh render like a tempo change does.
    pub fn set_volume(&mut self, volume: f64) {
        let clamped = volume.clamp(0.0, 1.0);
        let notify = {
            let mut guard = self.shared.state.lock().unwrap();
            let inner = &mut *guard;
            if (inner.state.volume - clamped).abs() <= 1e-6 {
                return;
            }
            inner.state.volume = clamped;
            let count = inner.events.len();
            let notify = inner.tracker.mark_pending(&mut inner.state, count);
            if inner.state.is_playing {
                inner.pending_resume = true;
            }
            notify
        };
        self.audio.set_volume(clamped);
        if notify {
            self.shared.notify_observer();
        }
    }

    /// Halt playback, keeping the cursor position.
    pub fn stop(&mut self) {
        {
            let mut guard = self.shared.state.lock().unwrap();
            if guard.state.is_loaded && guard.state.is_playing {
                log::debug!("stop: halting playback at tick={}", guard.state.position_tick);
                guard.state.is_playing = false;
            }
            if guard.state.is_loaded {
                guard.pending_seconds = 0.0;
                guard.state.last_error = None;
            }
            guard.pending_resume = false;
        }
        self.audio.stop();
    }

    /// Restore cursor position and playback options to their defaults.
    pub fn reset_adjustments(&mut self) {
        self.stop();
        let (beats, unit, loop_region) = {
            let mut guard = self.shared.state.lock().unwrap();
            guard.state.position_tick = 0;
            guard.pending_seconds = 0.0;
            guard.state.tempo_bpm = 120.0;
            guard.state.metronome_enabled = false;
            let loop_region = LoopRegion::full_track(guard.state.duration_tick);
            guard.state.loop_region = loop_region;
            (
                guard.state.beats_per_measure,
                guard.state.beat_unit,
                loop_region,
            )
        };
        self.audio.set_tempo(120.0);
        self.audio.set_metronome(false, beats, unit);
        self.audio.set_loop(loop_region);
    }

    /// Tear down the renderer and its background threads.
    pub fn shutdown(&mut self) {
        self.stop();
        self.audio.shutdown();
    }
}

fn normalize_tempo(tempo_bpm: f64) -> f64 {
    if tempo_bpm <= 0.0 {
        return 30.0;
    }
    tempo_bpm.clamp(30.0, 400.0)
}

/// Round `duration` up to the next whole measure boundary.
fn round_up_to_measure(duration: u64, pulses_per_quarter: u32, beats: u32, unit: u32) -> u64 {
    let beat_ticks = ((pulses_per_quarter as f64 * 4.0) / unit.max(1) as f64).round() as u64;
    let measure_ticks = beat_ticks * beats.max(1) as u64;
    if duration == 0 || measure_ticks == 0 {
        return duration;
    }
    duration.div_ceil(measure_ticks) * measure_ticks
}

/// Loop bounds clamped into the track; the full track when disabled.
fn normalized_loop(state: &PlaybackState) -> (u64, u64) {
    if !state.loop_region.enabled {
        return (0, state.duration_tick);
    }
    let start = state.loop_region.start_tick.min(state.duration_tick);
    let end = state.loop_region.end_tick.clamp(start, state.duration_tick);
    (start, end)
}

fn active_loop_end(state: &PlaybackState) -> u64 {
    if state.loop_region.enabled {
        normalized_loop(state).1
    } else {
        state.duration_tick
    }
}

/// Move the cursor forward, wrapping inside an active loop and stopping at
/// the end of the track otherwise. Large time jumps wrap in one step.
fn move_forward(inner: &mut ControllerState, ticks: u64) -> AudioAction {
    let state = &mut inner.state;
    let start = state.position_tick;
    let mut target = start + ticks;
    let (loop_start, loop_end) = normalized_loop(state);

    if state.loop_region.enabled && loop_end > loop_start {
        let mut wrapped = false;
        if target >= loop_end {
            let span = loop_end - loop_start;
            target = loop_start + (target - loop_end) % span;
            wrapped = true;
        }
        state.position_tick = target.min(loop_end);
        if wrapped || target < start {
            return AudioAction::Seek(state.position_tick);
        }
        return AudioAction::None;
    }

    if target >= state.duration_tick {
        state.position_tick = state.duration_tick;
        state.is_playing = false;
        return AudioAction::Stop;
    }

    state.position_tick = target;
    AudioAction::None
}

fn compute_signature(events: &[Event], pulses_per_quarter: u32, tempo_changes: &[TempoChange]) -> u64 {
    let mut bytes = Vec::with_capacity(12 + events.len() * 18 + tempo_changes.len() * 16);
    bytes.extend_from_slice(&pulses_per_quarter.to_le_bytes());
    bytes.extend_from_slice(&(events.len() as u32).to_le_bytes());
    for event in events {
        bytes.extend_from_slice(&event.onset_tick.to_le_bytes());
        bytes.extend_from_slice(&event.duration_ticks.to_le_bytes());
        bytes.push(event.pitch);
        bytes.push(event.program);
    }
    for change in tempo_changes {
        bytes.extend_from_slice(&change.tick.to_le_bytes());
        bytes.extend_from_slice(&change.bpm.to_bits().to_le_bytes());
    }
    xxh3_64(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::NullAudioRenderer;
    use crate::tempo::TempoMap;
    use std::sync::Mutex as StdMutex;

    struct FakeInner {
        calls: StdMutex<Vec<String>>,
        start_result: StdMutex<bool>,
        listener: StdMutex<Option<Arc<dyn RenderListener>>>,
        tempo_map: StdMutex<Option<Arc<TempoMap>>>,
    }

    #[derive(Clone)]
    struct FakeRenderer {
        inner: Arc<FakeInner>,
    }

    impl FakeRenderer {
        fn new() -> Self {
            Self {
                inner: Arc::new(FakeInner {
                    calls: StdMutex::new(Vec::new()),
                    start_result: StdMutex::new(true),
                    listener: StdMutex::new(None),
                    tempo_map: StdMutex::new(None),
                }),
            }
        }

        fn record(&self, call: impl Into<String>) {
            self.inner.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.inner.calls.lock().unwrap().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }

        fn listener(&self) -> Arc<dyn RenderListener> {
            self.inner.listener.lock().unwrap().clone().unwrap()
        }
    }

    impl AudioRenderer for FakeRenderer {
        fn prepare(&self, events: &[Event], ppq: u32, _tempo_changes: &[TempoChange]) {
            self.record(format!("prepare:{}:{}", events.len(), ppq));
        }

        fn start(&self, position_tick: u64, _tempo_bpm: f64) -> bool {
            self.record(format!("start:{}", position_tick));
            *self.inner.start_result.lock().unwrap()
        }

        fn pause(&self) {
            self.record("pause");
        }

        fn stop(&self) {
            self.record("stop");
        }

        fn seek(&self, tick: u64) {
            self.record(format!("seek:{}", tick));
        }

        fn set_tempo(&self, tempo_bpm: f64) {
            self.record(format!("set_tempo:{}", tempo_bpm));
        }

        fn set_loop(&self, loop_region: LoopRegion) {
            self.record(format!(
                "set_loop:{}:{}:{}",
                loop_region.enabled, loop_region.start_tick, loop_region.end_tick
            ));
        }

        fn set_metronome(&self, enabled: bool, _beats: u32, _unit: u32) {
            self.record(format!("set_metronome:{}", enabled));
        }

        fn set_volume(&self, volume: f64) {
            self.record(format!("set_volume:{}", volume));
        }

        fn set_render_listener(&self, listener: Option<Arc<dyn RenderListener>>) {
            *self.inner.listener.lock().unwrap() = listener;
        }

        fn tempo_map(&self) -> Option<Arc<TempoMap>> {
            self.inner.tempo_map.lock().unwrap().clone()
        }

        fn shutdown(&self) {
            self.record("shutdown");
        }
    }

    fn events() -> Vec<Event> {
        vec![Event::new(0, 480, 69, 79), Event::new(480, 480, 71, 79)]
    }

    fn loaded_controller() -> (PlaybackController, FakeRenderer) {
        let fake = FakeRenderer::new();
        let mut controller = PlaybackController::new(Box::new(fake.clone()));
        controller.load(&events(), 480, Some(120.0), &[], 4, 4);
        // Complete the initial render so later commands start from an idle
        // (non-rendering) state.
        let listener = fake.listener();
        listener.render_started(1);
        listener.render_complete(1, true);
        (controller, fake)
    }

    #[test]
    fn test_load_resets_state() {
        let (controller, _fake) = loaded_controller();
        let state = controller.state();
        assert!(state.is_loaded);
        assert!(!state.is_playing);
        assert_eq!(state.position_tick, 0);
        assert_eq!(state.duration_tick, 960);
        // 4/4 at ppq 480 is 1920 ticks per measure; 960 rounds up to 1920.
        assert_eq!(state.track_end_tick, 1920);
        assert!(!state.loop_region.enabled);
        assert_eq!(state.loop_region.end_tick, 960);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn test_load_unchanged_signature_skips_render() {
        let (mut controller, fake) = loaded_controller();
        assert_eq!(fake.count("prepare"), 1);
        controller.load(&events(), 480, Some(120.0), &[], 4, 4);
        assert_eq!(fake.count("prepare"), 1);
        assert!(!controller.state().is_rendering);
    }

    #[test]
    fn test_load_changed_events_rerenders() {
        let (mut controller, fake) = loaded_controller();
        let mut changed = events();
        changed.push(Event::new(960, 480, 72, 79));
        controller.load(&changed, 480, Some(120.0), &[], 4, 4);
        assert_eq!(fake.count("prepare"), 2);
    }

    #[test]
    fn test_tempo_changes_affect_signature() {
        let (mut controller, fake) = loaded_controller();
        controller.load(
            &events(),
            480,
            Some(120.0),
            &[TempoChange::new(480, 60.0)],
            4,
            4,
        );
        assert_eq!(fake.count("prepare"), 2);
    }

    #[test]
    fn test_toggle_without_backend_sets_error() {
        let mut controller = PlaybackController::new(Box::new(NullAudioRenderer));
        controller.load(&events(), 480, Some(120.0), &[], 4, 4);
        assert!(!controller.toggle_playback());
        assert_eq!(
            controller.state().last_error,
            Some(PlaybackError::NoAudioBackendAvailable)
        );
        assert!(!controller.state().is_playing);
    }

    #[test]
    fn test_toggle_starts_then_pauses() {
        let (mut controller, fake) = loaded_controller();
        assert!(controller.toggle_playback());
        assert!(controller.state().is_playing);
        assert!(!controller.toggle_playback());
        assert!(!controller.state().is_playing);
        assert_eq!(fake.count("pause"), 1);
    }

    #[test]
    fn test_toggle_start_failure_sets_error() {
        let (mut controller, fake) = loaded_controller();
        *fake.inner.start_result.lock().unwrap() = false;
        assert!(!controller.toggle_playback());
        assert_eq!(
            controller.state().last_error,
            Some(PlaybackError::PlaybackStartFailure)
        );
    }

    #[test]
    fn test_advance_moves_position_at_flat_tempo() {
        let (mut controller, _fake) = loaded_controller();
        assert!(controller.toggle_playback());
        // 120 bpm at ppq 480 is 960 ticks per second.
        controller.advance(0.5);
        assert_eq!(controller.state().position_tick, 480);
    }

    #[test]
    fn test_advance_accumulates_fractional_ticks() {
        let (mut controller, _fake) = loaded_controller();
        assert!(controller.toggle_playback());
        // Each step is 0.52 ticks; ten steps must land on 5, not 0.
        for _ in 0..10 {
            controller.advance(0.52 / 960.0);
        }
        assert_eq!(controller.state().position_tick, 5);
    }

    #[test]
    fn test_loop_wrap() {
        let (mut controller, fake) = loaded_controller();
        controller.set_loop(LoopRegion {
            enabled: true,
            start_tick: 120,
            end_tick: 240,
        });
        controller.seek_to(230);
        assert!(controller.toggle_playback());

        // 40 ticks of wall time pushes 230 past the loop end; the cursor
        // wraps to 120 + (270 - 240) = 150.
        controller.advance(40.0 / 960.0);
        assert_eq!(controller.state().position_tick, 150);
        assert!(fake.calls().contains(&"seek:150".to_string()));
    }

    #[test]
    fn test_loop_wrap_handles_large_jump() {
        let (mut controller, _fake) = loaded_controller();
        controller.set_loop(LoopRegion {
            enabled: true,
            start_tick: 120,
            end_tick: 240,
        });
        controller.seek_to(120);
        assert!(controller.toggle_playback());

        // Five loop lengths plus ten ticks in one jump.
        controller.advance(610.0 / 960.0);
        assert_eq!(controller.state().position_tick, 130);
        assert!(controller.state().is_playing);
    }

    #[test]
    fn test_advance_stops_at_track_end() {
        let (mut controller, fake) = loaded_controller();
        controller.seek_to(900);
        assert!(controller.toggle_playback());
        controller.advance(1.0);
        let state = controller.state();
        assert_eq!(state.position_tick, state.duration_tick);
        assert!(!state.is_playing);
        assert!(fake.calls().iter().any(|c| c == "stop"));
    }

    #[test]
    fn test_seek_clamps_to_track_end_and_loop() {
        let (mut controller, _fake) = loaded_controller();
        controller.seek_to(5000);
        assert_eq!(controller.state().position_tick, 1920);

        controller.set_loop(LoopRegion {
            enabled: true,
            start_tick: 120,
            end_tick: 240,
        });
        controller.seek_to(0);
        assert_eq!(controller.state().position_tick, 120);
        controller.seek_to(900);
        assert_eq!(controller.state().position_tick, 240);
    }

    #[test]
    fn test_degenerate_loop_is_disabled_for_playback() {
        let (mut controller, fake) = loaded_controller();
        controller.set_loop(LoopRegion {
            enabled: true,
            start_tick: 5000,
            end_tick: 6000,
        });
        // Both bounds clamp to the track end, so the playback loop degrades
        // to the full track, disabled.
        assert!(fake
            .calls()
            .iter()
            .any(|c| c == &format!("set_loop:false:0:{}", 960)));
    }

    #[test]
    fn test_set_tempo_requests_render_and_pending_resume() {
        let (mut controller, fake) = loaded_controller();
        assert!(controller.toggle_playback());
        controller.set_tempo(90.0);
        let state = controller.state();
        assert!(state.is_rendering);
        assert_eq!(state.tempo_bpm, 90.0);
        assert_eq!(fake.count("set_tempo:90"), 1);

        // advance is inert while the resume is pending.
        controller.advance(0.5);
        assert_eq!(controller.state().position_tick, 0);
    }

    #[test]
    fn test_set_tempo_clamps_range() {
        let (mut controller, _fake) = loaded_controller();
        controller.set_tempo(1000.0);
        assert_eq!(controller.state().tempo_bpm, 400.0);
        controller.set_tempo(-5.0);
        assert_eq!(controller.state().tempo_bpm, 30.0);
    }

    #[test]
    fn test_generation_monotonicity() {
        let (mut controller, fake) = loaded_controller();
        assert!(controller.toggle_playback());
        controller.set_tempo(90.0);

        let listener = fake.listener();
        listener.render_started(1);
        listener.render_started(2);

        // A late completion for a superseded generation is a no-op.
        listener.render_complete(1, true);
        let state = controller.state();
        assert!(state.is_rendering);
        assert_ne!(state.render_progress, 1.0);

        listener.render_complete(2, true);
        let state = controller.state();
        assert!(!state.is_rendering);
        assert_eq!(state.render_progress, 1.0);
    }

    #[test]
    fn test_render_complete_clears_pending_resume() {
        let (mut controller, fake) = loaded_controller();
        assert!(controller.toggle_playback());
        controller.set_tempo(90.0);
        controller.advance(0.5);
        assert_eq!(controller.state().position_tick, 0);

        let listener = fake.listener();
        listener.render_started(1);
        listener.render_complete(1, true);

        controller.advance(0.5);
        assert!(controller.state().position_tick > 0);
    }

    #[test]
    fn test_failed_render_surfaces_error_and_stops() {
        let (mut controller, fake) = loaded_controller();
        assert!(controller.toggle_playback());
        controller.set_tempo(90.0);

        let listener = fake.listener();
        listener.render_started(1);
        listener.render_complete(1, false);

        let state = controller.state();
        assert!(!state.is_playing);
        assert_eq!(state.last_error, Some(PlaybackError::RenderFailure));
        assert!(!state.is_rendering);
    }

    #[test]
    fn test_set_volume_requests_render() {
        let (mut controller, fake) = loaded_controller();
        controller.set_volume(0.5);
        assert_eq!(controller.state().volume, 0.5);
        assert!(controller.state().is_rendering);
        assert_eq!(fake.count("set_volume:0.5"), 1);

        // Same value again is a no-op.
        controller.set_volume(0.5);
        assert_eq!(fake.count("set_volume"), 1);
    }

    #[test]
    fn test_set_metronome_toggles_and_rerenders() {
        let (mut controller, fake) = loaded_controller();
        controller.set_metronome(true);
        assert!(controller.state().metronome_enabled);
        assert!(controller.state().is_rendering);
        assert_eq!(fake.count("set_metronome:true"), 1);
    }

    #[test]
    fn test_toggle_past_loop_end_restarts_at_loop_start() {
        let (mut controller, _fake) = loaded_controller();
        controller.set_loop(LoopRegion {
            enabled: true,
            start_tick: 120,
            end_tick: 240,
        });
        controller.seek_to(240);
        assert!(controller.toggle_playback());
        assert_eq!(controller.state().position_tick, 120);
    }

    #[test]
    fn test_reset_adjustments_restores_defaults() {
        let (mut controller, _fake) = loaded_controller();
        controller.set_tempo(200.0);
        controller.set_metronome(true);
        controller.set_loop(LoopRegion {
            enabled: true,
            start_tick: 120,
            end_tick: 240,
        });
        controller.reset_adjustments();
        let state = controller.state();
        assert_eq!(state.tempo_bpm, 120.0);
        assert!(!state.metronome_enabled);
        assert!(!state.loop_region.enabled);
        assert_eq!(state.position_tick, 0);
    }

    #[test]
    fn test_observer_notified_on_render_activity() {
        let (mut controller, fake) = loaded_controller();
        let notifications = Arc::new(StdMutex::new(0usize));
        let observed = Arc::clone(&notifications);
        controller.set_render_observer(Some(Arc::new(move || {
            *observed.lock().unwrap() += 1;
        })));

        controller.set_tempo(90.0);
        let listener = fake.listener();
        listener.render_started(1);
        listener.render_progress(1, 0.5);
        listener.render_complete(1, true);
        assert!(*notifications.lock().unwrap() >= 3);
    }
}
