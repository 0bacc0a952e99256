//! The synthesiser-backed [`AudioRenderer`] implementation.
//!
//! Owns the render worker and a playback backend; keeps the published PCM
//! buffer consistent with live tempo / metronome / volume changes by
//! re-rendering asynchronously and resuming playback once the fresh buffer
//! is ready.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::playback::{AudioRenderer, RenderListener};
use crate::players::{AudioPlayer, PlaybackHandle};
use crate::tempo::{TempoChange, TempoMap};
use crate::types::{Event, LoopRegion};

use super::cache::NoteSegmentCache;
use super::rendering::{render_events, MetronomeSettings, RenderConfig};
use super::worker::{RenderFn, RenderRequest, RenderWorker};

/// Engine-fixed output sample rate
pub const SAMPLE_RATE: u32 = 22050;

/// Base peak target before the volume scale is applied
const AMPLITUDE: f64 = 0.45;

/// Mixing chunk between progress reports
const PROGRESS_CHUNK_SIZE: usize = 4096;

/// Render settings that are baked into the PCM and therefore force a fresh
/// render when they change.
struct RenderSettings {
    metronome: MetronomeSettings,
    volume: f64,
}

/// Playback-side state guarded by one lock so backend calls stay atomic
/// with respect to position/tempo transitions.
struct PlaybackShared {
    tempo_bpm: f64,
    position_tick: u64,
    is_playing: bool,
    has_events: bool,
    handle: Option<Box<dyn PlaybackHandle>>,
    /// Stored for the controller's cursor logic; playback itself always
    /// runs the full buffer from the seek offset
    #[allow(dead_code)]
    loop_region: LoopRegion,
}

struct RendererInner {
    player: Arc<dyn AudioPlayer>,
    worker: RenderWorker,
    playback: Mutex<PlaybackShared>,
    settings: Arc<Mutex<RenderSettings>>,
    /// Tempo-change list of the current source, passed through to every
    /// ensure-buffer request
    tempo_changes: Mutex<Arc<[TempoChange]>>,
    listener: Mutex<Option<Arc<dyn RenderListener>>>,
    resume_threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Renders note events to PCM and plays them through an [`AudioPlayer`].
pub struct SynthRenderer {
    inner: Arc<RendererInner>,
}

impl SynthRenderer {
    pub fn new(player: Arc<dyn AudioPlayer>) -> Self {
        let cache = Arc::new(NoteSegmentCache::new());
        let settings = Arc::new(Mutex::new(RenderSettings {
            metronome: MetronomeSettings::default(),
            volume: 1.0,
        }));

        let render_settings = Arc::clone(&settings);
        let render_fn: Arc<RenderFn> =
            Arc::new(move |request: &RenderRequest, progress: Option<&dyn Fn(f32)>| {
                let volume = render_settings.lock().unwrap().volume;
                let config = RenderConfig {
                    sample_rate: SAMPLE_RATE,
                    amplitude: AMPLITUDE * volume.clamp(0.0, 1.0),
                    chunk_size: PROGRESS_CHUNK_SIZE,
                    metronome: request.metronome,
                };
                render_events(
                    &request.events,
                    request.tempo_bpm,
                    request.pulses_per_quarter,
                    &config,
                    &cache,
                    &request.tempo_changes,
                    progress,
                )
            });

        Self {
            inner: Arc::new(RendererInner {
                player,
                worker: RenderWorker::new(render_fn, SAMPLE_RATE),
                playback: Mutex::new(PlaybackShared {
                    tempo_bpm: 120.0,
                    position_tick: 0,
                    is_playing: false,
                    has_events: false,
                    handle: None,
                    loop_region: LoopRegion::default(),
                }),
                settings,
                tempo_changes: Mutex::new(Arc::from(Vec::new())),
                listener: Mutex::new(None),
                resume_threads: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl RendererInner {
    fn ensure_buffer(&self, force: bool, wait: bool) {
        let metronome = self.settings.lock().unwrap().metronome;
        let tempo = {
            let playback = self.playback.lock().unwrap();
            playback.tempo_bpm
        };
        let listener = self.listener.lock().unwrap().clone();
        let tempo_changes = self.tempo_changes.lock().unwrap().clone();
        self.worker
            .ensure_buffer(tempo, &tempo_changes, force, wait, listener, metronome);
    }

    fn stop_handle_only(playback: &mut PlaybackShared) {
        if let Some(handle) = playback.handle.take() {
            handle.stop();
            log::debug!("playback handle cleared");
        }
    }

    fn stop_playback(&self) {
        let mut playback = self.playback.lock().unwrap();
        Self::stop_handle_only(&mut playback);
        self.player.stop_all();
        playback.is_playing = false;
        log::debug!("playback stopped");
    }

    fn play_from_tick(&self, playback: &mut PlaybackShared, tick: u64) -> bool {
        let buffer = self.worker.buffer();
        if buffer.is_empty() {
            playback.is_playing = false;
            playback.handle = None;
            log::debug!("play_from_tick: no buffer to play");
            return false;
        }
        Self::stop_handle_only(playback);

        let start_sample = match self.worker.tempo_map() {
            Some(map) => map.tick_to_sample(tick, SAMPLE_RATE),
            None => {
                let ticks_per_second = self.worker.ticks_per_second().max(1e-3);
                (tick as f64 / ticks_per_second * SAMPLE_RATE as f64).round() as usize
            }
        };
        let byte_offset = (start_sample * 2).min(buffer.len());
        if byte_offset >= buffer.len() {
            playback.is_playing = false;
            log::debug!("play_from_tick: offset beyond buffer (tick={})", tick);
            return false;
        }

        match self.player.play(&buffer[byte_offset..], SAMPLE_RATE) {
            Some(handle) => {
                playback.handle = Some(handle);
                playback.is_playing = true;
                log::debug!(
                    "play_from_tick: started at tick={} bytes={}",
                    tick,
                    buffer.len() - byte_offset
                );
                true
            }
            None => {
                self.player.stop_all();
                playback.handle = None;
                playback.is_playing = false;
                log::debug!("play_from_tick: backend returned no handle");
                false
            }
        }
    }

    /// Spawn a thread that waits for the render worker to become idle and
    /// resumes playback if `generation` is still the published one.
    fn restart_after_render(inner: &Arc<RendererInner>, generation: u64, position_tick: u64) {
        let resume_inner = Arc::clone(inner);
        let thread = std::thread::Builder::new()
            .name(format!("preview-resume-{}", generation))
            .spawn(move || {
                resume_inner.worker.wait_until_idle();
                let mut playback = resume_inner.playback.lock().unwrap();
                if resume_inner.worker.buffer_generation() != generation {
                    return;
                }
                resume_inner.play_from_tick(&mut playback, position_tick);
            });

        match thread {
            Ok(handle) => {
                let mut threads = inner.resume_threads.lock().unwrap();
                threads.retain(|t| !t.is_finished());
                threads.push(handle);
            }
            Err(error) => log::warn!("failed to spawn resume thread: {}", error),
        }
    }

    /// Stop, re-render with the current settings, and schedule a resume when
    /// playback was active. Shared by tempo / metronome / volume changes.
    fn rerender_and_resume(inner: &Arc<RendererInner>) {
        let (was_playing, position) = {
            let playback = inner.playback.lock().unwrap();
            (playback.is_playing, playback.position_tick)
        };
        inner.stop_playback();
        inner.ensure_buffer(true, false);
        if was_playing {
            let generation = inner.worker.render_generation();
            RendererInner::restart_after_render(inner, generation, position);
        }
    }
}

impl AudioRenderer for SynthRenderer {
    fn prepare(&self, events: &[Event], pulses_per_quarter: u32, tempo_changes: &[TempoChange]) {
        let inner = &self.inner;
        inner.stop_playback();

        let tempo = {
            let mut playback = inner.playback.lock().unwrap();
            playback.position_tick = 0;
            playback.has_events = !events.is_empty();
            playback.tempo_bpm
        };
        *inner.tempo_changes.lock().unwrap() = Arc::from(tempo_changes.to_vec());
        inner
            .worker
            .update_source(events, pulses_per_quarter, tempo, tempo_changes);
        inner.ensure_buffer(true, false);
        log::debug!(
            "prepare: events={} ppq={} (async render scheduled)",
            events.len(),
            pulses_per_quarter
        );
    }

    fn start(&self, position_tick: u64, tempo_bpm: f64) -> bool {
        let inner = &self.inner;
        log::debug!(
            "start requested at tick={} tempo={:.3}",
            position_tick,
            tempo_bpm
        );
        {
            let mut playback = inner.playback.lock().unwrap();
            playback.tempo_bpm = tempo_bpm;
            playback.position_tick = position_tick;
            RendererInner::stop_handle_only(&mut playback);
            playback.is_playing = false;
        }
        inner.player.stop_all();

        let has_events = inner.playback.lock().unwrap().has_events;
        if !has_events {
            log::debug!("start aborted: no events available");
            return false;
        }
        inner.ensure_buffer(false, false);

        let buffer_ready = !inner.worker.buffer().is_empty()
            && inner.worker.buffer_generation() == inner.worker.render_generation();
        if buffer_ready {
            let mut playback = inner.playback.lock().unwrap();
            let started = inner.play_from_tick(&mut playback, position_tick);
            log::debug!("start result={}", started);
            return started;
        }

        let generation = inner.worker.render_generation();
        RendererInner::restart_after_render(inner, generation, position_tick);
        log::debug!("start deferred until render generation {}", generation);
        true
    }

    fn pause(&self) {
        log::debug!("pause invoked");
        self.inner.stop_playback();
    }

    fn stop(&self) {
        log::debug!("stop invoked");
        self.inner.stop_playback();
    }

    fn seek(&self, tick: u64) {
        let inner = &self.inner;
        let mut playback = inner.playback.lock().unwrap();
        playback.position_tick = tick;
        if !playback.is_playing {
            log::debug!("seek stored tick={} (not playing)", tick);
            return;
        }
        log::debug!("seek restarting playback from tick={}", tick);
        inner.play_from_tick(&mut playback, tick);
    }

    fn set_tempo(&self, tempo_bpm: f64) {
        let inner = &self.inner;
        {
            let mut playback = inner.playback.lock().unwrap();
            if (playback.tempo_bpm - tempo_bpm).abs() <= 1e-6 {
                return;
            }
            playback.tempo_bpm = tempo_bpm;
        }
        log::debug!("set_tempo: {:.3}", tempo_bpm);
        RendererInner::rerender_and_resume(inner);
    }

    fn set_loop(&self, loop_region: LoopRegion) {
        // Stored only: loop windowing is controller cursor logic, never
        // baked into the PCM, so no re-render happens here.
        let mut playback = self.inner.playback.lock().unwrap();
        playback.loop_region = loop_region;
        log::debug!(
            "set_loop: enabled={} start={} end={}",
            loop_region.enabled,
            loop_region.start_tick,
            loop_region.end_tick
        );
    }

    fn set_metronome(&self, enabled: bool, beats_per_measure: u32, beat_unit: u32) {
        let inner = &self.inner;
        let desired = MetronomeSettings {
            enabled,
            beats_per_measure: beats_per_measure.max(1),
            beat_unit: beat_unit.max(1),
        };
        {
            let mut settings = inner.settings.lock().unwrap();
            if settings.metronome == desired {
                return;
            }
            settings.metronome = desired;
        }
        log::debug!(
            "set_metronome: enabled={} beats={} unit={}",
            desired.enabled,
            desired.beats_per_measure,
            desired.beat_unit
        );
        RendererInner::rerender_and_resume(inner);
    }

    fn set_volume(&self, volume: f64) {
        let inner = &self.inner;
        let clamped = volume.clamp(0.0, 1.0);
        {
            let mut settings = inner.settings.lock().unwrap();
            if (settings.volume - clamped).abs() <= 1e-6 {
                return;
            }
            settings.volume = clamped;
        }
        log::debug!("set_volume: {:.3}", clamped);
        RendererInner::rerender_and_resume(inner);
    }

    fn set_render_listener(&self, listener: Option<Arc<dyn RenderListener>>) {
        *self.inner.listener.lock().unwrap() = listener;
    }

    fn tempo_map(&self) -> Option<Arc<TempoMap>> {
        self.inner.worker.tempo_map()
    }

    fn shutdown(&self) {
        self.inner.stop_playback();
        self.inner.worker.shutdown();
        let threads = std::mem::take(&mut *self.inner.resume_threads.lock().unwrap());
        for thread in threads {
            if thread.join().is_err() {
                log::warn!("resume thread join failed");
            }
        }
    }
}
