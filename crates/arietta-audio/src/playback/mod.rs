//! Playback coordination: the renderer contract consumed by the controller,
//! the render-listener callback contract, and backend selection at startup.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  commands   ┌──────────────────┐  jobs   ┌───────────────┐
//! │ PlaybackController│───────────►│  SynthRenderer   │────────►│ RenderWorker  │
//! │  (UI thread)      │            │ (AudioRenderer)  │         │ (one thread)  │
//! └────────┬─────────┘            └────────┬─────────┘         └───────┬───────┘
//!          │ state snapshots                │ play(pcm)                 │ listener
//!          ▼                                ▼                           │ callbacks
//!   PlaybackState                  AudioPlayer chain  ◄─────────────────┘
//! ```

pub mod controller;
pub(crate) mod tracker;

use std::sync::Arc;

use thiserror::Error;

use crate::players::select_player;
use crate::synth::renderer::SynthRenderer;
use crate::tempo::{TempoChange, TempoMap};
use crate::types::{Event, LoopRegion};

pub use controller::{PlaybackController, PlaybackState, RenderObserver};

/// User-facing playback failures surfaced through `PlaybackState::last_error`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    /// No audio backend could be constructed on this system
    #[error("audio playback is not available on this system")]
    NoAudioBackendAvailable,
    /// The backend refused to start playback
    #[error("unable to start audio playback")]
    PlaybackStartFailure,
    /// Synthesis failed; the render worker published an empty buffer
    #[error("audio rendering failed")]
    RenderFailure,
}

/// Receives notifications about asynchronous render progress.
///
/// Implementations must tolerate being called from the render worker thread.
/// A panicking listener is caught and logged at the worker boundary; it never
/// kills the worker.
pub trait RenderListener: Send + Sync {
    fn render_started(&self, generation: u64);
    fn render_progress(&self, generation: u64, progress: f32);
    fn render_complete(&self, generation: u64, success: bool);
}

/// Coordination contract between the playback controller and an audio
/// rendering backend.
///
/// All methods are non-blocking; rendering happens asynchronously and
/// completion is reported through the installed [`RenderListener`].
pub trait AudioRenderer: Send + Sync {
    /// Replace the source material and schedule an asynchronous render
    fn prepare(&self, events: &[Event], pulses_per_quarter: u32, tempo_changes: &[TempoChange]);

    /// Start playback from a tick position; returns false when playback
    /// could not start and no render is pending
    fn start(&self, position_tick: u64, tempo_bpm: f64) -> bool;

    fn pause(&self);

    fn stop(&self);

    /// Move the playback cursor; restarts the backend when already playing
    fn seek(&self, tick: u64);

    fn set_tempo(&self, tempo_bpm: f64);

    /// Store the loop selection. Loop windowing is cursor logic in the
    /// controller; it is never baked into the rendered PCM.
    fn set_loop(&self, loop_region: LoopRegion);

    fn set_metronome(&self, enabled: bool, beats_per_measure: u32, beat_unit: u32);

    /// Adjust the output volume; takes effect through a fresh render
    fn set_volume(&self, volume: f64);

    fn set_render_listener(&self, listener: Option<Arc<dyn RenderListener>>);

    /// Tempo map of the most recently published buffer, if any
    fn tempo_map(&self) -> Option<Arc<TempoMap>>;

    /// Whether this renderer can actually produce audio
    fn supports_audio(&self) -> bool {
        true
    }

    /// Stop playback and tear down background threads
    fn shutdown(&self);
}

/// Fallback renderer used when no audio backend is available.
///
/// Accepts every command and performs no audio output.
pub struct NullAudioRenderer;

impl AudioRenderer for NullAudioRenderer {
    fn prepare(&self, _events: &[Event], _pulses_per_quarter: u32, _tempo_changes: &[TempoChange]) {}

    fn start(&self, _position_tick: u64, _tempo_bpm: f64) -> bool {
        true
    }

    fn pause(&self) {}

    fn stop(&self) {}

    fn seek(&self, _tick: u64) {}

    fn set_tempo(&self, _tempo_bpm: f64) {}

    fn set_loop(&self, _loop_region: LoopRegion) {}

    fn set_metronome(&self, _enabled: bool, _beats_per_measure: u32, _beat_unit: u32) {}

    fn set_volume(&self, _volume: f64) {}

    fn set_render_listener(&self, _listener: Option<Arc<dyn RenderListener>>) {}

    fn tempo_map(&self) -> Option<Arc<TempoMap>> {
        None
    }

    fn supports_audio(&self) -> bool {
        false
    }

    fn shutdown(&self) {}
}

/// Build the best available audio renderer for this system.
///
/// Probes playback backends in preference order; when none can be
/// constructed, returns a [`NullAudioRenderer`] and logs a one-time warning.
pub fn build_audio_renderer() -> Box<dyn AudioRenderer> {
    match select_player() {
        Some(player) => Box::new(SynthRenderer::new(player)),
        None => {
            static WARN_ONCE: std::sync::Once = std::sync::Once::new();
            WARN_ONCE.call_once(|| {
                log::warn!("no audio playback backend available; preview audio is disabled");
            });
            Box::new(NullAudioRenderer)
        }
    }
}
