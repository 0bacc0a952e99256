//! Arietta Audio - preview rendering and playback for score arrangements
//!
//! Turns a list of note events into audible PCM in real time while the user
//! scrubs tempo, toggles a metronome, adjusts volume, and loops sections.
//! The public surface is [`playback::PlaybackController`]; everything below
//! it (tempo mapping, synthesis, render worker, output backends) is exposed
//! for embedding applications that need finer control.

pub mod playback;
pub mod players;
pub mod synth;
pub mod tempo;
pub mod types;

pub use playback::{
    build_audio_renderer, AudioRenderer, NullAudioRenderer, PlaybackController, PlaybackError,
    PlaybackState, RenderListener,
};
pub use tempo::{TempoChange, TempoError, TempoMap};
pub use types::{Event, LoopRegion};
