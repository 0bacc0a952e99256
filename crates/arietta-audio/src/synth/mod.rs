//! Preview synthesiser: additive note synthesis, event mixing, and the
//! asynchronous render worker that keeps the PCM buffer consistent with
//! fast-changing playback parameters.

pub mod cache;
pub mod patches;
pub mod renderer;
pub mod rendering;
pub mod tone;
pub mod worker;

pub use cache::{CacheInfo, NoteSegmentCache};
pub use patches::{patch_for_program, SynthPatch};
pub use renderer::SynthRenderer;
pub use rendering::{
    note_segment, render_events, tempo_cache_key, MetronomeSettings, RenderConfig,
};
pub use tone::midi_to_frequency;
pub use worker::{RenderFn, RenderRequest, RenderWorker};
