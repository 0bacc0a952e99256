//! Playback backends: the player capability contract, concrete backends,
//! and startup selection.
//!
//! A backend's only job is "play this PCM buffer / stop"; everything else
//! (rendering, looping, position tracking) lives upstream. Backends that
//! fail are handled by the [`FailoverPlayer`] chain, which promotes the
//! first working backend and permanently drops broken ones.

pub mod buffer;
pub mod command;
pub mod error;
pub mod failover;
#[cfg(windows)]
pub mod system;
pub(crate) mod wav;

use std::sync::Arc;

pub use buffer::CpalPlayer;
pub use command::CommandPlayer;
pub use error::{AudioError, AudioResult};
pub use failover::FailoverPlayer;

/// A single playback started by an [`AudioPlayer`].
///
/// `stop` is idempotent: stopping an already-stopped or finished playback
/// is a no-op.
pub trait PlaybackHandle: Send {
    fn stop(&self);
}

/// Abstract "play a PCM buffer" capability.
///
/// `play` returns `None` on any failure (the backend logs the cause and
/// silences itself first); callers treat that as a signal to fall back.
pub trait AudioPlayer: Send + Sync {
    /// Play mono 16-bit little-endian PCM at `sample_rate`.
    fn play(&self, pcm: &[u8], sample_rate: u32) -> Option<Box<dyn PlaybackHandle>>;

    /// Best-effort attempt to silence any playback started by this player.
    fn stop_all(&self);
}

/// Probe playback backends in preference order and compose them.
///
/// Preference: the cpal buffer backend when its native audio stack is
/// usable, the platform system-sound backend on Windows, then an external
/// command-line player found on PATH. Two or more candidates are wrapped in
/// a [`FailoverPlayer`]; exactly one is used directly; none yields `None`.
pub fn select_player() -> Option<Arc<dyn AudioPlayer>> {
    let mut candidates: Vec<Arc<dyn AudioPlayer>> = Vec::new();

    match CpalPlayer::new() {
        Ok(player) => candidates.push(Arc::new(player)),
        Err(error) => log::warn!("buffer playback backend unavailable: {}", error),
    }

    #[cfg(windows)]
    candidates.push(Arc::new(system::SystemSoundPlayer::new()));

    if let Some(player) = CommandPlayer::discover() {
        candidates.push(Arc::new(player));
    }

    match candidates.len() {
        0 => None,
        1 => candidates.pop(),
        _ => Some(Arc::new(FailoverPlayer::new(candidates))),
    }
}
