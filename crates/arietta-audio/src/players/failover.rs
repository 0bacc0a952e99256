//! Chain multiple playback backends and fall back when one fails.

use std::sync::{Arc, Mutex};

use super::{AudioPlayer, PlaybackHandle};

/// Ordered backend chain with sticky promotion and permanent demotion.
///
/// The first backend to produce a handle is moved to the front of the list
/// so future calls try it first. Every backend that fails along the way has
/// its `stop_all` called and is removed for the lifetime of this process;
/// a broken backend is never retried.
pub struct FailoverPlayer {
    players: Mutex<Vec<Arc<dyn AudioPlayer>>>,
}

impl FailoverPlayer {
    pub fn new(players: Vec<Arc<dyn AudioPlayer>>) -> Self {
        Self {
            players: Mutex::new(players),
        }
    }

    /// Number of backends still in the chain
    pub fn remaining(&self) -> usize {
        self.players.lock().unwrap().len()
    }

    fn promote(&self, player: &Arc<dyn AudioPlayer>) {
        let mut players = self.players.lock().unwrap();
        if let Some(index) = players.iter().position(|p| Arc::ptr_eq(p, player)) {
            let promoted = players.remove(index);
            players.insert(0, promoted);
        }
    }

    fn remove(&self, player: &Arc<dyn AudioPlayer>) {
        let mut players = self.players.lock().unwrap();
        players.retain(|p| !Arc::ptr_eq(p, player));
    }
}

impl AudioPlayer for FailoverPlayer {
    fn play(&self, pcm: &[u8], sample_rate: u32) -> Option<Box<dyn PlaybackHandle>> {
        let snapshot: Vec<Arc<dyn AudioPlayer>> = self.players.lock().unwrap().clone();

        for player in snapshot {
            if let Some(handle) = player.play(pcm, sample_rate) {
                log::debug!("playback backend started");
                self.promote(&player);
                return Some(handle);
            }

            // Drop backends that fail so we do not continually retry them.
            player.stop_all();
            log::debug!("playback backend failed; removing from chain");
            self.remove(&player);
        }

        None
    }

    fn stop_all(&self) {
        let snapshot: Vec<Arc<dyn AudioPlayer>> = self.players.lock().unwrap().clone();
        for player in snapshot {
            player.stop_all();
        }
    }
}
