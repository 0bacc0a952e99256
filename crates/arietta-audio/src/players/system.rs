//! Windows system-sound playback via PlaySound.
//!
//! PlaySound only accepts files, so each `play` writes a temp WAV and
//! issues an asynchronous play call. A best-effort timer thread deletes the
//! file and unregisters the handle once the clip must have finished;
//! explicit `stop` purges the sound and deletes the file immediately.

use std::os::windows::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use windows_sys::Win32::Media::Audio::{PlaySoundW, SND_ASYNC, SND_FILENAME, SND_PURGE};

use super::wav::{pcm_duration_seconds, write_temp_wav};
use super::{AudioPlayer, PlaybackHandle};

fn play_sound_file(path: &PathBuf) -> bool {
    let wide: Vec<u16> = path
        .as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();
    unsafe { PlaySoundW(wide.as_ptr(), std::ptr::null_mut(), SND_FILENAME | SND_ASYNC) != 0 }
}

fn purge_sounds() {
    unsafe {
        PlaySoundW(std::ptr::null(), std::ptr::null_mut(), SND_PURGE);
    }
}

type HandleRegistry = Mutex<Vec<Arc<HandleInner>>>;

struct HandleInner {
    wave_path: PathBuf,
    cleaned: AtomicBool,
    registry: Weak<HandleRegistry>,
}

impl HandleInner {
    fn cleanup(inner: &Arc<HandleInner>) {
        if inner.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(error) = std::fs::remove_file(&inner.wave_path) {
            if inner.wave_path.exists() {
                log::warn!("failed to delete temp audio file: {}", error);
            }
        }
        if let Some(registry) = inner.registry.upgrade() {
            let mut handles = registry.lock().unwrap();
            handles.retain(|h| !Arc::ptr_eq(h, inner));
        }
    }
}

struct SystemSoundHandle {
    inner: Arc<HandleInner>,
}

impl PlaybackHandle for SystemSoundHandle {
    fn stop(&self) {
        purge_sounds();
        HandleInner::cleanup(&self.inner);
    }
}

/// PlaySound-based playback backend, Windows only.
pub struct SystemSoundPlayer {
    handles: Arc<HandleRegistry>,
}

impl SystemSoundPlayer {
    pub fn new() -> Self {
        Self {
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Default for SystemSoundPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioPlayer for SystemSoundPlayer {
    fn play(&self, pcm: &[u8], sample_rate: u32) -> Option<Box<dyn PlaybackHandle>> {
        if pcm.is_empty() {
            return None;
        }
        let wave_path = match write_temp_wav(pcm, sample_rate) {
            Ok(path) => path,
            Err(error) => {
                log::error!("unable to write system-sound wave file: {}", error);
                return None;
            }
        };

        let inner = Arc::new(HandleInner {
            wave_path: wave_path.clone(),
            cleaned: AtomicBool::new(false),
            registry: Arc::downgrade(&self.handles),
        });
        self.handles.lock().unwrap().push(Arc::clone(&inner));

        // Timer deletes the file once the clip must have finished playing.
        let duration = pcm_duration_seconds(pcm, sample_rate);
        let timer_inner = Arc::clone(&inner);
        let wait = Duration::from_secs_f64((duration + 0.5).clamp(0.5, 60.0));
        if let Err(error) = std::thread::Builder::new()
            .name("preview-system-sound-cleanup".to_string())
            .spawn(move || {
                std::thread::sleep(wait);
                HandleInner::cleanup(&timer_inner);
            })
        {
            log::warn!("failed to spawn system-sound cleanup thread: {}", error);
        }

        if !play_sound_file(&wave_path) {
            log::error!("system sound playback failed");
            let handle = SystemSoundHandle { inner };
            handle.stop();
            return None;
        }

        Some(Box::new(SystemSoundHandle { inner }))
    }

    fn stop_all(&self) {
        let handles: Vec<Arc<HandleInner>> = self.handles.lock().unwrap().clone();
        for handle in handles {
            HandleInner::cleanup(&handle);
        }
        purge_sounds();
    }
}
