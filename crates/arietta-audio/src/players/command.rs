//! Playback through an external command-line audio player.
//!
//! A ranked list of known players is probed on PATH at construction time;
//! the first match wins. Each `play` writes a temp WAV and spawns the
//! player against it; a background watcher deletes the file once the
//! process exits.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::wav::write_temp_wav;
use super::{AudioPlayer, PlaybackHandle};

/// Known players in preference order, with the flags that make them exit
/// after playback without opening a window.
const CANDIDATES: &[(&str, &[&str])] = &[
    ("afplay", &[]),
    ("aplay", &["-q"]),
    ("paplay", &[]),
    ("ffplay", &["-autoexit", "-nodisp", "-loglevel", "quiet"]),
];

/// How long a graceful termination request gets before escalating to kill
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// External-process playback backend.
pub struct CommandPlayer {
    executable: PathBuf,
    extra_args: Vec<String>,
}

impl CommandPlayer {
    /// Probe PATH for a known player; first match wins.
    pub fn discover() -> Option<Self> {
        for (executable, extra) in CANDIDATES {
            if let Ok(path) = which::which(executable) {
                log::info!("external audio player: {}", path.display());
                return Some(Self {
                    executable: path,
                    extra_args: extra.iter().map(|a| a.to_string()).collect(),
                });
            }
        }
        None
    }

    #[cfg(test)]
    fn with_command(executable: PathBuf, extra_args: Vec<String>) -> Self {
        Self {
            executable,
            extra_args,
        }
    }
}

impl CommandPlayer {
    fn spawn_handle(&self, pcm: &[u8], sample_rate: u32) -> Option<CommandHandle> {
        if pcm.is_empty() {
            return None;
        }
        let wave_path = match write_temp_wav(pcm, sample_rate) {
            Ok(path) => path,
            Err(error) => {
                log::error!("unable to write temporary audio file: {}", error);
                return None;
            }
        };

        let child = Command::new(&self.executable)
            .args(&self.extra_args)
            .arg(&wave_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        match child {
            Ok(child) => Some(CommandHandle::new(child, wave_path)),
            Err(error) => {
                log::error!("audio command launch failed: {}", error);
                remove_wave_file(&wave_path);
                None
            }
        }
    }
}

impl AudioPlayer for CommandPlayer {
    fn play(&self, pcm: &[u8], sample_rate: u32) -> Option<Box<dyn PlaybackHandle>> {
        self.spawn_handle(pcm, sample_rate)
            .map(|handle| Box::new(handle) as Box<dyn PlaybackHandle>)
    }

    fn stop_all(&self) {
        // No global stop mechanism; handled per-handle.
    }
}

struct HandleInner {
    child: Mutex<Child>,
    wave_path: PathBuf,
    cleaned: AtomicBool,
}

impl HandleInner {
    fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        remove_wave_file(&self.wave_path);
    }
}

/// Handle owning the child process and its temp file.
struct CommandHandle {
    inner: Arc<HandleInner>,
}

impl CommandHandle {
    fn new(child: Child, wave_path: PathBuf) -> Self {
        let inner = Arc::new(HandleInner {
            child: Mutex::new(child),
            wave_path,
            cleaned: AtomicBool::new(false),
        });

        // Watcher deletes the temp file once the player exits on its own.
        let watcher_inner = Arc::clone(&inner);
        if let Err(error) = std::thread::Builder::new()
            .name("preview-player-watch".to_string())
            .spawn(move || {
                loop {
                    let finished = watcher_inner
                        .child
                        .lock()
                        .unwrap()
                        .try_wait()
                        .map(|status| status.is_some())
                        .unwrap_or(true);
                    if finished || watcher_inner.cleaned.load(Ordering::SeqCst) {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                watcher_inner.cleanup();
            })
        {
            log::warn!("failed to spawn player watcher thread: {}", error);
        }

        Self { inner }
    }
}

impl PlaybackHandle for CommandHandle {
    fn stop(&self) {
        {
            let mut child = self.inner.child.lock().unwrap();
            let running = matches!(child.try_wait(), Ok(None));
            if running {
                request_termination(&mut child);
                let deadline = Instant::now() + TERMINATE_GRACE;
                while matches!(child.try_wait(), Ok(None)) && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(20));
                }
                if matches!(child.try_wait(), Ok(None)) {
                    if let Err(error) = child.kill() {
                        log::warn!("audio command kill failed: {}", error);
                    }
                    let _ = child.wait();
                }
            }
        }
        self.inner.cleanup();
    }
}

/// Ask the player to exit gracefully. On unix this is SIGTERM so the player
/// can restore terminal state; elsewhere it falls through to kill.
fn request_termination(child: &mut Child) {
    #[cfg(unix)]
    {
        let pid = child.id() as libc::pid_t;
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(error) = child.kill() {
            log::warn!("audio command terminate failed: {}", error);
        }
    }
}

fn remove_wave_file(path: &Path) {
    if let Err(error) = std::fs::remove_file(path) {
        if path.exists() {
            log::warn!("failed to delete temp audio file: {}", error);
        }
    }
}
