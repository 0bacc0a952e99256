//! Buffer-based playback through a cpal output stream.
//!
//! One long-lived output stream is built at construction time and owned by
//! a dedicated thread (cpal streams must stay on their creating thread).
//! `play` swaps the armed buffer slot that the stream callback reads from;
//! handles stop by token compare, so a stale handle can never silence a
//! newer playback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use crossbeam::channel::{self, Receiver, Sender};

use super::error::{AudioError, AudioResult};
use super::{AudioPlayer, PlaybackHandle};

/// The buffer currently being played by the stream callback
struct ActiveBuffer {
    samples: Arc<Vec<i16>>,
    /// Fractional read position in source samples
    position: f64,
    /// Source samples consumed per device frame
    step: f64,
    /// Identifies which `play` call armed this buffer
    token: u64,
}

type Slot = Arc<Mutex<Option<ActiveBuffer>>>;

/// Low-latency playback backend over cpal.
pub struct CpalPlayer {
    slot: Slot,
    device_rate: u32,
    next_token: AtomicU64,
    shutdown_tx: Sender<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CpalPlayer {
    /// Build the output stream on a dedicated thread.
    ///
    /// Fails when no output device exists or no usable f32 configuration
    /// can be negotiated; the caller then skips this backend.
    pub fn new() -> AudioResult<Self> {
        let slot: Slot = Arc::new(Mutex::new(None));
        let (result_tx, result_rx) = channel::bounded::<AudioResult<u32>>(1);
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);

        let thread_slot = Arc::clone(&slot);
        let thread = std::thread::Builder::new()
            .name("preview-audio-output".to_string())
            .spawn(move || run_output_stream(thread_slot, result_tx, shutdown_rx))
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        let device_rate = result_rx
            .recv()
            .map_err(|_| AudioError::NoDevices)??;

        log::info!("cpal playback backend ready ({} Hz device rate)", device_rate);
        Ok(Self {
            slot,
            device_rate,
            next_token: AtomicU64::new(1),
            shutdown_tx,
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl AudioPlayer for CpalPlayer {
    fn play(&self, pcm: &[u8], sample_rate: u32) -> Option<Box<dyn PlaybackHandle>> {
        if pcm.is_empty() {
            return None;
        }
        let samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let step = sample_rate as f64 / self.device_rate.max(1) as f64;

        *self.slot.lock().unwrap() = Some(ActiveBuffer {
            samples: Arc::new(samples),
            position: 0.0,
            step,
            token,
        });
        log::debug!(
            "cpal playback armed: {} bytes at {} Hz (token {})",
            pcm.len(),
            sample_rate,
            token
        );

        Some(Box::new(CpalHandle {
            slot: Arc::clone(&self.slot),
            token,
        }))
    }

    fn stop_all(&self) {
        *self.slot.lock().unwrap() = None;
    }
}

impl Drop for CpalPlayer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.try_send(());
        if let Some(thread) = self.thread.lock().unwrap().take() {
            if thread.join().is_err() {
                log::warn!("cpal output thread join failed");
            }
        }
    }
}

struct CpalHandle {
    slot: Slot,
    token: u64,
}

impl PlaybackHandle for CpalHandle {
    fn stop(&self) {
        let mut slot = self.slot.lock().unwrap();
        if slot.as_ref().is_some_and(|active| active.token == self.token) {
            *slot = None;
        }
    }
}

/// Thread body: build the stream, report the negotiated rate, then park
/// until the player is dropped so the stream stays alive.
fn run_output_stream(slot: Slot, result_tx: Sender<AudioResult<u32>>, shutdown_rx: Receiver<()>) {
    let (stream, device_rate) = match build_output_stream(slot) {
        Ok(built) => built,
        Err(error) => {
            let _ = result_tx.send(Err(error));
            return;
        }
    };
    if let Err(error) = stream.play() {
        let _ = result_tx.send(Err(AudioError::StreamPlayError(error.to_string())));
        return;
    }
    let _ = result_tx.send(Ok(device_rate));
    let _ = shutdown_rx.recv();
    drop(stream);
}

fn build_output_stream(slot: Slot) -> AudioResult<(Stream, u32)> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevices)?;
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    log::info!("Using audio device: {}", device_name);

    let supported = device
        .supported_output_configs()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .max_by_key(|c| c.channels().min(2))
        .ok_or_else(|| AudioError::UnsupportedFormat("no f32 output config".to_string()))?;

    let default = device
        .default_output_config()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?;
    let sample_rate = default
        .sample_rate()
        .clamp(supported.min_sample_rate(), supported.max_sample_rate());
    let supported_config = supported.with_sample_rate(sample_rate);

    let config: StreamConfig = supported_config.config();
    let channels = config.channels as usize;
    let device_rate = config.sample_rate.0;
    log::debug!(
        "Output config: {} channels at {} Hz",
        config.channels,
        device_rate
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut active = slot.lock().unwrap();
                for frame in data.chunks_mut(channels) {
                    let value = match active.as_mut() {
                        Some(buffer) => {
                            let index = buffer.position as usize;
                            if index >= buffer.samples.len() {
                                // Buffer exhausted; release it so handles
                                // observe the playback as finished.
                                *active = None;
                                0.0
                            } else {
                                let sample = buffer.samples[index] as f32 / 32768.0;
                                buffer.position += buffer.step;
                                sample
                            }
                        }
                        None => 0.0,
                    };
                    for channel in frame.iter_mut() {
                        *channel = value;
                    }
                }
            },
            move |error| {
                log::error!("audio stream error: {}", error);
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

    Ok((stream, device_rate))
}
