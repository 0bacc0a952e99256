//! Background render coordination.
//!
//! One long-lived worker thread consumes a FIFO job queue; at most one
//! render executes at a time. Every scheduled render is tagged with a
//! generation number, and a completed render publishes its result only if
//! its generation still equals the worker's current generation. Older,
//! slower renders that finish late are silently dropped, so playback can
//! never regress to stale audio.
//!
//! The queue is unbounded: rapid parameter churn enqueues superseded jobs
//! that still run to completion before being discarded by the generation
//! check. Cancellation is by generation mismatch only; in-flight synthesis
//! is never interrupted.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};

use crate::playback::RenderListener;
use crate::tempo::{TempoChange, TempoMap};
use crate::types::Event;

use super::rendering::MetronomeSettings;

/// Tolerance used when comparing requested and rendered tempos
const TEMPO_TOLERANCE: f64 = 1e-6;

/// Bound on how long shutdown waits for an in-flight render
const SHUTDOWN_WAIT: Duration = Duration::from_secs(3);

/// Everything a render call needs, captured at schedule time.
pub struct RenderRequest {
    pub events: Arc<[Event]>,
    pub tempo_bpm: f64,
    pub pulses_per_quarter: u32,
    pub tempo_changes: Arc<[TempoChange]>,
    pub metronome: MetronomeSettings,
}

/// Injected synthesis function.
///
/// Returns the encoded PCM buffer and the tempo map it was rendered under.
/// A panic inside the function is caught at the worker boundary and treated
/// as a render failure.
pub type RenderFn =
    dyn Fn(&RenderRequest, Option<&dyn Fn(f32)>) -> (Vec<u8>, TempoMap) + Send + Sync;

/// A one-shot event: starts set, cleared when a render is scheduled, set
/// again when the worker returns to idle.
struct ReadyEvent {
    flag: Mutex<bool>,
    condvar: Condvar,
}

impl ReadyEvent {
    fn new() -> Self {
        Self {
            flag: Mutex::new(true),
            condvar: Condvar::new(),
        }
    }

    fn set(&self) {
        let mut flag = self.flag.lock().unwrap();
        *flag = true;
        self.condvar.notify_all();
    }

    fn clear(&self) {
        *self.flag.lock().unwrap() = false;
    }

    fn is_set(&self) -> bool {
        *self.flag.lock().unwrap()
    }

    fn wait(&self) {
        let mut flag = self.flag.lock().unwrap();
        while !*flag {
            flag = self.condvar.wait(flag).unwrap();
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut flag = self.flag.lock().unwrap();
        while !*flag {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _result) = self.condvar.wait_timeout(flag, deadline - now).unwrap();
            flag = guard;
        }
        true
    }
}

/// State guarded by the worker's single lock
struct WorkerState {
    events: Arc<[Event]>,
    pulses_per_quarter: u32,
    shutdown: bool,
    /// Generation of the newest scheduled render
    render_generation: u64,
    /// Generation of the currently published buffer
    buffer_generation: u64,
    /// Target parameters of the in-flight (or most recent) request
    target_tempo: f64,
    target_metronome: Option<MetronomeSettings>,
    target_tempo_changes: Arc<[TempoChange]>,
    /// Parameters the published buffer was rendered with; `rendered_tempo`
    /// is None until the first render publishes (or after invalidation)
    rendered_tempo: Option<f64>,
    rendered_metronome: Option<MetronomeSettings>,
    rendered_tempo_changes: Arc<[TempoChange]>,
    buffer: Arc<Vec<u8>>,
    tempo_map: Option<Arc<TempoMap>>,
    /// Flat ticks-per-second estimate, used when no tempo map is published
    ticks_per_second: f64,
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    ready: ReadyEvent,
}

struct RenderJob {
    generation: u64,
    request: RenderRequest,
    listener: Option<Arc<dyn RenderListener>>,
}

enum WorkerMessage {
    Render(RenderJob),
    Stop,
}

/// Owns the background render thread and the published buffer.
pub struct RenderWorker {
    shared: Arc<WorkerShared>,
    sample_rate: u32,
    job_tx: Sender<WorkerMessage>,
    /// Receiver clone kept so shutdown can drain queued-but-not-started jobs
    job_rx: Receiver<WorkerMessage>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RenderWorker {
    /// Spawn the worker thread around an injected render function.
    pub fn new(render_fn: Arc<RenderFn>, sample_rate: u32) -> Self {
        let shared = Arc::new(WorkerShared {
            state: Mutex::new(WorkerState {
                events: Arc::from(Vec::new()),
                pulses_per_quarter: 480,
                shutdown: false,
                render_generation: 0,
                buffer_generation: 0,
                target_tempo: 120.0,
                target_metronome: None,
                target_tempo_changes: Arc::from(Vec::new()),
                rendered_tempo: None,
                rendered_metronome: None,
                rendered_tempo_changes: Arc::from(Vec::new()),
                buffer: Arc::new(Vec::new()),
                tempo_map: None,
                ticks_per_second: (120.0 / 60.0) * 480.0,
            }),
            ready: ReadyEvent::new(),
        });

        let (job_tx, job_rx) = channel::unbounded();
        let thread_shared = Arc::clone(&shared);
        let thread_rx = job_rx.clone();
        let thread = std::thread::Builder::new()
            .name("preview-render".to_string())
            .spawn(move || {
                worker_loop(thread_shared, render_fn, thread_rx);
            })
            .expect("Failed to spawn preview render thread");

        Self {
            shared,
            sample_rate,
            job_tx,
            job_rx,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Replace the source data and invalidate the published buffer.
    pub fn update_source(
        &self,
        events: &[Event],
        pulses_per_quarter: u32,
        tempo_bpm: f64,
        tempo_changes: &[TempoChange],
    ) {
        let mut state = self.shared.state.lock().unwrap();
        state.events = Arc::from(events.to_vec());
        state.pulses_per_quarter = pulses_per_quarter.max(1);
        state.buffer = Arc::new(Vec::new());
        state.tempo_map = None;
        state.rendered_tempo = None;
        state.rendered_metronome = None;
        state.ticks_per_second = (tempo_bpm / 60.0) * state.pulses_per_quarter as f64;
    }

    /// Schedule a render when the published buffer does not match the
    /// requested parameters.
    ///
    /// Never re-requests while a render for the same target is in flight
    /// (tempo tolerance 1e-6). With `wait` the caller blocks until the
    /// worker is idle again, the synchronous fallback for code paths that
    /// need a ready buffer immediately.
    pub fn ensure_buffer(
        &self,
        tempo_bpm: f64,
        tempo_changes: &[TempoChange],
        force: bool,
        wait: bool,
        listener: Option<Arc<dyn RenderListener>>,
        metronome: MetronomeSettings,
    ) {
        if wait && !self.shared.ready.is_set() {
            self.shared.ready.wait();
        }

        let job = {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            if !self.is_render_needed(&state, force, tempo_bpm, tempo_changes, &metronome) {
                return;
            }

            state.render_generation += 1;
            let generation = state.render_generation;
            state.target_tempo = tempo_bpm;
            state.target_metronome = Some(metronome);
            state.target_tempo_changes = Arc::from(tempo_changes.to_vec());
            self.shared.ready.clear();

            RenderJob {
                generation,
                request: RenderRequest {
                    events: Arc::clone(&state.events),
                    tempo_bpm,
                    pulses_per_quarter: state.pulses_per_quarter,
                    tempo_changes: Arc::clone(&state.target_tempo_changes),
                    metronome,
                },
                listener,
            }
        };

        let generation = job.generation;
        if let Some(listener) = &job.listener {
            notify_started(listener, generation);
        }
        log::debug!(
            "render generation {} scheduled: events={} tempo={:.3}",
            generation,
            job.request.events.len(),
            job.request.tempo_bpm
        );

        if self.job_tx.send(WorkerMessage::Render(job)).is_err() {
            // Worker thread is gone; publish silence so callers do not hang.
            log::error!("render job queue closed; publishing empty buffer");
            let mut state = self.shared.state.lock().unwrap();
            if state.render_generation == generation {
                state.buffer = Arc::new(Vec::new());
                state.tempo_map = None;
                state.rendered_tempo = Some(tempo_bpm);
                state.rendered_metronome = Some(metronome);
                state.rendered_tempo_changes = Arc::from(tempo_changes.to_vec());
                state.buffer_generation = generation;
            }
            drop(state);
            self.shared.ready.set();
        } else if wait {
            self.shared.ready.wait();
        }
    }

    fn is_render_needed(
        &self,
        state: &WorkerState,
        force: bool,
        tempo_bpm: f64,
        tempo_changes: &[TempoChange],
        metronome: &MetronomeSettings,
    ) -> bool {
        if force {
            return true;
        }

        // A render already in flight for the same target makes a new
        // request redundant.
        if !self.shared.ready.is_set() {
            let target_matches = (state.target_tempo - tempo_bpm).abs() < TEMPO_TOLERANCE
                && state.target_metronome.as_ref() == Some(metronome)
                && state.target_tempo_changes.as_ref() == tempo_changes;
            if target_matches {
                return false;
            }
        }

        let buffer_valid = state.buffer_generation == state.render_generation
            && state
                .rendered_tempo
                .is_some_and(|t| (t - tempo_bpm).abs() < TEMPO_TOLERANCE)
            && state.rendered_metronome.as_ref() == Some(metronome)
            && state.rendered_tempo_changes.as_ref() == tempo_changes;
        !buffer_valid
    }

    /// Currently published PCM buffer (empty until a render completes)
    pub fn buffer(&self) -> Arc<Vec<u8>> {
        Arc::clone(&self.shared.state.lock().unwrap().buffer)
    }

    /// Tempo map of the published buffer, if any
    pub fn tempo_map(&self) -> Option<Arc<TempoMap>> {
        self.shared.state.lock().unwrap().tempo_map.clone()
    }

    /// Flat ticks-per-second estimate for the published buffer
    pub fn ticks_per_second(&self) -> f64 {
        self.shared.state.lock().unwrap().ticks_per_second
    }

    /// Generation of the published buffer
    pub fn buffer_generation(&self) -> u64 {
        self.shared.state.lock().unwrap().buffer_generation
    }

    /// Generation of the newest scheduled render
    pub fn render_generation(&self) -> u64 {
        self.shared.state.lock().unwrap().render_generation
    }

    /// Sample rate the published buffers are rendered at
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Block until no render is in flight.
    pub fn wait_until_idle(&self) {
        self.shared.ready.wait();
    }

    /// Close the worker to new requests, wait (bounded) for the in-flight
    /// job, discard queued-but-not-started jobs, and join the thread.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }

        if !self.shared.ready.wait_timeout(SHUTDOWN_WAIT) {
            log::warn!("render worker still busy after {:?}; continuing shutdown", SHUTDOWN_WAIT);
        }

        // Drop jobs that never started; they are stale renders nobody
        // is waiting for any more.
        let mut drained = 0usize;
        while let Ok(message) = self.job_rx.try_recv() {
            if matches!(message, WorkerMessage::Stop) {
                break;
            }
            drained += 1;
        }
        if drained > 0 {
            log::debug!("discarded {} queued render jobs during shutdown", drained);
            self.shared.ready.set();
        }

        let thread = self.thread.lock().unwrap().take();
        if let Some(thread) = thread {
            let _ = self.job_tx.send(WorkerMessage::Stop);
            if thread.join().is_err() {
                log::warn!("render worker thread join failed");
            }
        }
    }
}

impl Drop for RenderWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<WorkerShared>, render_fn: Arc<RenderFn>, jobs: Receiver<WorkerMessage>) {
    while let Ok(message) = jobs.recv() {
        match message {
            WorkerMessage::Stop => return,
            WorkerMessage::Render(job) => execute_job(&shared, &render_fn, job),
        }
    }
}

fn execute_job(shared: &WorkerShared, render_fn: &Arc<RenderFn>, job: RenderJob) {
    let RenderJob {
        generation,
        request,
        listener,
    } = job;

    let progress_listener = listener.clone();
    let progress: Option<Box<dyn Fn(f32)>> = progress_listener.map(|l| {
        Box::new(move |value: f32| notify_progress(&l, generation, value)) as Box<dyn Fn(f32)>
    });

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        render_fn(&request, progress.as_deref())
    }));

    let (buffer, tempo_map, success) = match outcome {
        Ok((pcm, map)) => (pcm, Some(map), true),
        Err(_) => {
            log::error!("render generation {} failed; publishing empty buffer", generation);
            (Vec::new(), None, false)
        }
    };

    let published = {
        let mut state = shared.state.lock().unwrap();
        // The current generation always wins: a result whose generation no
        // longer matches has been superseded and is dropped.
        if generation == state.render_generation {
            state.ticks_per_second = tempo_map
                .as_ref()
                .map(|m| m.ticks_per_second_at(0))
                .unwrap_or_else(|| {
                    (request.tempo_bpm / 60.0) * request.pulses_per_quarter as f64
                });
            state.buffer = Arc::new(buffer);
            state.tempo_map = tempo_map.map(Arc::new);
            state.rendered_tempo = Some(request.tempo_bpm);
            state.rendered_metronome = Some(request.metronome);
            state.rendered_tempo_changes = Arc::clone(&request.tempo_changes);
            state.buffer_generation = generation;
            true
        } else {
            false
        }
    };

    if published {
        log::debug!(
            "render generation {} published: events={} tempo={:.3} success={}",
            generation,
            request.events.len(),
            request.tempo_bpm,
            success
        );
    } else {
        log::debug!("render generation {} superseded; result dropped", generation);
    }

    if let Some(listener) = &listener {
        notify_progress(listener, generation, 1.0);
        notify_complete(listener, generation, success);
    }
    shared.ready.set();
}

// Listener callbacks must never kill the worker thread: panics are caught
// and logged here, at the boundary.

fn notify_started(listener: &Arc<dyn RenderListener>, generation: u64) {
    if catch_unwind(AssertUnwindSafe(|| listener.render_started(generation))).is_err() {
        log::warn!("render listener render_started panicked");
    }
}

fn notify_progress(listener: &Arc<dyn RenderListener>, generation: u64, progress: f32) {
    if catch_unwind(AssertUnwindSafe(|| {
        listener.render_progress(generation, progress)
    }))
    .is_err()
    {
        log::warn!("render listener render_progress panicked");
    }
}

fn notify_complete(listener: &Arc<dyn RenderListener>, generation: u64, success: bool) {
    if catch_unwind(AssertUnwindSafe(|| {
        listener.render_complete(generation, success)
    }))
    .is_err()
    {
        log::warn!("render listener render_complete panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tempo::TempoChange;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn flat_map(tempo: f64) -> TempoMap {
        TempoMap::build(480, &[TempoChange::new(0, tempo)]).unwrap()
    }

    /// Render function that encodes the requested tempo into the buffer so
    /// tests can tell which request produced the published result.
    fn tempo_tagged_render() -> Arc<RenderFn> {
        Arc::new(|request: &RenderRequest, progress: Option<&dyn Fn(f32)>| {
            if let Some(progress) = progress {
                progress(0.5);
            }
            let pcm = (request.tempo_bpm as u64).to_le_bytes().to_vec();
            (pcm, flat_map(request.tempo_bpm))
        })
    }

    fn worker_with(render_fn: Arc<RenderFn>) -> RenderWorker {
        let worker = RenderWorker::new(render_fn, 22050);
        worker.update_source(&[Event::new(0, 480, 69, 0)], 480, 120.0, &[]);
        worker
    }

    #[test]
    fn test_render_publishes_buffer() {
        let worker = worker_with(tempo_tagged_render());
        worker.ensure_buffer(120.0, &[], false, true, None, MetronomeSettings::default());
        assert_eq!(*worker.buffer(), 120u64.to_le_bytes().to_vec());
        assert_eq!(worker.buffer_generation(), 1);
        assert!(worker.tempo_map().is_some());
    }

    #[test]
    fn test_same_parameters_do_not_rerender() {
        let worker = worker_with(tempo_tagged_render());
        worker.ensure_buffer(120.0, &[], false, true, None, MetronomeSettings::default());
        worker.ensure_buffer(120.0, &[], false, true, None, MetronomeSettings::default());
        assert_eq!(worker.render_generation(), 1);
    }

    #[test]
    fn test_force_rerenders() {
        let worker = worker_with(tempo_tagged_render());
        worker.ensure_buffer(120.0, &[], false, true, None, MetronomeSettings::default());
        worker.ensure_buffer(120.0, &[], true, true, None, MetronomeSettings::default());
        assert_eq!(worker.render_generation(), 2);
        assert_eq!(worker.buffer_generation(), 2);
    }

    #[test]
    fn test_superseded_render_is_dropped() {
        // First render blocks until released, so the second request is
        // scheduled while the first is still in flight.
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let calls = AtomicUsize::new(0);
        let render_fn: Arc<RenderFn> = Arc::new(move |request, _progress| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                release_rx.lock().unwrap().recv().unwrap();
            }
            let pcm = (request.tempo_bpm as u64).to_le_bytes().to_vec();
            (pcm, flat_map(request.tempo_bpm))
        });

        let worker = worker_with(render_fn);
        worker.ensure_buffer(100.0, &[], false, false, None, MetronomeSettings::default());
        worker.ensure_buffer(200.0, &[], false, false, None, MetronomeSettings::default());
        assert_eq!(worker.render_generation(), 2);

        release_tx.send(()).unwrap();
        // The ready event is briefly set between queued jobs, so poll for
        // the final generation instead of waiting for idle once.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while worker.buffer_generation() != 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        // Generation 1 finished after generation 2 was requested, so only
        // generation 2's buffer is visible.
        assert_eq!(worker.buffer_generation(), 2);
        assert_eq!(*worker.buffer(), 200u64.to_le_bytes().to_vec());
    }

    #[test]
    fn test_in_flight_same_target_not_requeued() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let render_fn: Arc<RenderFn> = Arc::new(move |request, _progress| {
            let _ = release_rx.lock().unwrap().recv();
            (vec![1], flat_map(request.tempo_bpm))
        });

        let worker = worker_with(render_fn);
        worker.ensure_buffer(120.0, &[], false, false, None, MetronomeSettings::default());
        worker.ensure_buffer(120.0, &[], false, false, None, MetronomeSettings::default());
        assert_eq!(worker.render_generation(), 1);
        release_tx.send(()).unwrap();
        worker.wait_until_idle();
    }

    #[test]
    fn test_update_source_invalidates_buffer() {
        let worker = worker_with(tempo_tagged_render());
        worker.ensure_buffer(120.0, &[], false, true, None, MetronomeSettings::default());
        assert!(!worker.buffer().is_empty());

        worker.update_source(&[Event::new(0, 960, 60, 0)], 480, 120.0, &[]);
        assert!(worker.buffer().is_empty());
        assert!(worker.tempo_map().is_none());

        // Same parameters as before, but the source changed: re-renders.
        worker.ensure_buffer(120.0, &[], false, true, None, MetronomeSettings::default());
        assert_eq!(worker.render_generation(), 2);
        assert!(!worker.buffer().is_empty());
    }

    #[test]
    fn test_panicking_render_publishes_empty_and_reports_failure() {
        struct Recording {
            completions: Mutex<Vec<(u64, bool)>>,
        }
        impl RenderListener for Recording {
            fn render_started(&self, _generation: u64) {}
            fn render_progress(&self, _generation: u64, _progress: f32) {}
            fn render_complete(&self, generation: u64, success: bool) {
                self.completions.lock().unwrap().push((generation, success));
            }
        }

        let render_fn: Arc<RenderFn> = Arc::new(|_request, _progress| panic!("synthesis exploded"));
        let worker = worker_with(render_fn);
        let listener = Arc::new(Recording {
            completions: Mutex::new(Vec::new()),
        });
        worker.ensure_buffer(
            120.0,
            &[],
            false,
            true,
            Some(listener.clone() as Arc<dyn RenderListener>),
            MetronomeSettings::default(),
        );
        assert!(worker.buffer().is_empty());
        assert_eq!(*listener.completions.lock().unwrap(), vec![(1, false)]);
    }

    #[test]
    fn test_panicking_listener_does_not_kill_worker() {
        struct Exploding;
        impl RenderListener for Exploding {
            fn render_started(&self, _generation: u64) {
                panic!("listener start");
            }
            fn render_progress(&self, _generation: u64, _progress: f32) {
                panic!("listener progress");
            }
            fn render_complete(&self, _generation: u64, _success: bool) {
                panic!("listener complete");
            }
        }

        let worker = worker_with(tempo_tagged_render());
        worker.ensure_buffer(
            120.0,
            &[],
            false,
            true,
            Some(Arc::new(Exploding)),
            MetronomeSettings::default(),
        );
        // Worker survived and published despite the panicking listener.
        assert_eq!(worker.buffer_generation(), 1);
        worker.ensure_buffer(90.0, &[], false, true, None, MetronomeSettings::default());
        assert_eq!(worker.buffer_generation(), 2);
    }

    #[test]
    fn test_shutdown_rejects_new_requests() {
        let worker = worker_with(tempo_tagged_render());
        worker.shutdown();
        worker.ensure_buffer(120.0, &[], true, false, None, MetronomeSettings::default());
        assert_eq!(worker.render_generation(), 0);
    }

    #[test]
    fn test_listener_progress_is_forwarded_and_ends_at_one() {
        struct Recording {
            progress: Mutex<Vec<(u64, f32)>>,
        }
        impl RenderListener for Recording {
            fn render_started(&self, _generation: u64) {}
            fn render_progress(&self, generation: u64, progress: f32) {
                self.progress.lock().unwrap().push((generation, progress));
            }
            fn render_complete(&self, _generation: u64, _success: bool) {}
        }

        let worker = worker_with(tempo_tagged_render());
        let listener = Arc::new(Recording {
            progress: Mutex::new(Vec::new()),
        });
        worker.ensure_buffer(
            120.0,
            &[],
            false,
            true,
            Some(listener.clone() as Arc<dyn RenderListener>),
            MetronomeSettings::default(),
        );
        let progress = listener.progress.lock().unwrap();
        assert_eq!(progress.first(), Some(&(1, 0.5)));
        assert_eq!(progress.last(), Some(&(1, 1.0)));
    }
}
