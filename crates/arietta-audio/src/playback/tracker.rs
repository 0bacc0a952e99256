//! Tracks asynchronous render activity for the playback controller.

use std::collections::HashMap;
use std::time::Instant;

use super::controller::PlaybackState;

/// Maintains `is_rendering` / `render_progress` on the shared playback
/// state and keeps per-generation timing for debug logging.
///
/// Stale generations are rejected here by plain integer compare: once a
/// newer generation has been observed, callbacks for older ones are no-ops.
pub(crate) struct RenderTracker {
    render_generation: u64,
    pending_request: Option<(Instant, usize)>,
    start_times: HashMap<u64, Instant>,
    request_latencies: HashMap<u64, f64>,
    last_progress: HashMap<u64, f32>,
    event_counts: HashMap<u64, usize>,
}

impl RenderTracker {
    pub fn new() -> Self {
        Self {
            render_generation: 0,
            pending_request: None,
            start_times: HashMap::new(),
            request_latencies: HashMap::new(),
            last_progress: HashMap::new(),
            event_counts: HashMap::new(),
        }
    }

    /// Record that a render has been requested. Returns whether the state
    /// changed (and observers should be notified).
    pub fn mark_pending(&mut self, state: &mut PlaybackState, event_count: usize) -> bool {
        if !state.is_loaded {
            return false;
        }
        state.is_rendering = true;
        state.render_progress = 0.0;
        self.pending_request = Some((Instant::now(), event_count));
        log::debug!(
            "render pending for {} events (current generation {})",
            event_count,
            self.render_generation
        );
        true
    }

    /// Return to an idle, non-rendering state.
    pub fn mark_idle(&mut self, state: &mut PlaybackState, progress: f32) {
        state.is_rendering = false;
        state.render_progress = progress;
        self.pending_request = None;
    }

    /// The backend acknowledged a render request.
    pub fn on_render_started(
        &mut self,
        state: &mut PlaybackState,
        generation: u64,
        fallback_event_count: usize,
    ) -> bool {
        if generation < self.render_generation {
            return false;
        }
        let now = Instant::now();
        let (request_time, events) = match self.pending_request.take() {
            Some((time, count)) => (Some(time), count),
            None => (None, fallback_event_count),
        };
        self.render_generation = generation;
        state.is_rendering = true;
        state.render_progress = 0.0;
        self.start_times.insert(generation, now);
        self.event_counts.insert(generation, events);
        self.last_progress.insert(generation, 0.0);

        match request_time {
            Some(time) => {
                let latency = now.duration_since(time).as_secs_f64();
                self.request_latencies.insert(generation, latency);
                log::debug!(
                    "render generation {} started after {:.3}s wait (events={})",
                    generation,
                    latency,
                    events
                );
            }
            None => {
                self.request_latencies.remove(&generation);
                log::debug!(
                    "render generation {} started (events={})",
                    generation,
                    events
                );
            }
        }
        true
    }

    /// Update tracked progress; logs at 10% steps to keep the log quiet.
    pub fn on_render_progress(
        &mut self,
        state: &mut PlaybackState,
        generation: u64,
        progress: f32,
    ) -> bool {
        if generation != self.render_generation {
            return false;
        }
        let clamped = progress.clamp(0.0, 1.0);
        let previous = self.last_progress.get(&generation).copied().unwrap_or(0.0);
        if clamped >= 1.0 || clamped - previous >= 0.1 {
            self.last_progress.insert(generation, clamped);
            log::debug!(
                "render generation {} progress {:.0}%",
                generation,
                clamped * 100.0
            );
        }
        state.render_progress = clamped;
        true
    }

    /// Handle completion. A late-arriving completion for an older
    /// generation is a no-op.
    pub fn on_render_complete(
        &mut self,
        state: &mut PlaybackState,
        generation: u64,
        success: bool,
        fallback_event_count: usize,
    ) -> bool {
        if generation < self.render_generation {
            return false;
        }
        let start_time = self.start_times.remove(&generation);
        let request_latency = self.request_latencies.remove(&generation);
        let events = self
            .event_counts
            .remove(&generation)
            .unwrap_or(fallback_event_count);
        self.last_progress.remove(&generation);

        self.render_generation = generation;
        state.render_progress = if success { 1.0 } else { 0.0 };
        state.is_rendering = false;

        let elapsed = start_time.map(|t| t.elapsed().as_secs_f64());
        log::debug!(
            "render generation {} complete (success={} events={} wait={:?} render={:?})",
            generation,
            success,
            events,
            request_latency,
            elapsed
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded_state() -> PlaybackState {
        PlaybackState {
            is_loaded: true,
            ..PlaybackState::default()
        }
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let mut tracker = RenderTracker::new();
        let mut state = loaded_state();

        assert!(tracker.on_render_started(&mut state, 1, 4));
        assert!(tracker.on_render_started(&mut state, 2, 4));

        // Generation 1 completes after generation 2 was issued: no-op.
        assert!(!tracker.on_render_complete(&mut state, 1, true, 4));
        assert!(state.is_rendering);
        assert_ne!(state.render_progress, 1.0);

        assert!(tracker.on_render_complete(&mut state, 2, true, 4));
        assert!(!state.is_rendering);
        assert_eq!(state.render_progress, 1.0);
    }

    #[test]
    fn test_stale_progress_is_ignored() {
        let mut tracker = RenderTracker::new();
        let mut state = loaded_state();
        tracker.on_render_started(&mut state, 3, 1);
        assert!(!tracker.on_render_progress(&mut state, 2, 0.5));
        assert_eq!(state.render_progress, 0.0);
        assert!(tracker.on_render_progress(&mut state, 3, 0.5));
        assert_eq!(state.render_progress, 0.5);
    }

    #[test]
    fn test_failed_render_resets_progress() {
        let mut tracker = RenderTracker::new();
        let mut state = loaded_state();
        tracker.on_render_started(&mut state, 1, 1);
        tracker.on_render_complete(&mut state, 1, false, 1);
        assert!(!state.is_rendering);
        assert_eq!(state.render_progress, 0.0);
    }

    #[test]
    fn test_mark_pending_requires_loaded() {
        let mut tracker = RenderTracker::new();
        let mut state = PlaybackState::default();
        assert!(!tracker.mark_pending(&mut state, 3));
        state.is_loaded = true;
        assert!(tracker.mark_pending(&mut state, 3));
        assert!(state.is_rendering);
    }
}
