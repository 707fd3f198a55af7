//! Gapless scheduling of synthesized frames on the output device clock.
//!
//! Frames are placed by cursor arithmetic: each one starts where the previous
//! one ended, or at the device's current time if the cursor has fallen behind.
//! Arrival jitter therefore never opens gaps or causes overlap.
//!
//! In-flight handles are tagged with the scheduler's generation. A flush bumps
//! the generation, which invalidates every outstanding handle at once; each
//! handle can then report itself as stopped without being visited.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::error::Result;

use super::OutputDevice;
use super::codec::AudioFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Queued or currently audible.
    Scheduled,
    /// Played to the end without interruption.
    Completed,
    /// Cut off by a flush.
    Stopped,
}

/// One frame's rendering on the output device.
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    id: u64,
    generation: u64,
    start: Duration,
    duration: Duration,
    completed: Arc<AtomicBool>,
    live_generation: Arc<AtomicU64>,
}

impl PlaybackHandle {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn start(&self) -> Duration {
        self.start
    }

    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    #[must_use]
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }

    #[must_use]
    pub fn state(&self) -> HandleState {
        if self.completed.load(Ordering::Acquire) {
            HandleState::Completed
        } else if self.live_generation.load(Ordering::Acquire) != self.generation {
            HandleState::Stopped
        } else {
            HandleState::Scheduled
        }
    }
}

pub struct PlaybackScheduler {
    device: Box<dyn OutputDevice>,
    next_playback_time: Duration,
    generation: Arc<AtomicU64>,
    in_flight: VecDeque<PlaybackHandle>,
    next_id: u64,
    completed: u64,
    stopped: u64,
}

impl PlaybackScheduler {
    #[must_use]
    pub fn new(device: Box<dyn OutputDevice>) -> Self {
        let next_playback_time = device.now();
        Self {
            device,
            next_playback_time,
            generation: Arc::new(AtomicU64::new(0)),
            in_flight: VecDeque::new(),
            next_id: 0,
            completed: 0,
            stopped: 0,
        }
    }

    /// Queue `frame` to start exactly where the previous frame ends, or now if
    /// playback has drained.
    pub fn schedule(&mut self, frame: &AudioFrame) -> Result<PlaybackHandle> {
        let start = self.next_playback_time.max(self.device.now());
        let duration = frame.duration();

        self.device.play_at(frame, start)?;
        self.next_playback_time = start + duration;

        let handle = PlaybackHandle {
            id: self.next_id,
            generation: self.generation.load(Ordering::Acquire),
            start,
            duration,
            completed: Arc::new(AtomicBool::new(false)),
            live_generation: Arc::clone(&self.generation),
        };
        self.next_id += 1;
        self.in_flight.push_back(handle.clone());

        tracing::trace!(
            "scheduled frame {} at {:?} for {:?}",
            handle.id,
            handle.start,
            handle.duration
        );

        Ok(handle)
    }

    /// Stop everything in flight and restart the timeline at the device's
    /// current time. Returns how many handles were cut off.
    pub fn flush(&mut self) -> usize {
        self.reap();

        self.generation.fetch_add(1, Ordering::AcqRel);
        self.device.stop_all();

        let stopped = self.in_flight.len();
        self.in_flight.clear();
        self.stopped += stopped as u64;
        self.next_playback_time = self.device.now();

        tracing::debug!("playback flushed, {stopped} frames stopped");
        stopped
    }

    /// Retire handles whose audio has fully played. Returns how many finished.
    pub fn reap(&mut self) -> usize {
        let now = self.device.now();
        let mut finished = 0;

        // Handles are in start order and never overlap, so ends are ordered too.
        while let Some(front) = self.in_flight.front() {
            if front.end() > now {
                break;
            }
            if let Some(handle) = self.in_flight.pop_front() {
                handle.completed.store(true, Ordering::Release);
                finished += 1;
            }
        }

        self.completed += finished as u64;
        finished
    }

    /// Flush and release the output device.
    pub fn close(&mut self) {
        self.flush();
        self.device.close();
    }

    #[must_use]
    pub const fn cursor(&self) -> Duration {
        self.next_playback_time
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    #[must_use]
    pub const fn completed(&self) -> u64 {
        self.completed
    }

    #[must_use]
    pub const fn stopped(&self) -> u64 {
        self.stopped
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// An output device whose clock only moves when the test says so.
    #[derive(Clone, Default)]
    pub(crate) struct ManualOutput {
        pub(crate) state: Arc<Mutex<ManualOutputState>>,
    }

    #[derive(Default)]
    pub(crate) struct ManualOutputState {
        pub(crate) now: Duration,
        pub(crate) played: Vec<Duration>,
        pub(crate) stop_all_calls: usize,
        pub(crate) closed: usize,
    }

    impl ManualOutput {
        pub(crate) fn advance(&self, by: Duration) {
            if let Ok(mut s) = self.state.lock() {
                s.now += by;
            }
        }

        pub(crate) fn with<R>(&self, f: impl FnOnce(&ManualOutputState) -> R) -> R {
            let s = self.state.lock().unwrap_or_else(|e| panic!("{e}"));
            f(&s)
        }
    }

    impl OutputDevice for ManualOutput {
        fn name(&self) -> &'static str {
            "manual"
        }

        fn now(&self) -> Duration {
            self.with(|s| s.now)
        }

        fn play_at(&mut self, _frame: &AudioFrame, at: Duration) -> Result<()> {
            if let Ok(mut s) = self.state.lock() {
                s.played.push(at);
            }
            Ok(())
        }

        fn stop_all(&mut self) {
            if let Ok(mut s) = self.state.lock() {
                s.stop_all_calls += 1;
            }
        }

        fn close(&mut self) {
            if let Ok(mut s) = self.state.lock() {
                s.closed += 1;
            }
        }
    }

    fn frame_ms(ms: u64) -> AudioFrame {
        AudioFrame::new(vec![0.0; (24 * ms) as usize], 24000)
    }

    fn scheduler() -> (PlaybackScheduler, ManualOutput) {
        let device = ManualOutput::default();
        (PlaybackScheduler::new(Box::new(device.clone())), device)
    }

    #[test]
    fn frames_play_back_to_back() {
        let (mut sched, device) = scheduler();
        device.advance(Duration::from_millis(5));

        let durations = [100u64, 40, 250, 10, 60];
        let handles: Vec<PlaybackHandle> = durations
            .iter()
            .map(|&ms| sched.schedule(&frame_ms(ms)).unwrap_or_else(|e| panic!("{e}")))
            .collect();

        let first = handles[0].start();
        assert_eq!(first, Duration::from_millis(5));
        let mut expected = first;
        for (handle, &ms) in handles.iter().zip(&durations) {
            assert_eq!(handle.start(), expected);
            expected += Duration::from_millis(ms);
        }
        assert_eq!(sched.cursor(), expected);
        assert_eq!(sched.in_flight(), durations.len());
    }

    #[test]
    fn jittery_arrival_keeps_cursor_order() {
        let (mut sched, device) = scheduler();
        let a = sched.schedule(&frame_ms(100)).unwrap_or_else(|e| panic!("{e}"));
        // The next frame arrives late but before A finished: still contiguous.
        device.advance(Duration::from_millis(70));
        let b = sched.schedule(&frame_ms(100)).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(b.start(), a.end());
    }

    #[test]
    fn drained_timeline_restarts_at_now() {
        let (mut sched, device) = scheduler();
        sched.schedule(&frame_ms(100)).unwrap_or_else(|e| panic!("{e}"));
        device.advance(Duration::from_millis(300));
        let late = sched.schedule(&frame_ms(100)).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(late.start(), Duration::from_millis(300));
    }

    #[test]
    fn interruption_resets_timeline() {
        let (mut sched, device) = scheduler();
        let a = sched.schedule(&frame_ms(200)).unwrap_or_else(|e| panic!("{e}"));
        let continuation = sched.cursor();

        device.advance(Duration::from_millis(50));
        let interrupted_at = device.now();
        assert_eq!(sched.flush(), 1);

        let b = sched.schedule(&frame_ms(100)).unwrap_or_else(|e| panic!("{e}"));
        assert!(b.start() >= interrupted_at);
        assert!(b.start() < continuation);
        assert_eq!(a.state(), HandleState::Stopped);
        assert_eq!(b.state(), HandleState::Scheduled);
        assert_eq!(device.with(|s| s.stop_all_calls), 1);
    }

    #[test]
    fn flush_empties_in_flight_and_resets_cursor() {
        let (mut sched, device) = scheduler();
        sched.schedule(&frame_ms(100)).unwrap_or_else(|e| panic!("{e}"));
        sched.schedule(&frame_ms(100)).unwrap_or_else(|e| panic!("{e}"));
        device.advance(Duration::from_millis(30));

        sched.flush();
        assert_eq!(sched.in_flight(), 0);
        assert_eq!(sched.cursor(), Duration::from_millis(30));
        assert_eq!(sched.stopped(), 2);
    }

    #[test]
    fn natural_completion_is_reaped() {
        let (mut sched, device) = scheduler();
        let handles: Vec<_> = (0..3)
            .map(|_| sched.schedule(&frame_ms(100)).unwrap_or_else(|e| panic!("{e}")))
            .collect();

        device.advance(Duration::from_millis(150));
        assert_eq!(sched.reap(), 1);
        assert_eq!(handles[0].state(), HandleState::Completed);
        assert_eq!(handles[1].state(), HandleState::Scheduled);

        device.advance(Duration::from_millis(150));
        assert_eq!(sched.reap(), 2);
        assert!(handles.iter().all(|h| h.state() == HandleState::Completed));
        assert_eq!(sched.in_flight(), 0);
        assert_eq!(sched.completed(), 3);
    }

    #[test]
    fn flush_does_not_stop_already_finished_frames() {
        let (mut sched, device) = scheduler();
        let a = sched.schedule(&frame_ms(100)).unwrap_or_else(|e| panic!("{e}"));
        let b = sched.schedule(&frame_ms(100)).unwrap_or_else(|e| panic!("{e}"));
        device.advance(Duration::from_millis(120));

        assert_eq!(sched.flush(), 1);
        assert_eq!(a.state(), HandleState::Completed);
        assert_eq!(b.state(), HandleState::Stopped);
    }

    #[test]
    fn close_releases_device() {
        let (mut sched, device) = scheduler();
        sched.schedule(&frame_ms(100)).unwrap_or_else(|e| panic!("{e}"));
        sched.close();
        assert_eq!(sched.in_flight(), 0);
        assert_eq!(device.with(|s| s.closed), 1);
    }
}
