use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{SessionId, SessionState};

/// Per-session counters. Shared with the capture thread, which records drops
/// when the controller queue is full.
#[derive(Debug, Default)]
pub struct SessionStats {
    blocks_captured: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    frames_received: AtomicU64,
    frames_malformed: AtomicU64,
    interruptions: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $get:ident) => {
        pub fn $record(&self) {
            self.$get.fetch_add(1, Ordering::Relaxed);
        }

        #[must_use]
        pub fn $get(&self) -> u64 {
            self.$get.load(Ordering::Relaxed)
        }
    };
}

impl SessionStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_captured, blocks_captured);
    counter!(record_sent, frames_sent);
    counter!(record_dropped, frames_dropped);
    counter!(record_received, frames_received);
    counter!(record_malformed, frames_malformed);
    counter!(record_interruption, interruptions);
}

/// A point-in-time view of the controller, for display or JSON output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub state: SessionState,
    pub session: Option<SessionId>,
    pub started_at: Option<DateTime<Utc>>,
    pub blocks_captured: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub frames_received: u64,
    pub frames_malformed: u64,
    pub interruptions: u64,
    /// Device buffers the input side lost before they became blocks.
    pub input_overruns: u64,
    pub handles_completed: u64,
    pub handles_stopped: u64,
    pub in_flight: usize,
    /// Playback cursor on the output device clock, in milliseconds.
    pub cursor_ms: u64,
}

impl Diagnostics {
    /// Copy the counters out of `stats`; device and playback fields are left
    /// at zero.
    #[must_use]
    pub fn from_stats(
        state: SessionState,
        session: Option<SessionId>,
        started_at: Option<DateTime<Utc>>,
        stats: &SessionStats,
    ) -> Self {
        Self {
            state,
            session,
            started_at,
            blocks_captured: stats.blocks_captured(),
            frames_sent: stats.frames_sent(),
            frames_dropped: stats.frames_dropped(),
            frames_received: stats.frames_received(),
            frames_malformed: stats.frames_malformed(),
            interruptions: stats.interruptions(),
            input_overruns: 0,
            handles_completed: 0,
            handles_stopped: 0,
            in_flight: 0,
            cursor_ms: 0,
        }
    }
}

impl std::fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "state:            {}", self.state)?;
        if let Some(started) = self.started_at {
            writeln!(f, "started:          {}", started.to_rfc3339())?;
        }
        writeln!(f, "blocks captured:  {}", self.blocks_captured)?;
        writeln!(f, "frames sent:      {}", self.frames_sent)?;
        writeln!(f, "frames dropped:   {}", self.frames_dropped)?;
        writeln!(f, "frames received:  {}", self.frames_received)?;
        writeln!(f, "frames malformed: {}", self.frames_malformed)?;
        writeln!(f, "interruptions:    {}", self.interruptions)?;
        writeln!(f, "input overruns:   {}", self.input_overruns)?;
        write!(
            f,
            "playback:         {} completed, {} stopped",
            self.handles_completed, self.handles_stopped
        )
    }
}
