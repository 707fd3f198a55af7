//! Session lifecycle: one controller task owns the devices and the transport
//! for at most one live session at a time.
//!
//! ```text
//! Idle ──start──▶ Connecting ──Open──▶ Active
//!   ▲                 │                  │
//!   │            stop/Closed/Error  stop/Closed/Error
//!   │                 ▼                  ▼
//!   └──Finished──── Closing ◀────────────┘
//! ```
//!
//! Everything the controller reacts to arrives as an [`Event`] on one
//! bounded queue, so commands, capture blocks, and transport events are
//! handled in a single order.

pub mod controller;
pub mod stats;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::{ParleyError, Result};
use crate::net::transport::TransportEvent;

pub use controller::{Controller, SessionController};
pub use stats::{Diagnostics, SessionStats};

/// Identifies one session. Events tagged with an older id are stale.
pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closing => "closing",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub enum Command {
    Start(oneshot::Sender<Result<()>>),
    /// Replies once the controller is back in Idle.
    Stop(oneshot::Sender<()>),
    Diagnostics(oneshot::Sender<Diagnostics>),
}

#[derive(Debug)]
pub enum Event {
    /// A block from the input device thread.
    Capture {
        session: SessionId,
        block: Vec<f32>,
    },
    Transport {
        session: SessionId,
        event: TransportEvent,
    },
    Command(Command),
}

/// Callbacks for whoever is driving the session. All run on the controller
/// task and must return quickly.
pub trait SessionObserver: Send {
    fn on_open(&mut self) {}

    /// Fires once per session, when it is fully torn down.
    fn on_close(&mut self) {}

    /// A fault that ends the session. Followed by `on_close`.
    fn on_error(&mut self, _cause: &ParleyError) {}

    /// RMS level of each captured block, unscaled.
    fn on_volume(&mut self, _level: f32) {}
}
