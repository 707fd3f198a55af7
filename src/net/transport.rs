use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::codec::WireFrame;
use crate::error::Result;
use crate::session::{Event, SessionId};

use super::protocol::EncodedAudio;

/// Connection state of the duplex stream, as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Everything the transport reports back to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The remote accepted the session; frames may now flow.
    Open,
    /// One fragment of synthesized speech, still transport-encoded.
    Audio(EncodedAudio),
    /// The model was interrupted; queued speech is stale.
    Interrupted,
    /// The remote ended the stream normally.
    Closed(String),
    /// Network or protocol fault.
    Error(String),
    /// The transport task has exited and released the connection. Always the
    /// last event of a session's transport.
    Finished,
}

/// Negotiated at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetup {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
}

/// Routes transport events into the controller queue, tagged with the session
/// they belong to.
#[derive(Debug, Clone)]
pub struct EventSink {
    session: SessionId,
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    #[must_use]
    pub const fn new(session: SessionId, tx: mpsc::Sender<Event>) -> Self {
        Self { session, tx }
    }

    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.session
    }

    /// Deliver an event, waiting for queue space. Returns false once the
    /// controller is gone.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(Event::Transport {
                session: self.session,
                event,
            })
            .await
            .is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("outbound queue is full")]
    Full,
    #[error("transport is closed")]
    Closed,
}

/// The controller's grip on one connection.
///
/// Sending never blocks: frames go into a bounded queue drained by the
/// connection task. Closing is a request; the task acknowledges it by
/// emitting [`TransportEvent::Finished`].
pub struct TransportHandle {
    outbound: mpsc::Sender<WireFrame>,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl TransportHandle {
    #[must_use]
    pub const fn new(
        outbound: mpsc::Sender<WireFrame>,
        cancel: watch::Sender<bool>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            cancel,
            task,
        }
    }

    pub fn send(&self, frame: WireFrame) -> std::result::Result<(), SendError> {
        if *self.cancel.borrow() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Ask the connection to shut down gracefully. Safe to call repeatedly and
    /// while the connect is still in progress.
    pub fn close(&self) {
        self.cancel.send_if_modified(|closing| {
            if *closing {
                false
            } else {
                *closing = true;
                true
            }
        });
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Kill the connection task outright, for when a graceful close stalls.
    pub fn abort(&mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens duplex streams to the remote service.
pub trait Connector: Send + Sync {
    /// Begin connecting. Must not block: success or failure is reported later
    /// through `sink` as [`TransportEvent::Open`] or [`TransportEvent::Error`],
    /// followed eventually by [`TransportEvent::Finished`].
    fn connect(&self, setup: &SessionSetup, sink: EventSink) -> Result<TransportHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(depth: usize) -> (TransportHandle, mpsc::Receiver<WireFrame>, watch::Receiver<bool>) {
        let (tx, rx) = mpsc::channel(depth);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (TransportHandle::new(tx, cancel_tx, None), rx, cancel_rx)
    }

    #[test]
    fn send_reports_full_queue() {
        let (handle, _rx, _cancel) = handle(1);
        assert!(handle.send(WireFrame::new(vec![0, 0], 16000)).is_ok());
        assert_eq!(
            handle.send(WireFrame::new(vec![0, 0], 16000)),
            Err(SendError::Full)
        );
    }

    #[test]
    fn close_is_idempotent() {
        let (handle, _rx, mut cancel) = handle(4);
        handle.close();
        assert!(cancel.has_changed().unwrap_or(false));
        assert!(*cancel.borrow_and_update());

        handle.close();
        assert!(!cancel.has_changed().unwrap_or(true));
        assert!(handle.is_closing());
    }

    #[test]
    fn send_after_close_is_rejected() {
        let (handle, _rx, _cancel) = handle(4);
        handle.close();
        assert_eq!(
            handle.send(WireFrame::new(vec![0, 0], 16000)),
            Err(SendError::Closed)
        );
    }
}
