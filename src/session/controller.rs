use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::audio::codec::{self, WireFrame};
use crate::audio::pipeline::CapturePipeline;
use crate::audio::playback::PlaybackScheduler;
use crate::audio::{BlockSink, DeviceProvider};
use crate::config::Config;
use crate::error::{ParleyError, Result};
use crate::net::protocol::EncodedAudio;
use crate::net::transport::{
    ConnectionState, Connector, EventSink, SessionSetup, TransportEvent, TransportHandle,
};

use super::stats::{Diagnostics, SessionStats};
use super::{Command, Event, SessionId, SessionObserver, SessionState};

/// How often finished playback is reaped and close deadlines are checked.
const TICK_INTERVAL: Duration = Duration::from_millis(20);

/// Resources held for one live session. Dropping it releases all of them.
struct Session {
    id: SessionId,
    connection: ConnectionState,
    capture: CapturePipeline,
    scheduler: PlaybackScheduler,
    transport: TransportHandle,
    stats: Arc<SessionStats>,
    started_at: DateTime<Utc>,
    close_deadline: Option<Instant>,
}

impl Session {
    fn diagnostics(&self, state: SessionState) -> Diagnostics {
        let mut diag =
            Diagnostics::from_stats(state, Some(self.id), Some(self.started_at), &self.stats);
        diag.handles_completed = self.scheduler.completed();
        diag.handles_stopped = self.scheduler.stopped();
        diag.in_flight = self.scheduler.in_flight();
        diag.cursor_ms = self.scheduler.cursor().as_millis() as u64;
        diag.input_overruns = self.capture.overruns();
        diag
    }
}

/// Run device work that may block (opening, starting, or joining a device
/// thread) without stalling the other tasks on a multi-threaded runtime.
fn blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// The session state machine. Every input arrives through [`Controller::handle`]
/// (or the direct `start_session`/`stop` calls), so all state changes happen
/// on whichever single task owns it.
pub struct Controller {
    config: Config,
    devices: Arc<dyn DeviceProvider>,
    connector: Arc<dyn Connector>,
    observer: Box<dyn SessionObserver>,
    events: mpsc::Sender<Event>,
    state: watch::Sender<SessionState>,
    session: Option<Session>,
    next_id: SessionId,
    retired: Option<Diagnostics>,
    stop_waiters: Vec<oneshot::Sender<()>>,
}

impl Controller {
    /// `events` is the sending half of the queue this controller is fed
    /// from; capture and transport events are posted back into it.
    #[must_use]
    pub fn new(
        config: Config,
        devices: Arc<dyn DeviceProvider>,
        connector: Arc<dyn Connector>,
        observer: Box<dyn SessionObserver>,
        events: mpsc::Sender<Event>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            config,
            devices,
            connector,
            observer,
            events,
            state,
            session: None,
            next_id: 1,
            retired: None,
            stop_waiters: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.session
            .as_ref()
            .map_or(ConnectionState::Disconnected, |s| s.connection)
    }

    /// Acquire devices and begin connecting. Device failures abort before
    /// any connection is attempted.
    pub fn start_session(&mut self) -> Result<()> {
        if self.state() != SessionState::Idle {
            return Err(ParleyError::AlreadyActive);
        }

        let audio = &self.config.audio;
        let devices = &self.devices;
        let (input, output) = blocking(|| -> Result<_> {
            let input = devices.open_input(audio)?;
            let output = devices.open_output(audio)?;
            Ok((input, output))
        })?;
        let capture = CapturePipeline::new(input, self.config.audio.block_size);
        let mut scheduler = PlaybackScheduler::new(output);

        let id = self.next_id;
        self.next_id += 1;

        let setup = SessionSetup {
            model: self.config.session.model.clone(),
            voice: self.config.session.voice.clone(),
            system_instruction: self.config.session.system_instruction.clone(),
        };
        let transport = match self
            .connector
            .connect(&setup, EventSink::new(id, self.events.clone()))
        {
            Ok(t) => t,
            Err(e) => {
                blocking(|| scheduler.close());
                return Err(e);
            }
        };

        tracing::info!(
            "session {id} connecting, capturing from {}",
            capture.device_name()
        );

        self.session = Some(Session {
            id,
            connection: ConnectionState::Connecting,
            capture,
            scheduler,
            transport,
            stats: Arc::new(SessionStats::new()),
            started_at: Utc::now(),
            close_deadline: None,
        });
        self.retired = None;
        self.set_state(SessionState::Connecting);
        Ok(())
    }

    /// Begin tearing down the current session. Idle is reached once the
    /// transport reports it has finished. Repeated calls do nothing more.
    pub fn stop(&mut self) {
        if matches!(
            self.state(),
            SessionState::Connecting | SessionState::Active
        ) {
            tracing::info!("stopping session");
            self.begin_close();
        }
    }

    pub fn handle(&mut self, event: Event) {
        match event {
            Event::Capture { session, block } => self.on_capture(session, &block),
            Event::Transport { session, event } => self.on_transport(session, event),
            Event::Command(command) => self.on_command(command),
        }
    }

    /// Periodic housekeeping: retire finished playback, and force a stalled
    /// close through once its deadline passes.
    pub fn tick(&mut self, now: Instant) {
        match self.state() {
            SessionState::Active => {
                if let Some(session) = self.session.as_mut() {
                    let finished = session.scheduler.reap();
                    if finished > 0 {
                        tracing::trace!("{finished} frames finished playing");
                    }
                }
            }
            SessionState::Closing => {
                let expired = self
                    .session
                    .as_ref()
                    .and_then(|s| s.close_deadline)
                    .is_some_and(|deadline| now >= deadline);
                if expired {
                    if let Some(session) = self.session.as_mut() {
                        tracing::warn!(
                            "transport for session {} did not finish in {:?}, aborting",
                            session.id,
                            self.config.session.close_timeout()
                        );
                        session.transport.abort();
                    }
                    self.enter_idle();
                }
            }
            SessionState::Idle | SessionState::Connecting => {}
        }
    }

    /// Release everything immediately without waiting on the transport.
    pub fn shutdown(&mut self) {
        self.stop();
        if let Some(session) = self.session.as_mut() {
            session.transport.abort();
        }
        self.enter_idle();
    }

    #[must_use]
    pub fn diagnostics(&self) -> Diagnostics {
        let state = self.state();
        if let Some(ref session) = self.session {
            return session.diagnostics(state);
        }
        self.retired.clone().unwrap_or_else(|| {
            Diagnostics::from_stats(state, None, None, &SessionStats::new())
        })
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let _ = reply.send(self.start_session());
            }
            Command::Stop(reply) => {
                self.stop();
                if self.state() == SessionState::Idle {
                    let _ = reply.send(());
                } else {
                    self.stop_waiters.push(reply);
                }
            }
            Command::Diagnostics(reply) => {
                let _ = reply.send(self.diagnostics());
            }
        }
    }

    fn on_capture(&mut self, id: SessionId, block: &[f32]) {
        let active = self.state() == SessionState::Active;
        let Some(session) = self.session.as_mut().filter(|s| s.id == id) else {
            tracing::trace!("discarding capture block from stale session {id}");
            return;
        };

        if !active {
            session.stats.record_dropped();
            return;
        }

        let captured = match session.capture.process(block) {
            Ok(c) => c,
            Err(e) => {
                session.stats.record_malformed();
                tracing::warn!("discarding capture block: {e}");
                return;
            }
        };
        session.stats.record_captured();
        self.observer.on_volume(captured.level);

        match session.transport.send(captured.frame) {
            Ok(()) => {
                session.stats.record_sent();
                tracing::trace!("sent capture block, level {:.4}", captured.level);
            }
            Err(e) => {
                session.stats.record_dropped();
                tracing::debug!("dropped capture block: {e}");
            }
        }
    }

    fn on_transport(&mut self, id: SessionId, event: TransportEvent) {
        if self.session.as_ref().is_none_or(|s| s.id != id) {
            tracing::debug!("discarding {event:?} from stale session {id}");
            return;
        }

        let live = matches!(
            self.state(),
            SessionState::Connecting | SessionState::Active
        );

        match event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::Audio(audio) => self.on_audio(&audio),
            TransportEvent::Interrupted => self.on_interrupted(),
            TransportEvent::Closed(reason) => {
                if live {
                    tracing::info!("session {id} closed by remote: {reason}");
                    self.begin_close();
                }
            }
            TransportEvent::Error(cause) => {
                if live {
                    self.fail(ParleyError::Transport(cause));
                } else {
                    tracing::debug!("transport error while closing: {cause}");
                }
            }
            TransportEvent::Finished => {
                if live {
                    tracing::warn!("transport for session {id} exited without closing");
                    self.begin_close();
                }
                self.enter_idle();
            }
        }
    }

    fn on_open(&mut self) {
        if self.state() != SessionState::Connecting {
            tracing::debug!("ignoring open in state {}", self.state());
            return;
        }

        let started = match self.session.as_mut() {
            Some(session) => {
                let sink = capture_sink(
                    session.id,
                    Arc::clone(&session.stats),
                    self.events.clone(),
                );
                blocking(|| session.capture.start(sink)).map(|()| {
                    session.connection = ConnectionState::Connected;
                    session.id
                })
            }
            None => return,
        };

        match started {
            Ok(id) => {
                self.set_state(SessionState::Active);
                tracing::info!("session {id} active");
                self.observer.on_open();
            }
            Err(e) => self.fail(e),
        }
    }

    fn on_audio(&mut self, audio: &EncodedAudio) {
        if self.state() != SessionState::Active {
            tracing::debug!("discarding audio in state {}", self.state());
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.stats.record_received();

        let frame = match WireFrame::from_transport(&audio.mime_type, &audio.data)
            .and_then(|wire| codec::decode(&wire))
        {
            Ok(frame) => frame,
            Err(e) if !e.is_fatal_to_session() => {
                session.stats.record_malformed();
                tracing::warn!("discarding inbound audio: {e}");
                return;
            }
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        if let Err(e) = session.scheduler.schedule(&frame) {
            self.fail(e);
        }
    }

    fn on_interrupted(&mut self) {
        if self.state() != SessionState::Active {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            let stopped = session.scheduler.flush();
            session.stats.record_interruption();
            tracing::debug!("interrupted, {stopped} queued frames discarded");
        }
    }

    fn fail(&mut self, cause: ParleyError) {
        tracing::error!("session failed: {cause}");
        self.observer.on_error(&cause);
        self.begin_close();
    }

    fn begin_close(&mut self) {
        if !matches!(
            self.state(),
            SessionState::Connecting | SessionState::Active
        ) {
            return;
        }
        let deadline = Instant::now() + self.config.session.close_timeout();
        let Some(session) = self.session.as_mut() else {
            return;
        };

        blocking(|| {
            session.capture.stop();
            session.scheduler.close();
        });
        session.transport.close();
        session.connection = ConnectionState::Closing;
        session.close_deadline = Some(deadline);

        tracing::debug!("session {} closing", session.id);
        self.set_state(SessionState::Closing);
    }

    fn enter_idle(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.retired = Some(session.diagnostics(SessionState::Idle));
        let id = session.id;
        blocking(|| drop(session));

        self.set_state(SessionState::Idle);
        tracing::info!("session {id} ended");
        self.observer.on_close();

        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("session state {previous} -> {state}");
        }
    }
}

/// Runs on the input device thread: hand each block to the controller queue
/// without blocking, counting it as dropped if the queue is full.
fn capture_sink(
    session: SessionId,
    stats: Arc<SessionStats>,
    events: mpsc::Sender<Event>,
) -> BlockSink {
    Box::new(move |block| {
        if events.try_send(Event::Capture { session, block }).is_err() {
            stats.record_dropped();
        }
    })
}

fn controller_gone() -> ParleyError {
    ParleyError::Other("session controller has shut down".to_string())
}

/// Handle to a controller running as its own tokio task. Dropping it tears
/// down any session and ends the task.
pub struct SessionController {
    events: mpsc::Sender<Event>,
    state: watch::Receiver<SessionState>,
    /// Fired or dropped to end the task, independent of the event queue.
    stop_task: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SessionController {
    /// Spawn the controller task. Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(
        config: Config,
        devices: Arc<dyn DeviceProvider>,
        connector: Arc<dyn Connector>,
        observer: Box<dyn SessionObserver>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.audio.event_queue_depth.max(1));
        let controller = Controller::new(config, devices, connector, observer, tx.clone());
        let state = controller.subscribe();
        let (stop_task, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run(controller, rx, stop_rx));

        Self {
            events: tx,
            state,
            stop_task: Some(stop_task),
            task: Some(task),
        }
    }

    pub async fn start_session(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Start(reply)).await?;
        rx.await.map_err(|_| controller_gone())?
    }

    /// Stop the current session and wait until every resource is released.
    pub async fn stop_session(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Stop(reply)).await?;
        rx.await.map_err(|_| controller_gone())
    }

    pub async fn diagnostics(&self) -> Result<Diagnostics> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Diagnostics(reply)).await?;
        rx.await.map_err(|_| controller_gone())
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions, e.g. to notice a remote close.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Tear down any session and wait for the controller task to exit.
    pub async fn shutdown(mut self) {
        if let Some(stop_task) = self.stop_task.take() {
            let _ = stop_task.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("session controller task failed: {e}");
            }
        }
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.events
            .send(Event::Command(command))
            .await
            .map_err(|_| controller_gone())
    }
}

async fn run(
    mut controller: Controller,
    mut events: mpsc::Receiver<Event>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = &mut stop => break,
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                controller.handle(event);
            }
            _ = ticker.tick() => controller.tick(Instant::now()),
        }
    }

    tracing::debug!("session controller exiting");
    controller.shutdown();
}
