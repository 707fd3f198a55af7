use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::connect_async;

use crate::audio::codec::WireFrame;
use crate::config::Config;
use crate::error::{ParleyError, Result};

use super::protocol::{self, ServerEvent};
use super::transport::{Connector, EventSink, SessionSetup, TransportEvent, TransportHandle};

/// Connects to the live API over a WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: String,
    api_key: Option<String>,
    connect_timeout: Duration,
    send_queue_depth: usize,
}

/// How a connection ended without a transport fault.
enum Ending {
    /// We asked for it.
    Local,
    /// The remote closed the stream.
    Remote(String),
}

impl WsConnector {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            endpoint: config.session.endpoint.clone(),
            api_key: config.session.resolve_api_key(),
            connect_timeout: config.session.connect_timeout(),
            send_queue_depth: config.audio.send_queue_depth,
        }
    }

    fn url(&self) -> String {
        match self.api_key {
            Some(ref key) => {
                let sep = if self.endpoint.contains('?') { '&' } else { '?' };
                format!("{}{sep}key={key}", self.endpoint)
            }
            None => self.endpoint.clone(),
        }
    }
}

impl Connector for WsConnector {
    fn connect(&self, setup: &SessionSetup, sink: EventSink) -> Result<TransportHandle> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            ParleyError::Transport(format!("websocket transport requires a tokio runtime: {e}"))
        })?;

        if self.api_key.is_none() {
            tracing::warn!("no API key configured; the server will likely reject the session");
        }

        let setup_json = protocol::setup_message(setup)?;
        let (out_tx, out_rx) = mpsc::channel::<WireFrame>(self.send_queue_depth);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        tracing::info!(
            "connecting to {} (model {}, voice {})",
            self.endpoint,
            setup.model,
            setup.voice
        );

        let task = runtime.spawn(run_connection(
            self.url(),
            setup_json,
            self.connect_timeout,
            out_rx,
            cancel_rx,
            sink,
        ));

        Ok(TransportHandle::new(out_tx, cancel_tx, Some(task)))
    }
}

async fn run_connection(
    url: String,
    setup_json: String,
    connect_timeout: Duration,
    mut outbound: mpsc::Receiver<WireFrame>,
    mut cancel: watch::Receiver<bool>,
    sink: EventSink,
) {
    let ending = drive(
        &url,
        setup_json,
        connect_timeout,
        &mut outbound,
        &mut cancel,
        &sink,
    )
    .await;

    match ending {
        Ok(Ending::Local) => {
            tracing::debug!("session {} closed locally", sink.session());
        }
        Ok(Ending::Remote(reason)) => {
            tracing::info!("remote closed session {}: {reason}", sink.session());
            sink.emit(TransportEvent::Closed(reason)).await;
        }
        Err(e) => {
            let cause = match e {
                ParleyError::Transport(msg) => msg,
                other => other.to_string(),
            };
            tracing::warn!("session {} transport failed: {cause}", sink.session());
            sink.emit(TransportEvent::Error(cause)).await;
        }
    }

    sink.emit(TransportEvent::Finished).await;
}

async fn drive(
    url: &str,
    setup_json: String,
    connect_timeout: Duration,
    outbound: &mut mpsc::Receiver<WireFrame>,
    cancel: &mut watch::Receiver<bool>,
    sink: &EventSink,
) -> Result<Ending> {
    // A close requested mid-connect waits for the connect to resolve, then
    // shuts the socket down, so the two never race.
    let (ws, _response) = tokio::time::timeout(connect_timeout, connect_async(url))
        .await
        .map_err(|_| {
            ParleyError::Transport(format!("connect timed out after {connect_timeout:?}"))
        })?
        .map_err(|e| ParleyError::Transport(format!("connect failed: {e}")))?;

    let (mut ws_tx, mut ws_rx) = ws.split();

    if *cancel.borrow_and_update() {
        let _ = ws_tx.close().await;
        return Ok(Ending::Local);
    }

    ws_tx
        .send(Message::Text(setup_json))
        .await
        .map_err(|e| ParleyError::Transport(format!("failed to send setup: {e}")))?;

    let mut frames_sent: u64 = 0;

    loop {
        tokio::select! {
            biased;

            _ = cancel.changed() => {
                tracing::debug!("closing connection after {frames_sent} frames");
                let _ = ws_tx.send(Message::Close(None)).await;
                let _ = ws_tx.close().await;
                return Ok(Ending::Local);
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    None => return Ok(Ending::Remote("stream ended".to_string())),
                    Some(Err(e)) => {
                        return Err(ParleyError::Transport(format!("receive failed: {e}")));
                    }
                    Some(Ok(msg)) => msg,
                };

                let payload = match msg {
                    Message::Text(text) => text.into_bytes(),
                    Message::Binary(bytes) => bytes,
                    Message::Close(frame) => {
                        return match frame {
                            Some(f) if f.code != CloseCode::Normal => Err(ParleyError::Transport(
                                format!("closed by remote ({}): {}", u16::from(f.code), f.reason),
                            )),
                            Some(f) => Ok(Ending::Remote(f.reason.to_string())),
                            None => Ok(Ending::Remote("closed by remote".to_string())),
                        };
                    }
                    _ => continue,
                };

                if let Some(ending) = dispatch(&payload, sink).await? {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    let _ = ws_tx.close().await;
                    return Ok(ending);
                }
            }

            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = ws_tx.close().await;
                    return Ok(Ending::Local);
                };
                let text = protocol::realtime_input_message(&frame)?;
                ws_tx
                    .send(Message::Text(text))
                    .await
                    .map_err(|e| ParleyError::Transport(format!("send failed: {e}")))?;
                frames_sent += 1;
            }
        }
    }
}

/// Forward one inbound message. Returns how the connection should end, if
/// it should: the server announced it is going away, or the controller is
/// gone.
async fn dispatch(payload: &[u8], sink: &EventSink) -> Result<Option<Ending>> {
    let Some(event) = protocol::classify(payload)? else {
        return Ok(None);
    };

    let delivered = match event {
        ServerEvent::Ready => sink.emit(TransportEvent::Open).await,
        ServerEvent::Interrupted => sink.emit(TransportEvent::Interrupted).await,
        ServerEvent::Audio(parts) => {
            let mut delivered = true;
            for part in parts {
                delivered = sink.emit(TransportEvent::Audio(part)).await;
                if !delivered {
                    break;
                }
            }
            delivered
        }
        ServerEvent::GoAway(reason) => return Ok(Some(Ending::Remote(reason))),
    };

    Ok((!delivered).then_some(Ending::Local))
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    use crate::session::Event;

    type ServerSocket = WebSocketStream<TcpStream>;

    fn setup() -> SessionSetup {
        SessionSetup {
            model: "m".to_string(),
            voice: "v".to_string(),
            system_instruction: String::new(),
        }
    }

    async fn listen() -> (TcpListener, Config) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        let addr = listener.local_addr().unwrap_or_else(|e| panic!("{e}"));
        let mut config = Config::default();
        config.session.endpoint = format!("ws://{addr}/live");
        config.session.api_key = Some("test".to_string());
        (listener, config)
    }

    async fn accept(listener: &TcpListener) -> ServerSocket {
        let (stream, _) = listener.accept().await.unwrap_or_else(|e| panic!("{e}"));
        accept_async(stream).await.unwrap_or_else(|e| panic!("{e}"))
    }

    async fn next_text(ws: &mut ServerSocket) -> String {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => text,
            other => panic!("expected text, got {other:?}"),
        }
    }

    async fn drain(ws: &mut ServerSocket) {
        while let Some(Ok(_)) = ws.next().await {}
    }

    async fn next_event(rx: &mut mpsc::Receiver<Event>) -> TransportEvent {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        match event {
            Some(Event::Transport { session: 7, event }) => event,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn connect(config: &Config) -> (TransportHandle, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = WsConnector::new(config)
            .connect(&setup(), EventSink::new(7, tx))
            .unwrap_or_else(|e| panic!("{e}"));
        (handle, rx)
    }

    #[tokio::test]
    async fn full_exchange_then_normal_close() {
        let (listener, config) = listen().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let setup = next_text(&mut ws).await;
            assert!(setup.starts_with("{\"setup\""), "{setup}");

            ws.send(Message::Text(r#"{"setupComplete":{}}"#.to_string()))
                .await
                .unwrap_or_else(|e| panic!("{e}"));
            ws.send(Message::Text(
                r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAA="}}]}}}"#
                    .to_string(),
            ))
            .await
            .unwrap_or_else(|e| panic!("{e}"));

            let input = next_text(&mut ws).await;
            assert!(input.contains("realtimeInput"), "{input}");

            ws.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "done".into(),
            })))
            .await
            .unwrap_or_else(|e| panic!("{e}"));
            drain(&mut ws).await;
        });

        let (handle, mut rx) = connect(&config);
        assert_eq!(next_event(&mut rx).await, TransportEvent::Open);
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Audio(protocol::EncodedAudio {
                mime_type: "audio/pcm;rate=24000".to_string(),
                data: "AAA=".to_string(),
            })
        );

        assert!(handle.send(WireFrame::new(vec![0, 0, 1, 0], 16000)).is_ok());
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Closed("done".to_string())
        );
        assert_eq!(next_event(&mut rx).await, TransportEvent::Finished);
        server.await.unwrap_or_else(|e| panic!("{e}"));
    }

    #[tokio::test]
    async fn abnormal_close_code_is_an_error() {
        let (listener, config) = listen().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let _ = next_text(&mut ws).await;
            ws.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "bad key".into(),
            })))
            .await
            .unwrap_or_else(|e| panic!("{e}"));
            drain(&mut ws).await;
        });

        let (_handle, mut rx) = connect(&config);
        match next_event(&mut rx).await {
            TransportEvent::Error(cause) => {
                assert!(cause.contains("1008") && cause.contains("bad key"), "{cause}");
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(next_event(&mut rx).await, TransportEvent::Finished);
        server.await.unwrap_or_else(|e| panic!("{e}"));
    }

    #[tokio::test]
    async fn go_away_ends_the_session() {
        let (listener, config) = listen().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let _ = next_text(&mut ws).await;
            ws.send(Message::Text(r#"{"goAway":{"timeLeft":"10s"}}"#.to_string()))
                .await
                .unwrap_or_else(|e| panic!("{e}"));
            match ws.next().await {
                Some(Ok(Message::Close(_))) => {}
                other => panic!("expected close, got {other:?}"),
            }
        });

        let (_handle, mut rx) = connect(&config);
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Closed("server is going away in 10s".to_string())
        );
        assert_eq!(next_event(&mut rx).await, TransportEvent::Finished);
        server.await.unwrap_or_else(|e| panic!("{e}"));
    }

    #[tokio::test]
    async fn close_during_handshake_sends_no_setup() {
        let (listener, config) = listen().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap_or_else(|e| panic!("{e}"));
            tokio::time::sleep(Duration::from_millis(200)).await;
            let mut ws = accept_async(stream).await.unwrap_or_else(|e| panic!("{e}"));
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None => {}
                other => panic!("expected close, got {other:?}"),
            }
        });

        let (handle, mut rx) = connect(&config);
        handle.close();
        assert_eq!(next_event(&mut rx).await, TransportEvent::Finished);
        server.await.unwrap_or_else(|e| panic!("{e}"));
    }

    #[tokio::test]
    async fn refused_connection_reports_error() {
        let (listener, config) = listen().await;
        drop(listener);

        let (_handle, mut rx) = connect(&config);
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Error(_)));
        assert_eq!(next_event(&mut rx).await, TransportEvent::Finished);
    }

    #[test]
    fn url_appends_key() {
        let mut config = Config::default();
        config.session.endpoint = "wss://example.test/live".to_string();
        config.session.api_key = Some("abc".to_string());
        assert_eq!(WsConnector::new(&config).url(), "wss://example.test/live?key=abc");

        config.session.endpoint = "wss://example.test/live?alt=json".to_string();
        assert_eq!(
            WsConnector::new(&config).url(),
            "wss://example.test/live?alt=json&key=abc"
        );
    }

    #[test]
    fn connect_outside_runtime_fails() {
        let mut config = Config::default();
        config.session.api_key = Some("abc".to_string());
        let connector = WsConnector::new(&config);
        let (tx, _rx) = mpsc::channel(4);
        let result = connector.connect(&setup(), EventSink::new(1, tx));
        assert!(matches!(result, Err(ParleyError::Transport(_))));
    }
}
