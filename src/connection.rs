//! One authenticated WebSocket session to the ASR backend
//!
//! # Connection flow
//!
//! 1. `open()` - connect the socket and wait for the `{"status":"connected"}` greeting
//! 2. `send_config()` - declare language and sample rate, transition to Ready
//! 3. `send_audio()` - stream binary PCM chunks
//! 4. `send_done()` - signal end of input, transition to Draining
//! 5. `close()` - clean shutdown with close code 1000
//!
//! Incoming frames are parsed by a spawned reader task and surfaced through a
//! bounded channel; the close code arrives as the last item so the session can
//! distinguish a normal drain from a mid-stream loss.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::protocol::frame::coding::CloseCode,
    tungstenite::protocol::CloseFrame,
    tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};

use crate::error::SttError;
use crate::protocol::{ConfigMessage, Handshake, ServerEvent, CLOSE_AUTH, DONE_SIGNAL};

/// Timeout for the TCP/TLS/WebSocket connect
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the server greeting after the socket opens
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Depth of the reader-to-session event channel
const EVENT_CHANNEL_DEPTH: usize = 32;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a [`Connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// Parked in the pool, not attached to a session
    Idle,
    /// Socket open and greeted, configuration not yet sent
    HandshakePending,
    /// Configured and usable for audio
    Ready,
    /// End-of-input sent, waiting for remaining finals and the server close
    Draining,
    /// Closed cleanly
    Closed,
    /// Unusable after a transport or protocol failure
    Failed,
}

/// Events surfaced by the reader task
#[derive(Debug, Clone)]
pub(crate) enum ConnEvent {
    /// Provisional transcription
    Interim { text: String, confidence: Option<f32> },
    /// Stable transcription
    Final { text: String, confidence: Option<f32> },
    /// Socket ended; `code` is the close code when the peer sent one
    Closed { code: Option<u16> },
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// One WebSocket session, owned by the pool or by a single stream at a time
#[derive(Debug)]
pub(crate) struct Connection {
    id: u64,
    write: WsSink,
    events: mpsc::Receiver<ConnEvent>,
    reader: tokio::task::JoinHandle<()>,
    state: ConnState,
    language: String,
    sample_rate: u32,
    last_used: Instant,
}

impl Connection {
    /// Open the socket at a minted URL and wait for the server greeting
    ///
    /// The URL carries a single-use ticket, never the API key. A 1008 close
    /// during the handshake maps to `Auth`; any other premature close maps to
    /// `Network` so the caller can retry with a fresh ticket.
    pub async fn open(
        ws_url: &str,
        language: &str,
        sample_rate: u32,
    ) -> Result<Self, SttError> {
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);

        let (ws_stream, _response) = timeout(
            CONNECT_TIMEOUT,
            connect_async_with_config(ws_url, None, false),
        )
        .await
        .map_err(|_| SttError::Network("connection timeout".to_string()))?
        .map_err(|e| SttError::Network(e.to_string()))?;

        let (write, mut read) = ws_stream.split();

        // The server speaks first
        timeout(HANDSHAKE_TIMEOUT, async {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let hs: Handshake = serde_json::from_str(&text).map_err(|_| {
                            SttError::Protocol(format!(
                                "unexpected first frame from server: {}",
                                truncate(&text)
                            ))
                        })?;
                        if !hs.is_connected() {
                            return Err(SttError::Protocol(format!(
                                "unexpected handshake status {:?}",
                                hs.status
                            )));
                        }
                        return Ok(());
                    }
                    Ok(Message::Close(frame)) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        return Err(match code {
                            Some(CLOSE_AUTH) => SttError::Auth(
                                "server rejected the ticket (close 1008)".to_string(),
                            ),
                            other => SttError::Network(format!(
                                "socket closed during handshake (code {:?})",
                                other
                            )),
                        });
                    }
                    Ok(Message::Binary(_)) => {
                        return Err(SttError::Protocol(
                            "binary frame before handshake".to_string(),
                        ));
                    }
                    Ok(_) => {} // ping/pong
                    Err(e) => return Err(SttError::Network(e.to_string())),
                }
            }
            Err(SttError::Network(
                "socket ended before handshake".to_string(),
            ))
        })
        .await
        .map_err(|_| SttError::Network("handshake timeout".to_string()))??;

        log::debug!("Connection {}: open and greeted", id);

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let reader = tokio::spawn(read_loop(id, read, event_tx));

        Ok(Self {
            id,
            write,
            events: event_rx,
            reader,
            state: ConnState::HandshakePending,
            language: language.to_string(),
            sample_rate,
            last_used: Instant::now(),
        })
    }

    /// Send the configuration message, completing the handshake
    pub async fn send_config(&mut self) -> Result<(), SttError> {
        let msg = ConfigMessage::new(&self.language, self.sample_rate).to_json();
        self.send_text(msg).await?;
        self.state = ConnState::Ready;
        log::debug!(
            "Connection {}: configured (lang={}, rate={})",
            self.id,
            self.language,
            self.sample_rate
        );
        Ok(())
    }

    /// Send one chunk of mono PCM as a binary frame
    pub async fn send_audio(&mut self, chunk: Vec<u8>) -> Result<(), SttError> {
        if let Err(e) = self.write.send(Message::Binary(chunk)).await {
            return Err(self.fail(e.to_string()));
        }
        Ok(())
    }

    /// Signal end of input with the literal `"Done"` text frame
    pub async fn send_done(&mut self) -> Result<(), SttError> {
        self.send_text(DONE_SIGNAL.to_string()).await?;
        self.state = ConnState::Draining;
        Ok(())
    }

    /// Keepalive ping, answered transparently by the peer
    pub async fn ping(&mut self) -> Result<(), SttError> {
        if let Err(e) = self.write.send(Message::Ping(Vec::new())).await {
            return Err(self.fail(e.to_string()));
        }
        Ok(())
    }

    /// Next event from the reader; `None` after the channel drained post-close
    pub async fn recv_event(&mut self) -> Option<ConnEvent> {
        self.events.recv().await
    }

    /// Close with status 1000 and stop the reader
    pub async fn close(mut self) {
        log::debug!("Connection {}: closing", self.id);
        self.reader.abort();
        let _ = self
            .write
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })))
            .await;
        self.state = ConnState::Closed;
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Usable for a new session: configured and the reader still running
    pub fn is_ready(&self) -> bool {
        matches!(self.state, ConnState::Ready | ConnState::Idle) && !self.reader.is_finished()
    }

    pub fn matches(&self, language: &str, sample_rate: u32) -> bool {
        self.language == language && self.sample_rate == sample_rate
    }

    /// Called by the pool when parking the connection
    ///
    /// Events left over from the previous session are discarded so they can
    /// never leak into the next one.
    pub fn mark_idle(&mut self) {
        while self.events.try_recv().is_ok() {}
        self.state = ConnState::Idle;
        self.last_used = Instant::now();
    }

    /// Called by the pool when handing the connection to a session
    pub fn mark_checked_out(&mut self) {
        self.state = ConnState::Ready;
        self.last_used = Instant::now();
    }

    pub fn idle_age(&self) -> Duration {
        self.last_used.elapsed()
    }

    async fn send_text(&mut self, text: String) -> Result<(), SttError> {
        if let Err(e) = self.write.send(Message::Text(text)).await {
            return Err(self.fail(e.to_string()));
        }
        Ok(())
    }

    fn fail(&mut self, detail: String) -> SttError {
        self.state = ConnState::Failed;
        SttError::ConnectionLost(detail)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Reader must not outlive the session that owned it
        self.reader.abort();
    }
}

/// Reader task: parse incoming frames, forward events, report the close code
async fn read_loop(
    id: u64,
    mut read: impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin
        + Send
        + 'static,
    tx: mpsc::Sender<ConnEvent>,
) {
    let mut reported_close = false;

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                Ok(ServerEvent::Partial { text, confidence }) => {
                    if tx.send(ConnEvent::Interim { text, confidence }).await.is_err() {
                        return;
                    }
                }
                Ok(ServerEvent::Final { text, confidence }) => {
                    if tx.send(ConnEvent::Final { text, confidence }).await.is_err() {
                        return;
                    }
                }
                Ok(ServerEvent::Unknown) => {
                    log::warn!(
                        "Connection {}: dropping server message with unknown type: {}",
                        id,
                        truncate(&text)
                    );
                }
                Err(e) => {
                    log::warn!(
                        "Connection {}: dropping unparseable text frame ({}): {}",
                        id,
                        e,
                        truncate(&text)
                    );
                }
            },
            Ok(Message::Binary(data)) => {
                log::debug!(
                    "Connection {}: dropping unexpected {}-byte binary frame",
                    id,
                    data.len()
                );
            }
            Ok(Message::Close(frame)) => {
                let code = frame.as_ref().map(|f| u16::from(f.code));
                log::debug!("Connection {}: peer closed (code {:?})", id, code);
                let _ = tx.send(ConnEvent::Closed { code }).await;
                reported_close = true;
                break;
            }
            Ok(_) => {} // ping/pong
            Err(e) => {
                log::warn!("Connection {}: socket error: {}", id, e);
                let _ = tx.send(ConnEvent::Closed { code: None }).await;
                reported_close = true;
                break;
            }
        }
    }

    if !reported_close {
        let _ = tx.send(ConnEvent::Closed { code: None }).await;
    }
}

fn truncate(text: &str) -> &str {
    let cut = text
        .char_indices()
        .nth(120)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[..cut]
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Accept one WebSocket connection and drive it with `script`
    async fn one_shot_server<F, Fut>(script: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            script(ws).await;
        });
        format!("ws://{}/ws?token=test", addr)
    }

    #[tokio::test]
    async fn test_open_waits_for_greeting_then_configures() {
        let url = one_shot_server(|mut ws| async move {
            ws.send(Message::Text(r#"{"status":"connected"}"#.to_string()))
                .await
                .unwrap();
            // Expect the config message next
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => {
                    assert!(text.contains(r#""lang":"fr""#));
                    assert!(text.contains(r#""sample_rate":16000"#));
                }
                other => panic!("expected config text frame, got {:?}", other),
            }
        })
        .await;

        let mut conn = Connection::open(&url, "fr", 16000).await.unwrap();
        assert_eq!(conn.state(), ConnState::HandshakePending);
        conn.send_config().await.unwrap();
        assert_eq!(conn.state(), ConnState::Ready);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_auth_close_during_handshake() {
        let url = one_shot_server(|mut ws| async move {
            ws.close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "invalid token".into(),
            }))
            .await
            .unwrap();
        })
        .await;

        let err = Connection::open(&url, "fr", 16000).await.unwrap_err();
        assert!(matches!(err, SttError::Auth(_)));
    }

    #[tokio::test]
    async fn test_non_json_greeting_is_protocol_error() {
        let url = one_shot_server(|mut ws| async move {
            ws.send(Message::Text("hello there".to_string()))
                .await
                .unwrap();
            let _ = ws.next().await;
        })
        .await;

        let err = Connection::open(&url, "fr", 16000).await.unwrap_err();
        assert!(matches!(err, SttError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_events_and_close_code_surface_in_order() {
        let url = one_shot_server(|mut ws| async move {
            ws.send(Message::Text(r#"{"status":"connected"}"#.to_string()))
                .await
                .unwrap();
            let _ = ws.next().await; // config
            ws.send(Message::Text(
                r#"{"type":"partial","text":"bonjour","confidence":0.85}"#.to_string(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text(
                r#"{"type":"final","text":"bonjour monde","confidence":0.95}"#.to_string(),
            ))
            .await
            .unwrap();
            ws.close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }))
            .await
            .unwrap();
        })
        .await;

        let mut conn = Connection::open(&url, "fr", 16000).await.unwrap();
        conn.send_config().await.unwrap();

        match conn.recv_event().await.unwrap() {
            ConnEvent::Interim { text, confidence } => {
                assert_eq!(text, "bonjour");
                assert_eq!(confidence, Some(0.85));
            }
            other => panic!("expected interim, got {:?}", other),
        }
        match conn.recv_event().await.unwrap() {
            ConnEvent::Final { text, .. } => assert_eq!(text, "bonjour monde"),
            other => panic!("expected final, got {:?}", other),
        }
        match conn.recv_event().await.unwrap() {
            ConnEvent::Closed { code } => assert_eq!(code, Some(1000)),
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_messages_are_dropped() {
        let url = one_shot_server(|mut ws| async move {
            ws.send(Message::Text(r#"{"status":"connected"}"#.to_string()))
                .await
                .unwrap();
            let _ = ws.next().await; // config
            ws.send(Message::Text(r#"{"type":"diagnostic","x":1}"#.to_string()))
                .await
                .unwrap();
            ws.send(Message::Text(r#"{"status":"still here"}"#.to_string()))
                .await
                .unwrap();
            ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
            ws.send(Message::Text(
                r#"{"type":"final","text":"ok"}"#.to_string(),
            ))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut conn = Connection::open(&url, "fr", 16000).await.unwrap();
        conn.send_config().await.unwrap();

        // Everything unrecognized was skipped; the final comes straight through
        match conn.recv_event().await.unwrap() {
            ConnEvent::Final { text, .. } => assert_eq!(text, "ok"),
            other => panic!("expected final, got {:?}", other),
        }
    }
}
