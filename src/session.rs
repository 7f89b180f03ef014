//! Per-track streaming session
//!
//! One `SttStream` bridges one inbound audio track to the ASR backend. A
//! single driver task owns the checked-out connection and runs everything on
//! one `select!` loop:
//!
//! ```text
//! push(frame) ──channel──▶ driver ── resample ── chunk ── binary frame ──▶ ASR
//!                            │                                             │
//! next_event() ◀──channel────┴──────────── tagged events ◀── JSON ─────────┘
//! ```
//!
//! End of input is signalled by dropping the uplink sender: queued frames
//! drain first, then the chunker flushes and `"Done"` goes out. A lost
//! connection is replaced transparently under the configured backoff policy;
//! frames that arrive during the outage are parked in a bounded ring and
//! replayed, with evictions counted in metrics.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::ring::FrameRing;
use crate::audio::{AudioFrame, Chunker, Resampler};
use crate::config::SttConfig;
use crate::connection::{ConnEvent, ConnState, Connection};
use crate::error::SttError;
use crate::metrics::{MetricsSnapshot, StreamMetrics};
use crate::pool::ConnectionPool;
use crate::protocol::{CLOSE_AUTH, CLOSE_GOING_AWAY, CLOSE_NORMAL, CLOSE_SERVER_ERROR};

/// Depth of the consumer-facing event channel
const EVENT_QUEUE_DEPTH: usize = 32;

/// How long `acquire` may wait on a saturated pool
const ACQUIRE_WAIT: Duration = Duration::from_secs(10);

/// Grace period for the server to close after `"Done"`, refreshed by events
const DONE_ACK_WINDOW: Duration = Duration::from_secs(2);

/// Keepalive ping cadence while the connection is up
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Hard deadline for `close()` before the driver is aborted
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// How long the terminal error event may wait for a slow consumer
const TERMINAL_EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Frames parked during an outage before the oldest are evicted
const OUTAGE_RING_FRAMES: usize = 500;

/// One transcription alternative
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    /// Confidence in `[0, 1]` when the backend reports one
    pub confidence: Option<f32>,
    pub language: String,
}

/// Event delivered to the consumer, tagged with a per-session sequence number
#[derive(Debug, Clone)]
pub struct SpeechEvent {
    pub sequence: u64,
    pub kind: SpeechEventKind,
}

#[derive(Debug, Clone)]
pub enum SpeechEventKind {
    /// Provisional transcription; may be superseded but never crosses a final
    Interim(Transcript),
    /// Stable transcription, delivered in server order
    Final(Transcript),
    /// Terminal failure; always the last event of the session
    Error(SttError),
}

/// Lifecycle state of a session, readable at any time via [`SttStream::state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    New,
    Running,
    EndingInput,
    Reconnecting,
    Finished,
    Errored,
}

/// Receiver half of the event sequence, for consumers that poll concurrently
/// with pushing audio
pub type EventReceiver = mpsc::Receiver<SpeechEvent>;

/// Handle to one streaming transcription session
pub struct SttStream {
    stream_id: Uuid,
    frame_tx: Option<mpsc::Sender<AudioFrame>>,
    events_rx: Option<EventReceiver>,
    driver: Option<tokio::task::JoinHandle<()>>,
    cancel: CancellationToken,
    state: Arc<Mutex<StreamState>>,
    metrics: Arc<StreamMetrics>,
}

impl SttStream {
    pub(crate) fn spawn(config: Arc<SttConfig>, pool: Arc<ConnectionPool>) -> Self {
        let stream_id = Uuid::new_v4();
        let (frame_tx, frame_rx) = mpsc::channel(config.uplink_queue_depth());
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        let state = Arc::new(Mutex::new(StreamState::New));
        let metrics = Arc::new(StreamMetrics::default());

        let driver = Driver {
            stream_id,
            interim_results: config.interim_results,
            language: config.language.clone(),
            resampler: Resampler::new(config.sample_rate),
            chunker: Chunker::new(config.chunk_bytes()),
            ring: FrameRing::new(OUTAGE_RING_FRAMES),
            config,
            pool,
            frame_rx,
            events_tx,
            cancel: cancel.clone(),
            state: state.clone(),
            metrics: metrics.clone(),
            sequence: 0,
            input_done: false,
            dropped_reported: 0,
        };

        log::debug!("Session {}: starting", stream_id);
        let handle = tokio::spawn(driver.run());

        Self {
            stream_id,
            frame_tx: Some(frame_tx),
            events_rx: Some(events_rx),
            driver: Some(handle),
            cancel,
            state,
            metrics,
        }
    }

    /// Queue one frame of audio
    ///
    /// Suspends when the uplink queue is full, so a consumer that stops
    /// draining events eventually backpressures the producer. Malformed
    /// frames return `AudioFormat` without ending the session.
    pub async fn push(&self, frame: AudioFrame) -> Result<(), SttError> {
        frame.validate()?;

        match &self.frame_tx {
            Some(tx) => {
                if tx.send(frame).await.is_err() {
                    log::warn!(
                        "Session {}: frame dropped, session already terminated",
                        self.stream_id
                    );
                } else {
                    self.metrics.record_frame_pushed();
                }
            }
            None => {
                log::warn!(
                    "Session {}: frame pushed after end_input, ignoring",
                    self.stream_id
                );
            }
        }
        Ok(())
    }

    /// Signal that no more audio is coming; idempotent
    ///
    /// Queued frames still drain, then the last partial chunk is zero-padded
    /// and `"Done"` is sent. Remaining finals keep arriving until the server
    /// closes.
    pub fn end_input(&mut self) {
        if self.frame_tx.take().is_some() {
            log::debug!("Session {}: input ended", self.stream_id);
        }
    }

    /// Next event, or `None` once the session finished or errored
    ///
    /// Returns `None` immediately if the receiver was taken with
    /// [`take_events`](Self::take_events).
    pub async fn next_event(&mut self) -> Option<SpeechEvent> {
        match self.events_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Take ownership of the event receiver for concurrent consumption
    pub fn take_events(&mut self) -> Option<EventReceiver> {
        self.events_rx.take()
    }

    /// Cooperative shutdown; idempotent
    ///
    /// Stops reconnection attempts, closes the connection, and ends the event
    /// sequence. The driver gets a hard deadline before being aborted.
    pub async fn close(&mut self) {
        // Cancel before dropping the sender: the driver polls the token
        // first, so a drained channel is never mistaken for end_input
        self.cancel.cancel();
        self.frame_tx = None;

        if let Some(mut driver) = self.driver.take() {
            if timeout(CLOSE_GRACE, &mut driver).await.is_err() {
                log::warn!(
                    "Session {}: driver exceeded the close deadline, aborting",
                    self.stream_id
                );
                driver.abort();
            }
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(StreamState::Errored)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn id(&self) -> Uuid {
        self.stream_id
    }
}

impl Drop for SttStream {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Outcome of one connection's pump loop
enum Pump {
    /// Input ended and the server drained; the session is done
    Finished,
    /// `close()` was requested
    Cancelled,
    /// Unrecoverable; emit the error and stop
    Terminal(SttError),
    /// Transient; replace the connection and resume
    Lost(String),
}

struct Driver {
    stream_id: Uuid,
    config: Arc<SttConfig>,
    pool: Arc<ConnectionPool>,
    frame_rx: mpsc::Receiver<AudioFrame>,
    events_tx: mpsc::Sender<SpeechEvent>,
    cancel: CancellationToken,
    state: Arc<Mutex<StreamState>>,
    metrics: Arc<StreamMetrics>,
    resampler: Resampler,
    chunker: Chunker,
    ring: FrameRing,
    language: String,
    interim_results: bool,
    sequence: u64,
    input_done: bool,
    dropped_reported: u64,
}

impl Driver {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            let mut conn = match self
                .pool
                .acquire(&self.config.language, self.config.sample_rate, ACQUIRE_WAIT)
                .await
            {
                Ok(conn) => {
                    if attempt > 0 {
                        self.metrics.record_reconnect();
                        log::info!(
                            "Session {}: reconnected after {} attempt(s)",
                            self.stream_id,
                            attempt
                        );
                    }
                    attempt = 0;
                    conn
                }
                Err(e) => {
                    if e.is_terminal() || attempt >= self.config.max_reconnects {
                        self.finish_with_error(e).await;
                        return;
                    }
                    attempt += 1;
                    log::warn!(
                        "Session {}: connection attempt failed ({}), retry {}/{}",
                        self.stream_id,
                        e,
                        attempt,
                        self.config.max_reconnects
                    );
                    self.set_state(StreamState::Reconnecting);
                    if !self.backoff(attempt).await {
                        self.set_state(StreamState::Finished);
                        return;
                    }
                    continue;
                }
            };

            self.set_state(if self.input_done {
                StreamState::EndingInput
            } else {
                StreamState::Running
            });

            match self.pump(&mut conn).await {
                Pump::Finished => {
                    self.pool.discard(conn).await;
                    self.set_state(StreamState::Finished);
                    log::debug!("Session {}: finished", self.stream_id);
                    return;
                }
                Pump::Cancelled => {
                    self.pool.release(conn).await;
                    self.set_state(StreamState::Finished);
                    log::debug!("Session {}: closed by the consumer", self.stream_id);
                    return;
                }
                Pump::Terminal(e) => {
                    self.pool.discard(conn).await;
                    self.finish_with_error(e).await;
                    return;
                }
                Pump::Lost(detail) => {
                    self.pool.discard(conn).await;
                    attempt += 1;
                    if attempt > self.config.max_reconnects {
                        self.finish_with_error(SttError::ConnectionLost(format!(
                            "gave up after {} reconnect attempts: {}",
                            attempt - 1,
                            detail
                        )))
                        .await;
                        return;
                    }
                    log::warn!(
                        "Session {}: connection lost ({}), reconnect {}/{}",
                        self.stream_id,
                        detail,
                        attempt,
                        self.config.max_reconnects
                    );
                    self.set_state(StreamState::Reconnecting);
                    if !self.backoff(attempt).await {
                        self.set_state(StreamState::Finished);
                        return;
                    }
                }
            }
        }
    }

    /// Drive one connection until it finishes, fails, or is cancelled
    async fn pump(&mut self, conn: &mut Connection) -> Pump {
        // Replay frames parked during the outage; audio already in flight
        // when the previous socket dropped is gone for transcription purposes
        while let Some(frame) = self.ring.pop() {
            if let Err(e) = self.forward_frame(conn, &frame).await {
                return Pump::Lost(e.to_string());
            }
        }

        // A loss after end_input means the fresh connection must be
        // re-finalized: flush what the chunker still holds and resignal
        if self.input_done && conn.state() != ConnState::Draining {
            if let Err(e) = self.finish_input(conn).await {
                return Pump::Lost(e.to_string());
            }
        }

        let cancel = self.cancel.clone();
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await; // the first tick completes immediately

        let ack_timer = tokio::time::sleep(Duration::from_secs(24 * 3600));
        tokio::pin!(ack_timer);
        let mut awaiting_ack = conn.state() == ConnState::Draining;
        if awaiting_ack {
            ack_timer.as_mut().reset(Instant::now() + DONE_ACK_WINDOW);
        }

        loop {
            // Biased order: cancellation always wins, and pending server
            // events drain before more audio goes out
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Pump::Cancelled,

                _ = ping.tick() => {
                    if let Err(e) = conn.ping().await {
                        return Pump::Lost(e.to_string());
                    }
                }

                event = conn.recv_event() => {
                    match event {
                        Some(ConnEvent::Interim { text, confidence }) => {
                            self.metrics.record_interim();
                            if self.interim_results {
                                let transcript = self.transcript(text, confidence);
                                if !self.emit(SpeechEventKind::Interim(transcript)).await {
                                    return Pump::Cancelled;
                                }
                            }
                            if awaiting_ack {
                                ack_timer.as_mut().reset(Instant::now() + DONE_ACK_WINDOW);
                            }
                        }
                        Some(ConnEvent::Final { text, confidence }) => {
                            self.metrics.record_final();
                            let transcript = self.transcript(text, confidence);
                            if !self.emit(SpeechEventKind::Final(transcript)).await {
                                return Pump::Cancelled;
                            }
                            if awaiting_ack {
                                ack_timer.as_mut().reset(Instant::now() + DONE_ACK_WINDOW);
                            }
                        }
                        Some(ConnEvent::Closed { code }) => {
                            return classify_close(code, awaiting_ack);
                        }
                        None => return Pump::Lost("event channel closed".to_string()),
                    }
                }

                maybe_frame = self.frame_rx.recv(), if !self.input_done => {
                    match maybe_frame {
                        Some(frame) => {
                            if let Err(e) = self.forward_frame(conn, &frame).await {
                                return Pump::Lost(e.to_string());
                            }
                        }
                        None => {
                            self.input_done = true;
                            self.set_state(StreamState::EndingInput);
                            match self.finish_input(conn).await {
                                Ok(()) => {
                                    awaiting_ack = true;
                                    ack_timer.as_mut().reset(Instant::now() + DONE_ACK_WINDOW);
                                }
                                Err(e) => return Pump::Lost(e.to_string()),
                            }
                        }
                    }
                }

                _ = &mut ack_timer, if awaiting_ack => {
                    log::debug!(
                        "Session {}: no server close within the ack window, finishing",
                        self.stream_id
                    );
                    return Pump::Finished;
                }
            }
        }
    }

    /// Resample, chunk, and send one frame
    async fn forward_frame(
        &mut self,
        conn: &mut Connection,
        frame: &AudioFrame,
    ) -> Result<(), SttError> {
        let bytes = match self.resampler.process(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                // Bad frames are dropped; the session keeps going
                log::warn!("Session {}: dropping invalid frame: {}", self.stream_id, e);
                return Ok(());
            }
        };

        for chunk in self.chunker.push(&bytes) {
            let len = chunk.len();
            conn.send_audio(chunk).await?;
            self.metrics.record_chunk_sent(len);
        }
        Ok(())
    }

    /// Flush the padded tail chunk and signal end of input
    async fn finish_input(&mut self, conn: &mut Connection) -> Result<(), SttError> {
        if let Some(padded) = self.chunker.flush() {
            let len = padded.len();
            conn.send_audio(padded).await?;
            self.metrics.record_chunk_sent(len);
        }
        conn.send_done().await?;
        log::debug!("Session {}: done signal sent", self.stream_id);
        Ok(())
    }

    /// Sleep out the backoff while parking inbound frames; false when cancelled
    async fn backoff(&mut self, attempt: u32) -> bool {
        let delay = Duration::from_millis(jitter(backoff_ms(&self.config, attempt)));
        log::debug!(
            "Session {}: backing off {:?} before reconnecting",
            self.stream_id,
            delay
        );

        let cancel = self.cancel.clone();
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return false,
                _ = &mut sleep => break,
                maybe_frame = self.frame_rx.recv(), if !self.input_done => {
                    match maybe_frame {
                        Some(frame) => self.ring.push(frame),
                        None => self.input_done = true,
                    }
                }
            }
        }

        let dropped = self.ring.dropped() - self.dropped_reported;
        self.metrics.record_frames_dropped(dropped);
        self.dropped_reported = self.ring.dropped();
        true
    }

    /// Deliver one event; false when the consumer is gone or closing
    async fn emit(&mut self, kind: SpeechEventKind) -> bool {
        self.sequence += 1;
        let event = SpeechEvent {
            sequence: self.sequence,
            kind,
        };
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => false,
            sent = self.events_tx.send(event) => sent.is_ok(),
        }
    }

    /// Emit the terminal error sentinel and mark the session errored
    async fn finish_with_error(&mut self, error: SttError) {
        log::warn!("Session {}: terminal failure: {}", self.stream_id, error);
        self.sequence += 1;
        let event = SpeechEvent {
            sequence: self.sequence,
            kind: SpeechEventKind::Error(error),
        };
        match timeout(TERMINAL_EVENT_TIMEOUT, self.events_tx.send(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => {
                log::warn!(
                    "Session {}: terminal error event was not delivered",
                    self.stream_id
                );
            }
        }
        self.set_state(StreamState::Errored);
    }

    fn transcript(&self, text: String, confidence: Option<f32>) -> Transcript {
        Transcript {
            text,
            confidence,
            language: self.language.clone(),
        }
    }

    fn set_state(&self, next: StreamState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }
}

/// Map a server close code to the pump outcome
fn classify_close(code: Option<u16>, done_sent: bool) -> Pump {
    match code {
        Some(CLOSE_AUTH) => Pump::Terminal(SttError::Auth(
            "server closed with policy violation (1008)".to_string(),
        )),
        Some(CLOSE_NORMAL) | Some(CLOSE_GOING_AWAY) if done_sent => Pump::Finished,
        Some(CLOSE_SERVER_ERROR) => Pump::Lost("server error (close 1011)".to_string()),
        other => Pump::Lost(format!("socket closed (code {:?}) before input ended", other)),
    }
}

/// Exponential backoff before jitter: `min(max, base * 2^(attempt-1))`
fn backoff_ms(config: &SttConfig, attempt: u32) -> u64 {
    let shift = (attempt.saturating_sub(1)).min(16);
    config
        .base_backoff_ms
        .saturating_mul(1u64 << shift)
        .min(config.max_backoff_ms)
}

/// Spread a delay by +-20% using sub-millisecond clock noise
fn jitter(ms: u64) -> u64 {
    let span = ms / 5;
    if span == 0 {
        return ms.max(1);
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    ms - span + nanos % (2 * span + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> SttConfig {
        let mut cfg = SttConfig::new("test_key", "ws://127.0.0.1:1/ws");
        cfg.base_backoff_ms = 10;
        cfg.max_backoff_ms = 40;
        cfg.max_reconnects = 2;
        cfg
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut cfg = SttConfig::new("k", "ws://h/ws");
        cfg.base_backoff_ms = 100;
        cfg.max_backoff_ms = 350;

        assert_eq!(backoff_ms(&cfg, 1), 100);
        assert_eq!(backoff_ms(&cfg, 2), 200);
        assert_eq!(backoff_ms(&cfg, 3), 350);
        assert_eq!(backoff_ms(&cfg, 10), 350);
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        for _ in 0..100 {
            let v = jitter(1000);
            assert!((800..=1200).contains(&v), "jitter out of range: {}", v);
        }
        // Tiny delays degrade gracefully
        assert!(jitter(1) >= 1);
    }

    #[test]
    fn test_close_classification() {
        assert!(matches!(
            classify_close(Some(1008), false),
            Pump::Terminal(SttError::Auth(_))
        ));
        assert!(matches!(classify_close(Some(1000), true), Pump::Finished));
        assert!(matches!(classify_close(Some(1001), true), Pump::Finished));
        // Normal close before Done still counts as a loss
        assert!(matches!(classify_close(Some(1000), false), Pump::Lost(_)));
        assert!(matches!(classify_close(Some(1011), true), Pump::Lost(_)));
        assert!(matches!(classify_close(None, false), Pump::Lost(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unreachable_backend_surfaces_terminal_error() {
        let config = Arc::new(fast_config());
        let pool = Arc::new(ConnectionPool::new(&config));
        let mut stream = SttStream::spawn(config, pool.clone());

        // All mint attempts fail fast; the session must end with exactly one
        // terminal error event
        let event = stream.next_event().await.expect("terminal event");
        assert!(matches!(event.kind, SpeechEventKind::Error(_)));
        assert!(stream.next_event().await.is_none());
        assert_eq!(stream.state(), StreamState::Errored);

        pool.close_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_push_after_end_input_is_ignored() {
        let config = Arc::new(fast_config());
        let pool = Arc::new(ConnectionPool::new(&config));
        let mut stream = SttStream::spawn(config, pool.clone());

        stream.end_input();
        stream.end_input(); // idempotent

        let frame = AudioFrame::new(vec![0i16; 160], 16000, 1);
        assert!(stream.push(frame).await.is_ok());

        stream.close().await;
        pool.close_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_push_rejects_malformed_frame() {
        let config = Arc::new(fast_config());
        let pool = Arc::new(ConnectionPool::new(&config));
        let mut stream = SttStream::spawn(config, pool.clone());

        let bad = AudioFrame::new(vec![0i16; 160], 0, 1);
        assert!(matches!(
            stream.push(bad).await,
            Err(SttError::AudioFormat(_))
        ));

        stream.close().await;
        pool.close_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_during_reconnect_is_deterministic() {
        let mut cfg = fast_config();
        cfg.base_backoff_ms = 5000;
        cfg.max_backoff_ms = 5000;
        let config = Arc::new(cfg);
        let pool = Arc::new(ConnectionPool::new(&config));
        let mut stream = SttStream::spawn(config, pool.clone());

        // Give the driver time to fail its first attempt and enter backoff
        tokio::time::sleep(Duration::from_millis(200)).await;
        stream.close().await;

        let state = stream.state();
        assert!(
            state == StreamState::Finished || state == StreamState::Errored,
            "unexpected state {:?}",
            state
        );
        pool.close_all().await;
    }
}
