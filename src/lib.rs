//! Real-time speech-to-text streaming client
//!
//! Bridges live PCM audio tracks to a remote ASR service over WebSocket,
//! turning a continuous frame stream into a finite sequence of interim and
//! final transcription events. Authentication, connection pooling, audio
//! resampling, chunking, protocol framing, and reconnection are handled
//! internally.
//!
//! # Architecture
//!
//! ```text
//! media runtime ──▶ SttStream::push ──▶ Resampler ──▶ Chunker ──┐
//!                                                               ▼
//!                           ConnectionPool ◀── ticket ── TokenExchanger
//!                                 │                           ▲
//!                                 ▼                           │ HTTPS
//!                            Connection ── binary PCM ──▶ ASR backend
//!                                 │                           │
//!                                 ◀──── partial/final JSON ───┘
//!                                 ▼
//!                       SttStream events ──▶ consumer
//! ```
//!
//! # Example
//!
//! ```no_run
//! use voxtream::{AudioFrame, SpeechEventKind, SttClient, SttConfig};
//!
//! # async fn run() -> Result<(), voxtream::SttError> {
//! let client = SttClient::new(SttConfig::new(
//!     std::env::var("ASR_API_KEY").unwrap_or_default(),
//!     "wss://asr.example.com/ws",
//! ))?;
//!
//! let mut stream = client.stream();
//! stream.push(AudioFrame::new(vec![0i16; 1600], 16000, 1)).await?;
//! stream.end_input();
//!
//! while let Some(event) = stream.next_event().await {
//!     match event.kind {
//!         SpeechEventKind::Interim(t) => println!("[interim] {}", t.text),
//!         SpeechEventKind::Final(t) => println!("[final] {}", t.text),
//!         SpeechEventKind::Error(e) => eprintln!("failed: {}", e),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod audio;
mod client;
mod config;
mod connection;
mod error;
mod metrics;
mod pool;
mod protocol;
mod session;
mod token;

pub use audio::{AudioFrame, Chunker, Resampler};
pub use client::SttClient;
pub use config::SttConfig;
pub use error::SttError;
pub use metrics::{MetricsSnapshot, StreamMetrics};
pub use session::{
    EventReceiver, SpeechEvent, SpeechEventKind, StreamState, SttStream, Transcript,
};
