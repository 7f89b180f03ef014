//! ASR wire protocol types
//!
//! JSON message shapes exchanged with the ASR backend over WebSocket.
//!
//! # Protocol overview
//!
//! 1. Server greets with `{"status":"connected"}` after the socket opens
//! 2. Client sends `{"config":{"lang":"fr","sample_rate":16000}}`
//! 3. Client streams raw mono little-endian int16 PCM as binary frames
//! 4. Server sends `{"type":"partial",...}` and `{"type":"final",...}` events
//! 5. Client sends the literal text frame `"Done"` to end input
//! 6. Server flushes remaining finals and closes with code 1000/1001

use serde::{Deserialize, Serialize};

/// End-of-input signal, sent as a bare text frame (not JSON)
pub(crate) const DONE_SIGNAL: &str = "Done";

/// Close code: normal shutdown
pub(crate) const CLOSE_NORMAL: u16 = 1000;

/// Close code: going away (also used by the backend for scripted restarts)
pub(crate) const CLOSE_GOING_AWAY: u16 = 1001;

/// Close code: authentication rejected
pub(crate) const CLOSE_AUTH: u16 = 1008;

/// Close code: internal server error
pub(crate) const CLOSE_SERVER_ERROR: u16 = 1011;

/// Greeting sent by the server right after the socket opens
#[derive(Debug, Deserialize)]
pub(crate) struct Handshake {
    pub status: String,
}

impl Handshake {
    pub fn is_connected(&self) -> bool {
        self.status == "connected"
    }
}

/// Session configuration, the first client message after the greeting
#[derive(Debug, Serialize)]
pub(crate) struct ConfigMessage<'a> {
    config: ConfigBody<'a>,
}

#[derive(Debug, Serialize)]
struct ConfigBody<'a> {
    lang: &'a str,
    sample_rate: u32,
}

impl<'a> ConfigMessage<'a> {
    pub fn new(language: &'a str, sample_rate: u32) -> Self {
        Self {
            config: ConfigBody {
                lang: language,
                sample_rate,
            },
        }
    }

    pub fn to_json(&self) -> String {
        // Serialization of two scalar fields cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Transcription events received from the server
///
/// Messages with an unrecognized `type` tag deserialize to `Unknown` and are
/// dropped by the reader with a warning; shapes without a `type` field fail to
/// parse and are dropped the same way.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum ServerEvent {
    /// Provisional transcription, may be superseded
    #[serde(rename = "partial")]
    Partial {
        text: String,
        #[serde(default)]
        confidence: Option<f32>,
    },

    /// Stable transcription of an utterance, never revised
    #[serde(rename = "final")]
    Final {
        text: String,
        #[serde(default)]
        confidence: Option<f32>,
    },

    /// Catch-all so future server message types do not break the stream
    #[serde(other)]
    Unknown,
}
