//! Error taxonomy for the streaming client
//!
//! A single enum covers every failure the consumer can observe. Errors are
//! `Clone` so a terminal failure can ride the event channel as the last item.
//!
//! # Retry classification
//!
//! `Auth` and `Config` are terminal: retrying cannot help. `Network`,
//! `Service`, `Protocol` and `ConnectionLost` are handled by the session's
//! reconnection policy while attempts remain. `AudioFormat` is reported on the
//! offending `push` call and the session continues.

/// Errors surfaced by the streaming speech-to-text client
#[derive(Debug, Clone)]
pub enum SttError {
    /// Invalid API key, rejected token, or server close code 1008
    Auth(String),
    /// Transport failure: DNS, TCP, TLS, socket reset, pool wait timeout
    Network(String),
    /// Server-side failure: 5xx from the token endpoint or close code 1011
    Service { status: u16, message: String },
    /// Malformed server frame or unexpected handshake
    Protocol(String),
    /// Invalid audio frame pushed by the caller
    AudioFormat(String),
    /// Invalid user configuration, raised at construction
    Config(String),
    /// Socket closed before the end-of-input signal was acknowledged
    ConnectionLost(String),
}

impl SttError {
    /// Whether retrying under the reconnection policy can possibly succeed
    pub fn is_terminal(&self) -> bool {
        matches!(self, SttError::Auth(_) | SttError::Config(_))
    }

    /// Short machine-readable label, used in log lines and error events
    pub fn kind(&self) -> &'static str {
        match self {
            SttError::Auth(_) => "auth",
            SttError::Network(_) => "network",
            SttError::Service { .. } => "service",
            SttError::Protocol(_) => "protocol",
            SttError::AudioFormat(_) => "audio_format",
            SttError::Config(_) => "config",
            SttError::ConnectionLost(_) => "connection_lost",
        }
    }
}

impl std::fmt::Display for SttError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SttError::Auth(e) => write!(f, "Authentication failed: {}", e),
            SttError::Network(e) => write!(f, "Network error: {}", e),
            SttError::Service { status, message } => {
                write!(f, "ASR service error ({}): {}", status, message)
            }
            SttError::Protocol(e) => write!(f, "Protocol error: {}", e),
            SttError::AudioFormat(e) => write!(f, "Invalid audio frame: {}", e),
            SttError::Config(e) => write!(f, "Invalid configuration: {}", e),
            SttError::ConnectionLost(e) => write!(f, "Connection lost: {}", e),
        }
    }
}

impl std::error::Error for SttError {}
