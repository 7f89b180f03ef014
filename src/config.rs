//! Client configuration
//!
//! A fixed record validated once at construction. Every field is immutable
//! after the client is built; invalid values raise `SttError::Config` before
//! any network activity happens.

use serde::{Deserialize, Serialize};

use crate::error::SttError;

/// Lower bound for `chunk_duration_ms`
const MIN_CHUNK_MS: u32 = 20;

/// Upper bound for `chunk_duration_ms`
const MAX_CHUNK_MS: u32 = 1000;

/// Configuration for [`SttClient`](crate::SttClient)
///
/// `api_key` is the only field without a usable default. The key is sent
/// exclusively as an `Authorization` header during token exchange and never
/// appears in WebSocket URLs or log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Long-lived API key, traded for short-lived WebSocket tickets.
    #[serde(skip_serializing)]
    pub api_key: String,

    /// WSS base for the audio connection, e.g. `wss://asr.example.com/ws`.
    pub base_url: String,

    /// HTTPS base for token exchange. When empty, derived from `base_url`
    /// (scheme swapped, trailing `/ws` segment replaced by `/token`).
    pub token_url: String,

    /// Language tag passed to the ASR backend (e.g. `fr`, `fr-medical`).
    pub language: String,

    /// Target ASR sample rate in Hz. Inbound frames at other rates are
    /// resampled down/up to this rate before chunking.
    pub sample_rate: u32,

    /// When false, interim results are filtered out and the consumer only
    /// sees finals.
    pub interim_results: bool,

    /// Maximum concurrent WebSocket connections kept by the pool.
    pub connection_pool_size: usize,

    /// Duration of one binary audio frame in milliseconds.
    pub chunk_duration_ms: u32,

    /// Consecutive reconnection attempts before a session gives up.
    pub max_reconnects: u32,

    /// Base delay for exponential reconnect backoff, in milliseconds.
    pub base_backoff_ms: u64,

    /// Ceiling for the reconnect backoff, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: String::new(),
            token_url: String::new(),
            language: "fr".to_string(),
            sample_rate: 16000,
            interim_results: true,
            connection_pool_size: 2,
            chunk_duration_ms: 100,
            max_reconnects: 3,
            base_backoff_ms: 1000,
            max_backoff_ms: 10_000,
        }
    }
}

impl SttConfig {
    /// Convenience constructor for the common case
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Check every field, returning `SttError::Config` on the first problem
    pub fn validate(&self) -> Result<(), SttError> {
        if self.api_key.is_empty() {
            return Err(SttError::Config("api_key must not be empty".to_string()));
        }
        if !self.base_url.starts_with("wss://") && !self.base_url.starts_with("ws://") {
            return Err(SttError::Config(format!(
                "base_url must use ws:// or wss://, got {:?}",
                self.base_url
            )));
        }
        if !self.token_url.is_empty()
            && !self.token_url.starts_with("https://")
            && !self.token_url.starts_with("http://")
        {
            return Err(SttError::Config(format!(
                "token_url must use http:// or https://, got {:?}",
                self.token_url
            )));
        }
        if self.language.is_empty() {
            return Err(SttError::Config("language must not be empty".to_string()));
        }
        if self.sample_rate == 0 {
            return Err(SttError::Config("sample_rate must be positive".to_string()));
        }
        if self.connection_pool_size == 0 {
            return Err(SttError::Config(
                "connection_pool_size must be at least 1".to_string(),
            ));
        }
        if self.chunk_duration_ms < MIN_CHUNK_MS || self.chunk_duration_ms > MAX_CHUNK_MS {
            return Err(SttError::Config(format!(
                "chunk_duration_ms must be within {}..={}, got {}",
                MIN_CHUNK_MS, MAX_CHUNK_MS, self.chunk_duration_ms
            )));
        }
        if self.base_backoff_ms == 0 {
            return Err(SttError::Config(
                "base_backoff_ms must be positive".to_string(),
            ));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(SttError::Config(
                "max_backoff_ms must be >= base_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// HTTPS endpoint for token exchange
    ///
    /// Uses `token_url` when configured, otherwise derives it from `base_url`
    /// by swapping the scheme and replacing a trailing `/ws` segment with
    /// `/token`.
    pub fn token_endpoint(&self) -> String {
        if !self.token_url.is_empty() {
            return self.token_url.clone();
        }

        let http_base = self
            .base_url
            .replacen("wss://", "https://", 1)
            .replacen("ws://", "http://", 1);
        let http_base = http_base.trim_end_matches('/');
        match http_base.strip_suffix("/ws") {
            Some(root) => format!("{}/token", root),
            None => format!("{}/token", http_base),
        }
    }

    /// Size of one binary audio frame in bytes (mono int16 at `sample_rate`)
    pub fn chunk_bytes(&self) -> usize {
        (self.sample_rate as usize * self.chunk_duration_ms as usize / 1000) * 2
    }

    /// Capacity of the uplink frame queue: two seconds worth of chunks
    pub(crate) fn uplink_queue_depth(&self) -> usize {
        ((2000 / self.chunk_duration_ms) as usize).max(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> SttConfig {
        SttConfig::new("key_123", "wss://asr.example.com/ws")
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_empty_api_key_rejected() {
        let cfg = SttConfig::new("", "wss://asr.example.com/ws");
        assert!(matches!(cfg.validate(), Err(SttError::Config(_))));
    }

    #[test]
    fn test_bad_scheme_rejected() {
        let cfg = SttConfig::new("key", "https://asr.example.com/ws");
        assert!(matches!(cfg.validate(), Err(SttError::Config(_))));
    }

    #[test]
    fn test_zero_pool_rejected() {
        let mut cfg = valid();
        cfg.connection_pool_size = 0;
        assert!(matches!(cfg.validate(), Err(SttError::Config(_))));
    }

    #[test]
    fn test_chunk_duration_bounds() {
        let mut cfg = valid();
        cfg.chunk_duration_ms = 10;
        assert!(cfg.validate().is_err());
        cfg.chunk_duration_ms = 1500;
        assert!(cfg.validate().is_err());
        cfg.chunk_duration_ms = 20;
        assert!(cfg.validate().is_ok());
        cfg.chunk_duration_ms = 1000;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_token_endpoint_derived_from_base() {
        let cfg = valid();
        assert_eq!(cfg.token_endpoint(), "https://asr.example.com/token");

        let cfg = SttConfig::new("key", "ws://localhost:8765/ws");
        assert_eq!(cfg.token_endpoint(), "http://localhost:8765/token");
    }

    #[test]
    fn test_token_endpoint_explicit_wins() {
        let mut cfg = valid();
        cfg.token_url = "https://auth.example.com/v2/token".to_string();
        assert_eq!(cfg.token_endpoint(), "https://auth.example.com/v2/token");
    }

    #[test]
    fn test_chunk_bytes() {
        // 16000 Hz * 100ms / 1000 = 1600 samples = 3200 bytes
        assert_eq!(valid().chunk_bytes(), 3200);

        let mut cfg = valid();
        cfg.chunk_duration_ms = 50;
        assert_eq!(cfg.chunk_bytes(), 1600);
    }

    #[test]
    fn test_api_key_not_serialized() {
        let json = serde_json::to_string(&valid()).unwrap();
        assert!(!json.contains("key_123"));
    }
}
