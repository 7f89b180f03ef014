//! Configured entry point
//!
//! `SttClient` validates the configuration once, owns the connection pool,
//! and hands out per-track [`SttStream`]s. Multiple clients in one process
//! are fully independent; nothing here is global except the TLS provider
//! registration.

use std::sync::{Arc, OnceLock, Once};

use crate::config::SttConfig;
use crate::error::SttError;
use crate::pool::ConnectionPool;
use crate::session::SttStream;

static CRYPTO_PROVIDER: Once = Once::new();

/// Factory for streaming transcription sessions
///
/// Construction is cheap and synchronous; the pool and its connections come
/// to life lazily when the first stream is created, which is why `stream()`
/// must be called from within a Tokio runtime.
#[derive(Debug)]
pub struct SttClient {
    config: Arc<SttConfig>,
    pool: OnceLock<Arc<ConnectionPool>>,
}

impl SttClient {
    /// Validate the configuration and build a client
    ///
    /// Returns `SttError::Config` synchronously on any invalid field.
    pub fn new(config: SttConfig) -> Result<Self, SttError> {
        config.validate()?;

        CRYPTO_PROVIDER.call_once(|| {
            // The rustls connector needs one process-wide default provider
            let _ = rustls::crypto::ring::default_provider().install_default();
        });

        log::info!(
            "SttClient: configured (lang={}, rate={}, pool={})",
            config.language,
            config.sample_rate,
            config.connection_pool_size
        );

        Ok(Self {
            config: Arc::new(config),
            pool: OnceLock::new(),
        })
    }

    /// Start a new streaming session for one audio track
    pub fn stream(&self) -> SttStream {
        SttStream::spawn(self.config.clone(), self.shared_pool())
    }

    pub fn config(&self) -> &SttConfig {
        &self.config
    }

    /// Close every pooled connection and refuse new acquisitions
    ///
    /// Streams still running will fail over to their reconnect path and end;
    /// call this after the sessions you care about have finished.
    pub async fn shutdown(&self) {
        if let Some(pool) = self.pool.get() {
            log::info!("SttClient: shutting down");
            pool.close_all().await;
        }
    }

    fn shared_pool(&self) -> Arc<ConnectionPool> {
        self.pool
            .get_or_init(|| Arc::new(ConnectionPool::new(&self.config)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_is_rejected_synchronously() {
        let err = SttClient::new(SttConfig::default()).unwrap_err();
        assert!(matches!(err, SttError::Config(_)));

        let mut cfg = SttConfig::new("key", "wss://asr.example.com/ws");
        cfg.chunk_duration_ms = 5;
        assert!(SttClient::new(cfg).is_err());
    }

    #[test]
    fn test_valid_config_is_accepted() {
        let client =
            SttClient::new(SttConfig::new("key", "wss://asr.example.com/ws")).unwrap();
        assert_eq!(client.config().language, "fr");
    }

    #[tokio::test]
    async fn test_shutdown_without_streams_is_a_noop() {
        let client =
            SttClient::new(SttConfig::new("key", "wss://asr.example.com/ws")).unwrap();
        // No pool was ever created; this must not panic or hang
        client.shutdown().await;
    }
}
