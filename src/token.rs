//! HTTPS token exchange
//!
//! Trades the long-lived API key for a single-use WebSocket URL. The key
//! travels only in the `Authorization` header of this request; WebSocket URLs
//! carry the short-lived ticket instead, so the key never reaches query
//! strings or socket logs.

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

use crate::config::SttConfig;
use crate::error::SttError;

/// Timeout for one token exchange round trip
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Global HTTP client for reuse across requests (avoids TLS handshake overhead)
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn get_http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(EXCHANGE_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client")
    })
}

/// Token endpoint response, either shape
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    ws_url: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

/// Mints single-use WebSocket URLs from the configured API key
#[derive(Debug)]
pub(crate) struct TokenExchanger {
    api_key: String,
    token_url: String,
    ws_base: String,
}

impl TokenExchanger {
    pub fn new(config: &SttConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            token_url: config.token_endpoint(),
            ws_base: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Exchange the API key for a connectable WebSocket URL
    ///
    /// Tokens are opaque and single-use; nothing is cached here.
    pub async fn mint(&self, language: &str, sample_rate: u32) -> Result<String, SttError> {
        let response = get_http_client()
            .post(&self.token_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .query(&[
                ("lang", language.to_string()),
                ("sample_rate", sample_rate.to_string()),
            ])
            .send()
            .await
            .map_err(|e| SttError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(SttError::Auth(format!(
                "token endpoint rejected the API key ({})",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SttError::Service {
                status: status.as_u16(),
                message,
            });
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| SttError::Protocol(format!("malformed token response: {}", e)))?;

        let ws_url = match (body.ws_url, body.token) {
            (Some(url), _) => url,
            (None, Some(token)) => format!(
                "{}?token={}&lang={}&sample_rate={}",
                self.ws_base, token, language, sample_rate
            ),
            (None, None) => {
                return Err(SttError::Protocol(
                    "token response had neither ws_url nor token".to_string(),
                ))
            }
        };

        log::debug!("Token: minted ticket for lang={}", language);
        Ok(ws_url)
    }
}
