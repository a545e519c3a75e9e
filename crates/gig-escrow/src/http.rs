//! HTTP settlement gateway.
//!
//! Posts each leg to `{base_url}/settlements` with the intent id in the
//! `Idempotency-Key` header. Response mapping:
//!
//! - 200/201 with `{"settlement_reference": ..}` → confirmed
//! - 202 → accepted, acknowledgment follows
//! - 408, 429, 5xx, timeouts, connection errors → transient
//! - any other status → permanent

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::gateway::{GatewayError, GatewayResponse, SettlementGateway};
use crate::plan::SettlementIntent;

/// Header carrying the intent id.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Connection settings for [`HttpSettlementGateway`].
#[derive(Clone)]
pub struct HttpGatewayConfig {
    /// Base URL, e.g. `https://payments.internal/v1`.
    pub base_url: String,
    /// Bearer token, if the gateway requires one.
    pub api_key: Option<String>,
    /// Per-request timeout in seconds (default: 10).
    pub timeout_secs: u64,
}

impl HttpGatewayConfig {
    /// Configuration with the default timeout and no credentials.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            timeout_secs: 10,
        }
    }

    /// Attach a bearer token.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

impl std::fmt::Debug for HttpGatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGatewayConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ConfirmationBody {
    settlement_reference: String,
}

/// Real HTTP client for the settlement rail.
#[derive(Debug)]
pub struct HttpSettlementGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSettlementGateway {
    /// Build a gateway client from configuration.
    pub fn new(config: HttpGatewayConfig) -> Result<Self, GatewayError> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = &config.api_key {
            headers.insert(
                reqwest::header::AUTHORIZATION,
                reqwest::header::HeaderValue::from_str(&format!("Bearer {key}"))
                    .map_err(|_| GatewayError::Permanent("invalid API key characters".into()))?,
            );
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| GatewayError::Permanent(format!("failed to build HTTP client: {e}")))?;
        let base_url = config.base_url.trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl SettlementGateway for HttpSettlementGateway {
    async fn dispatch(&self, intent: &SettlementIntent) -> Result<GatewayResponse, GatewayError> {
        let url = format!("{}/settlements", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header(IDEMPOTENCY_HEADER, intent.intent_id.to_string())
            .json(intent)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(format!("POST {url}: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(GatewayResponse::Accepted);
        }
        if status.is_success() {
            let body: ConfirmationBody = resp.json().await.map_err(|e| {
                GatewayError::Transient(format!("unreadable confirmation from {url}: {e}"))
            })?;
            return Ok(GatewayResponse::Confirmed {
                settlement_reference: body.settlement_reference,
            });
        }

        let body = resp.text().await.unwrap_or_default();
        if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
        {
            Err(GatewayError::Transient(format!("HTTP {status}: {body}")))
        } else {
            Err(GatewayError::Permanent(format!("HTTP {status}: {body}")))
        }
    }

    fn name(&self) -> &str {
        "HttpSettlementGateway"
    }
}
