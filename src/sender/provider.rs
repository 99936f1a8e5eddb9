//! Outbound mail provider (Resend-compatible HTTP API).

use std::collections::BTreeMap;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SendError;

/// Request body of `POST /emails`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundEmail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
    pub text: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Sent as the `Idempotency-Key` request header, not in the body.
    #[serde(skip)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    id: Option<String>,
}

/// Transmits a formatted email. Returns the provider's message id.
#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn deliver(&self, email: &OutboundEmail) -> Result<String, SendError>;
}

pub struct HttpMailProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: SecretString,
}

impl HttpMailProvider {
    pub fn new(client: reqwest::Client, api_url: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl MailProvider for HttpMailProvider {
    async fn deliver(&self, email: &OutboundEmail) -> Result<String, SendError> {
        let mut request = self
            .client
            .post(format!("{}/emails", self.api_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(email);
        if let Some(key) = &email.idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SendError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ProviderResponse = resp
            .json()
            .await
            .map_err(|e| SendError::InvalidResponse(e.to_string()))?;
        let id = parsed
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SendError::InvalidResponse("missing id".to_string()))?;
        debug!(provider_id = %id, "Mail provider accepted message");
        Ok(id)
    }
}
