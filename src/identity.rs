//! Identity resolution: sender address to canonical cross-channel user ID.
//!
//! The resolver never fails a request: when the identity service is
//! unavailable the address becomes its own identity.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::IdentityConfig;
use crate::error::IdentityError;
use crate::pipeline::Resolution;

/// A resolved user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub canonical_user_id: String,
    pub display_name: Option<String>,
    pub is_new_user: bool,
}

/// Answer from the identity service's resolve endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedIdentity {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_new_user: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedIdentity {
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentityRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    value: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<&'a str>,
}

/// Remote identity store.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Look up the user owning an email address.
    async fn resolve(
        &self,
        address: &str,
        display_name: Option<&str>,
    ) -> Result<ResolvedIdentity, IdentityError>;

    /// Register a new identity and return its user ID.
    async fn create(&self, address: &str, display_name: &str) -> Result<String, IdentityError>;
}

/// Identity service reached over HTTP.
pub struct HttpIdentityService {
    client: reqwest::Client,
    base_url: String,
    secret: Option<SecretString>,
}

impl HttpIdentityService {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, secret: Option<SecretString>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret,
        }
    }

    pub fn from_config(client: reqwest::Client, config: &IdentityConfig) -> Self {
        Self::new(client, config.base_url.clone(), config.secret.clone())
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &IdentityRequest<'_>,
    ) -> Result<T, IdentityError> {
        let mut request = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body);
        if let Some(secret) = &self.secret {
            request = request.bearer_auth(secret.expose_secret());
        }

        let resp = request
            .send()
            .await
            .map_err(|e| IdentityError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(IdentityError::Status {
                status: status.as_u16(),
                body,
            });
        }

        resp.json::<T>()
            .await
            .map_err(|e| IdentityError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl IdentityService for HttpIdentityService {
    async fn resolve(
        &self,
        address: &str,
        display_name: Option<&str>,
    ) -> Result<ResolvedIdentity, IdentityError> {
        let body = IdentityRequest {
            kind: "email",
            value: address,
            display_name,
        };
        self.post("/api/identity/resolve", &body).await
    }

    async fn create(&self, address: &str, display_name: &str) -> Result<String, IdentityError> {
        let body = IdentityRequest {
            kind: "email",
            value: address,
            display_name: Some(display_name),
        };
        let created: CreatedIdentity = self.post("/api/identity/create", &body).await?;
        created
            .user_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| IdentityError::InvalidResponse("missing userId".to_string()))
    }
}

/// Maps addresses to canonical users with a degraded fallback.
#[derive(Clone)]
pub struct IdentityResolver {
    service: Arc<dyn IdentityService>,
}

impl IdentityResolver {
    pub fn new(service: Arc<dyn IdentityService>) -> Self {
        Self { service }
    }

    /// Resolve an address. Never fails.
    ///
    /// A service answer without a user ID triggers `create_identity`.
    pub async fn resolve(&self, address: &str, display_name: Option<&str>) -> Resolution<Identity> {
        let address = address.trim();

        match self.service.resolve(address, display_name).await {
            Ok(resolved) => {
                if let Some(user_id) = resolved.user_id.filter(|id| !id.trim().is_empty()) {
                    debug!(address, user_id = %user_id, "Identity resolved");
                    return Resolution::Resolved(Identity {
                        canonical_user_id: user_id,
                        display_name: resolved.display_name.or_else(|| display_name.map(str::to_string)),
                        is_new_user: resolved.is_new_user,
                    });
                }

                match self.create_identity(address, display_name).await {
                    Some(user_id) => Resolution::Resolved(Identity {
                        canonical_user_id: user_id,
                        display_name: display_name.map(str::to_string),
                        is_new_user: true,
                    }),
                    None => Resolution::degraded(
                        fallback_identity(address, display_name),
                        "identity creation failed",
                    ),
                }
            }
            Err(e) => {
                warn!(address, error = %e, "Identity service unavailable, using address as identity");
                Resolution::degraded(fallback_identity(address, display_name), e.to_string())
            }
        }
    }

    /// Register a new identity. `None` on any failure.
    pub async fn create_identity(&self, address: &str, display_name: Option<&str>) -> Option<String> {
        let name = display_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_display_name(address));

        match self.service.create(address, &name).await {
            Ok(user_id) => {
                info!(address, user_id = %user_id, "Created identity");
                Some(user_id)
            }
            Err(e) => {
                warn!(address, error = %e, "Failed to create identity");
                None
            }
        }
    }
}

/// The address stands in for the user.
pub fn fallback_identity(address: &str, display_name: Option<&str>) -> Identity {
    Identity {
        canonical_user_id: address.to_string(),
        display_name: display_name.map(str::to_string),
        is_new_user: true,
    }
}

/// `"Email User <local-part>"`.
pub fn default_display_name(address: &str) -> String {
    let local = address.split('@').next().unwrap_or(address);
    format!("Email User {local}")
}
