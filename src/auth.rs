//! Shared-secret check for inbound webhooks.

use axum::http::HeaderMap;
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::WebhookConfig;
use crate::error::AuthError;

/// Header set by Cloudflare email workers.
const RELAY_SECRET_HEADER: &str = "cf-webhook-auth";

/// Validates the shared secret presented by the email relay.
///
/// With no secret configured every request is accepted (local testing).
#[derive(Debug, Clone)]
pub struct WebhookAuthenticator {
    secret: Option<SecretString>,
    header_name: String,
}

impl WebhookAuthenticator {
    pub fn new(secret: Option<SecretString>, header_name: impl Into<String>) -> Self {
        let authenticator = Self {
            secret,
            header_name: header_name.into().to_ascii_lowercase(),
        };
        if authenticator.is_permissive() {
            warn!("No webhook secret configured: inbound webhooks are NOT authenticated");
        }
        authenticator
    }

    pub fn from_config(config: &WebhookConfig) -> Self {
        Self::new(config.secret.clone(), config.header_name.clone())
    }

    pub fn is_permissive(&self) -> bool {
        self.secret.is_none()
    }

    /// Check the request headers against the configured secret.
    pub fn verify(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let Some(secret) = &self.secret else {
            debug!("Webhook accepted in permissive mode");
            return Ok(());
        };

        let Some(presented) = presented_credential(headers, &self.header_name) else {
            warn!(header = %self.header_name, "Webhook rejected: no credential presented");
            return Err(AuthError::Unauthorized("missing credential"));
        };

        if secrets_match(secret.expose_secret(), presented) {
            Ok(())
        } else {
            warn!(header = %self.header_name, "Webhook rejected: credential mismatch");
            Err(AuthError::Unauthorized("credential mismatch"))
        }
    }
}

/// First credential found in: the configured header, the relay header,
/// then an `Authorization: Bearer` token.
fn presented_credential<'a>(headers: &'a HeaderMap, header_name: &str) -> Option<&'a str> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header(header_name)
        .or_else(|| header(RELAY_SECRET_HEADER))
        .or_else(|| {
            header("authorization")
                .and_then(|v| v.split_once(' '))
                .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
                .map(|(_, token)| token.trim())
        })
}

fn secrets_match(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn auth(secret: Option<&str>) -> WebhookAuthenticator {
        WebhookAuthenticator::new(secret.map(SecretString::from), "x-webhook-secret")
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn permissive_mode_accepts_anything() {
        let a = auth(None);
        assert!(a.is_permissive());
        assert!(a.verify(&HeaderMap::new()).is_ok());
        assert!(a.verify(&headers(&[("x-webhook-secret", "whatever")])).is_ok());
    }

    #[test]
    fn matching_secret_accepted() {
        let a = auth(Some("s3cret"));
        assert!(a.verify(&headers(&[("x-webhook-secret", "s3cret")])).is_ok());
    }

    #[test]
    fn relay_header_and_bearer_accepted() {
        let a = auth(Some("s3cret"));
        assert!(a.verify(&headers(&[("cf-webhook-auth", "s3cret")])).is_ok());
        assert!(a.verify(&headers(&[("authorization", "Bearer s3cret")])).is_ok());
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let a = auth(Some("s3cret"));
        assert!(a.verify(&headers(&[("authorization", "bearer s3cret")])).is_ok());
        assert!(a.verify(&headers(&[("authorization", "BEARER s3cret")])).is_ok());
        assert_eq!(
            a.verify(&headers(&[("authorization", "Basic s3cret")])),
            Err(AuthError::Unauthorized("missing credential"))
        );
    }

    #[test]
    fn mismatch_rejected() {
        let a = auth(Some("s3cret"));
        assert_eq!(
            a.verify(&headers(&[("x-webhook-secret", "wrong")])),
            Err(AuthError::Unauthorized("credential mismatch"))
        );
        assert_eq!(
            a.verify(&headers(&[("x-webhook-secret", "s3cret-but-longer")])),
            Err(AuthError::Unauthorized("credential mismatch"))
        );
    }

    #[test]
    fn missing_credential_rejected() {
        let a = auth(Some("s3cret"));
        assert_eq!(
            a.verify(&HeaderMap::new()),
            Err(AuthError::Unauthorized("missing credential"))
        );
    }

    #[test]
    fn custom_header_name_is_case_insensitive() {
        let a = WebhookAuthenticator::new(Some(SecretString::from("k")), "X-Relay-Token");
        assert!(a.verify(&headers(&[("x-relay-token", "k")])).is_ok());
    }
}
