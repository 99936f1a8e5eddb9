//! Reply sender: validates outbound mail and hands it to the provider.

pub mod format;
pub mod provider;

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::MailConfig;
use crate::error::SendError;

pub use format::{normalize_subject, render_html_document, text_to_html};
pub use provider::{HttpMailProvider, MailProvider, OutboundEmail};

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid"));

/// Subject of the notice sent when a message could not be processed.
pub const FAILURE_NOTICE_SUBJECT: &str = "We couldn't process your message";

/// Body of the failure notice.
pub const FAILURE_NOTICE_BODY: &str = "Sorry, we are temporarily unable to process your message. \
Please try again in a little while.";

/// A message accepted by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SentEmail {
    /// Provider-side id.
    pub provider_id: String,
    /// The `Message-ID` header we set.
    pub message_id: String,
    pub subject: String,
}

pub type SendResult = Result<SentEmail, SendError>;

#[derive(Clone)]
pub struct ReplySender {
    provider: Arc<dyn MailProvider>,
    from_address: String,
    max_subject_len: usize,
}

impl ReplySender {
    pub fn new(
        provider: Arc<dyn MailProvider>,
        from_address: impl Into<String>,
        max_subject_len: usize,
    ) -> Self {
        Self {
            provider,
            from_address: from_address.into(),
            max_subject_len,
        }
    }

    pub fn from_config(provider: Arc<dyn MailProvider>, config: &MailConfig) -> Self {
        Self::new(provider, config.from_address.clone(), config.max_subject_len)
    }

    /// Send a reply. Validation failures return before any network call.
    ///
    /// With `in_reply_to`, the `In-Reply-To` and `References` headers are set
    /// and the `Message-ID` and idempotency key are derived from it, so a
    /// redelivered inbound message produces the same outbound identifiers.
    pub async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        in_reply_to: Option<&str>,
    ) -> SendResult {
        self.send_tagged(to, subject, body, in_reply_to, "reply").await
    }

    /// Tell the sender their message could not be processed. Never fails.
    pub async fn send_failure_notice(&self, to: &str, in_reply_to: Option<&str>) {
        match self
            .send_tagged(to, FAILURE_NOTICE_SUBJECT, FAILURE_NOTICE_BODY, in_reply_to, "notice")
            .await
        {
            Ok(sent) => info!(to, provider_id = %sent.provider_id, "Failure notice sent"),
            Err(e) => warn!(to, error = %e, "Failure notice could not be sent"),
        }
    }

    async fn send_tagged(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        in_reply_to: Option<&str>,
        tag: &str,
    ) -> SendResult {
        let email = self.prepare(to, subject, body, in_reply_to, tag)?;
        let message_id = email
            .headers
            .get("Message-ID")
            .cloned()
            .unwrap_or_default();

        info!(
            to,
            subject = %email.subject,
            body_len = body.len(),
            in_reply_to = in_reply_to.unwrap_or("-"),
            "Sending email"
        );

        match self.provider.deliver(&email).await {
            Ok(provider_id) => {
                info!(to, provider_id = %provider_id, message_id = %message_id, "Email sent");
                Ok(SentEmail {
                    provider_id,
                    message_id,
                    subject: email.subject,
                })
            }
            Err(e) => {
                error!(to, error = %e, "Failed to send email");
                Err(e)
            }
        }
    }

    /// Check recipient and subject without touching the network.
    ///
    /// The cap applies to the caller's subject; the `Re: ` prefix added on
    /// send does not count against it.
    pub fn validate(&self, to: &str, subject: &str) -> Result<(), SendError> {
        let to = to.trim();
        if !is_valid_address(to) {
            return Err(SendError::InvalidRecipient(to.to_string()));
        }
        let len = subject.chars().count();
        if len > self.max_subject_len {
            return Err(SendError::SubjectTooLong {
                len,
                max: self.max_subject_len,
            });
        }
        Ok(())
    }

    /// Validate and build the provider request.
    pub fn prepare(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        in_reply_to: Option<&str>,
        tag: &str,
    ) -> Result<OutboundEmail, SendError> {
        self.validate(to, subject)?;
        let to = to.trim();
        let subject = normalize_subject(subject);

        if body.trim().is_empty() {
            return Err(SendError::EmptyBody);
        }

        let in_reply_to = in_reply_to.map(str::trim).filter(|v| !v.is_empty());
        let token = match in_reply_to {
            Some(parent) => Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{tag}:{parent}").as_bytes()),
            None => Uuid::new_v4(),
        };

        let mut headers = BTreeMap::new();
        headers.insert(
            "Message-ID".to_string(),
            format!("<{token}@{}>", sender_domain(&self.from_address)),
        );
        if let Some(parent) = in_reply_to {
            headers.insert("In-Reply-To".to_string(), parent.to_string());
            headers.insert("References".to_string(), parent.to_string());
        }

        Ok(OutboundEmail {
            from: self.from_address.clone(),
            to: vec![to.to_string()],
            subject,
            html: render_html_document(body),
            text: body.to_string(),
            headers,
            idempotency_key: in_reply_to.map(|_| format!("{tag}-{token}")),
        })
    }
}

/// `local@domain.tld` shape check.
pub fn is_valid_address(address: &str) -> bool {
    EMAIL_RE.is_match(address)
}

/// Domain part of the from address, for generated Message-IDs.
fn sender_domain(from: &str) -> &str {
    let address = match (from.rfind('<'), from.rfind('>')) {
        (Some(start), Some(end)) if start < end => &from[start + 1..end],
        _ => from,
    };
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim())
        .filter(|d| !d.is_empty())
        .unwrap_or("localhost")
}
