//! Conversation dispatch: hands a normalized message to the AI backend.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::{BackendApi, BackendConfig};
use crate::email::CanonicalMessage;
use crate::error::DispatchError;

/// Reply text used when the backend answers without any.
pub const APOLOGY_REPLY: &str = "Sorry, I couldn't process your message.";

/// Subject used in `respondTo` when the message has none.
const DEFAULT_RESPONSE_SUBJECT: &str = "Assistant Response";

/// Model name sent on the completions endpoint; the backend ignores it.
const COMPLETIONS_MODEL: &str = "gpt-4";

const CHANNEL: &str = "email";

/// Request body of the chat endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub message: String,
    pub user_id: String,
    pub thread_id: String,
    pub channel: &'static str,
    pub respond_to: RespondTo,
    pub metadata: DispatchMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RespondTo {
    pub channel: &'static str,
    pub details: RespondToDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RespondToDetails {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub to: String,
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMetadata {
    pub subject: String,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub original_email: String,
}

impl DispatchRequest {
    pub fn new(message: &CanonicalMessage, user_id: &str, thread_id: &str) -> Self {
        let subject = if message.subject.trim().is_empty() {
            DEFAULT_RESPONSE_SUBJECT.to_string()
        } else {
            message.subject.clone()
        };
        Self {
            message: message.body.clone(),
            user_id: user_id.to_string(),
            thread_id: thread_id.to_string(),
            channel: CHANNEL,
            respond_to: RespondTo {
                channel: CHANNEL,
                details: RespondToDetails {
                    kind: CHANNEL,
                    to: message.from.clone(),
                    subject,
                },
            },
            metadata: DispatchMetadata {
                subject: message.subject.clone(),
                message_id: message.message_id.clone(),
                in_reply_to: message.in_reply_to.clone(),
                original_email: message.from.clone(),
            },
        }
    }
}

/// What the backend answered, before defaults are applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendReply {
    pub text: Option<String>,
    pub capabilities: Vec<Value>,
}

/// A successful dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReply {
    pub text: String,
    pub capabilities: Vec<Value>,
}

pub type DispatchResult = Result<DispatchReply, DispatchError>;

/// The AI processing backend.
#[async_trait]
pub trait ConversationBackend: Send + Sync {
    async fn converse(&self, request: &DispatchRequest) -> Result<BackendReply, DispatchError>;
}

/// Backend reached over HTTP, on either the chat or the completions endpoint.
pub struct HttpConversationBackend {
    client: reqwest::Client,
    base_url: String,
    secret: Option<SecretString>,
    api: BackendApi,
}

impl HttpConversationBackend {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        secret: Option<SecretString>,
        api: BackendApi,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret,
            api,
        }
    }

    pub fn from_config(client: reqwest::Client, config: &BackendConfig) -> Self {
        Self::new(client, config.base_url.clone(), config.secret.clone(), config.api)
    }

    fn endpoint(&self) -> String {
        match self.api {
            BackendApi::Chat => format!("{}/api/chat", self.base_url),
            BackendApi::Completions => format!("{}/api/v1/chat/completions", self.base_url),
        }
    }

    /// OpenAI-style body; the chat API takes the request as is.
    fn completions_body(request: &DispatchRequest) -> Value {
        serde_json::json!({
            "model": COMPLETIONS_MODEL,
            "messages": [{"role": "user", "content": request.message}],
            "user": request.user_id,
            "metadata": {
                "channel": request.channel,
                "threadId": request.thread_id,
                "subject": request.metadata.subject,
                "messageId": request.metadata.message_id,
                "inReplyTo": request.metadata.in_reply_to,
                "originalEmail": request.metadata.original_email,
            },
        })
    }
}

#[async_trait]
impl ConversationBackend for HttpConversationBackend {
    async fn converse(&self, request: &DispatchRequest) -> Result<BackendReply, DispatchError> {
        let http = self.client.post(self.endpoint());
        let mut http = match self.api {
            BackendApi::Chat => http.json(request),
            BackendApi::Completions => http.json(&Self::completions_body(request)),
        };
        if let Some(secret) = &self.secret {
            http = http.bearer_auth(secret.expose_secret());
        }

        let resp = http
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DispatchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let value: Value = resp
            .json()
            .await
            .map_err(|e| DispatchError::InvalidResponse(e.to_string()))?;
        Ok(parse_reply(self.api, &value))
    }
}

/// Pull reply text and capabilities out of a backend answer.
pub fn parse_reply(api: BackendApi, value: &Value) -> BackendReply {
    let text = match api {
        BackendApi::Chat => ["response", "message"]
            .iter()
            .find_map(|key| non_empty_str(value.get(*key))),
        BackendApi::Completions => non_empty_str(
            value
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content")),
        ),
    };
    let capabilities = value
        .get("capabilities")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    BackendReply { text, capabilities }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

/// Submits messages to the backend. No retries.
#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn ConversationBackend>,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn ConversationBackend>) -> Self {
        Self { backend }
    }

    pub async fn dispatch(
        &self,
        message: &CanonicalMessage,
        user_id: &str,
        thread_id: &str,
    ) -> DispatchResult {
        let request = DispatchRequest::new(message, user_id, thread_id);
        debug!(
            user_id,
            thread_id,
            message_len = request.message.len(),
            "Dispatching message to backend"
        );

        match self.backend.converse(&request).await {
            Ok(reply) => {
                let text = reply.text.unwrap_or_else(|| APOLOGY_REPLY.to_string());
                info!(
                    user_id,
                    thread_id,
                    reply_len = text.len(),
                    capabilities = reply.capabilities.len(),
                    "Received backend reply"
                );
                Ok(DispatchReply {
                    text,
                    capabilities: reply.capabilities,
                })
            }
            Err(e) => {
                error!(user_id, thread_id, error = %e, "Backend dispatch failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::email::BodySource;

    fn message() -> CanonicalMessage {
        CanonicalMessage {
            from: "a@x.com".into(),
            sender_name: None,
            to: "coach@y.com".into(),
            subject: "Re: Hello".into(),
            body: "How are you?".into(),
            body_source: BodySource::Text,
            message_id: Some("<m2@x>".into()),
            in_reply_to: Some("<m1@x>".into()),
            references: Vec::new(),
            thread_signal: Some("<m1@x>".into()),
            headers: BTreeMap::new(),
        }
    }

    struct FakeBackend {
        reply: Result<BackendReply, DispatchError>,
        seen: Mutex<Vec<DispatchRequest>>,
    }

    #[async_trait]
    impl ConversationBackend for FakeBackend {
        async fn converse(&self, request: &DispatchRequest) -> Result<BackendReply, DispatchError> {
            self.seen.lock().unwrap().push(request.clone());
            self.reply.clone()
        }
    }

    fn dispatcher(reply: Result<BackendReply, DispatchError>) -> (Dispatcher, Arc<FakeBackend>) {
        let fake = Arc::new(FakeBackend {
            reply,
            seen: Mutex::new(Vec::new()),
        });
        (Dispatcher::new(fake.clone()), fake)
    }

    #[test]
    fn request_carries_metadata_superset() {
        let value = serde_json::to_value(DispatchRequest::new(&message(), "user-1", "thread-1")).unwrap();
        assert_eq!(
            value,
            json!({
                "message": "How are you?",
                "userId": "user-1",
                "threadId": "thread-1",
                "channel": "email",
                "respondTo": {
                    "channel": "email",
                    "details": {"type": "email", "to": "a@x.com", "subject": "Re: Hello"}
                },
                "metadata": {
                    "subject": "Re: Hello",
                    "messageId": "<m2@x>",
                    "inReplyTo": "<m1@x>",
                    "originalEmail": "a@x.com"
                }
            })
        );
    }

    #[test]
    fn chat_reply_prefers_response_then_message() {
        let r = parse_reply(BackendApi::Chat, &json!({"response": "hi", "message": "other"}));
        assert_eq!(r.text.as_deref(), Some("hi"));
        let r = parse_reply(BackendApi::Chat, &json!({"response": "", "message": "other"}));
        assert_eq!(r.text.as_deref(), Some("other"));
        let r = parse_reply(BackendApi::Chat, &json!({}));
        assert!(r.text.is_none());
        assert!(r.capabilities.is_empty());
    }

    #[test]
    fn chat_reply_keeps_capabilities() {
        let r = parse_reply(
            BackendApi::Chat,
            &json!({"response": "ok", "capabilities": [{"name": "memory"}]}),
        );
        assert_eq!(r.capabilities, vec![json!({"name": "memory"})]);
    }

    #[test]
    fn completions_reply_reads_first_choice() {
        let r = parse_reply(
            BackendApi::Completions,
            &json!({"choices": [{"message": {"role": "assistant", "content": "hello"}}]}),
        );
        assert_eq!(r.text.as_deref(), Some("hello"));
        assert!(parse_reply(BackendApi::Completions, &json!({"choices": []})).text.is_none());
    }

    #[tokio::test]
    async fn missing_text_falls_back_to_apology() {
        let (d, fake) = dispatcher(Ok(BackendReply::default()));
        let reply = d.dispatch(&message(), "user-1", "thread-1").await.unwrap();
        assert_eq!(reply.text, APOLOGY_REPLY);
        assert!(reply.capabilities.is_empty());
        assert_eq!(fake.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backend_error_is_returned_once() {
        let err = DispatchError::Status {
            status: 503,
            body: "overloaded".into(),
        };
        let (d, fake) = dispatcher(Err(err.clone()));
        assert_eq!(d.dispatch(&message(), "user-1", "thread-1").await, Err(err));
        assert_eq!(fake.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn empty_subject_uses_default_response_subject() {
        let mut msg = message();
        msg.subject = String::new();
        let req = DispatchRequest::new(&msg, "u", "t");
        assert_eq!(req.respond_to.details.subject, DEFAULT_RESPONSE_SUBJECT);
        assert_eq!(req.metadata.subject, "");
    }

    #[test]
    fn completions_body_shape() {
        let backend = HttpConversationBackend::new(
            reqwest::Client::new(),
            "http://backend/",
            None,
            BackendApi::Completions,
        );
        assert_eq!(backend.endpoint(), "http://backend/api/v1/chat/completions");
        let body = HttpConversationBackend::completions_body(&DispatchRequest::new(&message(), "user-1", "thread-1"));
        assert_eq!(body["messages"][0]["content"], "How are you?");
        assert_eq!(body["user"], "user-1");
        assert_eq!(body["metadata"]["threadId"], "thread-1");
    }
}
