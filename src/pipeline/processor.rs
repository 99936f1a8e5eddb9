//! Webhook pipeline: runs one inbound email through every stage.
//!
//! Flow:
//! 1. Authenticate the relay
//! 2. Normalize the payload
//! 3. Resolve the sender's identity (degrades, never fails)
//! 4. Attribute the message to a thread (degrades, never fails)
//! 5. Dispatch to the AI backend
//! 6. Send the reply
//!
//! Reply addressing and subject are validated right after normalization,
//! so an unsendable reply never reaches identity, threads or the backend.
//!
//! Dispatch and send failures trigger a best-effort failure notice to the
//! sender when enabled. Nothing is retried inside a request.

use std::sync::Arc;

use axum::http::HeaderMap;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::auth::WebhookAuthenticator;
use crate::config::Config;
use crate::dispatch::{Dispatcher, HttpConversationBackend};
use crate::email::{CanonicalMessage, InboundPayload, Normalizer, extractor_for};
use crate::error::{PipelineError, PipelineErrorKind};
use crate::identity::{HttpIdentityService, IdentityResolver};
use crate::pipeline::types::{Stage, StateTrail};
use crate::sender::{HttpMailProvider, ReplySender, SentEmail};
use crate::store::ThreadStore;
use crate::threads::ThreadResolver;

/// Result of a successful run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOutcome {
    /// Provider id of the reply, or the inbound message-id for duplicates.
    pub message_id: Option<String>,
    pub thread_id: String,
    pub user_id: String,
    /// Already answered; nothing was dispatched or sent.
    pub duplicate: bool,
    pub identity_degraded: bool,
    pub thread_degraded: bool,
    #[serde(skip)]
    pub sent: Option<SentEmail>,
    #[serde(skip)]
    pub trail: StateTrail,
}

/// The ingestion pipeline. Cheap to clone; all components are shared handles.
#[derive(Clone)]
pub struct Pipeline {
    authenticator: WebhookAuthenticator,
    normalizer: Normalizer,
    identities: IdentityResolver,
    threads: ThreadResolver,
    dispatcher: Dispatcher,
    sender: ReplySender,
    notify_on_failure: bool,
}

impl Pipeline {
    pub fn new(
        authenticator: WebhookAuthenticator,
        normalizer: Normalizer,
        identities: IdentityResolver,
        threads: ThreadResolver,
        dispatcher: Dispatcher,
        sender: ReplySender,
    ) -> Self {
        Self {
            authenticator,
            normalizer,
            identities,
            threads,
            dispatcher,
            sender,
            notify_on_failure: true,
        }
    }

    pub fn with_failure_notices(mut self, enabled: bool) -> Self {
        self.notify_on_failure = enabled;
        self
    }

    /// Wire the HTTP-backed components from configuration.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn ThreadStore>,
        client: reqwest::Client,
    ) -> Self {
        let identity = HttpIdentityService::from_config(client.clone(), &config.identity);
        let backend = HttpConversationBackend::from_config(client.clone(), &config.backend);
        let provider = HttpMailProvider::new(
            client,
            config.mail.api_url.clone(),
            config.mail.api_key.clone(),
        );

        Self::new(
            WebhookAuthenticator::from_config(&config.webhook),
            Normalizer::new(extractor_for(config.threading.strategy)),
            IdentityResolver::new(Arc::new(identity)),
            ThreadResolver::new(store, config.threading.stale_window),
            Dispatcher::new(Arc::new(backend)),
            ReplySender::from_config(Arc::new(provider), &config.mail),
        )
        .with_failure_notices(config.mail.notify_on_failure)
    }

    pub fn authenticator(&self) -> &WebhookAuthenticator {
        &self.authenticator
    }

    pub fn sender(&self) -> &ReplySender {
        &self.sender
    }

    /// Run one inbound email through the pipeline.
    pub async fn run(
        &self,
        headers: &HeaderMap,
        payload: &InboundPayload,
    ) -> Result<PipelineOutcome, PipelineError> {
        let mut trail = StateTrail::new();

        if let Err(e) = self.authenticator.verify(headers) {
            return Err(fail(&mut trail, Stage::Authenticate, e));
        }
        trail.complete(Stage::Authenticate);

        let message = match self.normalizer.normalize(payload) {
            Ok(message) => message,
            Err(e) => return Err(fail(&mut trail, Stage::Normalize, e)),
        };
        trail.complete(Stage::Normalize);

        // A reply that could never be sent is rejected before any upstream call.
        if let Err(e) = self.sender.validate(&message.from, &message.subject) {
            return Err(fail(&mut trail, Stage::Send, e));
        }

        let identity = self
            .identities
            .resolve(&message.from, message.sender_name.as_deref())
            .await;
        if let Some(reason) = identity.reason() {
            warn!(from = %message.from, reason, stage = %Stage::ResolveIdentity, "Identity degraded");
        }
        let identity_degraded = identity.is_degraded();
        let identity = identity.into_value();
        trail.complete(Stage::ResolveIdentity);

        let attribution = self
            .threads
            .resolve_inbound(&identity.canonical_user_id, &message)
            .await;
        if let Some(reason) = attribution.reason() {
            warn!(from = %message.from, reason, stage = %Stage::ResolveThread, "Thread degraded");
        }
        let thread_degraded = attribution.is_degraded();
        let attribution = attribution.into_value();
        let thread_id = attribution.thread.id.clone();
        trail.complete(Stage::ResolveThread);

        if attribution.is_answered() {
            info!(
                message_id = message.message_id.as_deref().unwrap_or("-"),
                thread_id = %thread_id,
                "Message already answered, skipping"
            );
            trail.succeed();
            return Ok(PipelineOutcome {
                message_id: message.message_id.clone(),
                thread_id,
                user_id: identity.canonical_user_id,
                duplicate: true,
                identity_degraded,
                thread_degraded,
                sent: None,
                trail,
            });
        }

        let reply = match self
            .dispatcher
            .dispatch(&message, &identity.canonical_user_id, &thread_id)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                let err = fail(&mut trail, Stage::Dispatch, e);
                self.notify_failure(&message, &err).await;
                return Err(err);
            }
        };
        trail.complete(Stage::Dispatch);

        let sent = match self
            .sender
            .send(
                &message.from,
                &message.subject,
                &reply.text,
                message.message_id.as_deref(),
            )
            .await
        {
            Ok(sent) => sent,
            Err(e) => {
                let err = fail(&mut trail, Stage::Send, e);
                self.notify_failure(&message, &err).await;
                return Err(err);
            }
        };
        trail.complete(Stage::Send);

        if !thread_degraded {
            self.threads
                .record_reply(
                    &thread_id,
                    message.message_id.as_deref(),
                    &sent.message_id,
                    Some(&sent.provider_id),
                )
                .await;
        }

        trail.succeed();
        info!(
            from = %message.from,
            thread_id = %thread_id,
            provider_id = %sent.provider_id,
            "Email processed"
        );

        Ok(PipelineOutcome {
            message_id: Some(sent.provider_id.clone()),
            thread_id,
            user_id: identity.canonical_user_id,
            duplicate: false,
            identity_degraded,
            thread_degraded,
            sent: Some(sent),
            trail,
        })
    }

    async fn notify_failure(&self, message: &CanonicalMessage, err: &PipelineError) {
        if !self.notify_on_failure || !err.warrants_failure_notice() {
            return;
        }
        self.sender
            .send_failure_notice(&message.from, message.message_id.as_deref())
            .await;
    }
}

/// Record the failure on the trail and build the error.
fn fail(
    trail: &mut StateTrail,
    stage: Stage,
    cause: impl Into<PipelineErrorKind>,
) -> PipelineError {
    let err = PipelineError::new(stage, cause);
    trail.fail(stage, err.kind.to_string());
    if err.status_code().is_server_error() {
        error!(stage = %stage, error = %err.kind, "Pipeline failed");
    } else {
        warn!(stage = %stage, error = %err.kind, "Pipeline rejected request");
    }
    err
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use chrono::Duration;
    use secrecy::SecretString;

    use super::*;
    use crate::dispatch::{BackendReply, ConversationBackend, DispatchRequest};
    use crate::email::InboundEmail;
    use crate::error::{DispatchError, IdentityError, SendError};
    use crate::identity::{IdentityService, ResolvedIdentity};
    use crate::pipeline::types::PipelineState;
    use crate::sender::{FAILURE_NOTICE_BODY, MailProvider, OutboundEmail};
    use crate::store::LibSqlThreadStore;

    // ── Fakes ───────────────────────────────────────────────────────

    struct FakeIdentity {
        user_id: Option<String>,
    }

    #[async_trait]
    impl IdentityService for FakeIdentity {
        async fn resolve(
            &self,
            _address: &str,
            _display_name: Option<&str>,
        ) -> Result<ResolvedIdentity, IdentityError> {
            match &self.user_id {
                Some(id) => Ok(ResolvedIdentity {
                    user_id: Some(id.clone()),
                    display_name: None,
                    is_new_user: false,
                }),
                None => Err(IdentityError::Transport("connection refused".into())),
            }
        }

        async fn create(&self, _address: &str, _name: &str) -> Result<String, IdentityError> {
            Err(IdentityError::Transport("connection refused".into()))
        }
    }

    #[derive(Default)]
    struct FakeBackend {
        fail: bool,
        seen: Mutex<Vec<DispatchRequest>>,
    }

    #[async_trait]
    impl ConversationBackend for FakeBackend {
        async fn converse(&self, request: &DispatchRequest) -> Result<BackendReply, DispatchError> {
            self.seen.lock().unwrap().push(request.clone());
            if self.fail {
                return Err(DispatchError::Status {
                    status: 500,
                    body: "backend down".into(),
                });
            }
            Ok(BackendReply {
                text: Some(format!("You said: {}", request.message)),
                capabilities: Vec::new(),
            })
        }
    }

    #[derive(Default)]
    struct FakeProvider {
        fail: bool,
        sent: Mutex<Vec<OutboundEmail>>,
    }

    #[async_trait]
    impl MailProvider for FakeProvider {
        async fn deliver(&self, email: &OutboundEmail) -> Result<String, SendError> {
            let mut sent = self.sent.lock().unwrap();
            sent.push(email.clone());
            if self.fail {
                return Err(SendError::Provider {
                    status: 500,
                    body: "provider down".into(),
                });
            }
            Ok(format!("re_{}", sent.len()))
        }
    }

    struct Harness {
        pipeline: Pipeline,
        backend: Arc<FakeBackend>,
        provider: Arc<FakeProvider>,
        store: Arc<LibSqlThreadStore>,
    }

    async fn harness(
        identity: Option<&str>,
        backend: FakeBackend,
        provider: FakeProvider,
    ) -> Harness {
        let store = Arc::new(LibSqlThreadStore::new_memory().await.unwrap());
        let backend = Arc::new(backend);
        let provider = Arc::new(provider);
        let pipeline = Pipeline::new(
            WebhookAuthenticator::new(Some(SecretString::from("s3cret")), "x-webhook-secret"),
            Normalizer::default(),
            IdentityResolver::new(Arc::new(FakeIdentity {
                user_id: identity.map(str::to_string),
            })),
            ThreadResolver::new(store.clone(), Duration::hours(24)),
            Dispatcher::new(backend.clone()),
            ReplySender::new(provider.clone(), "coach@y.com", 100),
        );
        Harness {
            pipeline,
            backend,
            provider,
            store,
        }
    }

    fn authed() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-webhook-secret", HeaderValue::from_static("s3cret"));
        headers
    }

    fn email(subject: &str, message_id: &str, in_reply_to: Option<&str>) -> InboundPayload {
        InboundPayload::Fields(InboundEmail {
            from: Some("a@x.com".into()),
            to: Some("coach@y.com".into()),
            subject: Some(subject.into()),
            message_id: Some(message_id.into()),
            in_reply_to: in_reply_to.map(str::to_string),
            raw: Some(format!("From: a@x.com\nSubject: {subject}\n\nHi there")),
            ..Default::default()
        })
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn happy_path_replies_in_thread() {
        let h = harness(Some("user-1"), FakeBackend::default(), FakeProvider::default()).await;
        let outcome = h
            .pipeline
            .run(&authed(), &email("Hello", "<m1@x>", None))
            .await
            .unwrap();

        assert!(!outcome.duplicate);
        assert_eq!(outcome.user_id, "user-1");
        assert_eq!(outcome.message_id.as_deref(), Some("re_1"));
        assert_eq!(
            outcome.trail.states(),
            &[
                PipelineState::Received,
                PipelineState::Authenticated,
                PipelineState::Normalized,
                PipelineState::IdentityResolved,
                PipelineState::ThreadResolved,
                PipelineState::Dispatched,
                PipelineState::Replied,
                PipelineState::Succeeded,
            ]
        );

        let requests = h.backend.seen.lock().unwrap();
        assert_eq!(requests[0].message, "Hi there");
        assert_eq!(requests[0].user_id, "user-1");
        assert_eq!(requests[0].thread_id, outcome.thread_id);

        let sent = h.provider.sent.lock().unwrap();
        assert_eq!(sent[0].subject, "Re: Hello");
        assert_eq!(sent[0].text, "You said: Hi there");
        assert_eq!(sent[0].headers.get("In-Reply-To").map(String::as_str), Some("<m1@x>"));
    }

    #[tokio::test]
    async fn reply_to_our_reply_continues_thread() {
        let h = harness(Some("user-1"), FakeBackend::default(), FakeProvider::default()).await;
        let first = h
            .pipeline
            .run(&authed(), &email("Hello", "<m1@x>", None))
            .await
            .unwrap();
        let our_id = first.sent.as_ref().unwrap().message_id.clone();

        let second = h
            .pipeline
            .run(&authed(), &email("Re: Hello", "<m2@x>", Some(&our_id)))
            .await
            .unwrap();
        assert_eq!(second.thread_id, first.thread_id);

        let thread = h.store.get_thread(&first.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.message_count, 2);
    }

    #[tokio::test]
    async fn bad_secret_stops_before_side_effects() {
        let h = harness(Some("user-1"), FakeBackend::default(), FakeProvider::default()).await;
        let mut headers = HeaderMap::new();
        headers.insert("x-webhook-secret", HeaderValue::from_static("wrong"));

        let err = h
            .pipeline
            .run(&headers, &email("Hello", "<m1@x>", None))
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::Authenticate);
        assert_eq!(err.status_code().as_u16(), 401);
        assert!(h.backend.seen.lock().unwrap().is_empty());
        assert!(h.provider.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_field_stops_before_downstream() {
        let h = harness(Some("user-1"), FakeBackend::default(), FakeProvider::default()).await;
        let payload = InboundPayload::Fields(InboundEmail {
            from: Some("a@x.com".into()),
            subject: Some("Hello".into()),
            ..Default::default()
        });
        let err = h.pipeline.run(&authed(), &payload).await.unwrap_err();
        assert_eq!(err.stage, Stage::Normalize);
        assert!(matches!(err.kind, PipelineErrorKind::Parse(_)));
        assert!(h.backend.seen.lock().unwrap().is_empty());
        assert!(h.provider.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_failure_is_send_failed_with_notice() {
        let h = harness(
            Some("user-1"),
            FakeBackend::default(),
            FakeProvider {
                fail: true,
                ..Default::default()
            },
        )
        .await;
        let err = h
            .pipeline
            .run(&authed(), &email("Hello", "<m1@x>", None))
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::Send);
        assert!(err.status_code().is_server_error());

        // Reply attempt, then the notice attempt; the notice failure is swallowed.
        let sent = h.provider.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].text, FAILURE_NOTICE_BODY);
    }

    #[tokio::test]
    async fn dispatch_failure_sends_notice() {
        let h = harness(
            Some("user-1"),
            FakeBackend {
                fail: true,
                ..Default::default()
            },
            FakeProvider::default(),
        )
        .await;
        let err = h
            .pipeline
            .run(&authed(), &email("Hello", "<m1@x>", None))
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::Dispatch);
        assert!(err.status_code().is_server_error());

        let sent = h.provider.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, FAILURE_NOTICE_BODY);
    }

    #[tokio::test]
    async fn failure_notice_can_be_disabled() {
        let mut h = harness(
            Some("user-1"),
            FakeBackend {
                fail: true,
                ..Default::default()
            },
            FakeProvider::default(),
        )
        .await;
        h.pipeline = h.pipeline.with_failure_notices(false);
        assert!(h.pipeline.run(&authed(), &email("Hello", "<m1@x>", None)).await.is_err());
        assert!(h.provider.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn raw_mail_with_comment_sender_is_answered() {
        let h = harness(Some("user-1"), FakeBackend::default(), FakeProvider::default()).await;
        let payload = InboundPayload::Raw(
            "From: a@x.com (Alice)\nTo: coach@y.com\nSubject: =?UTF-8?B?SGVsbG8=?=\nMessage-ID: <m1@x>\n\nHi there".into(),
        );
        h.pipeline.run(&authed(), &payload).await.unwrap();

        assert_eq!(h.backend.seen.lock().unwrap().len(), 1);
        let sent = h.provider.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["a@x.com"]);
        assert_eq!(sent[0].subject, "Re: Hello");
        assert_eq!(sent[0].text, "You said: Hi there");
    }

    #[tokio::test]
    async fn subject_near_cap_still_gets_reply() {
        let h = harness(Some("user-1"), FakeBackend::default(), FakeProvider::default()).await;
        let subject = "s".repeat(98);
        let outcome = h
            .pipeline
            .run(&authed(), &email(&subject, "<m1@x>", None))
            .await
            .unwrap();

        assert_eq!(outcome.message_id.as_deref(), Some("re_1"));
        assert_eq!(h.backend.seen.lock().unwrap().len(), 1);
        let sent = h.provider.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, format!("Re: {subject}"));
        assert_ne!(sent[0].text, FAILURE_NOTICE_BODY);
    }

    #[tokio::test]
    async fn oversized_subject_rejected_before_dispatch() {
        let h = harness(Some("user-1"), FakeBackend::default(), FakeProvider::default()).await;
        let err = h
            .pipeline
            .run(&authed(), &email(&"s".repeat(101), "<m1@x>", None))
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Send);
        assert_eq!(err.status_code().as_u16(), 422);
        assert!(h.backend.seen.lock().unwrap().is_empty());
        assert!(h.provider.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn identity_outage_degrades_to_address() {
        let h = harness(None, FakeBackend::default(), FakeProvider::default()).await;
        let outcome = h
            .pipeline
            .run(&authed(), &email("Hello", "<m1@x>", None))
            .await
            .unwrap();
        assert!(outcome.identity_degraded);
        assert_eq!(outcome.user_id, "a@x.com");
        assert_eq!(h.backend.seen.lock().unwrap()[0].user_id, "a@x.com");
    }

    #[tokio::test]
    async fn redelivered_answered_message_is_duplicate() {
        let h = harness(Some("user-1"), FakeBackend::default(), FakeProvider::default()).await;
        let payload = email("Hello", "<m1@x>", None);
        let first = h.pipeline.run(&authed(), &payload).await.unwrap();
        let again = h.pipeline.run(&authed(), &payload).await.unwrap();

        assert!(again.duplicate);
        assert_eq!(again.thread_id, first.thread_id);
        assert_eq!(again.message_id.as_deref(), Some("<m1@x>"));
        assert_eq!(h.backend.seen.lock().unwrap().len(), 1);
        assert_eq!(h.provider.sent.lock().unwrap().len(), 1);

        let thread = h.store.get_thread(&first.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.message_count, 1);
    }
}
