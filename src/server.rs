//! HTTP routes for the webhook, direct sends and health checks.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::email::{InboundEmail, InboundPayload};
use crate::error::{ParseError, PipelineError, SendError};
use crate::pipeline::{Pipeline, Stage};

const SERVICE_NAME: &str = "mailbridge";

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            started_at: Instant::now(),
        }
    }
}

/// Build the service router.
pub fn router(state: AppState, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/webhook/email", post(email_webhook))
        .route("/send", post(send_email))
        .route("/health", get(health))
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit_bytes))
        .layer(TraceLayer::new_for_http())
}

// ── Webhook ─────────────────────────────────────────────────────────

/// POST /webhook/email
///
/// Accepts relay JSON or a bare `message/rfc822` / `text/plain` body.
async fn email_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str());
    info!(
        content_type = content_type.unwrap_or("-"),
        content_length = body.len(),
        "Incoming email webhook"
    );

    let payload = match decode_payload(content_type, &body) {
        Ok(payload) => payload,
        Err(e) => {
            // Unauthenticated callers learn nothing about payload problems.
            let err = match state.pipeline.authenticator().verify(&headers) {
                Err(auth) => PipelineError::new(Stage::Authenticate, auth),
                Ok(()) => PipelineError::new(Stage::Normalize, e),
            };
            warn!(error = %err, "Webhook payload rejected");
            return pipeline_error_response(&err);
        }
    };

    match state.pipeline.run(&headers, &payload).await {
        Ok(outcome) if outcome.duplicate => Json(json!({
            "success": true,
            "duplicate": true,
            "messageId": outcome.message_id,
        }))
        .into_response(),
        Ok(outcome) => Json(json!({
            "success": true,
            "messageId": outcome.message_id,
            "threadId": outcome.thread_id,
        }))
        .into_response(),
        Err(err) => pipeline_error_response(&err),
    }
}

fn decode_payload(content_type: Option<&str>, body: &[u8]) -> Result<InboundPayload, ParseError> {
    let content_type = content_type.unwrap_or("").to_ascii_lowercase();
    let looks_like_json = body
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{');

    if content_type.contains("json") || (content_type.is_empty() && looks_like_json) {
        let email: InboundEmail = serde_json::from_slice(body)
            .map_err(|e| ParseError::InvalidPayload(format!("invalid JSON: {e}")))?;
        return Ok(InboundPayload::Fields(email));
    }

    let raw = String::from_utf8_lossy(body).into_owned();
    if raw.trim().is_empty() {
        return Err(ParseError::InvalidPayload("empty body".to_string()));
    }
    Ok(InboundPayload::Raw(raw))
}

fn pipeline_error_response(err: &PipelineError) -> Response {
    (
        err.status_code(),
        Json(json!({
            "error": err.kind.to_string(),
            "stage": err.stage,
        })),
    )
        .into_response()
}

// ── Direct send ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest {
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    in_reply_to: Option<String>,
}

/// POST /send
async fn send_email(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(e) = state.pipeline.authenticator().verify(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": e.to_string()}))).into_response();
    }

    let request: SendRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Invalid JSON body", "details": e.to_string()})),
            )
                .into_response();
        }
    };

    let field = |v: &Option<String>| {
        v.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let fields = (
        field(&request.to),
        field(&request.subject),
        field(&request.message),
    );
    let (Some(to), Some(subject), Some(message)) = fields.clone() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Missing required fields",
                "details": {
                    "to": fields.0.is_none(),
                    "subject": fields.1.is_none(),
                    "message": fields.2.is_none(),
                },
            })),
        )
            .into_response();
    };

    match state
        .pipeline
        .sender()
        .send(&to, &subject, &message, request.in_reply_to.as_deref())
        .await
    {
        Ok(sent) => Json(json!({
            "success": true,
            "messageId": sent.provider_id,
        }))
        .into_response(),
        Err(e) => send_error_response(&e),
    }
}

fn send_error_response(err: &SendError) -> Response {
    let status = if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::BAD_GATEWAY
    };
    let details = match err {
        SendError::SubjectTooLong { len, max } => json!({"length": len, "max": max}),
        SendError::InvalidRecipient(to) => json!({"to": to}),
        SendError::Provider { status, body } => json!({"status": status, "body": body}),
        _ => json!({}),
    };
    (status, Json(json!({"error": err.to_string(), "details": details}))).into_response()
}

// ── Health ──────────────────────────────────────────────────────────

/// GET /health
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_content_type_decodes_fields() {
        let payload = decode_payload(
            Some("application/json; charset=utf-8"),
            br#"{"from":"a@x.com","to":"b@y.com","subject":"Hi"}"#,
        )
        .unwrap();
        assert!(matches!(payload, InboundPayload::Fields(ref e) if e.subject.as_deref() == Some("Hi")));
    }

    #[test]
    fn rfc822_body_is_raw() {
        let payload = decode_payload(Some("message/rfc822"), b"From: a@x.com\n\nbody").unwrap();
        assert_eq!(payload, InboundPayload::Raw("From: a@x.com\n\nbody".into()));
    }

    #[test]
    fn missing_content_type_sniffs_json() {
        assert!(matches!(
            decode_payload(None, b"  {\"from\":\"a@x.com\"}").unwrap(),
            InboundPayload::Fields(_)
        ));
        assert!(matches!(
            decode_payload(None, b"From: a@x.com\n\nbody").unwrap(),
            InboundPayload::Raw(_)
        ));
    }

    #[test]
    fn malformed_json_is_invalid_payload() {
        assert!(matches!(
            decode_payload(Some("application/json"), b"{not json"),
            Err(ParseError::InvalidPayload(_))
        ));
        assert!(matches!(
            decode_payload(Some("text/plain"), b"   "),
            Err(ParseError::InvalidPayload(_))
        ));
    }

    #[test]
    fn send_validation_errors_are_bad_request() {
        let resp = send_error_response(&SendError::SubjectTooLong { len: 150, max: 100 });
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = send_error_response(&SendError::Provider {
            status: 500,
            body: "x".into(),
        });
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
