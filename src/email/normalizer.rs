//! Email normalizer: inbound payload to `CanonicalMessage`.
//!
//! Raw headers go through `mail-parser`, which handles folding, encoded
//! words and address syntax. The body is everything after the first blank
//! line. No MIME walk; a `text/html` content type is the only body switch.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use mail_parser::{HeaderValue, Message, MessageParser};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::email::signal::{SubjectPrefixSignal, ThreadSignalExtractor};
use crate::email::types::{
    BodySource, CanonicalMessage, InboundEmail, InboundPayload, Mailbox, bracket_id,
    first_mailbox, parse_address, parse_references,
};
use crate::error::ParseError;

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("tag pattern is valid"));

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// A raw RFC-822-like blob split into headers and a decoded body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEmail {
    /// Lower-cased header names with decoded values.
    pub headers: BTreeMap<String, String>,
    pub from: Option<Mailbox>,
    pub to: Option<Mailbox>,
    pub subject: Option<String>,
    /// Bracketed, as `<id@host>`.
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub body: String,
    pub is_html: bool,
}

impl RawEmail {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Converts inbound payloads into canonical messages. Pure apart from logging.
#[derive(Clone)]
pub struct Normalizer {
    signal: Arc<dyn ThreadSignalExtractor>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(Arc::new(SubjectPrefixSignal))
    }
}

impl Normalizer {
    pub fn new(signal: Arc<dyn ThreadSignalExtractor>) -> Self {
        Self { signal }
    }

    pub fn normalize(&self, payload: &InboundPayload) -> Result<CanonicalMessage, ParseError> {
        let message = match payload {
            InboundPayload::Fields(email) => self.from_fields(email)?,
            InboundPayload::Raw(raw) => self.from_raw(raw)?,
        };

        info!(
            from = %message.from,
            subject = %message.subject,
            message_id = message.message_id.as_deref().unwrap_or("-"),
            thread_signal = message.thread_signal.as_deref().unwrap_or("-"),
            body_len = message.body.len(),
            "Normalized inbound email"
        );
        Ok(message)
    }

    fn from_fields(&self, email: &InboundEmail) -> Result<CanonicalMessage, ParseError> {
        let raw = email.raw.as_deref().map(parse_raw);

        // JSON fields win; raw headers fill gaps.
        let text = |value: &Option<String>, fallback: Option<&String>| -> Option<String> {
            non_empty(value.as_deref()).or_else(|| fallback.cloned())
        };
        let address = |value: &Option<String>, fallback: Option<&Mailbox>| -> Option<Mailbox> {
            value
                .as_deref()
                .and_then(parse_address)
                .or_else(|| fallback.cloned())
        };

        let from = address(&email.from, raw.as_ref().and_then(|r| r.from.as_ref()));
        let to = address(&email.to, raw.as_ref().and_then(|r| r.to.as_ref()));
        let subject = text(&email.subject, raw.as_ref().and_then(|r| r.subject.as_ref()));
        let message_id = text(&email.message_id, raw.as_ref().and_then(|r| r.message_id.as_ref()));
        let in_reply_to = text(
            &email.in_reply_to,
            raw.as_ref().and_then(|r| r.in_reply_to.as_ref()),
        );

        let (body, body_source) = select_body(email, raw.as_ref());

        let mut headers = raw.as_ref().map(|r| r.headers.clone()).unwrap_or_default();
        for (name, value) in &email.headers {
            headers.insert(name.to_ascii_lowercase(), value.clone());
        }

        self.assemble(Parts {
            from,
            to,
            subject,
            message_id,
            in_reply_to,
            body,
            body_source,
            headers,
        })
    }

    fn from_raw(&self, raw: &str) -> Result<CanonicalMessage, ParseError> {
        let parsed = parse_raw(raw);
        let body_source = match (parsed.body.is_empty(), parsed.is_html) {
            (true, _) => BodySource::Empty,
            (false, true) => BodySource::Html,
            (false, false) => BodySource::Text,
        };

        self.assemble(Parts {
            from: parsed.from,
            to: parsed.to,
            subject: parsed.subject,
            message_id: parsed.message_id,
            in_reply_to: parsed.in_reply_to,
            body: parsed.body,
            body_source,
            headers: parsed.headers,
        })
    }

    fn assemble(&self, parts: Parts) -> Result<CanonicalMessage, ParseError> {
        let from = parts.from.ok_or_else(|| missing("from"))?;
        let to = parts.to.ok_or_else(|| missing("to"))?;
        let subject = parts.subject.ok_or_else(|| missing("subject"))?;

        let references = parts
            .headers
            .get("references")
            .map(|v| parse_references(v))
            .unwrap_or_default();

        let thread_signal =
            self.signal
                .extract(&subject, parts.in_reply_to.as_deref(), &references);
        debug!(
            extractor = self.signal.name(),
            signal = thread_signal.as_deref().unwrap_or("-"),
            "Extracted thread signal"
        );

        Ok(CanonicalMessage {
            from: from.address,
            sender_name: from.name,
            to: to.address,
            subject,
            body: parts.body,
            body_source: parts.body_source,
            message_id: parts.message_id,
            in_reply_to: parts.in_reply_to,
            references,
            thread_signal,
            headers: parts.headers,
        })
    }
}

struct Parts {
    from: Option<Mailbox>,
    to: Option<Mailbox>,
    subject: Option<String>,
    message_id: Option<String>,
    in_reply_to: Option<String>,
    body: String,
    body_source: BodySource,
    headers: BTreeMap<String, String>,
}

fn missing(field: &'static str) -> ParseError {
    warn!(field, "Inbound email missing required field");
    ParseError::MissingField(field)
}

/// Prefer split text, then split HTML, then the raw blob's body.
fn select_body(email: &InboundEmail, raw: Option<&RawEmail>) -> (String, BodySource) {
    if let Some(split) = &email.body {
        if let Some(text) = non_empty(split.text.as_deref()) {
            return (text, BodySource::Text);
        }
        if let Some(html) = split.html.as_deref() {
            let text = strip_html(html);
            if !text.is_empty() {
                return (text, BodySource::Html);
            }
        }
    }
    match raw {
        Some(raw) if !raw.body.is_empty() => {
            let source = if raw.is_html {
                BodySource::Html
            } else {
                BodySource::Text
            };
            (raw.body.clone(), source)
        }
        _ => (String::new(), BodySource::Empty),
    }
}

/// Split a raw blob into headers and body.
///
/// The header block ends at the first blank line. A blob whose first line
/// is not a header is treated as body only.
pub fn parse_raw(raw: &str) -> RawEmail {
    let starts_with_header = raw
        .lines()
        .find(|l| !l.trim().is_empty())
        .is_some_and(looks_like_header);
    let (header_block, body) = if starts_with_header {
        split_blob(raw)
    } else {
        ("", raw)
    };

    let mut email = RawEmail::default();
    if !header_block.trim().is_empty()
        && let Some(parsed) = MessageParser::default().parse(header_block.as_bytes())
    {
        read_headers(&parsed, &mut email);
    }

    email.is_html = email
        .headers
        .get("content-type")
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("text/html"));

    let body = body.lines().collect::<Vec<_>>().join("\n");
    email.body = if email.is_html {
        strip_html(&body)
    } else {
        body.trim().to_string()
    };
    email
}

/// `(header block, body)` split at the first blank line.
fn split_blob(raw: &str) -> (&str, &str) {
    let mut offset = 0;
    for line in raw.split_inclusive('\n') {
        if line.trim().is_empty() {
            return (&raw[..offset], &raw[offset + line.len()..]);
        }
        offset += line.len();
    }
    (raw, "")
}

fn read_headers(parsed: &Message<'_>, email: &mut RawEmail) {
    email.from = first_mailbox(parsed.from());
    email.to = first_mailbox(parsed.to());
    email.subject = parsed.subject().map(collapse_whitespace).filter(|s| !s.is_empty());
    email.message_id = parsed
        .message_id()
        .filter(|id| !id.trim().is_empty())
        .map(bracket_id);
    email.in_reply_to = message_ids(parsed.in_reply_to()).into_iter().next();
    email.references = message_ids(parsed.references());

    for header in parsed.headers() {
        let value = match header.value() {
            HeaderValue::Text(text) => collapse_whitespace(text),
            HeaderValue::TextList(list) => collapse_whitespace(&list.join(", ")),
            HeaderValue::ContentType(ct) => match ct.subtype() {
                Some(sub) => format!("{}/{sub}", ct.ctype()),
                None => ct.ctype().to_string(),
            },
            _ => continue,
        };
        // First occurrence wins.
        email
            .headers
            .entry(header.name().to_ascii_lowercase())
            .or_insert(value);
    }

    let typed = [
        ("from", email.from.as_ref().map(|m| m.address.clone())),
        ("to", email.to.as_ref().map(|m| m.address.clone())),
        ("subject", email.subject.clone()),
        ("message-id", email.message_id.clone()),
        ("in-reply-to", email.in_reply_to.clone()),
        (
            "references",
            (!email.references.is_empty()).then(|| email.references.join(" ")),
        ),
    ];
    for (name, value) in typed {
        if let Some(value) = value {
            email.headers.insert(name.to_string(), value);
        }
    }
}

/// Message-ids of an `In-Reply-To` / `References` value, bracketed.
fn message_ids(value: &HeaderValue<'_>) -> Vec<String> {
    let ids: Vec<&str> = match value {
        HeaderValue::Text(id) => vec![&**id],
        HeaderValue::TextList(ids) => ids.iter().map(|id| &**id).collect(),
        _ => Vec::new(),
    };
    ids.into_iter()
        .filter(|id| !id.trim().is_empty())
        .map(bracket_id)
        .collect()
}

fn collapse_whitespace(value: &str) -> String {
    WHITESPACE_RE.replace_all(value, " ").trim().to_string()
}

fn looks_like_header(line: &str) -> bool {
    match line.split_once(':') {
        Some((name, _)) => {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        }
        None => false,
    }
}

/// Strip HTML tags, decode `&nbsp; &lt; &gt; &amp;`, collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let without_tags = TAG_RE.replace_all(html, "");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&");
    WHITESPACE_RE.replace_all(&decoded, " ").trim().to_string()
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
