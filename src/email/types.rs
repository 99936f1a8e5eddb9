//! Email-specific types: inbound payloads and the canonical message.

use std::collections::BTreeMap;

use mail_parser::{Address, MessageParser};
use serde::{Deserialize, Serialize};

/// Pre-split body fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitBody {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
}

/// Inbound email as posted by the relay as JSON.
///
/// Every field is optional at this layer: validation happens in the
/// normalizer so a missing field maps to a precise `MissingField` error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEmail {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default, alias = "message_id", alias = "messageID")]
    pub message_id: Option<String>,
    #[serde(default, alias = "in_reply_to")]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub body: Option<SplitBody>,
    /// Full RFC-822 source, when the relay forwards it.
    #[serde(default)]
    pub raw: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// What the webhook received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPayload {
    /// JSON fields, possibly carrying a raw blob alongside.
    Fields(InboundEmail),
    /// A bare `message/rfc822` body.
    Raw(String),
}

/// Which source the canonical body text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodySource {
    Text,
    Html,
    Empty,
}

/// Normalized message handed to the rest of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    /// Bare sender address.
    pub from: String,
    /// Display name from the `From` header, if any.
    pub sender_name: Option<String>,
    pub to: String,
    pub subject: String,
    /// Plain text. Never absent; empty when the source had no body.
    pub body: String,
    pub body_source: BodySource,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    /// Hint used by the thread resolver; `None` starts a new conversation.
    pub thread_signal: Option<String>,
    /// Lower-cased header names.
    pub headers: BTreeMap<String, String>,
}

/// A single parsed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub address: String,
    pub name: Option<String>,
}

/// First mailbox of a parsed address header.
pub(crate) fn first_mailbox(address: Option<&Address<'_>>) -> Option<Mailbox> {
    let addr = address?.first()?;
    let email = addr.address()?.trim();
    if email.is_empty() {
        return None;
    }
    let name = addr
        .name()
        .map(|n| n.trim().trim_matches('"').trim())
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    Some(Mailbox {
        address: email.to_string(),
        name,
    })
}

/// Parse an address header value into its first mailbox.
///
/// Handles `Name <addr>`, `addr (comment)` and encoded names.
pub fn parse_address(value: &str) -> Option<Mailbox> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let header = format!("From: {value}\r\n\r\n");
    let parsed = MessageParser::default().parse(header.as_bytes())?;
    first_mailbox(parsed.from())
}

/// Restore the angle brackets mail-parser strips from message-ids.
pub(crate) fn bracket_id(id: &str) -> String {
    let id = id.trim();
    if id.starts_with('<') && id.ends_with('>') {
        id.to_string()
    } else {
        format!("<{id}>")
    }
}

/// Parse a `References` header into its message-ids, oldest first.
pub fn parse_references(value: &str) -> Vec<String> {
    value
        .split_whitespace()
        .map(str::to_string)
        .collect()
}
