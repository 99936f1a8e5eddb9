//! Thread-signal extraction.
//!
//! The signal is the hint the thread resolver uses to continue an existing
//! conversation. Extraction sits behind a trait so the subject heuristic
//! can be swapped for a header walk without touching the pipeline.

use std::sync::Arc;

use crate::config::SignalStrategy;

/// Literal reply prefix recognised by the subject heuristic.
pub const REPLY_PREFIX: &str = "Re: ";

/// Derives a thread signal from reply-related fields.
pub trait ThreadSignalExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(
        &self,
        subject: &str,
        in_reply_to: Option<&str>,
        references: &[String],
    ) -> Option<String>;
}

/// The subject must start with exactly `"Re: "`; the signal is then the
/// `In-Reply-To` value. Anything else starts a new thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubjectPrefixSignal;

impl ThreadSignalExtractor for SubjectPrefixSignal {
    fn name(&self) -> &'static str {
        "subject"
    }

    fn extract(
        &self,
        subject: &str,
        in_reply_to: Option<&str>,
        _references: &[String],
    ) -> Option<String> {
        if !subject.starts_with(REPLY_PREFIX) {
            return None;
        }
        non_empty(in_reply_to)
    }
}

/// Uses `In-Reply-To`, falling back to the newest `References` entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderChainSignal;

impl ThreadSignalExtractor for HeaderChainSignal {
    fn name(&self) -> &'static str {
        "headers"
    }

    fn extract(
        &self,
        _subject: &str,
        in_reply_to: Option<&str>,
        references: &[String],
    ) -> Option<String> {
        non_empty(in_reply_to).or_else(|| references.last().cloned())
    }
}

pub fn extractor_for(strategy: SignalStrategy) -> Arc<dyn ThreadSignalExtractor> {
    match strategy {
        SignalStrategy::Subject => Arc::new(SubjectPrefixSignal),
        SignalStrategy::Headers => Arc::new(HeaderChainSignal),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
