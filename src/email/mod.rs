//! Inbound email handling: payload types and normalization.

pub mod normalizer;
pub mod signal;
pub mod types;

pub use normalizer::{Normalizer, parse_raw, strip_html};
pub use signal::{HeaderChainSignal, SubjectPrefixSignal, ThreadSignalExtractor, extractor_for};
pub use types::{BodySource, CanonicalMessage, InboundEmail, InboundPayload, SplitBody};
