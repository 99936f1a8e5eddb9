//! Inbound email pipeline.
//!
//! Every webhook call flows through:
//! 1. `WebhookAuthenticator::verify()`: shared-secret check
//! 2. `Normalizer::normalize()`: payload to `CanonicalMessage`
//! 3. `IdentityResolver::resolve()`: sender to canonical user
//! 4. `ThreadResolver::resolve_inbound()`: message to conversation thread
//! 5. `Dispatcher::dispatch()`: AI backend reply
//! 6. `ReplySender::send()`: threaded reply through the mail provider

pub mod processor;
pub mod types;

pub use processor::{Pipeline, PipelineOutcome};
pub use types::{PipelineState, Resolution, Stage, StateTrail};
