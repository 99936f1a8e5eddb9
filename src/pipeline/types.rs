//! Shared types for the ingestion pipeline.

use std::fmt;

use serde::Serialize;

// ── Stages ──────────────────────────────────────────────────────────

/// A processing step of the pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Authenticate,
    Normalize,
    ResolveIdentity,
    ResolveThread,
    Dispatch,
    Send,
}

impl Stage {
    /// Short label for logging and error bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authenticate => "authenticate",
            Self::Normalize => "normalize",
            Self::ResolveIdentity => "resolve_identity",
            Self::ResolveThread => "resolve_thread",
            Self::Dispatch => "dispatch",
            Self::Send => "send",
        }
    }

    /// The state reached once this stage completes.
    pub fn completed_state(&self) -> PipelineState {
        match self {
            Self::Authenticate => PipelineState::Authenticated,
            Self::Normalize => PipelineState::Normalized,
            Self::ResolveIdentity => PipelineState::IdentityResolved,
            Self::ResolveThread => PipelineState::ThreadResolved,
            Self::Dispatch => PipelineState::Dispatched,
            Self::Send => PipelineState::Replied,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── State machine ───────────────────────────────────────────────────

/// Per-request state. Every run starts at `Received` and ends in
/// `Succeeded` or `Failed`; there is no path back to an earlier state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Received,
    Authenticated,
    Normalized,
    IdentityResolved,
    ThreadResolved,
    Dispatched,
    Replied,
    Succeeded,
    Failed { stage: Stage, reason: String },
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

/// Records the transitions of a single run.
#[derive(Debug, Clone)]
pub struct StateTrail {
    states: Vec<PipelineState>,
}

impl StateTrail {
    pub fn new() -> Self {
        Self {
            states: vec![PipelineState::Received],
        }
    }

    pub fn current(&self) -> &PipelineState {
        // `new` seeds the trail, so it is never empty.
        &self.states[self.states.len() - 1]
    }

    pub(crate) fn complete(&mut self, stage: Stage) {
        self.push(stage.completed_state());
    }

    pub(crate) fn succeed(&mut self) {
        self.push(PipelineState::Succeeded);
    }

    pub(crate) fn fail(&mut self, stage: Stage, reason: impl Into<String>) {
        self.push(PipelineState::Failed {
            stage,
            reason: reason.into(),
        });
    }

    fn push(&mut self, next: PipelineState) {
        if self.current().is_terminal() {
            tracing::warn!(?next, "Ignoring transition out of a terminal state");
            return;
        }
        tracing::debug!(from = ?self.current(), to = ?next, "Pipeline transition");
        self.states.push(next);
    }

    pub fn states(&self) -> &[PipelineState] {
        &self.states
    }
}

impl Default for StateTrail {
    fn default() -> Self {
        Self::new()
    }
}

// ── Resolution ──────────────────────────────────────────────────────

/// Outcome of a resolver that must never fail the request.
///
/// `Degraded` carries a usable substitute plus the reason the real
/// lookup could not be completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    Resolved(T),
    Degraded { value: T, reason: String },
}

impl<T> Resolution<T> {
    pub fn degraded(value: T, reason: impl Into<String>) -> Self {
        Self::Degraded {
            value,
            reason: reason.into(),
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Self::Resolved(value) | Self::Degraded { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Self::Resolved(value) | Self::Degraded { value, .. } => value,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Resolved(_) => None,
            Self::Degraded { reason, .. } => Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trail_starts_received() {
        let trail = StateTrail::new();
        assert_eq!(trail.current(), &PipelineState::Received);
    }

    #[test]
    fn trail_records_happy_path_in_order() {
        let mut trail = StateTrail::new();
        for stage in [
            Stage::Authenticate,
            Stage::Normalize,
            Stage::ResolveIdentity,
            Stage::ResolveThread,
            Stage::Dispatch,
            Stage::Send,
        ] {
            trail.complete(stage);
        }
        trail.succeed();

        assert_eq!(
            trail.states(),
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
    }

    #[test]
    fn failed_is_terminal() {
        let mut trail = StateTrail::new();
        trail.fail(Stage::Authenticate, "bad secret");
        trail.complete(Stage::Normalize);
        assert_eq!(trail.states().len(), 2);
        assert!(matches!(
            trail.current(),
            PipelineState::Failed { stage: Stage::Authenticate, .. }
        ));
    }

    #[test]
    fn resolution_accessors() {
        let ok: Resolution<u32> = Resolution::Resolved(1);
        assert!(!ok.is_degraded());
        assert_eq!(ok.reason(), None);

        let degraded = Resolution::degraded(2, "store offline");
        assert!(degraded.is_degraded());
        assert_eq!(degraded.reason(), Some("store offline"));
        assert_eq!(*degraded.value(), 2);
        assert_eq!(degraded.into_value(), 2);
    }
}
