//! Typed error hierarchy for the Waypoint engine.
//!
//! Four top-level enums cover the four subsystems:
//! - `CompileError`: specification compiler failures
//! - `StoreError`: specification and run-state store failures
//! - `RoutingError`: routing engine policy failures
//! - `DispatchError`: execution-engine boundary failures

use thiserror::Error;

/// Errors from the specification compiler.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Unknown {kind} reference '{reference}'")]
    UnknownReference { kind: RefKind, reference: String },

    #[error("Template placeholder '{placeholder}' in station '{station}' has no value and no default")]
    TemplateError { station: String, placeholder: String },

    #[error("Step '{step}' overrides would escalate capability '{capability}' beyond station ceiling")]
    CapabilityEscalation { step: String, capability: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What kind of document a dangling reference pointed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Flow,
    Step,
    Station,
    Fragment,
}

impl std::fmt::Display for RefKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RefKind::Flow => "flow",
            RefKind::Step => "step",
            RefKind::Station => "station",
            RefKind::Fragment => "fragment",
        };
        f.write_str(s)
    }
}

/// Errors from the specification store and the run-state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic-concurrency token mismatch. Carries both tokens so the
    /// caller can re-read and reconcile; the store never merges.
    #[error("Concurrency conflict: expected token {expected}, current token is {actual}")]
    Conflict { expected: String, actual: String },

    #[error("Resource '{id}' not found")]
    NotFound { id: String },

    /// The document failed validation; the write was rejected whole.
    #[error("Validation rejected the write with {} finding(s)", findings.len())]
    Validation { findings: Vec<crate::flow::Finding> },

    #[error("Run '{run_id}' not found")]
    RunNotFound { run_id: String },

    #[error("Failed to persist snapshot at {path}: {source}")]
    SnapshotWriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read snapshot at {path}: {source}")]
    SnapshotReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Snapshot serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the routing engine. Every variant forces termination of the
/// offending loop or detour; nothing here is silently retried.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Policy violation: {kind} ceiling {ceiling} exceeded at step '{step}'")]
    PolicyViolation {
        kind: CeilingKind,
        ceiling: u32,
        step: String,
    },

    #[error("Routing action '{action}' is not in flow '{flow}' policy allow-list")]
    DisallowedAction { flow: String, action: String },

    #[error("Bounce at step '{step}' declared no target and the flow has no default")]
    MissingBounceTarget { step: String },

    #[error("Bounce target '{target}' does not resolve to a known flow step")]
    UnknownBounceTarget { target: String },

    #[error("Pop requested on an empty interruption stack for run {run_id}")]
    StackUnderflow { run_id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Which policy ceiling a violation hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CeilingKind {
    Retry,
    Microloop,
    InjectionDepth,
}

impl std::fmt::Display for CeilingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CeilingKind::Retry => "retry",
            CeilingKind::Microloop => "microloop",
            CeilingKind::InjectionDepth => "injection depth",
        };
        f.write_str(s)
    }
}

/// Errors from the execution-engine boundary. The orchestrator converts all
/// of these to a synthetic fix-environment outcome; it never fabricates a
/// successful handoff.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Execution engine unreachable: {0}")]
    Unreachable(String),

    #[error("Execution engine returned a malformed result: {0}")]
    MalformedResult(String),

    #[error("Dispatch for step '{step}' exceeded its {ceiling_secs}s ceiling")]
    Timeout { step: String, ceiling_secs: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
