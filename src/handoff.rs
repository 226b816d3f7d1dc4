//! Handoff results: the structured outcome an execution engine returns
//! after one step.
//!
//! The core does not own this shape; it validates it and reacts to it.
//! Both vocabularies are closed: parsing rejects unknown statuses, actions
//! and fields rather than guessing.

use crate::errors::DispatchError;
use crate::flow::{EdgeCondition, StepRef};
use serde::{Deserialize, Serialize};

/// Outcome of one dispatched step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandoffResult {
    /// Verification status of the produced work
    pub status: HandoffStatus,
    /// What the engine asks the router to do next
    pub action: HandoffAction,
    /// Target for a bounce, when the engine names one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounce_target: Option<StepRef>,
    /// Whether another iteration could plausibly improve the result.
    /// `None` means the engine did not say; treated as "no" by microloops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_can_help: Option<bool>,
    /// Engine's confidence in its own status call
    #[serde(default)]
    pub confidence: Confidence,
    /// Artifact identifiers actually produced
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Free-text note (bounce reasons, blockers, concerns)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl HandoffResult {
    /// Minimal verified/proceed result.
    pub fn verified() -> Self {
        Self {
            status: HandoffStatus::Verified,
            action: HandoffAction::Proceed,
            bounce_target: None,
            iteration_can_help: None,
            confidence: Confidence::High,
            artifacts: Vec::new(),
            note: None,
        }
    }

    /// Synthetic result the orchestrator substitutes for a failed or
    /// timed-out dispatch. Never fabricates success.
    pub fn synthetic_fix_environment(reason: &str) -> Self {
        Self {
            status: HandoffStatus::Blocked,
            action: HandoffAction::FixEnvironment,
            bounce_target: None,
            iteration_can_help: None,
            confidence: Confidence::Low,
            artifacts: Vec::new(),
            note: Some(reason.to_string()),
        }
    }

    pub fn with_action(mut self, action: HandoffAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_status(mut self, status: HandoffStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_iteration_can_help(mut self, value: bool) -> Self {
        self.iteration_can_help = Some(value);
        self
    }

    /// Parse and shape-check an engine's raw JSON output.
    pub fn from_value(value: serde_json::Value) -> Result<Self, DispatchError> {
        serde_json::from_value(value).map_err(|e| DispatchError::MalformedResult(e.to_string()))
    }

    /// Edge condition equivalent of the status, for branch routing.
    pub fn edge_condition(&self) -> EdgeCondition {
        match self.status {
            HandoffStatus::Verified => EdgeCondition::Verified,
            HandoffStatus::Unverified => EdgeCondition::Unverified,
            HandoffStatus::Partial => EdgeCondition::Partial,
            HandoffStatus::Blocked => EdgeCondition::Blocked,
        }
    }

    /// Check that every required artifact is present, returning the missing
    /// ones.
    pub fn missing_artifacts(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|r| !self.artifacts.contains(r))
            .cloned()
            .collect()
    }
}

/// Closed verification vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Verified,
    Unverified,
    Partial,
    Blocked,
}

impl std::fmt::Display for HandoffStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HandoffStatus::Verified => "verified",
            HandoffStatus::Unverified => "unverified",
            HandoffStatus::Partial => "partial",
            HandoffStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Closed action vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffAction {
    Proceed,
    Rerun,
    Bounce,
    FixEnvironment,
}

impl std::fmt::Display for HandoffAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HandoffAction::Proceed => "proceed",
            HandoffAction::Rerun => "rerun",
            HandoffAction::Bounce => "bounce",
            HandoffAction::FixEnvironment => "fix_environment",
        };
        f.write_str(s)
    }
}

/// Engine confidence in its own verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    #[default]
    Medium,
    High,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_result() {
        let value = serde_json::json!({
            "status": "verified",
            "action": "proceed"
        });
        let result = HandoffResult::from_value(value).unwrap();
        assert_eq!(result.status, HandoffStatus::Verified);
        assert_eq!(result.action, HandoffAction::Proceed);
        assert_eq!(result.confidence, Confidence::Medium);
        assert!(result.artifacts.is_empty());
    }

    #[test]
    fn test_parse_full_result() {
        let value = serde_json::json!({
            "status": "unverified",
            "action": "bounce",
            "bounce_target": {"flow": "delivery", "step": "design"},
            "iteration_can_help": false,
            "confidence": "high",
            "artifacts": ["report.md"],
            "note": "design conflicts with the agreed interface"
        });
        let result = HandoffResult::from_value(value).unwrap();
        assert_eq!(result.action, HandoffAction::Bounce);
        assert_eq!(result.bounce_target.as_ref().unwrap().step, "design");
        assert_eq!(result.iteration_can_help, Some(false));
    }

    #[test]
    fn test_unknown_status_rejected() {
        let value = serde_json::json!({"status": "maybe", "action": "proceed"});
        let err = HandoffResult::from_value(value).unwrap_err();
        assert!(matches!(err, DispatchError::MalformedResult(_)));
    }

    #[test]
    fn test_invented_field_rejected() {
        let value = serde_json::json!({
            "status": "verified",
            "action": "proceed",
            "secret_channel": true
        });
        assert!(HandoffResult::from_value(value).is_err());
    }

    #[test]
    fn test_synthetic_fix_environment_is_blocked() {
        let result = HandoffResult::synthetic_fix_environment("engine unreachable");
        assert_eq!(result.status, HandoffStatus::Blocked);
        assert_eq!(result.action, HandoffAction::FixEnvironment);
        assert_eq!(result.note.as_deref(), Some("engine unreachable"));
    }

    #[test]
    fn test_edge_condition_mapping() {
        assert_eq!(
            HandoffResult::verified().edge_condition(),
            EdgeCondition::Verified
        );
        let partial = HandoffResult::verified().with_status(HandoffStatus::Partial);
        assert_eq!(partial.edge_condition(), EdgeCondition::Partial);
    }

    #[test]
    fn test_missing_artifacts() {
        let mut result = HandoffResult::verified();
        result.artifacts = vec!["plan.md".to_string()];
        let required = vec!["plan.md".to_string(), "tests.rs".to_string()];
        assert_eq!(result.missing_artifacts(&required), vec!["tests.rs"]);
    }
}
