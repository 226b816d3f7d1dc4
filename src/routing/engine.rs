//! The routing decision engine.
//!
//! `route` maps a handoff result onto graph navigation; the explicit
//! request methods (`detour`, `inject_flow`, `inject_nodes`,
//! `extend_graph`) push interruption frames after checking the flow
//! policy. All state mutation happens here, persistence happens in the
//! orchestrator.

use super::{FlowResolver, GraphExtension, RouteDecision};
use crate::errors::{CeilingKind, RoutingError};
use crate::flow::{
    ExhaustionBehavior, Flow, FlowGraph, FlowNode, NodeKind, RouteActionKind, StepRef,
};
use crate::handoff::{HandoffAction, HandoffResult, HandoffStatus};
use crate::runstate::{InjectionTarget, RunState, RunStatus, StackFrame};
use anyhow::anyhow;
use chrono::Utc;

pub struct RoutingEngine<R: FlowResolver> {
    flows: R,
}

impl<R: FlowResolver> RoutingEngine<R> {
    pub fn new(flows: R) -> Self {
        Self { flows }
    }

    /// Decide what happens after one step, mutating the run state's
    /// position and stacks accordingly.
    pub fn route(
        &self,
        state: &mut RunState,
        result: &HandoffResult,
    ) -> Result<RouteDecision, RoutingError> {
        let flow = self.active_flow(state)?;
        let decision = match result.action {
            HandoffAction::Proceed => self.on_proceed(state, &flow, result)?,
            HandoffAction::Rerun => self.on_rerun(state, &flow),
            HandoffAction::Bounce => self.on_bounce(state, &flow, result)?,
            HandoffAction::FixEnvironment => self.interrupt(
                state,
                result.note.as_deref().unwrap_or("fix-environment requested"),
            ),
        };
        tracing::info!(
            run_id = %state.run_id,
            position = %state.position(),
            ?decision,
            "routing decision"
        );
        Ok(decision)
    }

    /// Inject a pre-catalogued detour matching a policy suggestion. The
    /// run returns to the interrupted step itself once the detour pops:
    /// detours remediate, then the step is retried.
    pub fn detour(
        &self,
        state: &mut RunState,
        reason: &str,
    ) -> Result<RouteDecision, RoutingError> {
        let flow = self.active_flow(state)?;
        self.check_allowed(&flow, RouteActionKind::Detour)?;
        self.check_depth(state, &flow)?;

        let suggestion = flow
            .policy
            .detour_suggestions
            .iter()
            .find(|s| s.reason == reason)
            .ok_or_else(|| {
                RoutingError::Other(anyhow!(
                    "No detour catalogued for reason '{reason}' in flow '{}'",
                    flow.id
                ))
            })?;

        let here = state.position();
        let frame = StackFrame {
            interrupted: here.clone(),
            reason: reason.to_string(),
            target: InjectionTarget::Detour {
                nodes: suggestion.nodes.clone(),
            },
            pending: suggestion.nodes.clone(),
            pushed_at: Utc::now(),
        };
        self.push(state, frame, here)
    }

    /// Push the current position and switch to a target flow's entry node.
    /// The run resumes at the interrupted step's declared successor.
    pub fn inject_flow(
        &self,
        state: &mut RunState,
        target_flow: &str,
        reason: &str,
    ) -> Result<RouteDecision, RoutingError> {
        let flow = self.active_flow(state)?;
        self.check_allowed(&flow, RouteActionKind::InjectFlow)?;
        self.check_depth(state, &flow)?;

        let target = self.flows.resolve_flow(target_flow).ok_or_else(|| {
            RoutingError::Other(anyhow!("Unknown injection target flow '{target_flow}'"))
        })?;
        let resume_at = self.resume_point(state, &flow)?;

        let frame = StackFrame {
            interrupted: state.position(),
            reason: reason.to_string(),
            target: InjectionTarget::Flow {
                flow: target.id.clone(),
            },
            pending: vec![target.entry.clone()],
            pushed_at: Utc::now(),
        };
        self.push(state, frame, resume_at)
    }

    /// Push the current position and insert an ad-hoc node sequence not
    /// present in any catalogued flow.
    pub fn inject_nodes(
        &self,
        state: &mut RunState,
        nodes: Vec<FlowNode>,
        reason: &str,
    ) -> Result<RouteDecision, RoutingError> {
        let flow = self.active_flow(state)?;
        self.check_allowed(&flow, RouteActionKind::InjectNodes)?;
        self.check_depth(state, &flow)?;
        if nodes.is_empty() {
            return Err(RoutingError::Other(anyhow!(
                "Node injection requires at least one node"
            )));
        }

        let resume_at = self.resume_point(state, &flow)?;
        let pending: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let frame = StackFrame {
            interrupted: state.position(),
            reason: reason.to_string(),
            target: InjectionTarget::Nodes { nodes },
            pending,
            pushed_at: Utc::now(),
        };
        self.push(state, frame, resume_at)
    }

    /// Propose a patch to the flow graph. Recorded for authoring approval,
    /// never applied to the live graph.
    pub fn extend_graph(
        &self,
        state: &RunState,
        proposal: GraphExtension,
    ) -> Result<RouteDecision, RoutingError> {
        let flow = self.active_flow(state)?;
        self.check_allowed(&flow, RouteActionKind::ExtendGraph)?;
        Ok(RouteDecision::Proposed { proposal })
    }

    // ── Handoff action mapping ────────────────────────────────────────

    fn on_proceed(
        &self,
        state: &mut RunState,
        flow: &Flow,
        result: &HandoffResult,
    ) -> Result<RouteDecision, RoutingError> {
        // Inside a detour or ad-hoc injection: walk the pending sequence.
        let in_sequence_frame = state
            .interruption_stack
            .last()
            .is_some_and(|frame| {
                matches!(
                    frame.target,
                    InjectionTarget::Detour { .. } | InjectionTarget::Nodes { .. }
                )
            });
        if in_sequence_frame {
            let current = state.step.clone();
            let next = state
                .interruption_stack
                .last_mut()
                .and_then(|frame| {
                    frame.pending.retain(|s| s != &current);
                    frame.pending.first().cloned()
                });
            return match next {
                Some(next) => {
                    state.step = next.clone();
                    state.status = RunStatus::Running;
                    Ok(RouteDecision::Continue {
                        to: StepRef::new(&state.flow, &next),
                    })
                }
                None => {
                    state.pop_frame();
                    state.status = RunStatus::Running;
                    Ok(RouteDecision::Returned {
                        resume_at: state.position(),
                    })
                }
            };
        }

        // Microloop handling, whether we sit at the loop node or its critic.
        if let Some(anchor) = microloop_anchor(flow, &state.step) {
            let anchor_id = anchor.id.clone();
            let critic = anchor.critic.clone();
            if result.status == HandoffStatus::Unverified
                && result.iteration_can_help == Some(true)
            {
                state.microloop_count += 1;
                if state.microloop_count > flow.policy.microloop_ceiling {
                    return self.exhaust_microloop(state, flow, &anchor_id, result);
                }
                // Alternate between the loop node and its paired critic;
                // position is set directly so the counter survives the hop.
                let target = if state.step == anchor_id {
                    critic.unwrap_or(anchor_id)
                } else {
                    anchor_id
                };
                state.step = target.clone();
                state.status = RunStatus::Running;
                return Ok(RouteDecision::Continue {
                    to: StepRef::new(&state.flow, &target),
                });
            }
            // Verified, or iteration explicitly cannot help: exit the loop
            // along the anchor's default edge.
            return self.advance_default(state, flow, &anchor_id);
        }

        let node = self.current_node(state, flow)?;
        match node.kind {
            NodeKind::Terminal => {
                if state.interruption_stack.is_empty() {
                    state.status = RunStatus::Succeeded;
                    Ok(RouteDecision::Complete)
                } else {
                    // Terminal step of an injected flow: the frame returns.
                    state.pop_frame();
                    state.status = RunStatus::Running;
                    Ok(RouteDecision::Returned {
                        resume_at: state.position(),
                    })
                }
            }
            NodeKind::Branch => {
                let graph = self.graph(flow)?;
                let current = state.step.clone();
                let to = graph
                    .successor_for(&current, result.edge_condition())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        RoutingError::Other(anyhow!(
                            "Branch node '{current}' has no edge for status {:?}",
                            result.status
                        ))
                    })?;
                let position = StepRef::new(&state.flow, &to);
                state.advance_to(position.clone(), RunStatus::Running);
                Ok(RouteDecision::Continue { to: position })
            }
            NodeKind::Linear | NodeKind::Microloop => {
                let current = state.step.clone();
                self.advance_default(state, flow, &current)
            }
        }
    }

    fn on_rerun(&self, state: &mut RunState, flow: &Flow) -> RouteDecision {
        state.retry_count += 1;
        if state.retry_count > flow.policy.retry_ceiling {
            let reason = format!(
                "retry ceiling {} exceeded at step '{}'",
                flow.policy.retry_ceiling, state.step
            );
            return self.interrupt(state, &reason);
        }
        state.status = RunStatus::Running;
        RouteDecision::Rerun {
            step: state.position(),
            attempt: state.retry_count,
        }
    }

    fn on_bounce(
        &self,
        state: &mut RunState,
        flow: &Flow,
        result: &HandoffResult,
    ) -> Result<RouteDecision, RoutingError> {
        let target = result
            .bounce_target
            .clone()
            .or_else(|| flow.policy.default_bounce.clone())
            .ok_or_else(|| RoutingError::MissingBounceTarget {
                step: state.step.clone(),
            })?;
        let reason = result
            .note
            .clone()
            .unwrap_or_else(|| "bounce requested".to_string());
        self.bounce_to(state, target, &reason)
    }

    fn bounce_to(
        &self,
        state: &mut RunState,
        target: StepRef,
        reason: &str,
    ) -> Result<RouteDecision, RoutingError> {
        // The target must resolve before any state mutation; a bounce to
        // nowhere would park the run at an uncompilable position.
        let resolved = self.flows.resolve_flow(&target.flow).ok_or_else(|| {
            RoutingError::UnknownBounceTarget {
                target: target.to_string(),
            }
        })?;
        if resolved.node(&target.step).is_none() {
            return Err(RoutingError::UnknownBounceTarget {
                target: target.to_string(),
            });
        }

        state.warn("bounce", reason);

        // Pop back to the target's flow if it sits somewhere on the stack.
        if target.flow != state.flow
            && state
                .interruption_stack
                .iter()
                .any(|f| f.interrupted.flow == target.flow)
        {
            while state.flow != target.flow {
                if state.pop_frame().is_none() {
                    return Err(RoutingError::StackUnderflow {
                        run_id: state.run_id.to_string(),
                    });
                }
            }
        }

        state.advance_to(target.clone(), RunStatus::Running);
        Ok(RouteDecision::Bounce {
            to: target,
            reason: reason.to_string(),
        })
    }

    fn exhaust_microloop(
        &self,
        state: &mut RunState,
        flow: &Flow,
        anchor_id: &str,
        result: &HandoffResult,
    ) -> Result<RouteDecision, RoutingError> {
        let reason = format!(
            "microloop ceiling {} reached at step '{anchor_id}'",
            flow.policy.microloop_ceiling
        );
        match flow.policy.on_microloop_exhausted {
            ExhaustionBehavior::Bounce => {
                let target = result
                    .bounce_target
                    .clone()
                    .or_else(|| flow.policy.default_bounce.clone())
                    .ok_or_else(|| RoutingError::MissingBounceTarget {
                        step: anchor_id.to_string(),
                    })?;
                self.bounce_to(state, target, &reason)
            }
            ExhaustionBehavior::ProceedWithConcerns => {
                state.warn("microloop_exhausted", &reason);
                self.advance_default(state, flow, anchor_id)
            }
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────

    fn active_flow(&self, state: &RunState) -> Result<Flow, RoutingError> {
        self.flows
            .resolve_flow(&state.flow)
            .ok_or_else(|| RoutingError::Other(anyhow!("Unknown active flow '{}'", state.flow)))
    }

    fn graph(&self, flow: &Flow) -> Result<FlowGraph, RoutingError> {
        FlowGraph::new(flow).map_err(RoutingError::Other)
    }

    /// Current node definition: flow node or a previously injected one.
    fn current_node<'s>(
        &self,
        state: &'s RunState,
        flow: &'s Flow,
    ) -> Result<&'s FlowNode, RoutingError> {
        flow.node(&state.step)
            .or_else(|| state.injected_nodes.iter().find(|n| n.id == state.step))
            .ok_or_else(|| {
                RoutingError::Other(anyhow!(
                    "Step '{}' not found in flow '{}' or injected nodes",
                    state.step,
                    flow.id
                ))
            })
    }

    fn advance_default(
        &self,
        state: &mut RunState,
        flow: &Flow,
        from: &str,
    ) -> Result<RouteDecision, RoutingError> {
        let graph = self.graph(flow)?;
        let Some(to) = graph.default_successor(from).map(str::to_string) else {
            // No successor: only legal at a terminal node.
            if flow.node(from).map(|n| n.kind) == Some(NodeKind::Terminal) {
                state.status = RunStatus::Succeeded;
                return Ok(RouteDecision::Complete);
            }
            return Err(RoutingError::Other(anyhow!(
                "Non-terminal step '{from}' has no default successor"
            )));
        };
        let position = StepRef::new(&state.flow, &to);
        state.advance_to(position.clone(), RunStatus::Running);
        Ok(RouteDecision::Continue { to: position })
    }

    fn interrupt(&self, state: &mut RunState, reason: &str) -> RouteDecision {
        state.status = RunStatus::Interrupted;
        state.warn("fix_environment", reason);
        RouteDecision::FixEnvironment {
            reason: reason.to_string(),
        }
    }

    fn check_allowed(&self, flow: &Flow, action: RouteActionKind) -> Result<(), RoutingError> {
        if flow.policy.allows(action) {
            Ok(())
        } else {
            Err(RoutingError::DisallowedAction {
                flow: flow.id.clone(),
                action: action.to_string(),
            })
        }
    }

    fn check_depth(&self, state: &RunState, flow: &Flow) -> Result<(), RoutingError> {
        let ceiling = flow.policy.injection_depth_ceiling;
        if state.injection_depth() as u32 + 1 > ceiling {
            return Err(RoutingError::PolicyViolation {
                kind: CeilingKind::InjectionDepth,
                ceiling,
                step: state.step.clone(),
            });
        }
        Ok(())
    }

    /// Where an injection returns to: the interrupted step's default
    /// successor, or the step itself when it has none.
    fn resume_point(&self, state: &RunState, flow: &Flow) -> Result<StepRef, RoutingError> {
        let graph = self.graph(flow)?;
        Ok(graph
            .default_successor(&state.step)
            .map(|s| StepRef::new(&state.flow, s))
            .unwrap_or_else(|| state.position()))
    }

    fn push(
        &self,
        state: &mut RunState,
        frame: StackFrame,
        resume_at: StepRef,
    ) -> Result<RouteDecision, RoutingError> {
        let classification = frame.target.classification().to_string();
        state.push_frame(frame, resume_at);
        state.status = RunStatus::Running;
        Ok(RouteDecision::Injected {
            first: state.position(),
            classification,
        })
    }
}

/// Find the microloop node governing a step: the step itself, or the
/// microloop node naming it as critic.
fn microloop_anchor<'f>(flow: &'f Flow, step: &str) -> Option<&'f FlowNode> {
    let node = flow.node(step)?;
    if node.kind == NodeKind::Microloop {
        return Some(node);
    }
    flow.nodes
        .iter()
        .find(|n| n.kind == NodeKind::Microloop && n.critic.as_deref() == Some(step))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::test_support::{linear_flow, node};
    use crate::flow::{DetourSuggestion, FlowEdge};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn engine_with(flows: Vec<Flow>) -> RoutingEngine<HashMap<String, Flow>> {
        let map = flows.into_iter().map(|f| (f.id.clone(), f)).collect();
        RoutingEngine::new(map)
    }

    fn running_state(flow: &str, step: &str) -> RunState {
        let mut state = RunState::new(Uuid::new_v4(), flow, step);
        state.status = RunStatus::Running;
        state
    }

    fn permissive(mut flow: Flow) -> Flow {
        flow.policy.allowed_actions = vec![
            RouteActionKind::Continue,
            RouteActionKind::Detour,
            RouteActionKind::InjectFlow,
            RouteActionKind::InjectNodes,
            RouteActionKind::ExtendGraph,
        ];
        flow
    }

    #[test]
    fn test_linear_advance() {
        let engine = engine_with(vec![linear_flow("f")]);
        let mut state = running_state("f", "a");

        let decision = engine.route(&mut state, &HandoffResult::verified()).unwrap();
        assert_eq!(
            decision,
            RouteDecision::Continue {
                to: StepRef::new("f", "b")
            }
        );
        assert_eq!(state.step, "b");
        assert_eq!(state.status, RunStatus::Running);
    }

    #[test]
    fn test_terminal_completes_with_empty_stack() {
        let engine = engine_with(vec![linear_flow("f")]);
        let mut state = running_state("f", "c");

        let decision = engine.route(&mut state, &HandoffResult::verified()).unwrap();
        assert_eq!(decision, RouteDecision::Complete);
        assert_eq!(state.status, RunStatus::Succeeded);
        assert!(state.stacks_balanced());
    }

    #[test]
    fn test_bounded_retry_converts_to_fix_environment() {
        let engine = engine_with(vec![linear_flow("f")]);
        let mut state = running_state("f", "a");
        let rerun = HandoffResult::verified()
            .with_status(HandoffStatus::Unverified)
            .with_action(HandoffAction::Rerun);

        // Ceiling is 2: two reruns pass, the third converts.
        for attempt in 1..=2u32 {
            let decision = engine.route(&mut state, &rerun).unwrap();
            assert_eq!(
                decision,
                RouteDecision::Rerun {
                    step: StepRef::new("f", "a"),
                    attempt
                }
            );
        }
        let decision = engine.route(&mut state, &rerun).unwrap();
        assert!(matches!(decision, RouteDecision::FixEnvironment { .. }));
        assert_eq!(state.status, RunStatus::Interrupted);
    }

    #[test]
    fn test_fix_environment_interrupts_and_records() {
        let engine = engine_with(vec![linear_flow("f")]);
        let mut state = running_state("f", "b");

        let result = HandoffResult::synthetic_fix_environment("sandbox is down");
        let decision = engine.route(&mut state, &result).unwrap();
        assert!(matches!(decision, RouteDecision::FixEnvironment { .. }));
        assert_eq!(state.status, RunStatus::Interrupted);
        assert_eq!(state.warnings.len(), 1);
        assert_eq!(state.warnings[0].code, "fix_environment");
    }

    fn microloop_flow(behavior: ExhaustionBehavior) -> Flow {
        let mut flow = linear_flow("f");
        flow.nodes[1].kind = NodeKind::Microloop;
        flow.nodes[1].critic = None;
        flow.edges.push(FlowEdge::new("b", "b"));
        flow.policy.microloop_ceiling = 3;
        flow.policy.on_microloop_exhausted = behavior;
        flow.policy.default_bounce = Some(StepRef::new("f", "a"));
        flow
    }

    fn looping() -> HandoffResult {
        HandoffResult::verified()
            .with_status(HandoffStatus::Unverified)
            .with_iteration_can_help(true)
    }

    #[test]
    fn test_microloop_loops_then_bounces_at_ceiling() {
        let engine = engine_with(vec![microloop_flow(ExhaustionBehavior::Bounce)]);
        let mut state = running_state("f", "b");

        for _ in 0..3 {
            let decision = engine.route(&mut state, &looping()).unwrap();
            assert!(matches!(decision, RouteDecision::Continue { .. }));
            assert_eq!(state.step, "b");
        }
        // Fourth unverified result exceeds the ceiling: converted to bounce
        let decision = engine.route(&mut state, &looping()).unwrap();
        assert!(matches!(decision, RouteDecision::Bounce { .. }));
        assert_eq!(state.step, "a");
    }

    #[test]
    fn test_microloop_exits_on_verified() {
        let engine = engine_with(vec![microloop_flow(ExhaustionBehavior::Bounce)]);
        let mut state = running_state("f", "b");

        engine.route(&mut state, &looping()).unwrap();
        let decision = engine.route(&mut state, &HandoffResult::verified()).unwrap();
        assert_eq!(
            decision,
            RouteDecision::Continue {
                to: StepRef::new("f", "c")
            }
        );
    }

    #[test]
    fn test_microloop_exits_when_iteration_cannot_help() {
        let engine = engine_with(vec![microloop_flow(ExhaustionBehavior::Bounce)]);
        let mut state = running_state("f", "b");

        let stuck = HandoffResult::verified()
            .with_status(HandoffStatus::Unverified)
            .with_iteration_can_help(false);
        let decision = engine.route(&mut state, &stuck).unwrap();
        assert_eq!(
            decision,
            RouteDecision::Continue {
                to: StepRef::new("f", "c")
            }
        );
        assert_eq!(state.microloop_count, 0);
    }

    #[test]
    fn test_microloop_exhaustion_can_proceed_with_concerns() {
        let engine = engine_with(vec![microloop_flow(
            ExhaustionBehavior::ProceedWithConcerns,
        )]);
        let mut state = running_state("f", "b");

        for _ in 0..3 {
            engine.route(&mut state, &looping()).unwrap();
        }
        let decision = engine.route(&mut state, &looping()).unwrap();
        assert!(matches!(decision, RouteDecision::Continue { .. }));
        assert_eq!(state.step, "c");
        assert!(state.warnings.iter().any(|w| w.code == "microloop_exhausted"));
    }

    #[test]
    fn test_microloop_alternates_with_critic() {
        let mut flow = microloop_flow(ExhaustionBehavior::Bounce);
        flow.nodes[1].critic = Some("a".to_string());
        let engine = engine_with(vec![flow]);
        let mut state = running_state("f", "b");

        engine.route(&mut state, &looping()).unwrap();
        assert_eq!(state.step, "a"); // hop to critic
        engine.route(&mut state, &looping()).unwrap();
        assert_eq!(state.step, "b"); // hop back
        assert_eq!(state.microloop_count, 2);
    }

    #[test]
    fn test_detour_pushes_runs_and_returns_to_interrupted_step() {
        let mut flow = permissive(linear_flow("f"));
        flow.policy.detour_suggestions = vec![DetourSuggestion {
            reason: "env_broken".to_string(),
            nodes: vec!["a".to_string()],
        }];
        let engine = engine_with(vec![flow]);
        let mut state = running_state("f", "b");

        let decision = engine.detour(&mut state, "env_broken").unwrap();
        assert_eq!(
            decision,
            RouteDecision::Injected {
                first: StepRef::new("f", "a"),
                classification: "detour".to_string()
            }
        );
        assert_eq!(state.injection_depth(), 1);

        // Detour step completes: frame pops, run resumes at the
        // interrupted step itself.
        let decision = engine.route(&mut state, &HandoffResult::verified()).unwrap();
        assert_eq!(
            decision,
            RouteDecision::Returned {
                resume_at: StepRef::new("f", "b")
            }
        );
        assert!(state.stacks_balanced());
    }

    #[test]
    fn test_inject_flow_returns_to_declared_successor() {
        let outer = permissive(linear_flow("f"));
        let inner = linear_flow("g");
        let engine = engine_with(vec![outer, inner]);
        let mut state = running_state("f", "b");

        engine.inject_flow(&mut state, "g", "needs design").unwrap();
        assert_eq!(state.flow, "g");
        assert_eq!(state.step, "a");
        assert_eq!(state.injection_depth(), 1);

        // Walk g to its terminal node
        engine.route(&mut state, &HandoffResult::verified()).unwrap();
        engine.route(&mut state, &HandoffResult::verified()).unwrap();
        assert_eq!(state.step, "c");

        // Terminal proceed in the injected flow pops the frame and resumes
        // at b's declared successor in f.
        let decision = engine.route(&mut state, &HandoffResult::verified()).unwrap();
        assert_eq!(
            decision,
            RouteDecision::Returned {
                resume_at: StepRef::new("f", "c")
            }
        );
        assert_eq!(state.flow, "f");
        assert!(state.stacks_balanced());
    }

    #[test]
    fn test_inject_nodes_walks_adhoc_sequence() {
        let flow = permissive(linear_flow("f"));
        let engine = engine_with(vec![flow]);
        let mut state = running_state("f", "b");

        let adhoc = vec![node("patch_env", "worker"), node("verify_env", "worker")];
        engine.inject_nodes(&mut state, adhoc, "gap").unwrap();
        assert_eq!(state.step, "patch_env");
        assert_eq!(state.injected_nodes.len(), 2);

        let decision = engine.route(&mut state, &HandoffResult::verified()).unwrap();
        assert_eq!(
            decision,
            RouteDecision::Continue {
                to: StepRef::new("f", "verify_env")
            }
        );
        let decision = engine.route(&mut state, &HandoffResult::verified()).unwrap();
        assert!(matches!(decision, RouteDecision::Returned { .. }));
        assert!(state.stacks_balanced());
    }

    #[test]
    fn test_injection_depth_ceiling() {
        let mut outer = permissive(linear_flow("f"));
        outer.policy.injection_depth_ceiling = 1;
        let mut inner = permissive(linear_flow("g"));
        inner.policy.injection_depth_ceiling = 1;
        let engine = engine_with(vec![outer, inner]);
        let mut state = running_state("f", "a");

        engine.inject_flow(&mut state, "g", "first").unwrap();
        let err = engine.inject_flow(&mut state, "g", "second").unwrap_err();
        assert!(matches!(
            err,
            RoutingError::PolicyViolation {
                kind: CeilingKind::InjectionDepth,
                ceiling: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_disallowed_action_rejected() {
        // Default policy allows only continue and detour
        let engine = engine_with(vec![linear_flow("f"), linear_flow("g")]);
        let mut state = running_state("f", "a");

        let err = engine.inject_flow(&mut state, "g", "nope").unwrap_err();
        assert!(matches!(err, RoutingError::DisallowedAction { .. }));
        assert_eq!(state.injection_depth(), 0);
    }

    #[test]
    fn test_bounce_with_explicit_target() {
        let engine = engine_with(vec![linear_flow("f")]);
        let mut state = running_state("f", "c");

        let mut result = HandoffResult::verified().with_action(HandoffAction::Bounce);
        result.bounce_target = Some(StepRef::new("f", "a"));
        result.note = Some("tests contradict design".to_string());

        let decision = engine.route(&mut state, &result).unwrap();
        assert_eq!(
            decision,
            RouteDecision::Bounce {
                to: StepRef::new("f", "a"),
                reason: "tests contradict design".to_string()
            }
        );
        assert_eq!(state.step, "a");
        assert!(state.warnings.iter().any(|w| w.code == "bounce"));
    }

    #[test]
    fn test_bounce_to_unknown_step_rejected_without_mutation() {
        let engine = engine_with(vec![linear_flow("f")]);
        let mut state = running_state("f", "c");

        let mut result = HandoffResult::verified().with_action(HandoffAction::Bounce);
        result.bounce_target = Some(StepRef::new("f", "ghost"));

        let err = engine.route(&mut state, &result).unwrap_err();
        assert!(matches!(err, RoutingError::UnknownBounceTarget { .. }));
        // The run stays where it was, with nothing recorded
        assert_eq!(state.step, "c");
        assert!(state.warnings.is_empty());
    }

    #[test]
    fn test_bounce_to_unknown_flow_rejected() {
        let engine = engine_with(vec![linear_flow("f")]);
        let mut state = running_state("f", "c");

        let mut result = HandoffResult::verified().with_action(HandoffAction::Bounce);
        result.bounce_target = Some(StepRef::new("nowhere", "a"));

        let err = engine.route(&mut state, &result).unwrap_err();
        assert!(matches!(err, RoutingError::UnknownBounceTarget { .. }));
        assert_eq!(state.position(), StepRef::new("f", "c"));
    }

    #[test]
    fn test_bounce_without_target_errors() {
        let engine = engine_with(vec![linear_flow("f")]);
        let mut state = running_state("f", "b");

        let result = HandoffResult::verified().with_action(HandoffAction::Bounce);
        let err = engine.route(&mut state, &result).unwrap_err();
        assert!(matches!(err, RoutingError::MissingBounceTarget { .. }));
    }

    #[test]
    fn test_bounce_pops_to_outer_flow() {
        let outer = permissive(linear_flow("f"));
        let inner = linear_flow("g");
        let engine = engine_with(vec![outer, inner]);
        let mut state = running_state("f", "b");
        engine.inject_flow(&mut state, "g", "design").unwrap();

        let mut result = HandoffResult::verified().with_action(HandoffAction::Bounce);
        result.bounce_target = Some(StepRef::new("f", "a"));

        let decision = engine.route(&mut state, &result).unwrap();
        assert!(matches!(decision, RouteDecision::Bounce { .. }));
        assert_eq!(state.flow, "f");
        assert_eq!(state.step, "a");
        assert!(state.stacks_balanced());
    }

    #[test]
    fn test_extend_graph_is_proposal_only() {
        let flow = permissive(linear_flow("f"));
        let engine = engine_with(vec![flow]);
        let state = running_state("f", "b");

        let proposal = GraphExtension::new("f", "needs a docs step", state.run_id)
            .with_node(node("docs", "writer"))
            .with_edge(FlowEdge::new("b", "docs"));
        let decision = engine.extend_graph(&state, proposal.clone()).unwrap();
        assert_eq!(decision, RouteDecision::Proposed { proposal });
        // No state mutation whatsoever
        assert_eq!(state.step, "b");
        assert!(state.stacks_balanced());
    }
}
