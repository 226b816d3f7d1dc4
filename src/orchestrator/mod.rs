//! Orchestrator loop: the only writer of run state.
//!
//! One iteration of the loop is: load the snapshot, honor stop/pause
//! requests, compile the current step, dispatch the plan to the execution
//! engine, validate the handoff, route, persist, emit. The execution engine
//! lives behind the [`Engine`] trait: the orchestrator never interprets
//! work output beyond the structured handoff, and a failed or timed-out
//! dispatch is substituted with a synthetic fix-environment handoff rather
//! than a fabricated success.

use crate::compiler::{Compiler, RunContext};
use crate::errors::DispatchError;
use crate::events::{EventKind, EventStream};
use crate::flow::Flow;
use crate::fragment::FragmentStore;
use crate::handoff::HandoffResult;
use crate::routing::{FlowResolver, GraphExtension, RouteDecision, RoutingEngine};
use crate::runstate::{RunState, RunStateStore, RunStatus};
use crate::specstore::concurrency_token;
use crate::station::StationCatalog;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub use crate::compiler::InstructionPlan;

/// The execution-engine seam. Implementations run one compiled plan to
/// completion and report a structured handoff.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn execute(&self, plan: &InstructionPlan) -> Result<HandoffResult, DispatchError>;
}

pub struct Orchestrator<R: FlowResolver + Clone> {
    flows: R,
    router: RoutingEngine<R>,
    store: Arc<RunStateStore>,
    events: Arc<EventStream>,
    engine: Arc<dyn Engine>,
    stations: StationCatalog,
    fragments: FragmentStore,
}

impl<R: FlowResolver + Clone> Orchestrator<R> {
    pub fn new(
        flows: R,
        store: Arc<RunStateStore>,
        events: Arc<EventStream>,
        engine: Arc<dyn Engine>,
        stations: StationCatalog,
        fragments: FragmentStore,
    ) -> Self {
        Self {
            router: RoutingEngine::new(flows.clone()),
            flows,
            store,
            events,
            engine,
            stations,
            fragments,
        }
    }

    pub fn store(&self) -> &Arc<RunStateStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventStream> {
        &self.events
    }

    /// Create a run positioned at the flow's entry node.
    pub fn create_run(&self, flow_id: &str) -> Result<RunState> {
        let flow = self.resolve(flow_id)?;
        let run_id = Uuid::new_v4();
        let state = self.store.create(run_id, &flow)?;
        tracing::info!(run_id = %run_id, flow = %flow.versioned_id(), "run created");
        Ok(state)
    }

    /// Drive a run until it completes, interrupts, stops or pauses.
    /// Idempotent: driving an already-terminal run returns it unchanged.
    pub async fn run(&self, run_id: Uuid) -> Result<RunState> {
        let mut state = self.store.load(run_id)?;
        if state.status.is_terminal() {
            return Ok(state);
        }
        if state.status == RunStatus::Pending {
            self.transition(&mut state, RunStatus::Running);
        }

        loop {
            if state.stop_requested {
                self.transition(&mut state, RunStatus::Stopped);
                state = self.store.persist(state)?;
                break;
            }
            if state.pause_requested {
                state = self.store.persist(state)?;
                tracing::info!(run_id = %run_id, "run paused before dispatch");
                break;
            }
            if state.status.is_terminal() || state.status == RunStatus::Interrupted {
                break;
            }

            let flow = self.resolve(&state.flow)?;
            state.observe_fingerprint(
                &format!("flow:{}", flow.id),
                &concurrency_token(&flow).map_err(anyhow::Error::from)?,
            );
            // The referenced station is fingerprinted too, so drift in any
            // document a step depends on shows up in the snapshot
            let station_ref = flow
                .node(&state.step)
                .or_else(|| state.injected_nodes.iter().find(|n| n.id == state.step))
                .map(|n| (n.station.clone(), n.station_version));
            if let Some((station_id, version)) = station_ref
                && let Some(station) = self.stations.get(&station_id, version)
            {
                let token = concurrency_token(station).map_err(anyhow::Error::from)?;
                state.observe_fingerprint(&format!("station:{}", station.versioned_id()), &token);
            }

            let plan = self.compile_current(&flow, &state)?;
            // A recompile of the same step must hash identically; drift
            // means the definitions changed under a live run.
            state.observe_fingerprint(
                &format!("plan:{}", state.position()),
                &plan.trace.content_hash,
            );

            state.iteration += 1;
            self.events.emit(
                run_id,
                EventKind::StepStarted {
                    flow: state.flow.clone(),
                    step: state.step.clone(),
                    plan_hash: plan.trace.content_hash.clone(),
                },
            );
            // Persist before dispatch so a crash resumes at this step
            state = self.store.persist(state)?;

            let result = self.dispatch(&state, &flow, &plan).await;
            self.check_contract(&mut state, &plan, &result);
            self.events.emit(
                run_id,
                EventKind::StepCompleted {
                    flow: state.flow.clone(),
                    step: state.step.clone(),
                    status: result.status.to_string(),
                },
            );

            let before = state.status;
            let decision = match self.router.route(&mut state, &result) {
                Ok(decision) => decision,
                // A routing error still leaves an inspectable run: warning,
                // error event and failed status are persisted before the
                // error surfaces.
                Err(err) => {
                    let message = err.to_string();
                    tracing::error!(run_id = %run_id, step = %state.step, error = %message, "routing failed");
                    state.warn("routing_error", &message);
                    self.transition(&mut state, RunStatus::Failed);
                    self.events.emit(run_id, EventKind::Error { message });
                    self.store.persist(state)?;
                    return Err(err.into());
                }
            };
            self.events.emit(
                run_id,
                EventKind::RoutingDecision {
                    decision: decision.clone(),
                },
            );
            if let RouteDecision::Returned { resume_at } = &decision {
                self.events.emit(
                    run_id,
                    EventKind::DetourCompleted {
                        resumed_at: resume_at.to_string(),
                    },
                );
            }
            if state.status != before {
                self.events.emit(
                    run_id,
                    EventKind::StateChanged {
                        from: before,
                        to: state.status,
                    },
                );
            }
            state = self.store.persist(state)?;

            match decision {
                RouteDecision::Complete | RouteDecision::FixEnvironment { .. } => break,
                _ => {}
            }
        }
        Ok(state)
    }

    /// Resume an interrupted run after external remediation.
    pub async fn resume(&self, run_id: Uuid) -> Result<RunState> {
        let mut state = self.store.load(run_id)?;
        if state.status == RunStatus::Interrupted {
            self.transition(&mut state, RunStatus::Running);
            self.store.persist(state)?;
        }
        self.run(run_id).await
    }

    /// Push a pre-catalogued detour onto a run. The caller drives the run
    /// afterwards; this only records the decision.
    pub fn request_detour(&self, run_id: Uuid, reason: &str) -> Result<RunState> {
        let mut state = self.store.load(run_id)?;
        let decision = self.router.detour(&mut state, reason)?;
        self.emit_injection(run_id, reason, &decision);
        Ok(self.store.persist(state)?)
    }

    /// Inject a whole catalogued flow at the run's current position.
    pub fn request_flow_injection(
        &self,
        run_id: Uuid,
        flow_id: &str,
        reason: &str,
    ) -> Result<RunState> {
        let mut state = self.store.load(run_id)?;
        let decision = self.router.inject_flow(&mut state, flow_id, reason)?;
        self.emit_injection(run_id, reason, &decision);
        Ok(self.store.persist(state)?)
    }

    /// Inject an ad-hoc node sequence at the run's current position.
    pub fn request_node_injection(
        &self,
        run_id: Uuid,
        nodes: Vec<crate::flow::FlowNode>,
        reason: &str,
    ) -> Result<RunState> {
        let mut state = self.store.load(run_id)?;
        let decision = self.router.inject_nodes(&mut state, nodes, reason)?;
        self.emit_injection(run_id, reason, &decision);
        Ok(self.store.persist(state)?)
    }

    /// Propose a graph extension from a run. Returns the proposal for the
    /// caller to record; the live graph is never touched.
    pub fn propose_extension(
        &self,
        run_id: Uuid,
        proposal: GraphExtension,
    ) -> Result<GraphExtension> {
        let state = self.store.load(run_id)?;
        match self.router.extend_graph(&state, proposal)? {
            RouteDecision::Proposed { proposal } => {
                self.events.emit(
                    run_id,
                    EventKind::RoutingDecision {
                        decision: RouteDecision::Proposed {
                            proposal: proposal.clone(),
                        },
                    },
                );
                Ok(proposal)
            }
            other => Err(anyhow!(
                "Unexpected decision for extension proposal: {other:?}"
            )),
        }
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn resolve(&self, flow_id: &str) -> Result<Flow> {
        self.flows
            .resolve_flow(flow_id)
            .ok_or_else(|| anyhow!("Unknown flow '{flow_id}'"))
    }

    /// Compile the current step. Ad-hoc injected nodes are spliced into a
    /// shadow copy of the flow so the compiler can resolve them.
    fn compile_current(&self, flow: &Flow, state: &RunState) -> Result<InstructionPlan> {
        let mut flow = flow.clone();
        for node in &state.injected_nodes {
            if flow.node(&node.id).is_none() {
                flow.nodes.push(node.clone());
            }
        }
        let compiler = Compiler::new(&self.stations, &self.fragments);
        let ctx = RunContext::new(state.run_id, state.iteration);
        compiler
            .compile(&flow, &state.step, &ctx)
            .with_context(|| format!("Failed to compile step '{}'", state.position()))
    }

    /// Dispatch with the policy (or station) timeout. Any failure becomes a
    /// synthetic fix-environment handoff.
    async fn dispatch(
        &self,
        state: &RunState,
        flow: &Flow,
        plan: &InstructionPlan,
    ) -> HandoffResult {
        let ceiling_secs = flow
            .policy
            .step_timeout_secs
            .unwrap_or(plan.engine.timeout_secs);
        let outcome = tokio::time::timeout(
            Duration::from_secs(ceiling_secs),
            self.engine.execute(plan),
        )
        .await;

        let error = match outcome {
            Ok(Ok(result)) => return result,
            Ok(Err(e)) => e,
            Err(_) => DispatchError::Timeout {
                step: state.step.clone(),
                ceiling_secs,
            },
        };
        tracing::warn!(run_id = %state.run_id, step = %state.step, error = %error, "dispatch failed");
        self.events.emit(
            state.run_id,
            EventKind::Error {
                message: error.to_string(),
            },
        );
        HandoffResult::synthetic_fix_environment(&error.to_string())
    }

    /// Record missing required artifacts as a warning; the handoff itself
    /// still routes.
    fn check_contract(&self, state: &mut RunState, plan: &InstructionPlan, result: &HandoffResult) {
        let missing = result.missing_artifacts(&plan.contract.required_artifacts);
        if !missing.is_empty() {
            let message = format!(
                "Step '{}' handoff omits required artifacts: {}",
                state.step,
                missing.join(", ")
            );
            state.warn("missing_artifacts", &message);
            self.events.emit(
                state.run_id,
                EventKind::Warning {
                    code: "missing_artifacts".to_string(),
                    message,
                },
            );
        }
    }

    fn transition(&self, state: &mut RunState, to: RunStatus) {
        let from = state.status;
        state.status = to;
        self.events
            .emit(state.run_id, EventKind::StateChanged { from, to });
    }

    fn emit_injection(&self, run_id: Uuid, reason: &str, decision: &RouteDecision) {
        if let RouteDecision::Injected { classification, .. } = decision {
            self.events.emit(
                run_id,
                EventKind::DetourStarted {
                    reason: reason.to_string(),
                    classification: classification.clone(),
                },
            );
        }
        self.events.emit(
            run_id,
            EventKind::RoutingDecision {
                decision: decision.clone(),
            },
        );
    }
}
