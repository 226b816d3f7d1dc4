//! Specification compiler: flow + step + run context → instruction plan.
//!
//! Compilation is pure. Given identical inputs it produces an identical
//! content hash, which is what makes the hash usable as a cache and audit
//! key. The compiler resolves the step's station, merges parameter
//! overrides (step wins over station, per-call wins over step), renders the
//! objective template, concatenates identity text with the station's
//! ordered fragments, and assembles engine options without ever widening
//! capabilities beyond the station's ceiling.

mod template;

pub use template::{merge_values, render};

use crate::errors::{CompileError, RefKind};
use crate::flow::{Flow, FlowNode};
use crate::fragment::FragmentStore;
use crate::station::{EngineProfile, Station, StationCatalog};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Per-call context for one compilation.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub iteration: u32,
    /// Per-call template overrides; win over step params
    pub overrides: BTreeMap<String, String>,
}

impl RunContext {
    pub fn new(run_id: Uuid, iteration: u32) -> Self {
        Self {
            run_id,
            iteration,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_override(mut self, key: &str, value: &str) -> Self {
        self.overrides.insert(key.to_string(), value.to_string());
        self
    }
}

/// The compiled, immutable output for one (flow, step, run) triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionPlan {
    /// Rendered identity text plus concatenated fragments
    pub identity: String,
    /// Rendered objective text
    pub objective: String,
    /// What the handoff must contain
    pub contract: OutputContract,
    /// Effective execution-engine options for this step
    pub engine: EngineProfile,
    /// Audit record tying the plan back to its inputs
    pub trace: Traceability,
}

/// Required result fields and artifact paths for the step's handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OutputContract {
    pub required_result_fields: Vec<String>,
    pub required_artifacts: Vec<String>,
}

/// Traceability record: enough to reproduce and audit the compilation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Traceability {
    /// e.g. `critic@v3`
    pub station_version: String,
    /// e.g. `delivery@v2`
    pub flow_version: String,
    pub step_id: String,
    /// Hash over the rendered identity and objective text
    pub content_hash: String,
    pub compiled_at: DateTime<Utc>,
    pub run_id: Uuid,
    pub iteration: u32,
}

/// The compiler borrows the read-only catalogs it resolves against.
pub struct Compiler<'a> {
    stations: &'a StationCatalog,
    fragments: &'a FragmentStore,
}

impl<'a> Compiler<'a> {
    pub fn new(stations: &'a StationCatalog, fragments: &'a FragmentStore) -> Self {
        Self {
            stations,
            fragments,
        }
    }

    /// Compile the instruction plan for one step of a flow.
    pub fn compile(
        &self,
        flow: &Flow,
        step_id: &str,
        ctx: &RunContext,
    ) -> Result<InstructionPlan, CompileError> {
        let node = flow.node(step_id).ok_or_else(|| CompileError::UnknownReference {
            kind: RefKind::Step,
            reference: format!("{}/{}", flow.id, step_id),
        })?;

        let station = self
            .stations
            .get(&node.station, node.station_version)
            .ok_or_else(|| CompileError::UnknownReference {
                kind: RefKind::Station,
                reference: format!("{}@v{}", node.station, node.station_version),
            })?;

        let values = merge_values(station, &node.params, &ctx.overrides);
        self.check_required(station, &values)?;

        let objective = render(&station.objective_template, &values, &station.id)?;
        let identity = self.assemble_identity(station)?;
        let engine = effective_engine(station, node)?;

        let content_hash = content_hash(&identity, &objective);
        tracing::debug!(
            flow = %flow.versioned_id(),
            step = step_id,
            station = %station.versioned_id(),
            hash = %content_hash,
            "compiled instruction plan"
        );

        Ok(InstructionPlan {
            identity,
            objective,
            contract: OutputContract {
                required_result_fields: station.required_result_fields.clone(),
                required_artifacts: station.required_outputs.clone(),
            },
            engine,
            trace: Traceability {
                station_version: station.versioned_id(),
                flow_version: flow.versioned_id(),
                step_id: step_id.to_string(),
                content_hash,
                compiled_at: Utc::now(),
                run_id: ctx.run_id,
                iteration: ctx.iteration,
            },
        })
    }

    /// Every required placeholder must have a merged value.
    fn check_required(
        &self,
        station: &Station,
        values: &BTreeMap<String, String>,
    ) -> Result<(), CompileError> {
        for placeholder in &station.placeholders {
            if placeholder.required && !values.contains_key(&placeholder.name) {
                return Err(CompileError::TemplateError {
                    station: station.id.clone(),
                    placeholder: placeholder.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Identity text followed by the station's fragments, in declared order.
    fn assemble_identity(&self, station: &Station) -> Result<String, CompileError> {
        let mut parts = vec![station.identity.trim().to_string()];
        if !station.invariants.is_empty() {
            let invariants = station
                .invariants
                .iter()
                .map(|i| format!("- {i}"))
                .collect::<Vec<_>>()
                .join("\n");
            parts.push(format!("Invariants:\n{invariants}"));
        }
        for body in self.fragments.resolve_all(&station.fragments)? {
            parts.push(body.trim().to_string());
        }
        Ok(parts.join("\n\n"))
    }
}

/// Merge step-level engine overrides onto the station profile. The merged
/// profile must stay within the station ceiling; the turn ceiling is not
/// overridable at all.
fn effective_engine(station: &Station, node: &FlowNode) -> Result<EngineProfile, CompileError> {
    let mut engine = station.engine.clone();
    let Some(overrides) = &node.engine_overrides else {
        return Ok(engine);
    };

    if let Some(tier) = overrides.tier {
        engine.tier = tier;
    }
    if let Some(capabilities) = &overrides.capabilities {
        engine.capabilities = capabilities.clone();
    }

    if !station.engine.permits(&engine) {
        let capability = if engine.tier > station.engine.tier {
            format!("tier:{:?}", engine.tier)
        } else {
            engine
                .capabilities
                .iter()
                .find(|c| !station.engine.capabilities.contains(c))
                .cloned()
                .unwrap_or_else(|| "turn_ceiling".to_string())
        };
        return Err(CompileError::CapabilityEscalation {
            step: node.id.clone(),
            capability,
        });
    }

    Ok(engine)
}

/// Stable, order-sensitive hash over the rendered text. The unit separator
/// keeps (identity="ab", objective="c") distinct from ("a", "bc").
pub fn content_hash(identity: &str, objective: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update([0x1f]);
    hasher.update(objective.as_bytes());
    format!("{:x}", hasher.finalize())
}
