//! Specification store: the authoring surface for flows and stations.
//!
//! All writes go through optimistic concurrency: every read hands out a
//! token derived from the document's canonical JSON, and a write must
//! present the token it read. On mismatch the store rejects with both
//! tokens and never merges. Versions are append-only: a successful flow
//! write bumps the version, and station versions are immutable once
//! registered, so a published flow's pinned references never shift.

use crate::errors::StoreError;
use crate::flow::{
    Finding, Flow, ValidationLevel, validate_policy, validate_routing, validate_structural,
};
use crate::fragment::FragmentStore;
use crate::routing::{FlowResolver, GraphExtension};
use crate::station::{Station, StationCatalog};
use anyhow::{Context, anyhow};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// Concurrency token: hash of the document's canonical JSON form.
pub fn concurrency_token<T: Serialize>(doc: &T) -> Result<String, StoreError> {
    let json = serde_json::to_string(doc)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Default)]
struct Inner {
    flows: HashMap<String, Flow>,
    stations: StationCatalog,
    fragments: FragmentStore,
    proposals: Vec<GraphExtension>,
}

#[derive(Default)]
pub struct SpecStore {
    inner: Mutex<Inner>,
}

impl SpecStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a specification tree from disk: `stations/*.yaml`,
    /// `flows/*.yaml` and a `fragments/` directory. Every loaded flow must
    /// pass full validation.
    pub fn load_dir(root: &Path) -> Result<Self, StoreError> {
        let store = Self::new();
        {
            let mut inner = store.lock();

            let fragments_dir = root.join("fragments");
            if fragments_dir.is_dir() {
                inner.fragments =
                    FragmentStore::from_dir(&fragments_dir).map_err(StoreError::Other)?;
            }

            for body in read_yaml_files(&root.join("stations"))? {
                let station: Station = serde_yaml::from_str(&body)
                    .map_err(|e| StoreError::Other(anyhow!("Invalid station document: {e}")))?;
                let findings = validate_station(&inner, &station);
                reject_on_errors(findings)?;
                inner.stations.insert(station);
            }

            for body in read_yaml_files(&root.join("flows"))? {
                let flow: Flow = serde_yaml::from_str(&body)
                    .map_err(|e| StoreError::Other(anyhow!("Invalid flow document: {e}")))?;
                let findings = validate_flow_inner(&inner, &flow, ValidationLevel::Full);
                reject_on_errors(findings)?;
                inner.flows.insert(flow.id.clone(), flow);
            }
        }
        Ok(store)
    }

    /// Seed the fragment library (tests and embedded setups).
    pub fn set_fragments(&self, fragments: FragmentStore) {
        self.lock().fragments = fragments;
    }

    // ── Flows ─────────────────────────────────────────────────────────

    /// Read a flow together with its concurrency token.
    pub fn get_flow(&self, id: &str) -> Result<(Flow, String), StoreError> {
        let inner = self.lock();
        let flow = inner
            .flows
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        let token = concurrency_token(&flow)?;
        Ok((flow, token))
    }

    pub fn list_flows(&self) -> Vec<Flow> {
        let mut flows: Vec<Flow> = self.lock().flows.values().cloned().collect();
        flows.sort_by(|a, b| a.id.cmp(&b.id));
        flows
    }

    /// Write a flow. Creation passes `expected: None`; an update must
    /// present the token from the read it is based on, and exactly one of
    /// two concurrent writers wins. The stored version is bumped past the
    /// current one regardless of what the caller sent.
    pub fn put_flow(
        &self,
        mut flow: Flow,
        expected: Option<&str>,
    ) -> Result<(Flow, String), StoreError> {
        let mut inner = self.lock();

        let findings = validate_flow_inner(&inner, &flow, ValidationLevel::Full);
        reject_on_errors(findings)?;

        match (inner.flows.get(&flow.id), expected) {
            (Some(current), Some(expected)) => {
                let actual = concurrency_token(current)?;
                if expected != actual {
                    return Err(StoreError::Conflict {
                        expected: expected.to_string(),
                        actual,
                    });
                }
                flow.version = current.version + 1;
            }
            (Some(current), None) => {
                return Err(StoreError::Conflict {
                    expected: "<none>".to_string(),
                    actual: concurrency_token(current)?,
                });
            }
            (None, Some(expected)) => {
                return Err(StoreError::Conflict {
                    expected: expected.to_string(),
                    actual: "<absent>".to_string(),
                });
            }
            (None, None) => flow.version = 1,
        }

        let token = concurrency_token(&flow)?;
        tracing::info!(flow = %flow.versioned_id(), "flow stored");
        inner.flows.insert(flow.id.clone(), flow.clone());
        Ok((flow, token))
    }

    /// Run leveled validation against the stored catalogs without writing.
    pub fn validate_flow(&self, flow: &Flow, level: ValidationLevel) -> Vec<Finding> {
        validate_flow_inner(&self.lock(), flow, level)
    }

    // ── Stations ──────────────────────────────────────────────────────

    pub fn get_station(&self, id: &str, version: u32) -> Result<(Station, String), StoreError> {
        let inner = self.lock();
        let station = inner
            .stations
            .get(id, version)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                id: format!("{id}@v{version}"),
            })?;
        let token = concurrency_token(&station)?;
        Ok((station, token))
    }

    pub fn latest_station(&self, id: &str) -> Result<(Station, String), StoreError> {
        let inner = self.lock();
        let station = inner
            .stations
            .latest(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        let token = concurrency_token(&station)?;
        Ok((station, token))
    }

    /// Register a station version. Versions are append-only: a write always
    /// lands as `latest + 1` (1 for a new id), and an update must present
    /// the latest version's token. Existing versions are never rewritten.
    pub fn put_station(
        &self,
        mut station: Station,
        expected: Option<&str>,
    ) -> Result<(Station, String), StoreError> {
        let mut inner = self.lock();

        let findings = validate_station(&inner, &station);
        reject_on_errors(findings)?;

        match (inner.stations.latest(&station.id), expected) {
            (Some(latest), Some(expected)) => {
                let actual = concurrency_token(latest)?;
                if expected != actual {
                    return Err(StoreError::Conflict {
                        expected: expected.to_string(),
                        actual,
                    });
                }
                station.version = latest.version + 1;
            }
            (Some(latest), None) => {
                return Err(StoreError::Conflict {
                    expected: "<none>".to_string(),
                    actual: concurrency_token(latest)?,
                });
            }
            (None, Some(expected)) => {
                return Err(StoreError::Conflict {
                    expected: expected.to_string(),
                    actual: "<absent>".to_string(),
                });
            }
            (None, None) => station.version = 1,
        }

        let token = concurrency_token(&station)?;
        tracing::info!(station = %station.versioned_id(), "station stored");
        inner.stations.insert(station.clone());
        Ok((station, token))
    }

    // ── Catalog snapshots for the compiler ────────────────────────────

    pub fn stations_snapshot(&self) -> StationCatalog {
        self.lock().stations.clone()
    }

    pub fn fragments_snapshot(&self) -> FragmentStore {
        self.lock().fragments.clone()
    }

    // ── Graph extension proposals ─────────────────────────────────────

    /// Record a proposed graph extension for later authoring review.
    pub fn record_proposal(&self, proposal: GraphExtension) {
        tracing::info!(flow = %proposal.flow, proposal = %proposal.id, "graph extension proposed");
        self.lock().proposals.push(proposal);
    }

    /// Proposals targeting one flow, oldest first.
    pub fn proposals_for(&self, flow: &str) -> Vec<GraphExtension> {
        self.lock()
            .proposals
            .iter()
            .filter(|p| p.flow == flow)
            .cloned()
            .collect()
    }

    /// Remove a reviewed proposal. Applying it is an ordinary flow write.
    pub fn take_proposal(&self, id: Uuid) -> Option<GraphExtension> {
        let mut inner = self.lock();
        let index = inner.proposals.iter().position(|p| p.id == id)?;
        Some(inner.proposals.remove(index))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("spec store poisoned")
    }
}

impl FlowResolver for SpecStore {
    fn resolve_flow(&self, id: &str) -> Option<Flow> {
        self.lock().flows.get(id).cloned()
    }
}

impl FlowResolver for std::sync::Arc<SpecStore> {
    fn resolve_flow(&self, id: &str) -> Option<Flow> {
        self.as_ref().resolve_flow(id)
    }
}

fn reject_on_errors(findings: Vec<Finding>) -> Result<(), StoreError> {
    if findings.iter().any(|f| f.severity.is_error()) {
        Err(StoreError::Validation { findings })
    } else {
        Ok(())
    }
}

fn read_yaml_files(dir: &Path) -> Result<Vec<String>, StoreError> {
    let mut bodies = Vec::new();
    if !dir.is_dir() {
        return Ok(bodies);
    }
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))
        .map_err(StoreError::Other)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    paths.sort();
    for path in paths {
        let body = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))
            .map_err(StoreError::Other)?;
        bodies.push(body);
    }
    Ok(bodies)
}

/// Leveled validation against the stored catalogs. Each level runs
/// everything below it; findings accumulate.
fn validate_flow_inner(inner: &Inner, flow: &Flow, level: ValidationLevel) -> Vec<Finding> {
    let mut findings = validate_structural(flow);

    if level >= ValidationLevel::Referential {
        findings.extend(validate_references(inner, flow));
    }
    if level >= ValidationLevel::Routing {
        findings.extend(validate_routing(flow));
    }
    if level >= ValidationLevel::Full {
        findings.extend(validate_policy(flow));
        findings.extend(validate_cross_graph(inner, flow));
    }
    findings
}

/// Referential checks: every station pin resolves and this flow is allowed
/// to reference it.
fn validate_references(inner: &Inner, flow: &Flow) -> Vec<Finding> {
    let mut findings = Vec::new();
    for node in &flow.nodes {
        let path = format!("nodes/{}", node.id);
        let Some(station) = inner.stations.get(&node.station, node.station_version) else {
            let mut finding = Finding::error(
                "flow.node.unknown_station",
                &path,
                format!(
                    "Node '{}' pins unknown station '{}@v{}'",
                    node.id, node.station, node.station_version
                ),
            );
            if let Some(latest) = inner.stations.latest(&node.station) {
                finding = finding
                    .with_suggestion(format!("Latest registered version is v{}", latest.version));
            }
            findings.push(finding);
            continue;
        };
        if let Some(allowed) = &station.allowed_flows
            && !allowed.contains(&flow.id)
        {
            findings.push(Finding::error(
                "flow.node.station_not_allowed",
                &path,
                format!(
                    "Station '{}' restricts its flows and '{}' is not among them",
                    station.id, flow.id
                ),
            ));
        }
        for fragment in &station.fragments {
            if inner.fragments.get(fragment).is_err() {
                findings.push(Finding::error(
                    "flow.node.unknown_fragment",
                    &path,
                    format!(
                        "Station '{}' references missing fragment '{fragment}'",
                        station.id
                    ),
                ));
            }
        }
    }
    findings
}

/// Cross-graph checks: singleton stations may back at most one node across
/// all stored flows, and a cross-flow default bounce must resolve.
fn validate_cross_graph(inner: &Inner, flow: &Flow) -> Vec<Finding> {
    let mut findings = Vec::new();

    for node in &flow.nodes {
        let Some(station) = inner.stations.get(&node.station, node.station_version) else {
            continue;
        };
        if !station.singleton {
            continue;
        }
        let mut references = flow
            .nodes
            .iter()
            .filter(|n| n.station == station.id)
            .count();
        references += inner
            .flows
            .values()
            .filter(|f| f.id != flow.id)
            .flat_map(|f| &f.nodes)
            .filter(|n| n.station == station.id)
            .count();
        if references > 1 {
            findings.push(Finding::error(
                "flow.node.singleton_violation",
                &format!("nodes/{}", node.id),
                format!(
                    "Singleton station '{}' is referenced by {references} nodes across the catalog",
                    station.id
                ),
            ));
            break;
        }
    }

    if let Some(target) = &flow.policy.default_bounce
        && target.flow != flow.id
    {
        let resolves = inner
            .flows
            .get(&target.flow)
            .is_some_and(|f| f.node(&target.step).is_some());
        if !resolves {
            findings.push(Finding::error(
                "flow.policy.unknown_bounce_target",
                "policy/default_bounce",
                format!("Default bounce target '{target}' does not resolve"),
            ));
        }
    }

    findings
}

/// Station-level validation: template placeholders and fragment references.
fn validate_station(inner: &Inner, station: &Station) -> Vec<Finding> {
    let mut findings = Vec::new();

    if station.id.is_empty() {
        findings.push(Finding::error(
            "station.id.empty",
            "id",
            "Station id must not be empty",
        ));
    }

    for placeholder in &station.placeholders {
        let token = format!("{{{}}}", placeholder.name);
        if !station.objective_template.contains(&token) {
            findings.push(Finding::warning(
                "station.placeholder.unused",
                &format!("placeholders/{}", placeholder.name),
                format!(
                    "Placeholder '{}' never appears in the objective template",
                    placeholder.name
                ),
            ));
        }
    }

    for fragment in &station.fragments {
        if inner.fragments.get(fragment).is_err() {
            findings.push(Finding::error(
                "station.fragment.unknown",
                &format!("fragments/{fragment}"),
                format!("Fragment '{fragment}' is not in the library"),
            ));
        }
    }

    findings
}
