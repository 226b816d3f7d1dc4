//! Station templates: versioned, reusable execution roles.
//!
//! A station describes what a role needs (input artifacts), what it must
//! produce (output artifacts), how the execution engine may run it (resource
//! tier, capability allow-list, turn ceiling), and the parameterized
//! objective text the compiler renders for each step.

use serde::{Deserialize, Serialize};

/// A versioned station template. Immutable once referenced by a published
/// flow version; new behavior requires a new version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    /// Stable identifier (e.g. "implementer", "critic")
    pub id: String,
    /// Version number; bumped on any behavioral change
    pub version: u32,
    /// Human-readable name
    pub name: String,
    /// Artifact identifiers this station requires as inputs
    #[serde(default)]
    pub required_inputs: Vec<String>,
    /// Artifact identifiers this station may consume if present
    #[serde(default)]
    pub optional_inputs: Vec<String>,
    /// Artifact identifiers this station must produce
    #[serde(default)]
    pub required_outputs: Vec<String>,
    /// Result fields the handoff must populate
    #[serde(default)]
    pub required_result_fields: Vec<String>,
    /// Execution-engine configuration ceiling for this role
    pub engine: EngineProfile,
    /// Free-text identity content, prepended to every compiled plan
    pub identity: String,
    /// Free-text invariants the role must uphold
    #[serde(default)]
    pub invariants: Vec<String>,
    /// Objective template with `{name}` placeholders
    pub objective_template: String,
    /// Placeholder schema for the objective template
    #[serde(default)]
    pub placeholders: Vec<Placeholder>,
    /// Instruction fragment paths concatenated after the identity text
    #[serde(default)]
    pub fragments: Vec<String>,
    /// At most one node across all published flows may reference a
    /// singleton station
    #[serde(default)]
    pub singleton: bool,
    /// If set, only these flows may reference this station
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_flows: Option<Vec<String>>,
}

impl Station {
    /// Identifier qualified with the version, e.g. `critic@v3`.
    pub fn versioned_id(&self) -> String {
        format!("{}@v{}", self.id, self.version)
    }

    /// Look up a placeholder definition by name.
    pub fn placeholder(&self, name: &str) -> Option<&Placeholder> {
        self.placeholders.iter().find(|p| p.name == name)
    }
}

/// Named placeholder in an objective template.
///
/// Required placeholders with no supplied value fail compilation; optional
/// ones fall back to their default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placeholder {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Placeholder {
    pub fn required(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required: true,
            default: None,
            description: None,
        }
    }

    pub fn optional(name: &str, default: &str) -> Self {
        Self {
            name: name.to_string(),
            required: false,
            default: Some(default.to_string()),
            description: None,
        }
    }
}

/// Execution-engine configuration carried by a station.
///
/// Step-level overrides may narrow the capability list or lower the tier,
/// never the reverse; the compiler enforces this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineProfile {
    /// Resource tier the engine should allocate
    pub tier: ResourceTier,
    /// Capability allow-list (tool names, side-effect classes)
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Maximum engine turns for one step
    pub turn_ceiling: u32,
    /// Wall-clock ceiling for one dispatch, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    600
}

impl Default for EngineProfile {
    fn default() -> Self {
        Self {
            tier: ResourceTier::Standard,
            capabilities: Vec::new(),
            turn_ceiling: 50,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EngineProfile {
    /// Check whether `other` stays within this profile's ceiling.
    pub fn permits(&self, other: &EngineProfile) -> bool {
        other.tier <= self.tier
            && other.turn_ceiling <= self.turn_ceiling
            && other
                .capabilities
                .iter()
                .all(|c| self.capabilities.contains(c))
    }
}

/// Resource tier, ordered from cheapest to most capable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceTier {
    Light,
    #[default]
    Standard,
    Heavy,
}

/// In-memory catalog of station templates, keyed by id and version.
#[derive(Debug, Default, Clone)]
pub struct StationCatalog {
    stations: std::collections::HashMap<String, std::collections::BTreeMap<u32, Station>>,
}

impl StationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a station version. Re-registering an existing version
    /// replaces it; published immutability is the specification store's
    /// concern, not the catalog's.
    pub fn insert(&mut self, station: Station) {
        self.stations
            .entry(station.id.clone())
            .or_default()
            .insert(station.version, station);
    }

    /// Fetch an exact station version.
    pub fn get(&self, id: &str, version: u32) -> Option<&Station> {
        self.stations.get(id)?.get(&version)
    }

    /// Fetch the newest version of a station.
    pub fn latest(&self, id: &str) -> Option<&Station> {
        self.stations.get(id)?.values().next_back()
    }

    pub fn contains(&self, id: &str, version: u32) -> bool {
        self.get(id, version).is_some()
    }

    /// Iterate all registered stations, every version.
    pub fn iter(&self) -> impl Iterator<Item = &Station> {
        self.stations.values().flat_map(|versions| versions.values())
    }
}
