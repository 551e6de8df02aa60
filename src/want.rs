//! Want entity and identity types
//!
//! A want is the atomic unit of the engine: a declarative description of a
//! desired end state. The entity here carries identity, spec, status, and
//! execution history; the live state map is owned by
//! [`crate::state::WantState`] and joined back in when views are built.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Unique identifier for a want
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WantId(pub Uuid);

impl WantId {
    /// Generate a new want ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string
    pub fn parse_str(s: &str) -> EngineResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| EngineError::Validation(format!("Invalid want ID: {}", e)))
    }
}

impl Default for WantId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Want status lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WantStatus {
    /// Accepted by the control channel, not yet registered
    Created,
    /// Registered; waiting on dependencies or capabilities
    Idle,
    /// A Do-cycle is in flight
    Reaching,
    /// Every required capability succeeded and monitors are healthy
    Achieved,
    /// A Do-agent reported a terminal error
    Failed,
    /// Stopped by explicit control
    Stopped,
    /// Suspended by explicit control
    Suspended,
    /// Deleted; removed from the graph after this
    Terminated,
}

impl WantStatus {
    /// Whether any further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl std::fmt::Display for WantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Idle => "idle",
            Self::Reaching => "reaching",
            Self::Achieved => "achieved",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Suspended => "suspended",
            Self::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

/// A lifecycle-ownership edge from a child want to its parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    /// Owner kind, e.g. "Want"
    pub kind: String,
    /// Owner name
    pub name: String,
    /// Owner ID
    pub id: WantId,
    /// Controller edges cascade deletion; non-controller edges dangle
    #[serde(default)]
    pub controller: bool,
}

/// Derived peer reference: why two wants share state access
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correlation {
    /// The correlated peer
    pub want_id: WantId,
    /// Label strings that established the link, including
    /// `stateAccess/<parent>.<field>` entries
    pub labels: Vec<String>,
}

/// Want metadata: identity, labels, ownership
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WantMetadata {
    /// Stable unique ID; assigned on admission when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<WantId>,
    /// Human name, unique within the graph
    pub name: String,
    /// Want type tag, matching a registered type definition
    #[serde(rename = "type")]
    pub want_type: String,
    /// Free-form labels; selectors match against these
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Ownership edges, child to parent
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    /// Derived peer correlations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub correlations: Vec<Correlation>,
}

/// A `using` selector: matches any want whose labels contain this subset
pub type UsingSelector = BTreeMap<String, String>;

/// Want spec: what the want declares it needs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WantSpec {
    /// Parameters handed to agents
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    /// Capabilities a Do-agent must provide each cycle
    #[serde(default)]
    pub requires: Vec<String>,
    /// Label-subset dependency selectors
    #[serde(default)]
    pub using: Vec<UsingSelector>,
    /// Recipe to expand into owned children
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe: Option<String>,
    /// Explicit references to peers by ID
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<WantId>,
}

/// Outcome of a single agent execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Agent returned success
    Achieved,
    /// Agent returned an error or timed out
    Failed,
}

/// Append-only record of one agent execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentExecution {
    /// Agent name
    pub agent_name: String,
    /// "do" or "monitor"
    pub agent_type: String,
    /// Execution start
    pub started_at: DateTime<Utc>,
    /// Execution end
    pub ended_at: DateTime<Utc>,
    /// Outcome
    pub status: ExecutionStatus,
    /// Error message on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Free-form activity note
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    /// Wall-clock execution time reported by remote agents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

/// One committed state delta, for the want's state history
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateHistoryEntry {
    /// Sequence number assigned at commit
    pub seq: u64,
    /// Keys touched by the delta
    pub keys: Vec<String>,
    /// Agent that wrote the delta, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub written_by: Option<String>,
    /// Commit timestamp
    pub timestamp: DateTime<Utc>,
}

/// The want entity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Want {
    /// Identity, labels, ownership
    pub metadata: WantMetadata,
    /// Declared needs
    #[serde(default)]
    pub spec: WantSpec,
    /// Current lifecycle status
    #[serde(default = "default_status")]
    pub status: WantStatus,
    /// Agent execution history
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<AgentExecution>,
    /// State commit history
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state_history: Vec<StateHistoryEntry>,
    /// Set once the declared recipe has been expanded
    #[serde(default)]
    pub recipe_expanded: bool,
}

fn default_status() -> WantStatus {
    WantStatus::Created
}

impl Want {
    /// Create a want from metadata and spec, in `created` status
    pub fn new(metadata: WantMetadata, spec: WantSpec) -> Self {
        Self {
            metadata,
            spec,
            status: WantStatus::Created,
            history: Vec::new(),
            state_history: Vec::new(),
            recipe_expanded: false,
        }
    }

    /// The want's ID
    ///
    /// Admission assigns an ID before the want enters the graph, so inside
    /// the engine this never misses.
    pub fn id(&self) -> EngineResult<WantId> {
        self.metadata.id.ok_or_else(|| {
            EngineError::Internal(format!("want {} has no ID", self.metadata.name))
        })
    }

    /// Validate an incoming want before admission
    pub fn validate(&self) -> EngineResult<()> {
        if self.metadata.name.is_empty() {
            return Err(EngineError::Validation("want name cannot be empty".into()));
        }
        if self.metadata.want_type.is_empty() {
            return Err(EngineError::Validation(format!(
                "want {} has no type",
                self.metadata.name
            )));
        }
        for selector in &self.spec.using {
            if selector.is_empty() {
                return Err(EngineError::Validation(format!(
                    "want {} has an empty using selector",
                    self.metadata.name
                )));
            }
        }
        Ok(())
    }

    /// Whether a controller owner reference points at `owner`
    pub fn is_controlled_by(&self, owner: WantId) -> bool {
        self.metadata
            .owner_references
            .iter()
            .any(|r| r.controller && r.id == owner)
    }

    /// Whether any owner reference (controller or not) points at `owner`
    pub fn references_owner(&self, owner: WantId) -> bool {
        self.metadata.owner_references.iter().any(|r| r.id == owner)
    }

    /// Append an agent execution record
    pub fn record_execution(&mut self, record: AgentExecution) {
        self.history.push(record);
    }
}

/// Agent history regrouping for the `?groupBy=` query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryGroupBy {
    /// Group by agent name
    Name,
    /// Group by agent type
    Type,
}

impl HistoryGroupBy {
    /// Parse the query parameter value
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "name" => Ok(Self::Name),
            "type" => Ok(Self::Type),
            other => Err(EngineError::Validation(format!(
                "unknown groupBy: {}",
                other
            ))),
        }
    }
}

/// Regroup execution history by agent name or type
pub fn group_history(
    history: &[AgentExecution],
    by: HistoryGroupBy,
) -> BTreeMap<String, Vec<AgentExecution>> {
    let mut grouped: BTreeMap<String, Vec<AgentExecution>> = BTreeMap::new();
    for record in history {
        let key = match by {
            HistoryGroupBy::Name => record.agent_name.clone(),
            HistoryGroupBy::Type => record.agent_type.clone(),
        };
        grouped.entry(key).or_default().push(record.clone());
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_want(name: &str) -> Want {
        Want::new(
            WantMetadata {
                id: Some(WantId::new()),
                name: name.to_string(),
                want_type: "numbers-source".to_string(),
                ..Default::default()
            },
            WantSpec::default(),
        )
    }

    #[test]
    fn validate_rejects_missing_name() {
        let mut want = sample_want("gen");
        want.metadata.name.clear();
        assert!(want.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_selector() {
        let mut want = sample_want("sink");
        want.spec.using.push(BTreeMap::new());
        assert!(want.validate().is_err());
    }

    #[test]
    fn controller_ownership_is_detected() {
        let owner = WantId::new();
        let mut child = sample_want("child");
        child.metadata.owner_references.push(OwnerReference {
            kind: "Want".into(),
            name: "parent".into(),
            id: owner,
            controller: true,
        });
        assert!(child.is_controlled_by(owner));
        assert!(!child.is_controlled_by(WantId::new()));
    }

    #[test]
    fn yaml_round_trip_preserves_spec() {
        let yaml = r#"
metadata:
  name: gen
  type: numbers-source
  labels:
    role: source
spec:
  params:
    count: 3
  requires:
    - produce_numbers
"#;
        let want: Want = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(want.metadata.name, "gen");
        assert_eq!(want.metadata.labels["role"], "source");
        assert_eq!(want.spec.requires, vec!["produce_numbers"]);
        assert_eq!(want.status, WantStatus::Created);

        let emitted = serde_yaml::to_string(&want).unwrap();
        let reparsed: Want = serde_yaml::from_str(&emitted).unwrap();
        assert_eq!(reparsed.spec.params["count"], serde_json::json!(3));
    }

    #[test]
    fn history_groups_by_type() {
        let mut want = sample_want("gen");
        for (name, ty) in [("a", "do"), ("b", "monitor"), ("c", "do")] {
            want.record_execution(AgentExecution {
                agent_name: name.into(),
                agent_type: ty.into(),
                started_at: Utc::now(),
                ended_at: Utc::now(),
                status: ExecutionStatus::Achieved,
                error: None,
                activity: None,
                execution_time_ms: None,
            });
        }
        let grouped = group_history(&want.history, HistoryGroupBy::Type);
        assert_eq!(grouped["do"].len(), 2);
        assert_eq!(grouped["monitor"].len(), 1);
    }
}
