//! Capability and agent registry
//!
//! Capabilities are named contracts; agents declare which ones they
//! provide. The registry indexes agents by name and by capability, loads
//! declarations from a directory of YAML files, and binds local
//! implementations to declared names. Lookup by capability is
//! deterministic: ties break alphabetically by agent name.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::dispatch::local::{DoAgent, MonitorAgent};
use crate::error::{EngineError, EngineResult};

/// A state field an agent expects its want's owner to publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateField {
    /// Field name
    pub name: String,
    /// Declared value type, e.g. "number", "string", "object"
    #[serde(default, rename = "type")]
    pub field_type: Option<String>,
}

/// A capability declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    /// Capability name; the matchmaking key between wants and agents
    pub name: String,
    /// Human description
    #[serde(default)]
    pub description: String,
    /// Owner state fields agents providing this capability read
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_state_access: Vec<StateField>,
}

/// Agent execution variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// Action invoked once per reconcile cycle
    Do,
    /// Cooperative long-running observer
    Monitor,
}

impl AgentType {
    /// Wire/history label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Do => "do",
            Self::Monitor => "monitor",
        }
    }
}

/// Where an agent executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode")]
pub enum ExecTarget {
    /// In-process, bound to a registered implementation
    Local,
    /// HTTP-dispatched to a remote agent service
    Remote {
        /// Base URL of the agent service
        #[serde(rename = "baseUrl")]
        base_url: String,
    },
}

impl Default for ExecTarget {
    fn default() -> Self {
        Self::Local
    }
}

/// An agent declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    /// Unique agent name
    pub name: String,
    /// Do or Monitor
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    /// Capabilities this agent provides
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Local or remote execution
    #[serde(default)]
    pub exec: ExecTarget,
    /// Human description
    #[serde(default)]
    pub description: String,
}

/// One declaration file: capabilities and agents together
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDeclarations {
    /// Capability declarations
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Agent declarations
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
}

/// Registry of capabilities and agents
///
/// Concurrent maps: the reconcile loop reads while API handlers register.
#[derive(Default)]
pub struct AgentRegistry {
    by_name: DashMap<String, Arc<AgentSpec>>,
    by_capability: DashMap<String, BTreeSet<String>>,
    capabilities: DashMap<String, Capability>,
    do_impls: DashMap<String, Arc<dyn DoAgent>>,
    monitor_impls: DashMap<String, Arc<dyn MonitorAgent>>,
}

impl AgentRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability declaration
    pub fn register_capability(&self, capability: Capability) {
        self.capabilities
            .insert(capability.name.clone(), capability);
    }

    /// Look up a capability declaration
    pub fn capability(&self, name: &str) -> Option<Capability> {
        self.capabilities.get(name).map(|c| c.clone())
    }

    /// All registered capabilities, sorted by name
    pub fn list_capabilities(&self) -> Vec<Capability> {
        let mut all: Vec<Capability> = self.capabilities.iter().map(|c| c.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Remove a capability declaration
    pub fn unregister_capability(&self, name: &str) -> EngineResult<()> {
        self.capabilities
            .remove(name)
            .map(|_| ())
            .ok_or(EngineError::NotFound {
                kind: "capability",
                id: name.to_string(),
            })
    }

    /// Register an agent declaration
    pub fn register(&self, spec: AgentSpec) {
        let spec = Arc::new(spec);
        for capability in &spec.capabilities {
            self.by_capability
                .entry(capability.clone())
                .or_default()
                .insert(spec.name.clone());
        }
        info!(agent = %spec.name, agent_type = spec.agent_type.as_str(), "registered agent");
        self.by_name.insert(spec.name.clone(), spec);
    }

    /// Register a local Do-agent implementation under its declaration
    pub fn register_do(&self, spec: AgentSpec, implementation: Arc<dyn DoAgent>) {
        self.do_impls.insert(spec.name.clone(), implementation);
        self.register(spec);
    }

    /// Register a local Monitor-agent implementation under its declaration
    pub fn register_monitor(&self, spec: AgentSpec, implementation: Arc<dyn MonitorAgent>) {
        self.monitor_impls.insert(spec.name.clone(), implementation);
        self.register(spec);
    }

    /// Remove an agent and its capability index entries
    pub fn unregister(&self, name: &str) -> EngineResult<()> {
        let Some((_, spec)) = self.by_name.remove(name) else {
            return Err(EngineError::NotFound {
                kind: "agent",
                id: name.to_string(),
            });
        };
        for capability in &spec.capabilities {
            if let Some(mut set) = self.by_capability.get_mut(capability) {
                set.remove(name);
            }
        }
        self.do_impls.remove(name);
        self.monitor_impls.remove(name);
        Ok(())
    }

    /// Look up an agent by name
    pub fn get(&self, name: &str) -> Option<Arc<AgentSpec>> {
        self.by_name.get(name).map(|s| Arc::clone(&s))
    }

    /// All registered agents, sorted by name
    pub fn list(&self) -> Vec<Arc<AgentSpec>> {
        let mut all: Vec<Arc<AgentSpec>> =
            self.by_name.iter().map(|s| Arc::clone(&s)).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Agents providing `capability`, alphabetical by name
    pub fn find_by_capability(&self, capability: &str) -> Vec<Arc<AgentSpec>> {
        let Some(names) = self.by_capability.get(capability) else {
            return Vec::new();
        };
        names.iter().filter_map(|n| self.get(n)).collect()
    }

    /// The Do-agent bound to `capability` this cycle
    ///
    /// Deterministic: the alphabetically first Do-agent providing it.
    pub fn do_agent_for(&self, capability: &str) -> Option<Arc<AgentSpec>> {
        self.find_by_capability(capability)
            .into_iter()
            .find(|a| a.agent_type == AgentType::Do)
    }

    /// Monitor agents applying to any of `requires`, deduplicated
    pub fn monitors_for(&self, requires: &[String]) -> Vec<Arc<AgentSpec>> {
        let mut seen = BTreeSet::new();
        let mut monitors = Vec::new();
        for capability in requires {
            for agent in self.find_by_capability(capability) {
                if agent.agent_type == AgentType::Monitor && seen.insert(agent.name.clone()) {
                    monitors.push(agent);
                }
            }
        }
        monitors
    }

    /// Local Do implementation for an agent name
    pub fn do_impl(&self, name: &str) -> Option<Arc<dyn DoAgent>> {
        self.do_impls.get(name).map(|a| Arc::clone(&a))
    }

    /// Local Monitor implementation for an agent name
    pub fn monitor_impl(&self, name: &str) -> Option<Arc<dyn MonitorAgent>> {
        self.monitor_impls.get(name).map(|a| Arc::clone(&a))
    }

    /// Load every declaration file in a directory
    ///
    /// Files that fail to parse are logged and skipped; the rest register.
    /// Returns how many agents were registered.
    pub fn load_dir<P: AsRef<Path>>(&self, dir: P) -> EngineResult<usize> {
        let mut registered = 0;
        for entry in std::fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            let declarations: AgentDeclarations = match serde_yaml::from_str(&content) {
                Ok(d) => d,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping unparseable agent declaration");
                    continue;
                }
            };
            for capability in declarations.capabilities {
                self.register_capability(capability);
            }
            for agent in declarations.agents {
                self.register(agent);
                registered += 1;
            }
        }
        Ok(registered)
    }

    /// Parent-state fields declared by any capability of `agent`
    pub fn parent_state_access(&self, agent: &AgentSpec) -> Vec<StateField> {
        let mut fields = Vec::new();
        let mut seen = BTreeSet::new();
        for capability in &agent.capabilities {
            if let Some(decl) = self.capability(capability) {
                for field in decl.parent_state_access {
                    if seen.insert(field.name.clone()) {
                        fields.push(field);
                    }
                }
            }
        }
        fields
    }
}
