//! Want type definition store
//!
//! The catalog of known want types: parameter schemas, capabilities any
//! owner is expected to provide, default state, and recipe bindings.
//! Domain plugins register definitions (and optional admission/deletion
//! hooks) before the reconcile loop starts.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::registry::agents::{AgentRegistry, AgentType};
use crate::want::Want;

/// One parameter in a want type's schema
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSpec {
    /// Parameter name
    pub name: String,
    /// Declared type, e.g. "number", "string"
    #[serde(default, rename = "type")]
    pub param_type: Option<String>,
    /// Admission fails when a required parameter is absent
    #[serde(default)]
    pub required: bool,
    /// Folded into the want's params when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// A want type definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WantTypeDefinition {
    /// Type name, matched against `metadata.type`
    pub type_name: String,
    /// Display title
    #[serde(default)]
    pub title: String,
    /// Display category
    #[serde(default)]
    pub category: String,
    /// Display pattern tag
    #[serde(default)]
    pub pattern: String,
    /// Parameter schema
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// Capabilities this type expects any owner to provide
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub think_capabilities: Vec<String>,
    /// Initial state committed on admission
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub default_state: BTreeMap<String, Value>,
    /// Recipe expanded for wants of this type with no explicit recipe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe: Option<String>,
    /// Monitor agents applying to this type, cached by
    /// [`WantTypeRegistry::enrich_monitor_capabilities`]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub monitor_capabilities: Vec<String>,
}

/// Hook invoked when a want of the type is admitted
pub type AdmissionHook = Arc<dyn Fn(&mut Want) + Send + Sync>;
/// Hook invoked when a want of the type is deleted
pub type CleanupHook = Arc<dyn Fn(&Want) + Send + Sync>;

#[derive(Default, Clone)]
struct TypeHooks {
    on_admission: Option<AdmissionHook>,
    on_deletion: Option<CleanupHook>,
}

/// Catalog of want type definitions, keyed by type name
#[derive(Default)]
pub struct WantTypeRegistry {
    definitions: DashMap<String, WantTypeDefinition>,
    hooks: DashMap<String, TypeHooks>,
}

impl WantTypeRegistry {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace a definition
    pub fn store(&self, definition: WantTypeDefinition) {
        self.definitions
            .insert(definition.type_name.clone(), definition);
    }

    /// O(1) lookup by type name
    pub fn get(&self, type_name: &str) -> Option<WantTypeDefinition> {
        self.definitions.get(type_name).map(|d| d.clone())
    }

    /// All definitions, sorted by type name
    pub fn list(&self) -> Vec<WantTypeDefinition> {
        let mut all: Vec<WantTypeDefinition> =
            self.definitions.iter().map(|d| d.clone()).collect();
        all.sort_by(|a, b| a.type_name.cmp(&b.type_name));
        all
    }

    /// Remove a definition
    pub fn remove(&self, type_name: &str) -> EngineResult<()> {
        self.hooks.remove(type_name);
        self.definitions
            .remove(type_name)
            .map(|_| ())
            .ok_or(EngineError::NotFound {
                kind: "want type",
                id: type_name.to_string(),
            })
    }

    /// Register an admission hook for a type
    pub fn on_admission(&self, type_name: &str, hook: AdmissionHook) {
        self.hooks
            .entry(type_name.to_string())
            .or_default()
            .on_admission = Some(hook);
    }

    /// Register a deletion hook for a type
    pub fn on_deletion(&self, type_name: &str, hook: CleanupHook) {
        self.hooks
            .entry(type_name.to_string())
            .or_default()
            .on_deletion = Some(hook);
    }

    /// Validate a want against its type and fold in schema defaults
    ///
    /// Runs the type's admission hook last, so hooks observe the defaulted
    /// parameter set.
    pub fn admit(&self, want: &mut Want) -> EngineResult<WantTypeDefinition> {
        let Some(definition) = self.get(&want.metadata.want_type) else {
            return Err(EngineError::Validation(format!(
                "unknown want type: {}",
                want.metadata.want_type
            )));
        };
        for parameter in &definition.parameters {
            if want.spec.params.contains_key(&parameter.name) {
                continue;
            }
            match (&parameter.default, parameter.required) {
                (Some(default), _) => {
                    want.spec
                        .params
                        .insert(parameter.name.clone(), default.clone());
                }
                (None, true) => {
                    return Err(EngineError::Validation(format!(
                        "want {} missing required parameter {}",
                        want.metadata.name, parameter.name
                    )));
                }
                (None, false) => {}
            }
        }
        if want.spec.recipe.is_none() {
            want.spec.recipe = definition.recipe.clone();
        }
        if let Some(hooks) = self.hooks.get(&want.metadata.want_type) {
            if let Some(hook) = &hooks.on_admission {
                hook(want);
            }
        }
        Ok(definition)
    }

    /// Run the type's deletion hook, if any
    pub fn cleanup(&self, want: &Want) {
        if let Some(hooks) = self.hooks.get(&want.metadata.want_type) {
            if let Some(hook) = &hooks.on_deletion {
                hook(want);
            }
        }
    }

    /// Cache which monitor agents apply to each type's capabilities
    pub fn enrich_monitor_capabilities(&self, agents: &AgentRegistry) {
        for mut entry in self.definitions.iter_mut() {
            let mut monitors = Vec::new();
            for capability in &entry.think_capabilities {
                for agent in agents.find_by_capability(capability) {
                    if agent.agent_type == AgentType::Monitor
                        && !monitors.contains(&agent.name)
                    {
                        monitors.push(agent.name.clone());
                    }
                }
            }
            entry.monitor_capabilities = monitors;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::agents::{AgentSpec, ExecTarget};
    use crate::want::{WantMetadata, WantSpec};
    use serde_json::json;

    fn definition(type_name: &str) -> WantTypeDefinition {
        WantTypeDefinition {
            type_name: type_name.to_string(),
            title: "Numbers source".into(),
            category: "demo".into(),
            pattern: "source".into(),
            parameters: vec![
                ParameterSpec {
                    name: "count".into(),
                    param_type: Some("number".into()),
                    required: true,
                    default: Some(json!(10)),
                },
                ParameterSpec {
                    name: "rate".into(),
                    param_type: Some("number".into()),
                    required: false,
                    default: None,
                },
            ],
            think_capabilities: vec!["produce_numbers".into()],
            default_state: BTreeMap::new(),
            recipe: None,
            monitor_capabilities: Vec::new(),
        }
    }

    fn want_of(type_name: &str) -> Want {
        Want::new(
            WantMetadata {
                id: None,
                name: "gen".into(),
                want_type: type_name.into(),
                ..Default::default()
            },
            WantSpec::default(),
        )
    }

    #[test]
    fn admit_folds_defaults() {
        let registry = WantTypeRegistry::new();
        registry.store(definition("numbers-source"));
        let mut want = want_of("numbers-source");
        registry.admit(&mut want).unwrap();
        assert_eq!(want.spec.params["count"], json!(10));
        assert!(!want.spec.params.contains_key("rate"));
    }

    #[test]
    fn admit_rejects_unknown_type() {
        let registry = WantTypeRegistry::new();
        let mut want = want_of("mystery");
        assert!(registry.admit(&mut want).is_err());
    }

    #[test]
    fn required_parameter_without_default_fails() {
        let registry = WantTypeRegistry::new();
        let mut def = definition("numbers-source");
        def.parameters[0].default = None;
        registry.store(def);
        let mut want = want_of("numbers-source");
        let err = registry.admit(&mut want).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn admission_hook_sees_defaulted_params() {
        let registry = WantTypeRegistry::new();
        registry.store(definition("numbers-source"));
        registry.on_admission(
            "numbers-source",
            Arc::new(|want: &mut Want| {
                let count = want.spec.params["count"].clone();
                want.spec.params.insert("echo".into(), count);
            }),
        );
        let mut want = want_of("numbers-source");
        registry.admit(&mut want).unwrap();
        assert_eq!(want.spec.params["echo"], json!(10));
    }

    #[test]
    fn enrich_caches_monitor_agents() {
        let agents = AgentRegistry::new();
        agents.register(AgentSpec {
            name: "monitor_numbers".into(),
            agent_type: AgentType::Monitor,
            capabilities: vec!["produce_numbers".into()],
            exec: ExecTarget::Local,
            description: String::new(),
        });
        let registry = WantTypeRegistry::new();
        registry.store(definition("numbers-source"));
        registry.enrich_monitor_capabilities(&agents);
        assert_eq!(
            registry.get("numbers-source").unwrap().monitor_capabilities,
            vec!["monitor_numbers"]
        );
    }
}
