//! Recipe registry and expansion
//!
//! A recipe is a parameterized template expanding into a sub-graph of child
//! wants under a parent owner. Parameter references use `{{ name }}`
//! placeholders rendered with tera; expansion mints fresh IDs, sets
//! controller owner references, inherits labels, and cross-links siblings
//! with correlation entries (including `stateAccess/<parent>.<field>`
//! labels for parent-state fields declared by sibling capabilities).

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::registry::agents::AgentRegistry;
use crate::want::{Correlation, OwnerReference, Want, WantId, WantMetadata, WantSpec};

/// Recipe display metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeMetadata {
    /// Recipe name, the expansion key
    pub name: String,
    /// Version tag
    #[serde(default)]
    pub version: String,
    /// Human description
    #[serde(default)]
    pub description: String,
}

/// Child want template inside a recipe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WantTemplate {
    /// Child name; may carry `{{ param }}` references
    pub name: String,
    /// Child want type
    #[serde(rename = "type")]
    pub want_type: String,
    /// Labels set on the child (merged over inherited parent labels)
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Child spec; string values may carry `{{ param }}` references
    #[serde(default)]
    pub spec: WantSpec,
}

/// A parameterized sub-graph template
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    /// Name and version
    pub metadata: RecipeMetadata,
    /// Parameter defaults, overridden by the parent want's params
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Child want templates
    #[serde(default)]
    pub wants: Vec<WantTemplate>,
    /// State fields the parent is expected to publish
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_state: Vec<String>,
}

/// Named recipe registry
#[derive(Default)]
pub struct RecipeRegistry {
    recipes: DashMap<String, Recipe>,
}

impl RecipeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace a recipe
    pub fn register(&self, recipe: Recipe) {
        self.recipes.insert(recipe.metadata.name.clone(), recipe);
    }

    /// Look up a recipe by name
    pub fn get(&self, name: &str) -> Option<Recipe> {
        self.recipes.get(name).map(|r| r.clone())
    }

    /// All recipes, sorted by name
    pub fn list(&self) -> Vec<Recipe> {
        let mut all: Vec<Recipe> = self.recipes.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        all
    }

    /// Remove a recipe
    pub fn remove(&self, name: &str) -> EngineResult<()> {
        self.recipes
            .remove(name)
            .map(|_| ())
            .ok_or(EngineError::NotFound {
                kind: "recipe",
                id: name.to_string(),
            })
    }

    /// Load every recipe file in a directory, skipping unparseable ones
    pub fn load_dir<P: AsRef<Path>>(&self, dir: P) -> EngineResult<usize> {
        let mut loaded = 0;
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
            match serde_yaml::from_str::<Recipe>(&content) {
                Ok(recipe) => {
                    self.register(recipe);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping unparseable recipe");
                }
            }
        }
        Ok(loaded)
    }

    /// Expand `recipe_name` under `parent` into child wants
    ///
    /// The caller (the reconcile loop) admits the returned wants through
    /// the control channel.
    pub fn expand(
        &self,
        recipe_name: &str,
        parent: &Want,
        agents: &AgentRegistry,
    ) -> EngineResult<Vec<Want>> {
        let recipe = self.get(recipe_name).ok_or(EngineError::RecipeNotFound {
            name: recipe_name.to_string(),
        })?;
        let parent_id = parent.id()?;

        // Recipe defaults, overridden by the parent's params.
        let mut params = recipe.parameters.clone();
        for (k, v) in &parent.spec.params {
            params.insert(k.clone(), v.clone());
        }
        let context = tera_context(&params)?;

        let mut children = Vec::with_capacity(recipe.wants.len());
        for template in &recipe.wants {
            let rendered: WantTemplate = substitute(template, &context)?;
            if rendered.name == parent.metadata.name {
                // A child shadowing its owner's name would close an owner
                // cycle on admission.
                return Err(EngineError::RecipeParameterMissing {
                    reference: format!(
                        "child {} collides with its owner in recipe {}",
                        rendered.name, recipe_name
                    ),
                });
            }
            let mut labels = parent.metadata.labels.clone();
            labels.extend(rendered.labels.clone());
            children.push(Want::new(
                WantMetadata {
                    id: Some(WantId::new()),
                    name: rendered.name,
                    want_type: rendered.want_type,
                    labels,
                    owner_references: vec![OwnerReference {
                        kind: "Want".into(),
                        name: parent.metadata.name.clone(),
                        id: parent_id,
                        controller: true,
                    }],
                    correlations: Vec::new(),
                },
                rendered.spec,
            ));
        }

        cross_link_siblings(&mut children, parent_id, &recipe.parent_state, agents);
        Ok(children)
    }
}

/// Build the substitution context from merged parameters
fn tera_context(params: &BTreeMap<String, Value>) -> EngineResult<tera::Context> {
    let mut context = tera::Context::new();
    for (k, v) in params {
        context.insert(k.as_str(), v);
    }
    Ok(context)
}

/// Substitute `{{ param }}` references across every string in the template
fn substitute(template: &WantTemplate, context: &tera::Context) -> EngineResult<WantTemplate> {
    let tree = serde_json::to_value(template)?;
    let rendered = render_value(tree, context)?;
    Ok(serde_json::from_value(rendered)?)
}

fn render_value(value: Value, context: &tera::Context) -> EngineResult<Value> {
    match value {
        Value::String(s) if s.contains("{{") => {
            let whole_placeholder = s.trim().starts_with("{{") && s.trim().ends_with("}}");
            let rendered = tera::Tera::one_off(&s, context, false).map_err(|_| {
                EngineError::RecipeParameterMissing {
                    reference: s.clone(),
                }
            })?;
            // A value that was nothing but a placeholder keeps the
            // parameter's type; interpolations inside larger strings stay
            // strings.
            if whole_placeholder {
                if let Ok(typed) = serde_yaml::from_str::<Value>(&rendered) {
                    return Ok(typed);
                }
            }
            Ok(Value::String(rendered))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .into_iter()
                .map(|item| render_value(item, context))
                .collect::<EngineResult<_>>()?,
        )),
        Value::Object(entries) => {
            let mut rendered = serde_json::Map::with_capacity(entries.len());
            for (k, v) in entries {
                let key = if k.contains("{{") {
                    tera::Tera::one_off(&k, context, false).map_err(|_| {
                        EngineError::RecipeParameterMissing { reference: k }
                    })?
                } else {
                    k
                };
                rendered.insert(key, render_value(v, context)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other),
    }
}

/// Record correlation entries between expanded siblings
///
/// Two siblings correlate when one's `using` selector matches the other's
/// labels, or when both declare parent-state access through their required
/// capabilities. Correlations carry the matched `k=v` labels plus a
/// `stateAccess/<parent>.<field>` label per shared parent-state field.
fn cross_link_siblings(
    children: &mut [Want],
    parent_id: WantId,
    recipe_parent_state: &[String],
    agents: &AgentRegistry,
) {
    let fields: Vec<BTreeSet<String>> = children
        .iter()
        .map(|child| {
            let mut fields: BTreeSet<String> = BTreeSet::new();
            for capability in &child.spec.requires {
                if let Some(decl) = agents.capability(capability) {
                    fields.extend(decl.parent_state_access.iter().map(|f| f.name.clone()));
                }
            }
            fields
        })
        .collect();

    for a in 0..children.len() {
        for b in 0..children.len() {
            if a == b {
                continue;
            }
            let mut labels = Vec::new();
            for selector in &children[a].spec.using {
                let matches = selector
                    .iter()
                    .all(|(k, v)| children[b].metadata.labels.get(k) == Some(v));
                if matches {
                    labels.extend(selector.iter().map(|(k, v)| format!("{}={}", k, v)));
                }
            }
            let linked_by_using = !labels.is_empty();
            let share_parent_state = !fields[a].is_empty() && !fields[b].is_empty();
            if !linked_by_using && !share_parent_state {
                continue;
            }
            if share_parent_state {
                let mut shared: BTreeSet<&String> = fields[a].union(&fields[b]).collect();
                shared.extend(recipe_parent_state.iter());
                labels.extend(
                    shared
                        .into_iter()
                        .map(|field| format!("stateAccess/{}.{}", parent_id, field)),
                );
            }
            let peer = children[b].metadata.id;
            if let Some(peer_id) = peer {
                push_correlation(&mut children[a], peer_id, labels.clone());
            }
            let this = children[a].metadata.id;
            if let Some(this_id) = this {
                push_correlation(&mut children[b], this_id, labels);
            }
        }
    }
}

fn push_correlation(want: &mut Want, peer: WantId, labels: Vec<String>) {
    if let Some(existing) = want
        .metadata
        .correlations
        .iter_mut()
        .find(|c| c.want_id == peer)
    {
        for label in labels {
            if !existing.labels.contains(&label) {
                existing.labels.push(label);
            }
        }
        return;
    }
    want.metadata.correlations.push(Correlation {
        want_id: peer,
        labels,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::agents::{Capability, StateField};
    use serde_json::json;

    fn travel_recipe() -> Recipe {
        serde_yaml::from_str(
            r#"
metadata:
  name: travel-budget
  version: "1.0"
parameters:
  budget: 1000
  city: paris
wants:
  - name: "budget-{{ city }}"
    type: budget-tracker
    labels:
      role: budget
    spec:
      params:
        limit: "{{ budget }}"
      requires: [budget_tracking]
  - name: "hotel-{{ city }}"
    type: hotel-booker
    labels:
      role: hotel
    spec:
      params:
        city: "{{ city }}"
      requires: [hotel_booking]
      using:
        - role: budget
"#,
        )
        .unwrap()
    }

    fn agents_with_costs() -> AgentRegistry {
        let agents = AgentRegistry::new();
        for capability in ["budget_tracking", "hotel_booking"] {
            agents.register_capability(Capability {
                name: capability.into(),
                description: String::new(),
                parent_state_access: vec![StateField {
                    name: "costs".into(),
                    field_type: Some("number".into()),
                }],
            });
        }
        agents
    }

    fn parent() -> Want {
        let mut parent = Want::new(
            WantMetadata {
                id: Some(WantId::new()),
                name: "planner".into(),
                want_type: "travel-planner".into(),
                ..Default::default()
            },
            WantSpec::default(),
        );
        parent
            .spec
            .params
            .insert("city".into(), json!("tokyo"));
        parent
    }

    #[test]
    fn expansion_substitutes_and_owns() {
        let registry = RecipeRegistry::new();
        registry.register(travel_recipe());
        let parent = parent();

        let children = registry
            .expand("travel-budget", &parent, &agents_with_costs())
            .unwrap();
        assert_eq!(children.len(), 2);

        let budget = &children[0];
        // Parent param overrides the recipe default.
        assert_eq!(budget.metadata.name, "budget-tokyo");
        // A whole-placeholder value keeps the parameter's type.
        assert_eq!(budget.spec.params["limit"], json!(1000));
        assert!(budget.is_controlled_by(parent.id().unwrap()));
        assert!(budget.metadata.id.is_some());
    }

    #[test]
    fn siblings_gain_state_access_correlations() {
        let registry = RecipeRegistry::new();
        registry.register(travel_recipe());
        let parent = parent();
        let parent_id = parent.id().unwrap();

        let children = registry
            .expand("travel-budget", &parent, &agents_with_costs())
            .unwrap();
        let expected = format!("stateAccess/{}.costs", parent_id);
        for child in &children {
            assert_eq!(child.metadata.correlations.len(), 1);
            assert!(
                child.metadata.correlations[0]
                    .labels
                    .contains(&expected),
                "missing {} on {}",
                expected,
                child.metadata.name
            );
        }
        // The hotel side also records the selector that linked it.
        let hotel = &children[1];
        assert!(hotel.metadata.correlations[0]
            .labels
            .contains(&"role=budget".to_string()));
    }

    #[test]
    fn unknown_recipe_is_reported() {
        let registry = RecipeRegistry::new();
        let err = registry
            .expand("missing", &parent(), &AgentRegistry::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::RecipeNotFound { .. }));
    }

    #[test]
    fn unbound_reference_is_reported() {
        let registry = RecipeRegistry::new();
        let mut recipe = travel_recipe();
        recipe.wants[0].spec.params.insert(
            "surprise".into(),
            json!("{{ never_declared }}"),
        );
        registry.register(recipe);
        let err = registry
            .expand("travel-budget", &parent(), &agents_with_costs())
            .unwrap_err();
        assert!(matches!(err, EngineError::RecipeParameterMissing { .. }));
    }

    #[test]
    fn child_shadowing_owner_is_rejected() {
        let registry = RecipeRegistry::new();
        let mut recipe = travel_recipe();
        recipe.wants[0].name = "planner".into();
        registry.register(recipe);
        let err = registry
            .expand("travel-budget", &parent(), &agents_with_costs())
            .unwrap_err();
        assert!(matches!(err, EngineError::RecipeParameterMissing { .. }));
    }

    #[test]
    fn children_inherit_parent_labels_under_template_labels() {
        let registry = RecipeRegistry::new();
        registry.register(travel_recipe());
        let mut parent = parent();
        parent
            .metadata
            .labels
            .insert("trip".into(), "summer".into());
        parent.metadata.labels.insert("role".into(), "owner".into());

        let children = registry
            .expand("travel-budget", &parent, &agents_with_costs())
            .unwrap();
        assert_eq!(children[0].metadata.labels["trip"], "summer");
        // The template's own label wins over the inherited one.
        assert_eq!(children[0].metadata.labels["role"], "budget");
    }
}
