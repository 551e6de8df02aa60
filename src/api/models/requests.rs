//! Request bodies

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::want::{Want, WantId};

/// `POST /wants` accepts a single want or a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AddWantsRequest {
    /// `{wants: [...]}`: a config with many wants
    Batch {
        /// The batch
        wants: Vec<Want>,
    },
    /// A bare want
    Single(Box<Want>),
}

impl AddWantsRequest {
    /// Flatten into the admission batch
    pub fn into_wants(self) -> Vec<Want> {
        match self {
            Self::Batch { wants } => wants,
            Self::Single(want) => vec![*want],
        }
    }
}

/// `POST /agents/webhook/callback`: a remote monitor pushing a delta
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookCallbackRequest {
    /// Target want
    #[serde(rename = "wantID")]
    pub want_id: WantId,
    /// The pushing agent
    #[serde(rename = "agentName")]
    pub agent_name: String,
    /// Updated keys only
    #[serde(rename = "stateUpdates", default)]
    pub state_updates: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_and_batch_bodies_both_parse() {
        let single = serde_json::json!({
            "metadata": {"name": "gen", "type": "numbers-source"}
        });
        let request: AddWantsRequest = serde_json::from_value(single).unwrap();
        assert_eq!(request.into_wants().len(), 1);

        let batch = serde_json::json!({
            "wants": [
                {"metadata": {"name": "gen", "type": "numbers-source"}},
                {"metadata": {"name": "sink", "type": "numbers-sink"}}
            ]
        });
        let request: AddWantsRequest = serde_json::from_value(batch).unwrap();
        assert_eq!(request.into_wants().len(), 2);
    }

    #[test]
    fn yaml_config_parses_as_batch() {
        let yaml = r#"
wants:
  - metadata:
      name: gen
      type: numbers-source
    spec:
      requires: [produce_numbers]
"#;
        let request: AddWantsRequest = serde_yaml::from_str(yaml).unwrap();
        let wants = request.into_wants();
        assert_eq!(wants[0].spec.requires, vec!["produce_numbers"]);
    }
}
