//! Response bodies

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::snapshot::WantSnapshot;
use crate::want::{AgentExecution, WantId, WantStatus};

/// `POST /wants`: the admitted IDs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddWantsResponse {
    /// Admitted want IDs, in batch order
    pub ids: Vec<WantId>,
}

/// `DELETE /wants/{id}`: everything removed, descendants included
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteWantsResponse {
    /// Removed want IDs, children first
    pub deleted: Vec<WantId>,
}

/// `GET /wants/{id}`: the want, optionally with regrouped history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WantDetailResponse {
    /// The want and its state
    #[serde(flatten)]
    pub snapshot: WantSnapshot,
    /// History regrouped per `?groupBy=name|type`
    #[serde(rename = "agentHistory", skip_serializing_if = "Option::is_none")]
    pub agent_history: Option<BTreeMap<String, Vec<AgentExecution>>>,
}

/// `GET /wants/{id}/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Want ID
    pub id: WantId,
    /// Current status
    pub status: WantStatus,
}

/// `GET /wants/{id}/results`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsResponse {
    /// Committed state values
    pub data: BTreeMap<String, Value>,
}

/// Lifecycle endpoints: which wants actually transitioned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleResponse {
    /// Transitioned want IDs
    pub applied: Vec<WantId>,
}

/// `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Engine health
    pub status: crate::observability::HealthStatus,
    /// Service name
    pub service: String,
    /// Service version
    pub version: String,
}
