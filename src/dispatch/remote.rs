//! HTTP dispatch to remote agent services
//!
//! A Do-agent may be served over HTTP instead of in-process: the dispatcher
//! POSTs the want's state to the agent service's execute endpoint and
//! applies the returned updates in one progress cycle. Monitor cycles add a
//! callback URL the remote side pushes deltas back to. Auth is a single
//! shared bearer token; an absent token disables auth (development mode).

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::want::WantId;

/// Request body for `POST <base>/agent-service/execute`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteExecuteRequest {
    /// Target want
    #[serde(rename = "wantID")]
    pub want_id: WantId,
    /// Agent to run
    #[serde(rename = "agentName")]
    pub agent_name: String,
    /// The want's committed state snapshot
    #[serde(rename = "wantState")]
    pub want_state: BTreeMap<String, Value>,
    /// Where monitor deltas are pushed back to (monitor cycles only)
    #[serde(rename = "callbackURL", skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

/// Remote execution outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    /// The agent succeeded
    Completed,
    /// The agent failed; `error` carries the message
    Failed,
}

/// Response body from a remote agent service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteExecuteResponse {
    /// Outcome
    pub status: RemoteStatus,
    /// State updates to commit atomically
    #[serde(rename = "stateUpdates", default)]
    pub state_updates: BTreeMap<String, Value>,
    /// Wall-clock execution time on the agent side
    #[serde(rename = "executionTimeMs", default)]
    pub execution_time_ms: u64,
    /// Error message when failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// HTTP client for remote agent dispatch
#[derive(Clone)]
pub struct RemoteAgentClient {
    client: Client,
    auth_token: Option<String>,
    timeout: Duration,
}

impl RemoteAgentClient {
    /// Build a client with the per-attempt timeout and optional bearer token
    pub fn new(timeout: Duration, auth_token: Option<String>) -> EngineResult<Self> {
        if auth_token.is_none() {
            warn!("AGENT_AUTH_TOKEN not set; remote agent calls are unauthenticated");
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Internal(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            auth_token,
            timeout,
        })
    }

    /// One Do-agent execution. No retry: idempotency is the agent's business.
    pub async fn execute(
        &self,
        base_url: &str,
        request: &RemoteExecuteRequest,
    ) -> EngineResult<RemoteExecuteResponse> {
        self.post(base_url, "agent-service/execute", request).await
    }

    /// One Monitor observation cycle; deltas may come back later via the
    /// callback URL, fire-and-forget from the engine's perspective.
    pub async fn execute_monitor(
        &self,
        base_url: &str,
        request: &RemoteExecuteRequest,
    ) -> EngineResult<RemoteExecuteResponse> {
        self.post(base_url, "agent-service/monitor/execute", request)
            .await
    }

    async fn post(
        &self,
        base_url: &str,
        path: &str,
        request: &RemoteExecuteRequest,
    ) -> EngineResult<RemoteExecuteResponse> {
        let url = format!("{}/{}", base_url.trim_end_matches('/'), path);
        debug!(agent = %request.agent_name, url = %url, "dispatching remote agent");

        let started = Instant::now();
        let mut builder = self.client.post(&url).json(request);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Timeout {
                    agent: request.agent_name.clone(),
                    elapsed_ms: self.timeout.as_millis() as u64,
                }
            } else {
                EngineError::Agent {
                    agent: request.agent_name.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        if !response.status().is_success() {
            return Err(EngineError::Agent {
                agent: request.agent_name.clone(),
                message: format!("agent service returned {}", response.status()),
            });
        }
        let mut body: RemoteExecuteResponse =
            response.json().await.map_err(|e| EngineError::Agent {
                agent: request.agent_name.clone(),
                message: format!("unparseable agent response: {}", e),
            })?;
        if body.execution_time_ms == 0 {
            body.execution_time_ms = started.elapsed().as_millis().max(1) as u64;
        }
        Ok(body)
    }
}
