//! REST route handlers
//!
//! Thin adapters from wire shapes to [`EngineHandle`] calls. Want bodies
//! are accepted as JSON or YAML depending on the request content type;
//! everything served back is JSON.

use axum::body::Bytes;
use axum::extract::{Path, Query as UrlQuery, Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, warn};

use crate::api::models::errors::ApiError;
use crate::api::models::requests::{AddWantsRequest, WebhookCallbackRequest};
use crate::api::models::responses::{
    AddWantsResponse, DeleteWantsResponse, HealthResponse, LifecycleResponse, ResultsResponse,
    StatusResponse, WantDetailResponse,
};
use crate::dispatch::local::{AgentContext, WantView};
use crate::dispatch::remote::{RemoteExecuteRequest, RemoteExecuteResponse, RemoteStatus};
use crate::engine::{EngineHandle, LifecycleAction};
use crate::observability::HealthStatus;
use crate::recipes::Recipe;
use crate::registry::agents::{AgentSpec, Capability};
use crate::registry::want_types::WantTypeDefinition;
use crate::snapshot::GraphSnapshot;
use crate::want::{group_history, HistoryGroupBy, Want, WantId};

fn parse_id(id: &str) -> Result<WantId, ApiError> {
    WantId::parse_str(id).map_err(|_| ApiError::bad_request("invalid want ID"))
}

/// Decode a body as YAML or JSON based on the request content type
fn decode_body<T: serde::de::DeserializeOwned>(
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<T, ApiError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");
    if content_type.contains("yaml") {
        serde_yaml::from_slice(body)
            .map_err(|e| ApiError::bad_request(format!("invalid YAML body: {}", e)))
    } else {
        serde_json::from_slice(body)
            .map_err(|e| ApiError::bad_request(format!("invalid JSON body: {}", e)))
    }
}

/// Bearer-token gate for the agent-service and webhook routes
///
/// No configured token means development mode: every call passes.
pub async fn require_agent_auth(
    State(handle): State<EngineHandle>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(token) = &handle.config().security.agent_auth_token {
        let expected = format!("Bearer {}", token);
        let presented = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return ApiError::unauthorized().into_response();
        }
    }
    next.run(request).await
}

// ---- Wants ----

/// `POST /wants`
pub async fn add_wants(
    State(handle): State<EngineHandle>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<AddWantsResponse>), ApiError> {
    let request: AddWantsRequest = decode_body(&headers, &body)?;
    let ids = handle.add_wants(request.into_wants()).await?;
    Ok((StatusCode::CREATED, Json(AddWantsResponse { ids })))
}

/// `GET /wants`
pub async fn list_wants(
    State(handle): State<EngineHandle>,
) -> Result<Json<GraphSnapshot>, ApiError> {
    Ok(Json(handle.graph().await?))
}

/// `GET /wants/{id}`, optionally `?groupBy=name|type`
pub async fn get_want(
    State(handle): State<EngineHandle>,
    Path(id): Path<String>,
    UrlQuery(params): UrlQuery<HashMap<String, String>>,
) -> Result<Json<WantDetailResponse>, ApiError> {
    let id = parse_id(&id)?;
    let snapshot = handle
        .want(id)
        .await?
        .ok_or_else(|| ApiError::not_found("want", &id.to_string()))?;
    let agent_history = match params.get("groupBy") {
        Some(by) => {
            let by = HistoryGroupBy::parse(by).map_err(ApiError::from)?;
            Some(group_history(&snapshot.want.history, by))
        }
        None => None,
    };
    Ok(Json(WantDetailResponse {
        snapshot,
        agent_history,
    }))
}

/// `PUT /wants/{id}`: replace spec, preserve ID and history
pub async fn update_want(
    State(handle): State<EngineHandle>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<LifecycleResponse>, ApiError> {
    let id = parse_id(&id)?;
    let mut want: Want = decode_body(&headers, &body)?;
    want.metadata.id = Some(id);
    let applied = handle.update_want(want).await?;
    Ok(Json(LifecycleResponse { applied }))
}

/// `DELETE /wants/{id}`: recursive over controller ownership
pub async fn delete_want(
    State(handle): State<EngineHandle>,
    Path(id): Path<String>,
) -> Result<Json<DeleteWantsResponse>, ApiError> {
    let id = parse_id(&id)?;
    let deleted = handle.delete_wants(vec![id]).await?;
    Ok(Json(DeleteWantsResponse { deleted }))
}

/// `GET /wants/{id}/status`
pub async fn get_status(
    State(handle): State<EngineHandle>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let id = parse_id(&id)?;
    let status = handle
        .status(id)
        .await?
        .ok_or_else(|| ApiError::not_found("want", &id.to_string()))?;
    Ok(Json(StatusResponse { id, status }))
}

/// `GET /wants/{id}/results`
pub async fn get_results(
    State(handle): State<EngineHandle>,
    Path(id): Path<String>,
) -> Result<Json<ResultsResponse>, ApiError> {
    let id = parse_id(&id)?;
    let data = handle
        .results(id)
        .await?
        .ok_or_else(|| ApiError::not_found("want", &id.to_string()))?;
    Ok(Json(ResultsResponse { data }))
}

/// `POST /wants/{id}/{suspend|resume|stop|start}`
pub async fn lifecycle(
    State(handle): State<EngineHandle>,
    Path((id, action)): Path<(String, String)>,
) -> Result<Json<LifecycleResponse>, ApiError> {
    let id = parse_id(&id)?;
    let action = LifecycleAction::parse(&action).map_err(ApiError::from)?;
    let applied = handle.lifecycle(Some(id), action).await?;
    Ok(Json(LifecycleResponse { applied }))
}

// ---- Agents & capabilities ----

/// `POST /agents`
pub async fn register_agent(
    State(handle): State<EngineHandle>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<AgentSpec>), ApiError> {
    let spec: AgentSpec = decode_body(&headers, &body)?;
    handle.agents().register(spec.clone());
    // Idle wants with unmet capabilities re-evaluate now.
    handle.trigger_reconcile().await?;
    Ok((StatusCode::CREATED, Json(spec)))
}

/// `GET /agents`
pub async fn list_agents(State(handle): State<EngineHandle>) -> Json<Vec<AgentSpec>> {
    Json(handle.agents().list().iter().map(|a| (**a).clone()).collect())
}

/// `GET /agents/{name}`
pub async fn get_agent(
    State(handle): State<EngineHandle>,
    Path(name): Path<String>,
) -> Result<Json<AgentSpec>, ApiError> {
    handle
        .agents()
        .get(&name)
        .map(|a| Json((*a).clone()))
        .ok_or_else(|| ApiError::not_found("agent", &name))
}

/// `DELETE /agents/{name}`
pub async fn delete_agent(
    State(handle): State<EngineHandle>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    handle.agents().unregister(&name)?;
    handle.trigger_reconcile().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /capabilities`
pub async fn register_capability(
    State(handle): State<EngineHandle>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Capability>), ApiError> {
    let capability: Capability = decode_body(&headers, &body)?;
    handle.agents().register_capability(capability.clone());
    Ok((StatusCode::CREATED, Json(capability)))
}

/// `GET /capabilities`
pub async fn list_capabilities(State(handle): State<EngineHandle>) -> Json<Vec<Capability>> {
    Json(handle.agents().list_capabilities())
}

/// `GET /capabilities/{name}`
pub async fn get_capability(
    State(handle): State<EngineHandle>,
    Path(name): Path<String>,
) -> Result<Json<Capability>, ApiError> {
    handle
        .agents()
        .capability(&name)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("capability", &name))
}

/// `DELETE /capabilities/{name}`
pub async fn delete_capability(
    State(handle): State<EngineHandle>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    handle.agents().unregister_capability(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- Recipes & want types ----

/// `POST /recipes`
pub async fn register_recipe(
    State(handle): State<EngineHandle>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Recipe>), ApiError> {
    let recipe: Recipe = decode_body(&headers, &body)?;
    handle.recipes().register(recipe.clone());
    Ok((StatusCode::CREATED, Json(recipe)))
}

/// `GET /recipes`
pub async fn list_recipes(State(handle): State<EngineHandle>) -> Json<Vec<Recipe>> {
    Json(handle.recipes().list())
}

/// `GET /recipes/{name}`
pub async fn get_recipe(
    State(handle): State<EngineHandle>,
    Path(name): Path<String>,
) -> Result<Json<Recipe>, ApiError> {
    handle
        .recipes()
        .get(&name)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("recipe", &name))
}

/// `DELETE /recipes/{name}`
pub async fn delete_recipe(
    State(handle): State<EngineHandle>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    handle.recipes().remove(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /want-types`
pub async fn register_want_type(
    State(handle): State<EngineHandle>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WantTypeDefinition>), ApiError> {
    let definition: WantTypeDefinition = decode_body(&headers, &body)?;
    handle.want_types().store(definition.clone());
    Ok((StatusCode::CREATED, Json(definition)))
}

/// `GET /want-types`
pub async fn list_want_types(
    State(handle): State<EngineHandle>,
) -> Json<Vec<WantTypeDefinition>> {
    Json(handle.want_types().list())
}

/// `GET /want-types/{name}`
pub async fn get_want_type(
    State(handle): State<EngineHandle>,
    Path(name): Path<String>,
) -> Result<Json<WantTypeDefinition>, ApiError> {
    handle
        .want_types()
        .get(&name)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("want type", &name))
}

/// `DELETE /want-types/{name}`
pub async fn delete_want_type(
    State(handle): State<EngineHandle>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    handle.want_types().remove(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- Agent service (hosting side of remote dispatch) ----

/// `POST /agent-service/execute`: run a locally registered Do-agent
pub async fn agent_service_execute(
    State(handle): State<EngineHandle>,
    Json(request): Json<RemoteExecuteRequest>,
) -> Result<Json<RemoteExecuteResponse>, ApiError> {
    let implementation = handle
        .agents()
        .do_impl(&request.agent_name)
        .ok_or_else(|| ApiError::not_found("agent", &request.agent_name))?;
    let ctx = service_context(&request);
    let started = Instant::now();
    let response = match implementation.exec(&ctx).await {
        Ok(updates) => RemoteExecuteResponse {
            status: RemoteStatus::Completed,
            state_updates: updates,
            execution_time_ms: started.elapsed().as_millis().max(1) as u64,
            error: None,
        },
        Err(e) => RemoteExecuteResponse {
            status: RemoteStatus::Failed,
            state_updates: Default::default(),
            execution_time_ms: started.elapsed().as_millis().max(1) as u64,
            error: Some(e.to_string()),
        },
    };
    debug!(agent = %request.agent_name, status = ?response.status, "agent-service execute");
    Ok(Json(response))
}

/// `POST /agent-service/monitor/execute`: one monitor cycle
///
/// Updates come back in the response and, when a callback URL was given,
/// are also pushed there asynchronously.
pub async fn agent_service_monitor_execute(
    State(handle): State<EngineHandle>,
    Json(request): Json<RemoteExecuteRequest>,
) -> Result<Json<RemoteExecuteResponse>, ApiError> {
    let implementation = handle
        .agents()
        .monitor_impl(&request.agent_name)
        .ok_or_else(|| ApiError::not_found("agent", &request.agent_name))?;
    let ctx = service_context(&request);
    let started = Instant::now();
    let response = match implementation.observe(&ctx).await {
        Ok(updates) => {
            if let Some(callback_url) = &request.callback_url {
                if !updates.is_empty() {
                    let callback = WebhookCallbackRequest {
                        want_id: request.want_id,
                        agent_name: request.agent_name.clone(),
                        state_updates: updates.clone(),
                    };
                    let url = callback_url.clone();
                    tokio::spawn(async move {
                        if let Err(e) = reqwest::Client::new().post(&url).json(&callback).send().await
                        {
                            warn!(url = %url, error = %e, "monitor callback push failed");
                        }
                    });
                }
            }
            RemoteExecuteResponse {
                status: RemoteStatus::Completed,
                state_updates: updates,
                execution_time_ms: started.elapsed().as_millis().max(1) as u64,
                error: None,
            }
        }
        Err(e) => RemoteExecuteResponse {
            status: RemoteStatus::Failed,
            state_updates: Default::default(),
            execution_time_ms: started.elapsed().as_millis().max(1) as u64,
            error: Some(e.to_string()),
        },
    };
    Ok(Json(response))
}

/// `POST /agents/webhook/callback`: a remote monitor pushed a delta
pub async fn webhook_callback(
    State(handle): State<EngineHandle>,
    Json(request): Json<WebhookCallbackRequest>,
) -> Result<StatusCode, ApiError> {
    handle
        .apply_agent_updates(
            request.want_id,
            Some(request.agent_name),
            request.state_updates,
        )
        .await?;
    Ok(StatusCode::ACCEPTED)
}

fn service_context(request: &RemoteExecuteRequest) -> AgentContext {
    AgentContext {
        want: WantView {
            id: request.want_id,
            name: request.want_id.to_string(),
            want_type: String::new(),
            labels: Default::default(),
            params: Default::default(),
            state: request.want_state.clone(),
        },
        upstream: Vec::new(),
        owner: None,
    }
}

// ---- Observability ----

/// `GET /health`
pub async fn health(State(handle): State<EngineHandle>) -> Json<HealthResponse> {
    let status = if handle.errors().is_empty() {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };
    Json(HealthResponse {
        status,
        service: handle.config().service.name.clone(),
        version: handle.config().service.version.clone(),
    })
}

/// `GET /errors`
pub async fn list_errors(State(handle): State<EngineHandle>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "errors": handle.errors().recent() }))
}

/// `DELETE /errors`
pub async fn clear_errors(State(handle): State<EngineHandle>) -> StatusCode {
    handle.errors().clear();
    StatusCode::NO_CONTENT
}
