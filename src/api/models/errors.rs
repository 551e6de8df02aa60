//! API error body and status mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// JSON error body: `{code, message}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Stable machine-readable code
    pub code: String,
    /// Human message
    pub message: String,
    #[serde(skip)]
    status: Option<u16>,
}

impl ApiError {
    /// Build an error with an explicit code
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            status: None,
        }
    }

    /// A 400 with the VALIDATION code
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            code: "VALIDATION".into(),
            message: message.into(),
            status: Some(400),
        }
    }

    /// A 404 for an unknown entity
    pub fn not_found(kind: &str, id: &str) -> Self {
        Self {
            code: "NOT_FOUND".into(),
            message: format!("{} not found: {}", kind, id),
            status: Some(404),
        }
    }

    /// A 401 for a bad or missing bearer token
    pub fn unauthorized() -> Self {
        Self {
            code: "UNAUTHORIZED".into(),
            message: "missing or invalid bearer token".into(),
            status: Some(401),
        }
    }

    fn status_code(&self) -> StatusCode {
        if let Some(status) = self.status {
            return StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        }
        match self.code.as_str() {
            "VALIDATION" | "RECIPE_PARAMETER_MISSING" | "CYCLE_NOT_OPEN" => {
                StatusCode::BAD_REQUEST
            }
            "NAME_CONFLICT" => StatusCode::CONFLICT,
            "NOT_FOUND" | "RECIPE_NOT_FOUND" => StatusCode::NOT_FOUND,
            "UNMET_CAPABILITY" => StatusCode::UNPROCESSABLE_ENTITY,
            "TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
            "AGENT_ERROR" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
            status: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_wire_codes() {
        let api: ApiError = EngineError::NameConflict { name: "gen".into() }.into();
        assert_eq!(api.code, "NAME_CONFLICT");
        assert_eq!(api.status_code(), StatusCode::CONFLICT);

        let api: ApiError = EngineError::NotFound {
            kind: "want",
            id: "w".into(),
        }
        .into();
        assert_eq!(api.status_code(), StatusCode::NOT_FOUND);

        let api: ApiError = EngineError::Timeout {
            agent: "a".into(),
            elapsed_ms: 30_000,
        }
        .into();
        assert_eq!(api.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn explicit_statuses_win() {
        assert_eq!(ApiError::unauthorized().status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::bad_request("nope").status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
