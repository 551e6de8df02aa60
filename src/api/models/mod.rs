//! Wire models for the REST surface

pub mod errors;
pub mod requests;
pub mod responses;

pub use errors::ApiError;
pub use requests::{AddWantsRequest, WebhookCallbackRequest};
pub use responses::{
    AddWantsResponse, DeleteWantsResponse, HealthResponse, LifecycleResponse, ResultsResponse,
    StatusResponse, WantDetailResponse,
};
