//! HTTP surface
//!
//! REST API over the engine handle: CRUD over wants, agents, capabilities,
//! recipes, and want types; lifecycle endpoints; the agent-service hosting
//! side of remote dispatch; and the monitor callback webhook. All paths
//! are versioned under `/api/v1`.

pub mod models;
pub mod rest;

pub use rest::server::RestApiServer;
