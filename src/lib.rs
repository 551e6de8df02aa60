//! Declarative workflow engine
//!
//! This crate provides a reconciliation engine for "wants":
//! - Wants declare desired end states in YAML; the engine drives the live
//!   graph toward them through reconcile passes
//! - Agents (one-shot Do, long-running Monitor) bind to wants through a
//!   capability registry and run in-process or over HTTP
//! - Recipes expand parameterized sub-graphs under owner wants
//! - Label selectors express dependencies without naming peers
//! - A REST API exposes the graph, agents, recipes, and lifecycle controls

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod api;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod index;
pub mod lifecycle;
pub mod observability;
pub mod recipes;
pub mod registry;
pub mod snapshot;
pub mod state;
pub mod want;

pub use config::AppConfig;
pub use engine::{ChainBuilder, EngineHandle, LifecycleAction};
pub use error::{EngineError, EngineResult};
pub use recipes::{Recipe, RecipeRegistry};
pub use registry::{AgentRegistry, AgentSpec, AgentType, Capability, WantTypeDefinition};
pub use state::{ProgressCycle, StateEvent, WantState};
pub use want::{Want, WantId, WantStatus};
