//! Registries: capabilities, agents, and want type definitions

pub mod agents;
pub mod want_types;

pub use agents::{
    AgentRegistry, AgentSpec, AgentType, Capability, ExecTarget, StateField,
};
pub use want_types::{ParameterSpec, WantTypeDefinition, WantTypeRegistry};
