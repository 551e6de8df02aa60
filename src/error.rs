//! Error taxonomy for the engine
//!
//! Every fallible operation in the crate returns [`EngineResult`]. Variants
//! map one-to-one onto the wire error codes exposed by the REST surface:
//! validation problems surface through control-channel acks, capability and
//! dependency gaps are recorded on the want, and agent failures drive the
//! lifecycle machine.

use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Error conditions across the engine
///
/// # Categories
///
/// - **Admission errors**: invalid specs, name conflicts
/// - **Lookup errors**: unknown wants, agents, capabilities, recipes
/// - **Expansion errors**: recipe template failures
/// - **State errors**: progress cycle misuse, persistence failures
/// - **Dispatch errors**: agent failures and remote timeouts
/// - **Internal errors**: invariant violations (logged, never fatal to the loop)
#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad input: malformed spec, unknown want type, missing parameter
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A want with this name already exists in the graph or batch
    #[error("Want name already in use: {name}")]
    NameConflict {
        /// The conflicting name
        name: String,
    },

    /// An entity lookup failed
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind (want, agent, capability, recipe, want type)
        kind: &'static str,
        /// The identifier that missed
        id: String,
    },

    /// No registered agent provides a required capability
    #[error("No agent provides capability: {capability}")]
    UnmetCapability {
        /// The unsatisfied capability name
        capability: String,
    },

    /// Recipe lookup failed during expansion
    #[error("Recipe not found: {name}")]
    RecipeNotFound {
        /// The unknown recipe name
        name: String,
    },

    /// Recipe expansion hit an unbound parameter reference
    #[error("Recipe parameter missing: {reference}")]
    RecipeParameterMissing {
        /// The unresolved reference, e.g. `{{ count }}`
        reference: String,
    },

    /// State write attempted outside an open progress cycle
    #[error("No progress cycle open for want {want_id}")]
    CycleNotOpen {
        /// The want whose cycle was not open
        want_id: String,
    },

    /// Remote dispatch exceeded its per-attempt deadline
    #[error("Agent {agent} timed out after {elapsed_ms}ms")]
    Timeout {
        /// The agent that timed out
        agent: String,
        /// Milliseconds elapsed before the deadline fired
        elapsed_ms: u64,
    },

    /// The agent itself reported failure
    #[error("Agent {agent} failed: {message}")]
    Agent {
        /// The failing agent
        agent: String,
        /// The agent's error message
        message: String,
    },

    /// A control or event channel closed while the engine was running
    #[error("Engine channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Filesystem failure (snapshot, declaration loading)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML encode/decode failure
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON encode/decode failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invariant violation; fatal to the current pass only
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the error is the caller's fault (maps to a 4xx response)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::NameConflict { .. }
                | Self::NotFound { .. }
                | Self::RecipeNotFound { .. }
                | Self::RecipeParameterMissing { .. }
        )
    }

    /// Whether the error should transition the affected want to `failed`
    pub fn is_agent_failure(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Agent { .. })
    }

    /// Stable machine-readable code for the wire surface
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::NameConflict { .. } => "NAME_CONFLICT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::UnmetCapability { .. } => "UNMET_CAPABILITY",
            Self::RecipeNotFound { .. } => "RECIPE_NOT_FOUND",
            Self::RecipeParameterMissing { .. } => "RECIPE_PARAMETER_MISSING",
            Self::CycleNotOpen { .. } => "CYCLE_NOT_OPEN",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Agent { .. } => "AGENT_ERROR",
            Self::ChannelClosed(_) => "CHANNEL_CLOSED",
            Self::Io(_) => "IO",
            Self::Yaml(_) | Self::Json(_) => "SERIALIZATION",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_classified() {
        assert!(EngineError::Validation("bad".into()).is_client_error());
        assert!(EngineError::NameConflict { name: "gen".into() }.is_client_error());
        assert!(!EngineError::Internal("oops".into()).is_client_error());
    }

    #[test]
    fn agent_failures_are_classified() {
        assert!(EngineError::Timeout {
            agent: "agent_flight_api".into(),
            elapsed_ms: 30_000,
        }
        .is_agent_failure());
        assert!(EngineError::Agent {
            agent: "agent_budget".into(),
            message: "no seats".into(),
        }
        .is_agent_failure());
        assert!(!EngineError::Validation("bad".into()).is_agent_failure());
    }

    #[test]
    fn codes_are_stable() {
        let err = EngineError::NotFound {
            kind: "want",
            id: "w-1".into(),
        };
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(err.to_string(), "want not found: w-1");
    }
}
