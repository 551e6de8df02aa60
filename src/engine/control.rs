//! Control channel commands and queries
//!
//! Everything that mutates or reads the want graph flows through one FIFO
//! channel into the reconcile loop. Mutating commands carry a oneshot ack
//! with the applied IDs so callers can block until applied; queries reply
//! with deep copies so no caller ever holds a reference into the loop's
//! data.

use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::oneshot;

use crate::error::{EngineError, EngineResult};
use crate::lifecycle::LifecycleEvent;
use crate::snapshot::{GraphSnapshot, WantSnapshot};
use crate::want::{Want, WantId, WantStatus};

/// Ack payload for mutating commands: the IDs the command applied to
pub type Ack = EngineResult<Vec<WantId>>;

/// Explicit lifecycle controls exposed on the API and CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Park an idle want
    Suspend,
    /// Return a suspended want to idle
    Resume,
    /// Stop a want wherever it is
    Stop,
    /// Restart a failed or stopped want
    Start,
}

impl LifecycleAction {
    /// Parse the URL path segment form
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "suspend" => Ok(Self::Suspend),
            "resume" => Ok(Self::Resume),
            "stop" => Ok(Self::Stop),
            "start" => Ok(Self::Start),
            other => Err(EngineError::Validation(format!(
                "unknown lifecycle action: {}",
                other
            ))),
        }
    }

    /// The state-machine event this action raises
    pub fn event(&self) -> LifecycleEvent {
        match self {
            Self::Suspend => LifecycleEvent::Suspend,
            Self::Resume => LifecycleEvent::Resume,
            Self::Stop => LifecycleEvent::Stop,
            Self::Start => LifecycleEvent::Start,
        }
    }
}

/// Read-only queries answered by the loop with deep copies
#[derive(Debug)]
pub enum Query {
    /// The whole graph
    Graph {
        /// Reply channel
        reply: oneshot::Sender<GraphSnapshot>,
    },
    /// One want by ID
    Want {
        /// Target
        id: WantId,
        /// Reply channel
        reply: oneshot::Sender<Option<WantSnapshot>>,
    },
    /// One want by name
    WantByName {
        /// Target name
        name: String,
        /// Reply channel
        reply: oneshot::Sender<Option<WantSnapshot>>,
    },
    /// A want's status
    Status {
        /// Target
        id: WantId,
        /// Reply channel
        reply: oneshot::Sender<Option<WantStatus>>,
    },
    /// A want's committed state values
    Results {
        /// Target
        id: WantId,
        /// Reply channel
        reply: oneshot::Sender<Option<BTreeMap<String, Value>>>,
    },
}

/// Commands accepted by the reconcile loop
#[derive(Debug)]
pub enum ControlCommand {
    /// Admit new wants; IDs are assigned when missing
    AddWants {
        /// The batch; rejected as a whole on any conflict
        wants: Vec<Want>,
        /// Ack with admitted IDs
        ack: Option<oneshot::Sender<Ack>>,
    },
    /// Recursively delete wants and their controller-owned descendants
    DeleteWants {
        /// Roots to delete
        ids: Vec<WantId>,
        /// Ack with every removed ID, descendants included
        ack: Option<oneshot::Sender<Ack>>,
    },
    /// Replace a want's spec and re-index its labels
    UpdateWant {
        /// The replacement; must carry the target ID
        want: Box<Want>,
        /// Ack with the updated ID
        ack: Option<oneshot::Sender<Ack>>,
    },
    /// Force a full reconcile pass now
    TriggerReconcile,
    /// Nudge achieved wants to re-evaluate because a producer emitted data
    RetriggerCheck {
        /// Wants to nudge
        ids: Vec<WantId>,
    },
    /// Suspend / resume / stop / start, per-want or global
    Lifecycle {
        /// Target want, or every want when absent
        target: Option<WantId>,
        /// The action
        action: LifecycleAction,
        /// Ack with the IDs that actually transitioned
        ack: Option<oneshot::Sender<Ack>>,
    },
    /// Commit agent-pushed updates (webhook callbacks) through a progress cycle
    ApplyAgentUpdates {
        /// Target want
        want_id: WantId,
        /// Writing agent, when known
        agent: Option<String>,
        /// The update batch
        updates: BTreeMap<String, Value>,
        /// Ack; fire-and-forget callers pass `None`
        ack: Option<oneshot::Sender<Ack>>,
    },
    /// Read-only query
    Query(Query),
    /// Drain workers, persist the snapshot, exit the loop
    Shutdown {
        /// Acked after the snapshot is written
        ack: Option<oneshot::Sender<Ack>>,
    },
}
