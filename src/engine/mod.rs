//! ChainBuilder: the reconcile hub
//!
//! One engine instance owns the want graph. All mutation happens inside a
//! single cooperative loop fed by the control channel; agent execution
//! fans out to detached workers that report back through state events and
//! outcome messages. External callers hold an [`EngineHandle`].

pub mod control;
mod reconcile;

pub use control::{Ack, ControlCommand, LifecycleAction, Query};

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::dispatch::monitor::MonitorHandle;
use crate::dispatch::remote::RemoteAgentClient;
use crate::dispatch::{Dispatcher, DoCycleOutcome};
use crate::error::{EngineError, EngineResult};
use crate::index::ReferenceIndex;
use crate::observability::ErrorLog;
use crate::recipes::RecipeRegistry;
use crate::registry::agents::AgentRegistry;
use crate::registry::want_types::WantTypeRegistry;
use crate::snapshot::{self, GraphSnapshot, WantSnapshot};
use crate::state::{StateEvent, WantState};
use crate::want::{Want, WantId, WantStatus};

/// Loop-local bookkeeping per want
pub(crate) struct WantRecord {
    pub(crate) want: Want,
    pub(crate) state: Arc<WantState>,
    /// Flipped on stop/delete; cancels in-flight agent work
    pub(crate) cancel: watch::Sender<bool>,
    pub(crate) monitors: Vec<MonitorHandle>,
    /// A Do-cycle worker is running
    pub(crate) inflight: bool,
    /// An achieved want should re-enter reaching next pass
    pub(crate) retrigger: bool,
    /// Upstream sequence observed at last dispatch, per dependency
    pub(crate) observed_upstream: HashMap<WantId, u64>,
}

impl WantRecord {
    pub(crate) fn new(want: Want, state: Arc<WantState>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            want,
            state,
            cancel,
            monitors: Vec::new(),
            inflight: false,
            retrigger: false,
            observed_upstream: HashMap::new(),
        }
    }

    pub(crate) fn snapshot(&self) -> WantSnapshot {
        WantSnapshot {
            want: self.want.clone(),
            state: self.state.entries(),
        }
    }
}

/// The reconcile loop owner
///
/// Constructed by [`ChainBuilder::init`], which spawns the loop and hands
/// back an [`EngineHandle`].
pub struct ChainBuilder {
    pub(crate) config: Arc<AppConfig>,
    pub(crate) control_rx: mpsc::Receiver<ControlCommand>,
    pub(crate) state_events_tx: mpsc::UnboundedSender<StateEvent>,
    pub(crate) state_events_rx: mpsc::UnboundedReceiver<StateEvent>,
    pub(crate) outcomes_rx: mpsc::UnboundedReceiver<DoCycleOutcome>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) agents: Arc<AgentRegistry>,
    pub(crate) want_types: Arc<WantTypeRegistry>,
    pub(crate) recipes: Arc<RecipeRegistry>,
    pub(crate) errors: ErrorLog,
    pub(crate) wants: HashMap<WantId, WantRecord>,
    pub(crate) names: HashMap<String, WantId>,
    pub(crate) index: ReferenceIndex,
    pub(crate) execution_id: Uuid,
    pub(crate) needs_pass: bool,
}

impl ChainBuilder {
    /// Build the engine, restore the snapshot, and spawn the reconcile loop
    ///
    /// Must run inside a tokio runtime. The returned handle is the only way
    /// to talk to the loop; [`EngineHandle::shutdown`] quiesces it.
    pub fn init(config: AppConfig) -> EngineResult<EngineHandle> {
        config.validate()?;
        let config = Arc::new(config);

        let agents = Arc::new(AgentRegistry::new());
        let want_types = Arc::new(WantTypeRegistry::new());
        let recipes = Arc::new(RecipeRegistry::new());
        if let Some(dir) = &config.engine.agents_dir {
            let count = agents.load_dir(dir)?;
            info!(dir = %dir.display(), count, "loaded agent declarations");
        }
        if let Some(dir) = &config.engine.recipes_dir {
            let count = recipes.load_dir(dir)?;
            info!(dir = %dir.display(), count, "loaded recipes");
        }

        let (control_tx, control_rx) = mpsc::channel(256);
        let (state_events_tx, state_events_rx) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();

        let remote = RemoteAgentClient::new(
            Duration::from_secs(config.engine.remote_timeout_secs),
            config.security.agent_auth_token.clone(),
        )?;
        let dispatcher = Dispatcher::new(
            Arc::clone(&agents),
            remote,
            config.engine.worker_pool_size,
            outcomes_tx,
        );

        let errors = ErrorLog::default();
        let execution_id = Uuid::new_v4();
        let mut builder = ChainBuilder {
            config: Arc::clone(&config),
            control_rx,
            state_events_tx,
            state_events_rx,
            outcomes_rx,
            dispatcher,
            agents: Arc::clone(&agents),
            want_types: Arc::clone(&want_types),
            recipes: Arc::clone(&recipes),
            errors: errors.clone(),
            wants: HashMap::new(),
            names: HashMap::new(),
            index: ReferenceIndex::new(),
            execution_id,
            needs_pass: false,
        };
        builder.restore_snapshot()?;

        tokio::spawn(builder.run());

        Ok(EngineHandle {
            tx: control_tx,
            agents,
            want_types,
            recipes,
            errors,
            config,
            execution_id,
        })
    }

    /// Load the configured snapshot, landing every want in `idle`
    fn restore_snapshot(&mut self) -> EngineResult<()> {
        let Some(path) = &self.config.engine.snapshot_path else {
            return Ok(());
        };
        let Some(graph) = snapshot::load(path)? else {
            return Ok(());
        };
        for entry in graph.wants {
            let mut want = entry.want;
            let Some(id) = want.metadata.id else {
                continue;
            };
            if want.status == WantStatus::Terminated {
                continue;
            }
            if self.names.contains_key(&want.metadata.name) {
                continue;
            }
            // Readiness is re-derived from scratch; monitors cold-start.
            want.status = WantStatus::Idle;
            let state = WantState::new(id, self.state_events_tx.clone());
            state.restore(entry.state);
            self.index.insert(id, &want);
            self.names.insert(want.metadata.name.clone(), id);
            self.wants.insert(id, WantRecord::new(want, state));
        }
        self.needs_pass = true;
        Ok(())
    }

    /// The graph as one serializable snapshot, sorted by want name
    pub(crate) fn graph_snapshot(&self) -> GraphSnapshot {
        let mut wants: Vec<WantSnapshot> =
            self.wants.values().map(WantRecord::snapshot).collect();
        wants.sort_by(|a, b| a.want.metadata.name.cmp(&b.want.metadata.name));
        GraphSnapshot {
            execution_id: self.execution_id,
            timestamp: chrono::Utc::now(),
            wants,
        }
    }
}

/// Cloneable handle to a running engine
///
/// HTTP handlers, the CLI, and tests talk to the loop exclusively through
/// this. Registries hang off the handle so domain plugins can register
/// types and local agents before admitting wants.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<ControlCommand>,
    agents: Arc<AgentRegistry>,
    want_types: Arc<WantTypeRegistry>,
    recipes: Arc<RecipeRegistry>,
    errors: ErrorLog,
    config: Arc<AppConfig>,
    execution_id: Uuid,
}

impl EngineHandle {
    async fn send(&self, command: ControlCommand) -> EngineResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| EngineError::ChannelClosed("control"))
    }

    async fn send_acked(
        &self,
        build: impl FnOnce(oneshot::Sender<Ack>) -> ControlCommand,
    ) -> Ack {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(build(ack_tx)).await?;
        ack_rx
            .await
            .map_err(|_| EngineError::ChannelClosed("control ack"))?
    }

    /// Admit a batch of wants; all-or-nothing
    pub async fn add_wants(&self, wants: Vec<Want>) -> Ack {
        self.send_acked(|ack| ControlCommand::AddWants {
            wants,
            ack: Some(ack),
        })
        .await
    }

    /// Delete wants and their controller-owned descendants
    pub async fn delete_wants(&self, ids: Vec<WantId>) -> Ack {
        self.send_acked(|ack| ControlCommand::DeleteWants {
            ids,
            ack: Some(ack),
        })
        .await
    }

    /// Replace a want's spec, preserving ID and history
    pub async fn update_want(&self, want: Want) -> Ack {
        self.send_acked(|ack| ControlCommand::UpdateWant {
            want: Box::new(want),
            ack: Some(ack),
        })
        .await
    }

    /// Suspend / resume / stop / start one want or every want
    pub async fn lifecycle(&self, target: Option<WantId>, action: LifecycleAction) -> Ack {
        self.send_acked(|ack| ControlCommand::Lifecycle {
            target,
            action,
            ack: Some(ack),
        })
        .await
    }

    /// Force a reconcile pass
    pub async fn trigger_reconcile(&self) -> EngineResult<()> {
        self.send(ControlCommand::TriggerReconcile).await
    }

    /// Nudge achieved wants whose producers emitted new data
    pub async fn retrigger_check(&self, ids: Vec<WantId>) -> EngineResult<()> {
        self.send(ControlCommand::RetriggerCheck { ids }).await
    }

    /// Commit agent-pushed updates through a progress cycle
    pub async fn apply_agent_updates(
        &self,
        want_id: WantId,
        agent: Option<String>,
        updates: BTreeMap<String, Value>,
    ) -> Ack {
        self.send_acked(|ack| ControlCommand::ApplyAgentUpdates {
            want_id,
            agent,
            updates,
            ack: Some(ack),
        })
        .await
    }

    /// Deep-copy snapshot of the whole graph
    pub async fn graph(&self) -> EngineResult<GraphSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::Query(Query::Graph { reply })).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed("query"))
    }

    /// One want by ID
    pub async fn want(&self, id: WantId) -> EngineResult<Option<WantSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::Query(Query::Want { id, reply })).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed("query"))
    }

    /// One want by name
    pub async fn want_by_name(&self, name: &str) -> EngineResult<Option<WantSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::Query(Query::WantByName {
            name: name.to_string(),
            reply,
        }))
        .await?;
        rx.await.map_err(|_| EngineError::ChannelClosed("query"))
    }

    /// A want's status
    pub async fn status(&self, id: WantId) -> EngineResult<Option<WantStatus>> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::Query(Query::Status { id, reply })).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed("query"))
    }

    /// A want's committed state values
    pub async fn results(&self, id: WantId) -> EngineResult<Option<BTreeMap<String, Value>>> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::Query(Query::Results { id, reply })).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed("query"))
    }

    /// Drain workers, persist the snapshot, and stop the loop
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.send_acked(|ack| ControlCommand::Shutdown { ack: Some(ack) })
            .await
            .map(|_| ())
    }

    /// The agent registry
    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    /// The want type catalog
    pub fn want_types(&self) -> &Arc<WantTypeRegistry> {
        &self.want_types
    }

    /// The recipe registry
    pub fn recipes(&self) -> &Arc<RecipeRegistry> {
        &self.recipes
    }

    /// The error history buffer
    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    /// The engine configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// This engine run's ID
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }
}
