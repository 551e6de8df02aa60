//! Agent dispatch
//!
//! The dispatcher binds required capabilities to agents and executes them.
//! Do-cycles run as detached workers bounded by a semaphore; each worker
//! stages updates in a progress cycle, records history, and posts its
//! outcome back to the reconcile loop's control surface. Monitors are
//! managed in [`monitor`].

pub mod local;
pub mod monitor;
pub mod remote;

pub use local::{AgentContext, DoAgent, DoAgentFn, MonitorAgent, MonitorAgentFn, PeerState, StateUpdates, WantView};
pub use monitor::{spawn_monitor, MonitorHandle, MonitorSpawn};
pub use remote::{RemoteAgentClient, RemoteExecuteRequest, RemoteExecuteResponse, RemoteStatus};

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::registry::agents::{AgentRegistry, AgentType, ExecTarget};
use crate::state::WantState;
use crate::want::{AgentExecution, ExecutionStatus, WantId};

/// One Do-cycle to run for a want
pub struct DoCycleRequest {
    /// The want being driven
    pub want_id: WantId,
    /// Capabilities to run one Do-agent for, in order
    pub requires: Vec<String>,
    /// Execution context (state snapshots refresh per capability)
    pub context: AgentContext,
    /// The want's state handle
    pub state: Arc<WantState>,
    /// Lifecycle-derived cancellation; stop/delete flips it
    pub cancel: watch::Receiver<bool>,
}

/// What a Do-cycle worker reports back to the loop
#[derive(Debug)]
pub struct DoCycleOutcome {
    /// The want the cycle ran for
    pub want_id: WantId,
    /// One history record per executed agent
    pub executions: Vec<AgentExecution>,
    /// First error message, when any capability failed
    pub error: Option<String>,
    /// The cycle was cancelled mid-flight; the loop discards the outcome
    pub cancelled: bool,
}

impl DoCycleOutcome {
    /// Whether every capability succeeded
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && !self.cancelled
    }
}

/// Executes Do-cycles against the agent registry
#[derive(Clone)]
pub struct Dispatcher {
    agents: Arc<AgentRegistry>,
    remote: RemoteAgentClient,
    permits: Arc<Semaphore>,
    outcomes: mpsc::UnboundedSender<DoCycleOutcome>,
}

impl Dispatcher {
    /// Build a dispatcher posting outcomes to `outcomes`
    pub fn new(
        agents: Arc<AgentRegistry>,
        remote: RemoteAgentClient,
        worker_pool_size: usize,
        outcomes: mpsc::UnboundedSender<DoCycleOutcome>,
    ) -> Self {
        Self {
            agents,
            remote,
            permits: Arc::new(Semaphore::new(worker_pool_size.max(1))),
            outcomes,
        }
    }

    /// The registry this dispatcher binds agents from
    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    /// The remote dispatch client
    pub fn remote(&self) -> &RemoteAgentClient {
        &self.remote
    }

    /// Spawn one Do-cycle worker; the outcome arrives on the outcomes channel
    pub fn spawn_do_cycle(&self, request: DoCycleRequest) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let permit = dispatcher.permits.acquire().await;
            if permit.is_err() {
                return;
            }
            let outcome = dispatcher.run_do_cycle(request).await;
            let _ = dispatcher.outcomes.send(outcome);
        });
    }

    /// Run one Do-agent per required capability
    ///
    /// Every capability runs even after a failure, so exactly one
    /// invocation per capability happens per cycle; the first error decides
    /// the outcome.
    async fn run_do_cycle(&self, mut request: DoCycleRequest) -> DoCycleOutcome {
        let mut executions = Vec::with_capacity(request.requires.len());
        let mut first_error: Option<String> = None;

        for capability in &request.requires {
            if *request.cancel.borrow() {
                return DoCycleOutcome {
                    want_id: request.want_id,
                    executions,
                    error: first_error,
                    cancelled: true,
                };
            }
            let Some(agent) = self.agents.do_agent_for(capability) else {
                // The loop checks bindings before dispatch; a vanishing
                // agent between check and run still fails cleanly.
                let message = EngineError::UnmetCapability {
                    capability: capability.clone(),
                }
                .to_string();
                first_error.get_or_insert(message);
                continue;
            };

            request.context.want.state = request.state.snapshot();
            let started = Utc::now();
            let mut cycle = request
                .state
                .begin_progress_cycle(Some(agent.name.clone()))
                .await;

            let exec_result = {
                let exec = self.execute_one(&agent, &request.context);
                let mut cancel = request.cancel.clone();
                tokio::select! {
                    result = exec => Some(result),
                    _ = cancel.changed() => None,
                }
            };
            let Some(result) = exec_result else {
                drop(cycle);
                return DoCycleOutcome {
                    want_id: request.want_id,
                    executions,
                    error: first_error,
                    cancelled: true,
                };
            };

            let ended = Utc::now();
            match result {
                Ok((updates, execution_time_ms)) => {
                    for (k, v) in updates {
                        cycle.store_state(k, v);
                    }
                    cycle.commit();
                    debug!(agent = %agent.name, want = %request.context.want.name, "do-agent achieved");
                    executions.push(AgentExecution {
                        agent_name: agent.name.clone(),
                        agent_type: AgentType::Do.as_str().into(),
                        started_at: started,
                        ended_at: ended,
                        status: ExecutionStatus::Achieved,
                        error: None,
                        activity: None,
                        execution_time_ms,
                    });
                }
                Err(e) => {
                    drop(cycle);
                    warn!(agent = %agent.name, want = %request.context.want.name, error = %e, "do-agent failed");
                    executions.push(AgentExecution {
                        agent_name: agent.name.clone(),
                        agent_type: AgentType::Do.as_str().into(),
                        started_at: started,
                        ended_at: ended,
                        status: ExecutionStatus::Failed,
                        error: Some(e.to_string()),
                        activity: None,
                        execution_time_ms: None,
                    });
                    first_error.get_or_insert(e.to_string());
                }
            }
        }

        DoCycleOutcome {
            want_id: request.want_id,
            executions,
            error: first_error,
            cancelled: false,
        }
    }

    /// Execute one agent locally or remotely
    async fn execute_one(
        &self,
        agent: &crate::registry::agents::AgentSpec,
        ctx: &AgentContext,
    ) -> Result<(StateUpdates, Option<u64>), EngineError> {
        match &agent.exec {
            ExecTarget::Local => {
                let Some(implementation) = self.agents.do_impl(&agent.name) else {
                    return Err(EngineError::Agent {
                        agent: agent.name.clone(),
                        message: "no local implementation registered".into(),
                    });
                };
                let updates = implementation.exec(ctx).await?;
                Ok((updates, None))
            }
            ExecTarget::Remote { base_url } => {
                let request = RemoteExecuteRequest {
                    want_id: ctx.want.id,
                    agent_name: agent.name.clone(),
                    want_state: ctx.want.state.clone(),
                    callback_url: None,
                };
                let response = self.remote.execute(base_url, &request).await?;
                match response.status {
                    RemoteStatus::Completed => {
                        Ok((response.state_updates, Some(response.execution_time_ms)))
                    }
                    RemoteStatus::Failed => Err(EngineError::Agent {
                        agent: agent.name.clone(),
                        message: response
                            .error
                            .unwrap_or_else(|| "remote agent failed".into()),
                    }),
                }
            }
        }
    }
}
