//! Long-running monitor observers
//!
//! One task per (want, monitor-agent) pair. A monitor runs on a periodic
//! interval and whenever the reconcile loop nudges it because a state
//! change touched the fields it declared parent-state access to. Monitors
//! publish state through ordinary progress cycles and never transition the
//! want's status.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dispatch::local::{AgentContext, PeerState, WantView};
use crate::dispatch::remote::{RemoteAgentClient, RemoteExecuteRequest, RemoteStatus};
use crate::registry::agents::{AgentRegistry, AgentSpec, ExecTarget};
use crate::state::WantState;

/// Everything needed to start one monitor task
pub struct MonitorSpawn {
    /// The monitor agent's declaration
    pub agent: Arc<AgentSpec>,
    /// View seed of the observed want (name, labels, params)
    pub view: WantView,
    /// The observed want's state handle
    pub state: Arc<WantState>,
    /// The owner's identity and state handle, when one exists
    pub owner: Option<(PeerState, Arc<WantState>)>,
    /// Fields whose changes should wake the monitor between intervals
    pub watched_fields: Vec<String>,
    /// Periodic observation interval
    pub interval: Duration,
    /// Callback URL handed to remote monitors
    pub callback_url: Option<String>,
}

/// Handle the reconcile loop keeps per running monitor
pub struct MonitorHandle {
    /// Monitor agent name
    pub agent_name: String,
    /// Owner want the watched fields belong to
    pub owner_id: Option<crate::want::WantId>,
    /// Fields that wake the monitor
    pub watched_fields: Vec<String>,
    nudge: mpsc::UnboundedSender<()>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    /// Wake the monitor outside its interval
    pub fn nudge(&self) {
        let _ = self.nudge.send(());
    }

    /// Signal shutdown without waiting
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal shutdown and wait for the task to finish
    pub async fn join(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

/// Start one monitor task
pub fn spawn_monitor(
    spawn: MonitorSpawn,
    registry: Arc<AgentRegistry>,
    remote: RemoteAgentClient,
) -> MonitorHandle {
    let (nudge_tx, mut nudge_rx) = mpsc::unbounded_channel::<()>();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let agent_name = spawn.agent.name.clone();
    let owner_id = spawn.owner.as_ref().map(|(peer, _)| peer.id);
    let watched_fields = spawn.watched_fields.clone();

    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(spawn.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
                nudged = nudge_rx.recv() => {
                    if nudged.is_none() {
                        break;
                    }
                }
            }
            observe_once(&spawn, &registry, &remote).await;
        }
        debug!(agent = %spawn.agent.name, want = %spawn.view.name, "monitor stopped");
    });

    MonitorHandle {
        agent_name,
        owner_id,
        watched_fields,
        nudge: nudge_tx,
        shutdown: shutdown_tx,
        join,
    }
}

/// One observation cycle; errors are logged, never fatal
async fn observe_once(
    spawn: &MonitorSpawn,
    registry: &AgentRegistry,
    remote: &RemoteAgentClient,
) {
    let mut view = spawn.view.clone();
    view.state = spawn.state.snapshot();
    let owner = spawn.owner.as_ref().map(|(peer, owner_state)| {
        let mut peer = peer.clone();
        peer.state = owner_state.snapshot();
        peer
    });
    let ctx = AgentContext {
        want: view,
        upstream: Vec::new(),
        owner,
    };

    let updates = match &spawn.agent.exec {
        ExecTarget::Local => {
            let Some(implementation) = registry.monitor_impl(&spawn.agent.name) else {
                warn!(agent = %spawn.agent.name, "monitor has no local implementation");
                return;
            };
            match implementation.observe(&ctx).await {
                Ok(updates) => updates,
                Err(e) => {
                    warn!(agent = %spawn.agent.name, want = %ctx.want.name, error = %e, "monitor cycle failed");
                    return;
                }
            }
        }
        ExecTarget::Remote { base_url } => {
            let request = RemoteExecuteRequest {
                want_id: ctx.want.id,
                agent_name: spawn.agent.name.clone(),
                want_state: ctx.want.state.clone(),
                callback_url: spawn.callback_url.clone(),
            };
            match remote.execute_monitor(base_url, &request).await {
                Ok(response) if response.status == RemoteStatus::Completed => {
                    response.state_updates
                }
                Ok(response) => {
                    warn!(
                        agent = %spawn.agent.name,
                        error = response.error.as_deref().unwrap_or("unspecified"),
                        "remote monitor cycle failed"
                    );
                    return;
                }
                Err(e) => {
                    warn!(agent = %spawn.agent.name, error = %e, "remote monitor dispatch failed");
                    return;
                }
            }
        }
    };

    if updates.is_empty() {
        return;
    }
    let updates: BTreeMap<String, serde_json::Value> = updates.into_iter().collect();
    spawn
        .state
        .apply_updates(Some(spawn.agent.name.clone()), updates)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::local::{MonitorAgentFn, StateUpdates};
    use crate::registry::agents::AgentType;
    use crate::want::WantId;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn monitor_spec(name: &str) -> AgentSpec {
        AgentSpec {
            name: name.to_string(),
            agent_type: AgentType::Monitor,
            capabilities: vec!["booking_watch".into()],
            exec: ExecTarget::Local,
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn nudge_runs_an_observation_cycle() {
        let registry = Arc::new(AgentRegistry::new());
        registry.register_monitor(
            monitor_spec("monitor_booking"),
            Arc::new(MonitorAgentFn(|ctx: AgentContext| async move {
                let mut updates = StateUpdates::new();
                if ctx.want.state.get("booking_status") == Some(&json!("delayed_one_day")) {
                    updates.insert("rebook".into(), json!(true));
                }
                Ok(updates)
            })),
        );

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let want_id = WantId::new();
        let state = crate::state::WantState::new(want_id, events_tx);
        state
            .apply_updates(None, BTreeMap::from([(
                "booking_status".to_string(),
                json!("delayed_one_day"),
            )]))
            .await;
        let _ = events_rx.recv().await;

        let remote = RemoteAgentClient::new(Duration::from_secs(5), None).unwrap();
        let handle = spawn_monitor(
            MonitorSpawn {
                agent: registry.get("monitor_booking").unwrap(),
                view: WantView {
                    id: want_id,
                    name: "trip".into(),
                    want_type: "travel".into(),
                    labels: BTreeMap::new(),
                    params: BTreeMap::new(),
                    state: BTreeMap::new(),
                },
                state: Arc::clone(&state),
                owner: None,
                watched_fields: vec!["booking_status".into()],
                // Long interval so only the nudge can drive the cycle we
                // assert on.
                interval: Duration::from_secs(3600),
                callback_url: None,
            },
            Arc::clone(&registry),
            remote,
        );

        // The interval's immediate first tick plus the nudge both run; either
        // way the rebook flag lands.
        handle.nudge();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if state.get("rebook") == Some(json!(true)) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "monitor never published");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.join().await;
    }
}
