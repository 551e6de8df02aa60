//! In-process agent contracts
//!
//! Do-agents drive a want toward `achieved` in one-shot cycles; Monitor
//! agents observe and publish state continuously. Both return their state
//! updates; the dispatcher stages and commits them inside a progress cycle
//! so agents never touch want status or partial state.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::EngineResult;
use crate::want::WantId;

/// State updates returned by one agent execution
pub type StateUpdates = BTreeMap<String, Value>;

/// Read-only view of the want an agent executes against
#[derive(Debug, Clone)]
pub struct WantView {
    /// Want ID
    pub id: WantId,
    /// Want name
    pub name: String,
    /// Want type tag
    pub want_type: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Spec parameters
    pub params: BTreeMap<String, Value>,
    /// Committed state snapshot
    pub state: BTreeMap<String, Value>,
}

/// Committed state of a peer the want depends on or is owned by
#[derive(Debug, Clone)]
pub struct PeerState {
    /// Peer want ID
    pub id: WantId,
    /// Peer name
    pub name: String,
    /// Peer labels
    pub labels: BTreeMap<String, String>,
    /// Peer committed state snapshot
    pub state: BTreeMap<String, Value>,
}

/// Everything an agent sees for one execution
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// The want being driven
    pub want: WantView,
    /// Resolved `using` dependencies, in selector order
    pub upstream: Vec<PeerState>,
    /// The want's owner, when it has a controller owner
    pub owner: Option<PeerState>,
}

impl AgentContext {
    /// A spec parameter of the want
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.want.params.get(name)
    }

    /// First upstream peer publishing `key`, with the value
    pub fn upstream_value(&self, key: &str) -> Option<(&PeerState, &Value)> {
        self.upstream
            .iter()
            .find_map(|peer| peer.state.get(key).map(|value| (peer, value)))
    }

    /// A field from the owner's published state
    pub fn owner_value(&self, key: &str) -> Option<&Value> {
        self.owner.as_ref().and_then(|owner| owner.state.get(key))
    }
}

/// An action invoked once per reconcile cycle
///
/// Returning `Ok` drives the want toward `achieved` for the capability the
/// agent was bound to; any `Err` fails the cycle.
#[async_trait]
pub trait DoAgent: Send + Sync {
    /// Execute one cycle and return the state updates to commit
    async fn exec(&self, ctx: &AgentContext) -> EngineResult<StateUpdates>;
}

/// A cooperative long-running observer
///
/// `observe` returns after one observation cycle; the dispatcher invokes it
/// on a schedule and on relevant state-change events. Monitors publish
/// state but never transition want status.
#[async_trait]
pub trait MonitorAgent: Send + Sync {
    /// Run one observation cycle and return the state updates to commit
    async fn observe(&self, ctx: &AgentContext) -> EngineResult<StateUpdates>;
}

/// Adapter turning an async closure into a [`DoAgent`]
pub struct DoAgentFn<F>(pub F);

#[async_trait]
impl<F, Fut> DoAgent for DoAgentFn<F>
where
    F: Fn(AgentContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = EngineResult<StateUpdates>> + Send,
{
    async fn exec(&self, ctx: &AgentContext) -> EngineResult<StateUpdates> {
        (self.0)(ctx.clone()).await
    }
}

/// Adapter turning an async closure into a [`MonitorAgent`]
pub struct MonitorAgentFn<F>(pub F);

#[async_trait]
impl<F, Fut> MonitorAgent for MonitorAgentFn<F>
where
    F: Fn(AgentContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = EngineResult<StateUpdates>> + Send,
{
    async fn observe(&self, ctx: &AgentContext) -> EngineResult<StateUpdates> {
        (self.0)(ctx.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> AgentContext {
        AgentContext {
            want: WantView {
                id: WantId::new(),
                name: "sink".into(),
                want_type: "numbers-sink".into(),
                labels: BTreeMap::new(),
                params: [("count".to_string(), json!(3))].into(),
                state: BTreeMap::new(),
            },
            upstream: vec![PeerState {
                id: WantId::new(),
                name: "gen".into(),
                labels: [("role".to_string(), "source".to_string())].into(),
                state: [("produced".to_string(), json!([1, 2, 3]))].into(),
            }],
            owner: None,
        }
    }

    #[tokio::test]
    async fn closure_agents_execute() {
        let agent = DoAgentFn(|ctx: AgentContext| async move {
            let (_, produced) = ctx.upstream_value("produced").unwrap();
            let consumed = produced.as_array().unwrap().len();
            Ok(StateUpdates::from([(
                "consumed".to_string(),
                json!(consumed),
            )]))
        });
        let updates = agent.exec(&context()).await.unwrap();
        assert_eq!(updates["consumed"], json!(3));
    }

    #[test]
    fn upstream_lookup_finds_publisher() {
        let ctx = context();
        let (peer, value) = ctx.upstream_value("produced").unwrap();
        assert_eq!(peer.name, "gen");
        assert_eq!(value, &json!([1, 2, 3]));
        assert!(ctx.upstream_value("absent").is_none());
    }
}
