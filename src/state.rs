//! Per-want state store and progress cycles
//!
//! Agents stage updates inside a progress cycle and the whole delta becomes
//! visible atomically at commit. One cycle per want at a time; readers get
//! snapshot copies and never observe a partial delta. Every commit bumps a
//! per-want sequence and publishes a [`StateEvent`] to the reconcile loop.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::OwnedMutexGuard;

use crate::error::{EngineError, EngineResult};
use crate::want::WantId;

/// One committed state field
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEntry {
    /// The value
    pub value: Value,
    /// Agent that wrote it, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub written_by: Option<String>,
    /// Sequence of the commit that produced it
    pub seq: u64,
}

/// Event published to the reconcile loop when want state changes
#[derive(Debug, Clone)]
pub enum StateEvent {
    /// A progress cycle committed on `want_id`
    Changed {
        /// The want whose state changed
        want_id: WantId,
        /// Keys touched by the committed delta
        keys: Vec<String>,
        /// Sequence assigned to the commit
        seq: u64,
        /// Agent that wrote the delta, if any
        written_by: Option<String>,
    },
}

struct StateInner {
    entries: BTreeMap<String, StateEntry>,
    pending: Option<BTreeMap<String, Value>>,
    seq: u64,
}

/// Shared state handle for one want
///
/// Held by the reconcile loop (authoritative record) and by every worker
/// executing an agent against the want.
pub struct WantState {
    want_id: WantId,
    /// Serializes progress cycles; held for the lifetime of [`ProgressCycle`]
    cycle: Arc<tokio::sync::Mutex<()>>,
    inner: Mutex<StateInner>,
    events: mpsc::UnboundedSender<StateEvent>,
}

impl WantState {
    /// Create a state store publishing events on `events`
    pub fn new(want_id: WantId, events: mpsc::UnboundedSender<StateEvent>) -> Arc<Self> {
        Arc::new(Self {
            want_id,
            cycle: Arc::new(tokio::sync::Mutex::new(())),
            inner: Mutex::new(StateInner {
                entries: BTreeMap::new(),
                pending: None,
                seq: 0,
            }),
            events,
        })
    }

    /// The owning want's ID
    pub fn want_id(&self) -> WantId {
        self.want_id
    }

    /// Open a progress cycle, waiting for any in-flight cycle to close
    pub async fn begin_progress_cycle(
        self: &Arc<Self>,
        writer: Option<String>,
    ) -> ProgressCycle {
        let permit = Arc::clone(&self.cycle).lock_owned().await;
        self.inner.lock().pending = Some(BTreeMap::new());
        ProgressCycle {
            state: Arc::clone(self),
            writer,
            committed: false,
            _permit: permit,
        }
    }

    /// Stage a value into the open cycle's pending delta
    ///
    /// Fails with [`EngineError::CycleNotOpen`] when no cycle is open.
    pub fn store_state(&self, key: impl Into<String>, value: Value) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        match inner.pending.as_mut() {
            Some(pending) => {
                pending.insert(key.into(), value);
                Ok(())
            }
            None => Err(EngineError::CycleNotOpen {
                want_id: self.want_id.to_string(),
            }),
        }
    }

    /// Snapshot of committed values (no pending delta)
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Snapshot of committed entries with writer/sequence tags
    pub fn entries(&self) -> BTreeMap<String, StateEntry> {
        self.inner.lock().entries.clone()
    }

    /// Committed value for one key
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().entries.get(key).map(|e| e.value.clone())
    }

    /// Current commit sequence; 0 means nothing committed yet
    pub fn seq(&self) -> u64 {
        self.inner.lock().seq
    }

    /// Whether the want has ever committed state
    pub fn has_committed(&self) -> bool {
        self.seq() > 0
    }

    /// Whether any committed entry was written by an agent
    ///
    /// Distinguishes produced state from engine-side notes and type
    /// defaults when judging a `reaching` dependency satisfied.
    pub fn has_agent_commit(&self) -> bool {
        self.inner
            .lock()
            .entries
            .values()
            .any(|e| e.written_by.is_some())
    }

    /// Open a cycle, stage `updates`, and commit in one step
    ///
    /// Used for remote agent results, webhook callbacks, and type default
    /// state, which arrive as one coherent batch.
    pub async fn apply_updates(
        self: &Arc<Self>,
        writer: Option<String>,
        updates: BTreeMap<String, Value>,
    ) -> CommitReceipt {
        let mut cycle = self.begin_progress_cycle(writer).await;
        for (k, v) in updates {
            cycle.store_state(k, v);
        }
        cycle.commit()
    }

    /// Replace committed entries wholesale (snapshot restore only)
    pub fn restore(&self, entries: BTreeMap<String, StateEntry>) {
        let mut inner = self.inner.lock();
        inner.seq = entries.values().map(|e| e.seq).max().unwrap_or(0);
        inner.entries = entries;
    }

    fn commit_pending(&self, writer: &Option<String>) -> CommitReceipt {
        let mut inner = self.inner.lock();
        let pending = inner.pending.take().unwrap_or_default();
        if pending.is_empty() {
            return CommitReceipt {
                want_id: self.want_id,
                keys: Vec::new(),
                seq: inner.seq,
            };
        }
        inner.seq += 1;
        let seq = inner.seq;
        let mut keys = Vec::with_capacity(pending.len());
        for (k, v) in pending {
            keys.push(k.clone());
            inner.entries.insert(
                k,
                StateEntry {
                    value: v,
                    written_by: writer.clone(),
                    seq,
                },
            );
        }
        drop(inner);

        // Receiver dropping only happens during shutdown; the commit itself
        // already succeeded.
        let _ = self.events.send(StateEvent::Changed {
            want_id: self.want_id,
            keys: keys.clone(),
            seq,
            written_by: writer.clone(),
        });
        CommitReceipt {
            want_id: self.want_id,
            keys,
            seq,
        }
    }

    fn discard_pending(&self) {
        self.inner.lock().pending = None;
    }
}

/// What a commit touched; fed into the want's state history
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    /// The committed want
    pub want_id: WantId,
    /// Touched keys; empty when the cycle staged nothing
    pub keys: Vec<String>,
    /// Sequence after the commit
    pub seq: u64,
}

/// Scoped write section on one want's state
///
/// Holds the per-want cycle lock until committed or dropped. Dropping
/// without [`ProgressCycle::commit`] discards the staged delta; the lock is
/// released either way.
pub struct ProgressCycle {
    state: Arc<WantState>,
    writer: Option<String>,
    committed: bool,
    _permit: OwnedMutexGuard<()>,
}

impl ProgressCycle {
    /// Stage a value into the pending delta
    pub fn store_state(&mut self, key: impl Into<String>, value: Value) {
        // The cycle owns the pending buffer, so this cannot miss.
        let _ = self.state.store_state(key, value);
    }

    /// The staged delta so far (shipped to remote agents)
    pub fn pending_changes(&self) -> BTreeMap<String, Value> {
        self.state
            .inner
            .lock()
            .pending
            .clone()
            .unwrap_or_default()
    }

    /// Committed view of the want's state as of cycle open
    pub fn current_state(&self) -> BTreeMap<String, Value> {
        self.state.snapshot()
    }

    /// Merge the delta atomically, assign a sequence, publish the change
    pub fn commit(mut self) -> CommitReceipt {
        self.committed = true;
        self.state.commit_pending(&self.writer)
    }
}

impl Drop for ProgressCycle {
    fn drop(&mut self) {
        if !self.committed {
            self.state.discard_pending();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_state() -> (Arc<WantState>, mpsc::UnboundedReceiver<StateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WantState::new(WantId::new(), tx), rx)
    }

    #[tokio::test]
    async fn commit_applies_delta_atomically() {
        let (state, mut rx) = new_state();

        let mut cycle = state.begin_progress_cycle(Some("agent_gen".into())).await;
        cycle.store_state("produced", json!([1, 2, 3]));
        cycle.store_state("total", json!(3));

        // Staged values are not visible before commit.
        assert!(state.snapshot().is_empty());

        let receipt = cycle.commit();
        assert_eq!(receipt.seq, 1);
        assert_eq!(receipt.keys.len(), 2);
        assert_eq!(state.get("produced"), Some(json!([1, 2, 3])));
        assert_eq!(state.entries()["total"].written_by.as_deref(), Some("agent_gen"));

        match rx.recv().await.unwrap() {
            StateEvent::Changed { keys, seq, .. } => {
                assert_eq!(seq, 1);
                assert_eq!(keys.len(), 2);
            }
        }
    }

    #[tokio::test]
    async fn store_outside_cycle_fails() {
        let (state, _rx) = new_state();
        let err = state.store_state("k", json!(1)).unwrap_err();
        assert!(matches!(err, EngineError::CycleNotOpen { .. }));
    }

    #[tokio::test]
    async fn drop_without_commit_discards_delta() {
        let (state, _rx) = new_state();
        {
            let mut cycle = state.begin_progress_cycle(None).await;
            cycle.store_state("ghost", json!(true));
        }
        assert!(state.snapshot().is_empty());
        assert_eq!(state.seq(), 0);

        // The lock was released; a new cycle can open.
        let cycle = state.begin_progress_cycle(None).await;
        drop(cycle);
    }

    #[tokio::test]
    async fn cycles_are_serialized_per_want() {
        let (state, _rx) = new_state();
        let first = state.begin_progress_cycle(None).await;

        let contender = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let mut cycle = state.begin_progress_cycle(Some("late".into())).await;
                cycle.store_state("order", json!("second"));
                cycle.commit()
            })
        };

        // The contender cannot begin until the first cycle closes.
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(first);
        let receipt = contender.await.unwrap();
        assert_eq!(receipt.seq, 1);
        assert_eq!(state.get("order"), Some(json!("second")));
    }

    #[tokio::test]
    async fn empty_commit_does_not_bump_sequence() {
        let (state, mut rx) = new_state();
        let cycle = state.begin_progress_cycle(None).await;
        let receipt = cycle.commit();
        assert_eq!(receipt.seq, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn apply_updates_is_one_commit() {
        let (state, mut rx) = new_state();
        let updates: BTreeMap<String, Value> =
            [("a".to_string(), json!(1)), ("b".to_string(), json!(2))].into();
        let receipt = state.apply_updates(Some("remote".into()), updates).await;
        assert_eq!(receipt.seq, 1);
        assert_eq!(state.snapshot().len(), 2);
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
