//! The reconcile loop
//!
//! Single-threaded cooperative scheduling over the want map with parallel
//! fan-out at agent invocation. Commands, state events, and worker outcomes
//! are the only inputs; a periodic tick debounces retriggers to at most one
//! extra pass per window.

use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use super::control::{Ack, ControlCommand, LifecycleAction, Query};
use super::{ChainBuilder, WantRecord};
use crate::dispatch::local::{AgentContext, PeerState, WantView};
use crate::dispatch::monitor::{spawn_monitor, MonitorSpawn};
use crate::dispatch::{DoCycleOutcome, DoCycleRequest};
use crate::error::{EngineError, EngineResult};
use crate::lifecycle::{advance, LifecycleEvent};
use crate::registry::agents::{AgentType, ExecTarget};
use crate::snapshot;
use crate::state::{StateEvent, WantState};
use crate::want::{StateHistoryEntry, UsingSelector, Want, WantId, WantStatus};

/// What one pass decided for one want
enum Plan {
    /// Run a Do-cycle; `deps` are the satisfied upstream producers
    Dispatch {
        deps: Vec<WantId>,
        expand: bool,
        from_achieved: bool,
    },
    /// No required capabilities; achieve after optional expansion
    AchieveEmpty { expand: bool },
    /// Stay idle and record what is missing
    Note {
        unmet_deps: Vec<String>,
        unmet_caps: Vec<String>,
    },
    /// A dependency no longer resolves; fall back to idle
    Demote { unmet_deps: Vec<String> },
}

fn respond(ack: Option<oneshot::Sender<Ack>>, result: Ack) {
    if let Some(ack) = ack {
        let _ = ack.send(result);
    }
}

fn selector_string(selector: &UsingSelector) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

impl ChainBuilder {
    /// The loop body; runs until shutdown or channel close
    pub(crate) async fn run(mut self) {
        info!(execution = %self.execution_id, "reconcile loop started");
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.config.engine.tick_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown_ack: Option<oneshot::Sender<Ack>> = None;

        loop {
            tokio::select! {
                command = self.control_rx.recv() => {
                    match command {
                        Some(ControlCommand::Shutdown { ack }) => {
                            shutdown_ack = ack;
                            break;
                        }
                        Some(ControlCommand::TriggerReconcile) => self.reconcile_pass(),
                        Some(command) => self.handle_command(command),
                        None => break,
                    }
                }
                Some(event) = self.state_events_rx.recv() => self.on_state_event(event),
                Some(outcome) = self.outcomes_rx.recv() => self.on_outcome(outcome),
                _ = tick.tick() => {
                    if self.needs_pass {
                        self.reconcile_pass();
                    }
                }
            }
        }

        self.shutdown_drain().await;
        respond(shutdown_ack, Ok(Vec::new()));
        info!("reconcile loop stopped");
    }

    fn handle_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::AddWants { wants, ack } => {
                let result = self.admit_wants(wants);
                if let Err(e) = &result {
                    self.errors.record(e, None);
                }
                respond(ack, result);
            }
            ControlCommand::DeleteWants { ids, ack } => {
                let result = self.delete_wants(ids);
                if let Err(e) = &result {
                    self.errors.record(e, None);
                }
                respond(ack, result);
            }
            ControlCommand::UpdateWant { want, ack } => {
                let result = self.update_want(*want);
                if let Err(e) = &result {
                    self.errors.record(e, None);
                }
                respond(ack, result);
            }
            ControlCommand::RetriggerCheck { ids } => {
                for id in ids {
                    if let Some(record) = self.wants.get_mut(&id) {
                        if record.want.status == WantStatus::Achieved && !record.inflight {
                            record.retrigger = true;
                        }
                    }
                }
                self.needs_pass = true;
            }
            ControlCommand::Lifecycle {
                target,
                action,
                ack,
            } => {
                let result = self.apply_lifecycle(target, action);
                respond(ack, result);
            }
            ControlCommand::ApplyAgentUpdates {
                want_id,
                agent,
                updates,
                ack,
            } => match self.wants.get(&want_id) {
                Some(record) => {
                    let state = Arc::clone(&record.state);
                    // The commit must not block the loop behind a worker's
                    // open cycle; the event it publishes re-enters normally.
                    tokio::spawn(async move {
                        state.apply_updates(agent, updates).await;
                    });
                    respond(ack, Ok(vec![want_id]));
                }
                None => respond(
                    ack,
                    Err(EngineError::NotFound {
                        kind: "want",
                        id: want_id.to_string(),
                    }),
                ),
            },
            ControlCommand::Query(query) => self.handle_query(query),
            // Handled in run()
            ControlCommand::TriggerReconcile | ControlCommand::Shutdown { .. } => {}
        }
    }

    fn handle_query(&self, query: Query) {
        match query {
            Query::Graph { reply } => {
                let _ = reply.send(self.graph_snapshot());
            }
            Query::Want { id, reply } => {
                let _ = reply.send(self.wants.get(&id).map(WantRecord::snapshot));
            }
            Query::WantByName { name, reply } => {
                let snapshot = self
                    .names
                    .get(&name)
                    .and_then(|id| self.wants.get(id))
                    .map(WantRecord::snapshot);
                let _ = reply.send(snapshot);
            }
            Query::Status { id, reply } => {
                let _ = reply.send(self.wants.get(&id).map(|r| r.want.status));
            }
            Query::Results { id, reply } => {
                let _ = reply.send(self.wants.get(&id).map(|r| r.state.snapshot()));
            }
        }
    }

    /// Admit a batch, all-or-nothing
    fn admit_wants(&mut self, mut wants: Vec<Want>) -> Ack {
        if wants.is_empty() {
            return Ok(Vec::new());
        }
        let mut batch_names: HashSet<String> = HashSet::new();
        for want in &mut wants {
            want.validate()?;
            self.want_types.admit(want)?;
            if !batch_names.insert(want.metadata.name.clone())
                || self.names.contains_key(&want.metadata.name)
            {
                return Err(EngineError::NameConflict {
                    name: want.metadata.name.clone(),
                });
            }
            match want.metadata.id {
                Some(id) if self.wants.contains_key(&id) => {
                    return Err(EngineError::Validation(format!(
                        "want ID already admitted: {}",
                        id
                    )));
                }
                Some(_) => {}
                None => want.metadata.id = Some(WantId::new()),
            }
        }
        self.reject_owner_cycles(&wants)?;

        let mut applied = Vec::with_capacity(wants.len());
        for mut want in wants {
            let id = match want.id() {
                Ok(id) => id,
                Err(e) => return Err(e),
            };
            want.status = advance(WantStatus::Created, LifecycleEvent::Admitted)
                .unwrap_or(WantStatus::Idle);
            let state = WantState::new(id, self.state_events_tx.clone());
            if let Some(definition) = self.want_types.get(&want.metadata.want_type) {
                if !definition.default_state.is_empty() {
                    let entries = definition
                        .default_state
                        .iter()
                        .map(|(k, v)| {
                            (
                                k.clone(),
                                crate::state::StateEntry {
                                    value: v.clone(),
                                    written_by: None,
                                    seq: 0,
                                },
                            )
                        })
                        .collect();
                    state.restore(entries);
                }
            }
            debug!(want = %want.metadata.name, id = %id, "want admitted");
            self.index.insert(id, &want);
            self.names.insert(want.metadata.name.clone(), id);
            self.wants.insert(id, WantRecord::new(want, state));
            applied.push(id);
        }
        self.needs_pass = true;
        Ok(applied)
    }

    /// Walk proposed owner chains across the batch and the graph
    fn reject_owner_cycles(&self, batch: &[Want]) -> EngineResult<()> {
        let batch_refs: HashMap<WantId, &Want> = batch
            .iter()
            .filter_map(|w| w.metadata.id.map(|id| (id, w)))
            .collect();
        let owners_of = |id: &WantId| -> Vec<WantId> {
            batch_refs
                .get(id)
                .map(|w| &w.metadata.owner_references)
                .or_else(|| self.wants.get(id).map(|r| &r.want.metadata.owner_references))
                .map(|refs| refs.iter().map(|r| r.id).collect())
                .unwrap_or_default()
        };
        for want in batch {
            let Some(start) = want.metadata.id else { continue };
            let mut stack = owners_of(&start);
            let mut seen: HashSet<WantId> = HashSet::new();
            while let Some(current) = stack.pop() {
                if current == start {
                    return Err(EngineError::Validation(format!(
                        "owner references of {} form a cycle",
                        want.metadata.name
                    )));
                }
                if seen.insert(current) {
                    stack.extend(owners_of(&current));
                }
            }
        }
        Ok(())
    }

    /// Delete wants in post-order over controller ownership
    fn delete_wants(&mut self, ids: Vec<WantId>) -> Ack {
        for id in &ids {
            if !self.wants.contains_key(id) {
                return Err(EngineError::NotFound {
                    kind: "want",
                    id: id.to_string(),
                });
            }
        }
        let mut ordered = Vec::new();
        let mut visited = HashSet::new();
        for id in &ids {
            self.collect_cascade(*id, &mut visited, &mut ordered);
        }
        for id in &ordered {
            self.remove_want(*id);
        }
        self.needs_pass = true;
        Ok(ordered)
    }

    fn collect_cascade(
        &self,
        id: WantId,
        visited: &mut HashSet<WantId>,
        out: &mut Vec<WantId>,
    ) {
        if !visited.insert(id) {
            return;
        }
        for child in self.index.children_of(id) {
            if let Some(record) = self.wants.get(&child) {
                if record.want.is_controlled_by(id) {
                    self.collect_cascade(child, visited, out);
                }
            }
        }
        out.push(id);
    }

    fn remove_want(&mut self, id: WantId) {
        let Some(mut record) = self.wants.remove(&id) else {
            return;
        };
        let _ = record.cancel.send(true);
        for monitor in record.monitors.drain(..) {
            monitor.stop();
        }
        record.want.status = advance(record.want.status, LifecycleEvent::Delete)
            .unwrap_or(WantStatus::Terminated);
        self.want_types.cleanup(&record.want);
        self.index.remove(id, &record.want);
        self.names.remove(&record.want.metadata.name);
        info!(want = %record.want.metadata.name, id = %id, "want terminated");

        // Controller-owned descendants were removed first (post-order);
        // what remains under this owner holds non-controller references.
        for child in self.index.children_of(id) {
            if let Some(child_record) = self.wants.get(&child) {
                let state = Arc::clone(&child_record.state);
                let owner_name = record.want.metadata.name.clone();
                tokio::spawn(async move {
                    state
                        .apply_updates(
                            None,
                            BTreeMap::from([(
                                "dangling_reference".to_string(),
                                json!(owner_name),
                            )]),
                        )
                        .await;
                });
            }
        }
    }

    /// Replace a want's spec; latest update wins
    fn update_want(&mut self, incoming: Want) -> Ack {
        let id = incoming.metadata.id.ok_or_else(|| {
            EngineError::Validation("update requires a want ID".into())
        })?;
        incoming.validate()?;
        let Some(existing) = self.wants.get(&id) else {
            return Err(EngineError::NotFound {
                kind: "want",
                id: id.to_string(),
            });
        };
        let old_name = existing.want.metadata.name.clone();
        let old_labels = existing.want.metadata.labels.clone();
        let old_recipe = existing.want.spec.recipe.clone();
        if incoming.metadata.name != old_name
            && self.names.contains_key(&incoming.metadata.name)
        {
            return Err(EngineError::NameConflict {
                name: incoming.metadata.name.clone(),
            });
        }

        self.index.relabel(id, &old_labels, &incoming.metadata.labels);
        let Some(record) = self.wants.get_mut(&id) else {
            return Err(EngineError::Internal(format!("want {} vanished mid-update", id)));
        };
        record.want.metadata.name = incoming.metadata.name.clone();
        record.want.metadata.labels = incoming.metadata.labels;
        record.want.spec = incoming.spec;
        if record.want.spec.recipe != old_recipe {
            record.want.recipe_expanded = false;
        }
        // Monitors respawn against the new spec on the next pass.
        for monitor in record.monitors.drain(..) {
            monitor.stop();
        }
        if incoming.metadata.name != old_name {
            self.names.remove(&old_name);
            self.names.insert(incoming.metadata.name, id);
        }
        self.needs_pass = true;
        Ok(vec![id])
    }

    fn apply_lifecycle(&mut self, target: Option<WantId>, action: LifecycleAction) -> Ack {
        let targets: Vec<WantId> = match target {
            Some(id) => {
                if !self.wants.contains_key(&id) {
                    return Err(EngineError::NotFound {
                        kind: "want",
                        id: id.to_string(),
                    });
                }
                vec![id]
            }
            None => self.wants.keys().copied().collect(),
        };
        let mut applied = Vec::new();
        for id in targets {
            let Some(record) = self.wants.get_mut(&id) else {
                continue;
            };
            let Ok(next) = advance(record.want.status, action.event()) else {
                continue;
            };
            record.want.status = next;
            record.retrigger = false;
            match action {
                LifecycleAction::Stop | LifecycleAction::Suspend => {
                    let _ = record.cancel.send(true);
                    for monitor in record.monitors.drain(..) {
                        monitor.stop();
                    }
                }
                LifecycleAction::Resume | LifecycleAction::Start => {}
            }
            applied.push(id);
        }
        self.needs_pass = true;
        Ok(applied)
    }

    /// Fold a state-change event into loop bookkeeping
    fn on_state_event(&mut self, event: StateEvent) {
        let StateEvent::Changed {
            want_id,
            keys,
            seq,
            written_by,
        } = event;
        {
            let Some(record) = self.wants.get_mut(&want_id) else {
                return;
            };
            record.want.state_history.push(StateHistoryEntry {
                seq,
                keys: keys.clone(),
                written_by: written_by.clone(),
                timestamp: Utc::now(),
            });
        }

        // A monitor observing drift demotes its achieved want so the next
        // pass runs a fresh Do-cycle.
        let writer_is_monitor = written_by
            .as_deref()
            .and_then(|name| self.agents.get(name))
            .map(|agent| agent.agent_type == AgentType::Monitor)
            .unwrap_or(false);
        if writer_is_monitor {
            if let Some(record) = self.wants.get_mut(&want_id) {
                if record.want.status == WantStatus::Achieved {
                    if let Ok(next) =
                        advance(record.want.status, LifecycleEvent::DependencyInvalidated)
                    {
                        record.want.status = next;
                        debug!(want = %record.want.metadata.name, "monitor write demoted achieved want");
                    }
                }
            }
        }

        // Wake monitors whose declared parent-state fields were touched.
        for child in self.index.children_of(want_id) {
            if let Some(record) = self.wants.get(&child) {
                for monitor in &record.monitors {
                    if monitor.owner_id == Some(want_id)
                        && keys.iter().any(|k| monitor.watched_fields.contains(k))
                    {
                        monitor.nudge();
                    }
                }
            }
        }

        // Agent writes retrigger achieved dependents; engine notes do not.
        if written_by.is_some() {
            let dependents: Vec<WantId> = self
                .wants
                .iter()
                .filter(|(id, record)| {
                    **id != want_id
                        && record.want.status == WantStatus::Achieved
                        && !record.inflight
                        && record.want.spec.using.iter().any(|selector| {
                            self.index.resolve_using(selector).contains(&want_id)
                        })
                })
                .map(|(id, _)| *id)
                .collect();
            for id in dependents {
                if let Some(record) = self.wants.get_mut(&id) {
                    record.retrigger = true;
                }
            }
        }
        self.needs_pass = true;
    }

    /// Fold a Do-cycle outcome into status and history
    fn on_outcome(&mut self, outcome: DoCycleOutcome) {
        let Some(record) = self.wants.get_mut(&outcome.want_id) else {
            return;
        };
        record.inflight = false;
        for execution in &outcome.executions {
            record.want.record_execution(execution.clone());
        }
        if outcome.cancelled {
            self.needs_pass = true;
            return;
        }
        // A demotion or stop that raced the worker wins; its outcome only
        // contributes history.
        if record.want.status == WantStatus::Reaching {
            let event = if outcome.error.is_some() {
                LifecycleEvent::DoCycleFailed
            } else {
                LifecycleEvent::DoCycleSucceeded
            };
            match advance(record.want.status, event) {
                Ok(next) => record.want.status = next,
                Err(e) => error!(want = %record.want.metadata.name, error = %e, "lifecycle advance failed"),
            }
            if let Some(message) = &outcome.error {
                let err = EngineError::Agent {
                    agent: "do-cycle".into(),
                    message: message.clone(),
                };
                self.errors.record(&err, Some(outcome.want_id.to_string()));
                warn!(want_id = %outcome.want_id, error = %message, "want failed");
            }
        }
        self.needs_pass = true;
    }

    /// One scheduling sweep over the graph
    pub(crate) fn reconcile_pass(&mut self) {
        self.needs_pass = false;
        let mut ids: Vec<WantId> = self.wants.keys().copied().collect();
        ids.sort();

        let mut plans = Vec::new();
        for id in ids {
            if let Some(plan) = self.plan_want(id) {
                plans.push((id, plan));
            }
        }
        for (id, plan) in plans {
            self.apply_plan(id, plan);
        }
        self.reconcile_monitors();
    }

    fn dependency_satisfied(&self, dep: WantId) -> bool {
        let Some(record) = self.wants.get(&dep) else {
            return false;
        };
        match record.want.status {
            WantStatus::Achieved => true,
            WantStatus::Reaching => record.state.has_agent_commit(),
            _ => false,
        }
    }

    /// Selectors that no longer resolve to any want
    fn broken_selectors(&self, want: &Want) -> Vec<String> {
        want.spec
            .using
            .iter()
            .filter(|selector| self.index.resolve_using(selector).is_empty())
            .map(selector_string)
            .collect()
    }

    fn plan_want(&self, id: WantId) -> Option<Plan> {
        let record = self.wants.get(&id)?;
        let want = &record.want;
        match want.status {
            WantStatus::Idle if !record.inflight => {
                let mut unmet_deps = Vec::new();
                let mut deps = Vec::new();
                let mut waiting = false;
                for selector in &want.spec.using {
                    let resolved = self.index.resolve_using(selector);
                    if resolved.is_empty() {
                        unmet_deps.push(selector_string(selector));
                        continue;
                    }
                    let satisfied: Vec<WantId> = resolved
                        .iter()
                        .copied()
                        .filter(|dep| self.dependency_satisfied(*dep))
                        .collect();
                    if satisfied.is_empty() {
                        waiting = true;
                    } else {
                        deps.extend(satisfied);
                    }
                }
                let unmet_caps: Vec<String> = want
                    .spec
                    .requires
                    .iter()
                    .filter(|cap| self.agents.do_agent_for(cap).is_none())
                    .cloned()
                    .collect();
                if !unmet_deps.is_empty() || !unmet_caps.is_empty() {
                    return Some(Plan::Note {
                        unmet_deps,
                        unmet_caps,
                    });
                }
                if waiting {
                    return None;
                }
                let expand = want.spec.recipe.is_some() && !want.recipe_expanded;
                if want.spec.requires.is_empty() {
                    return Some(Plan::AchieveEmpty { expand });
                }
                Some(Plan::Dispatch {
                    deps,
                    expand,
                    from_achieved: false,
                })
            }
            WantStatus::Reaching => {
                let broken = self.broken_selectors(want);
                (!broken.is_empty()).then_some(Plan::Demote { unmet_deps: broken })
            }
            WantStatus::Achieved => {
                let broken = self.broken_selectors(want);
                if !broken.is_empty() {
                    return Some(Plan::Demote { unmet_deps: broken });
                }
                if record.inflight || want.spec.requires.is_empty() {
                    return None;
                }
                let upstream_advanced = record.observed_upstream.iter().any(|(dep, seen)| {
                    self.wants
                        .get(dep)
                        .map(|d| d.state.seq() > *seen)
                        .unwrap_or(false)
                });
                if !(record.retrigger || upstream_advanced) {
                    return None;
                }
                let mut deps = Vec::new();
                for selector in &want.spec.using {
                    let satisfied: Vec<WantId> = self
                        .index
                        .resolve_using(selector)
                        .iter()
                        .copied()
                        .filter(|dep| self.dependency_satisfied(*dep))
                        .collect();
                    if satisfied.is_empty() {
                        // Producers regressed; keep the retrigger pending.
                        return None;
                    }
                    deps.extend(satisfied);
                }
                Some(Plan::Dispatch {
                    deps,
                    expand: false,
                    from_achieved: true,
                })
            }
            _ => None,
        }
    }

    fn apply_plan(&mut self, id: WantId, plan: Plan) {
        match plan {
            Plan::Note {
                unmet_deps,
                unmet_caps,
            } => {
                if !unmet_deps.is_empty() {
                    self.write_note(id, "unmet_dependency", json!(unmet_deps));
                }
                if !unmet_caps.is_empty() {
                    self.write_note(id, "unmet_capabilities", json!(unmet_caps));
                }
            }
            Plan::Demote { unmet_deps } => {
                let Some(record) = self.wants.get_mut(&id) else {
                    return;
                };
                let _ = record.cancel.send(true);
                match advance(record.want.status, LifecycleEvent::DependencyInvalidated) {
                    Ok(next) => record.want.status = next,
                    Err(e) => {
                        error!(want = %record.want.metadata.name, error = %e, "demotion failed");
                        return;
                    }
                }
                record.retrigger = false;
                debug!(want = %record.want.metadata.name, "dependency invalidated");
                self.write_note(id, "unmet_dependency", json!(unmet_deps));
                self.needs_pass = true;
            }
            Plan::AchieveEmpty { expand } => {
                if expand {
                    self.expand_recipe(id);
                }
                let Some(record) = self.wants.get_mut(&id) else {
                    return;
                };
                let reached = advance(record.want.status, LifecycleEvent::Ready)
                    .and_then(|s| advance(s, LifecycleEvent::DoCycleSucceeded));
                match reached {
                    Ok(next) => record.want.status = next,
                    Err(e) => error!(want = %record.want.metadata.name, error = %e, "lifecycle advance failed"),
                }
                self.needs_pass = true;
            }
            Plan::Dispatch {
                deps,
                expand,
                from_achieved,
            } => {
                if expand {
                    self.expand_recipe(id);
                }
                let Some((context, dep_seqs)) = self.build_context(id, &deps) else {
                    return;
                };
                let Some(record) = self.wants.get_mut(&id) else {
                    return;
                };
                let event = if from_achieved {
                    LifecycleEvent::Retrigger
                } else {
                    LifecycleEvent::Ready
                };
                match advance(record.want.status, event) {
                    Ok(next) => record.want.status = next,
                    Err(e) => {
                        error!(want = %record.want.metadata.name, error = %e, "lifecycle advance failed");
                        return;
                    }
                }
                let (cancel_tx, cancel_rx) = watch::channel(false);
                record.cancel = cancel_tx;
                record.inflight = true;
                record.retrigger = false;
                record.observed_upstream = dep_seqs.into_iter().collect();
                debug!(want = %record.want.metadata.name, "dispatching do-cycle");
                let request = DoCycleRequest {
                    want_id: id,
                    requires: record.want.spec.requires.clone(),
                    context,
                    state: Arc::clone(&record.state),
                    cancel: cancel_rx,
                };
                self.dispatcher.spawn_do_cycle(request);
            }
        }
    }

    /// Build the execution context from loop-owned records
    fn build_context(
        &self,
        id: WantId,
        deps: &[WantId],
    ) -> Option<(AgentContext, Vec<(WantId, u64)>)> {
        let record = self.wants.get(&id)?;
        let want = &record.want;
        let view = WantView {
            id,
            name: want.metadata.name.clone(),
            want_type: want.metadata.want_type.clone(),
            labels: want.metadata.labels.clone(),
            params: want.spec.params.clone(),
            state: record.state.snapshot(),
        };
        let mut upstream = Vec::new();
        let mut dep_seqs = Vec::new();
        let mut seen = HashSet::new();
        for dep in deps {
            if !seen.insert(*dep) {
                continue;
            }
            let Some(dep_record) = self.wants.get(dep) else {
                continue;
            };
            upstream.push(PeerState {
                id: *dep,
                name: dep_record.want.metadata.name.clone(),
                labels: dep_record.want.metadata.labels.clone(),
                state: dep_record.state.snapshot(),
            });
            dep_seqs.push((*dep, dep_record.state.seq()));
        }
        let owner = want
            .metadata
            .owner_references
            .iter()
            .find(|r| r.controller)
            .and_then(|r| self.wants.get(&r.id).map(|o| (r.id, o)))
            .map(|(owner_id, owner_record)| PeerState {
                id: owner_id,
                name: owner_record.want.metadata.name.clone(),
                labels: owner_record.want.metadata.labels.clone(),
                state: owner_record.state.snapshot(),
            });
        Some((
            AgentContext {
                want: view,
                upstream,
                owner,
            },
            dep_seqs,
        ))
    }

    /// Expand a want's declared recipe and admit the children in-pass
    fn expand_recipe(&mut self, id: WantId) {
        let (recipe_name, parent) = {
            let Some(record) = self.wants.get_mut(&id) else {
                return;
            };
            let Some(name) = record.want.spec.recipe.clone() else {
                return;
            };
            // Set before admission so a failing expansion cannot loop.
            record.want.recipe_expanded = true;
            (name, record.want.clone())
        };
        match self.recipes.expand(&recipe_name, &parent, &self.agents) {
            Ok(children) => {
                info!(
                    recipe = %recipe_name,
                    parent = %parent.metadata.name,
                    children = children.len(),
                    "recipe expanded"
                );
                if let Err(e) = self.admit_wants(children) {
                    self.errors.record(&e, Some(id.to_string()));
                    self.write_note(id, "recipe_error", json!(e.to_string()));
                }
            }
            Err(e) => {
                warn!(recipe = %recipe_name, parent = %parent.metadata.name, error = %e, "recipe expansion failed");
                self.errors.record(&e, Some(id.to_string()));
                self.write_note(id, "recipe_error", json!(e.to_string()));
            }
        }
    }

    /// Commit a loop-side state note without blocking on the cycle lock
    fn write_note(&self, id: WantId, key: &str, value: serde_json::Value) {
        let Some(record) = self.wants.get(&id) else {
            return;
        };
        if record.state.get(key).as_ref() == Some(&value) {
            return;
        }
        let state = Arc::clone(&record.state);
        let key = key.to_string();
        tokio::spawn(async move {
            state
                .apply_updates(None, BTreeMap::from([(key, value)]))
                .await;
        });
    }

    /// Align running monitor tasks with each want's current `requires`
    fn reconcile_monitors(&mut self) {
        struct MonitorDelta {
            id: WantId,
            to_spawn: Vec<MonitorSpawn>,
            to_stop: Vec<String>,
        }
        let interval = Duration::from_secs(self.config.engine.monitor_interval_secs);
        let mut deltas = Vec::new();
        for (id, record) in &self.wants {
            let active = matches!(
                record.want.status,
                WantStatus::Idle | WantStatus::Reaching | WantStatus::Achieved
            );
            let desired = if active {
                self.agents.monitors_for(&record.want.spec.requires)
            } else {
                Vec::new()
            };
            let current: HashSet<&str> = record
                .monitors
                .iter()
                .map(|m| m.agent_name.as_str())
                .collect();
            let desired_names: HashSet<&str> =
                desired.iter().map(|a| a.name.as_str()).collect();

            let to_stop: Vec<String> = record
                .monitors
                .iter()
                .filter(|m| !desired_names.contains(m.agent_name.as_str()))
                .map(|m| m.agent_name.clone())
                .collect();
            let mut to_spawn = Vec::new();
            for agent in desired {
                if current.contains(agent.name.as_str()) {
                    continue;
                }
                let owner = record
                    .want
                    .metadata
                    .owner_references
                    .iter()
                    .find(|r| r.controller)
                    .and_then(|r| {
                        self.wants.get(&r.id).map(|owner_record| {
                            (
                                PeerState {
                                    id: r.id,
                                    name: owner_record.want.metadata.name.clone(),
                                    labels: owner_record.want.metadata.labels.clone(),
                                    state: BTreeMap::new(),
                                },
                                Arc::clone(&owner_record.state),
                            )
                        })
                    });
                let watched_fields = self
                    .agents
                    .parent_state_access(&agent)
                    .into_iter()
                    .map(|f| f.name)
                    .collect();
                let callback_url = match &agent.exec {
                    ExecTarget::Remote { .. } => Some(self.config.server.callback_url()),
                    ExecTarget::Local => None,
                };
                to_spawn.push(MonitorSpawn {
                    agent,
                    view: WantView {
                        id: *id,
                        name: record.want.metadata.name.clone(),
                        want_type: record.want.metadata.want_type.clone(),
                        labels: record.want.metadata.labels.clone(),
                        params: record.want.spec.params.clone(),
                        state: BTreeMap::new(),
                    },
                    state: Arc::clone(&record.state),
                    owner,
                    watched_fields,
                    interval,
                    callback_url,
                });
            }
            if !to_spawn.is_empty() || !to_stop.is_empty() {
                deltas.push(MonitorDelta {
                    id: *id,
                    to_spawn,
                    to_stop,
                });
            }
        }

        for delta in deltas {
            let registry = Arc::clone(&self.agents);
            let remote = self.dispatcher.remote().clone();
            let Some(record) = self.wants.get_mut(&delta.id) else {
                continue;
            };
            for stopping in &delta.to_stop {
                if let Some(position) = record
                    .monitors
                    .iter()
                    .position(|m| &m.agent_name == stopping)
                {
                    record.monitors.remove(position).stop();
                }
            }
            for spawn in delta.to_spawn {
                let handle = spawn_monitor(spawn, Arc::clone(&registry), remote.clone());
                record.monitors.push(handle);
            }
        }
    }

    /// Cancel workers, wait out the grace period, persist the snapshot
    async fn shutdown_drain(&mut self) {
        for record in self.wants.values_mut() {
            let _ = record.cancel.send(true);
            for monitor in record.monitors.drain(..) {
                monitor.stop();
            }
        }
        let grace = Duration::from_secs(self.config.engine.shutdown_grace_secs);
        let deadline = tokio::time::Instant::now() + grace;
        while self.wants.values().any(|r| r.inflight) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!("shutdown grace expired with workers in flight");
                break;
            }
            match tokio::time::timeout(remaining, self.outcomes_rx.recv()).await {
                Ok(Some(outcome)) => self.on_outcome(outcome),
                _ => break,
            }
        }
        if let Some(path) = self.config.engine.snapshot_path.clone() {
            if let Err(e) = snapshot::save(&path, &self.graph_snapshot()) {
                error!(error = %e, "snapshot save failed");
                self.errors.record(&e, None);
            }
        }
    }
}
