//! Apply executor — runs a plan's actions over a bounded worker pool.
//!
//! Scheduling walks the action DAG: an action starts once every dependency
//! has reached Applied, subject to a concurrency semaphore. A failure marks
//! all transitive dependents Blocked; independent subtrees keep running to
//! completion. State records are written transactionally around each provider
//! call (Applying before, Applied after) so a crash mid-run re-enters cleanly
//! on the next plan.

use super::error::{EngineError, ProviderError};
use super::graph::Dag;
use super::state::StateStore;
use super::types::{
    attrs_to_yaml, Action, ActionKind, ApplyReport, AttrValue, FailureReport, NodeState,
    NodeStatus, Observed, Plan, RecordStatus,
};
use crate::provider::{AdapterRegistry, ProviderAdapter};
use crate::trace::{eventlog, fingerprint};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

const STATE_SCHEMA: &str = "1.0";
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Maximum provider calls in flight at once.
    pub max_parallel: usize,
    /// Append run events to the JSONL log under the state directory.
    pub record_events: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            record_events: true,
        }
    }
}

struct TaskOutput {
    node_id: String,
    action: ActionKind,
    duration_seconds: f64,
    result: Result<Option<Observed>, String>,
}

/// Execute a plan. Returns a report of every node's terminal status; provider
/// failures land in the report, not in `Err` (that is reserved for scheduler
/// and state-store faults).
pub async fn apply(
    plan: &Plan,
    adapters: &AdapterRegistry,
    store: &StateStore,
    options: &ExecOptions,
    cancel: Option<watch::Receiver<bool>>,
) -> Result<ApplyReport, EngineError> {
    let start = Instant::now();
    let run_id = eventlog::generate_run_id();
    emit(
        options,
        store,
        eventlog::RunEvent::RunStarted {
            run_id: run_id.clone(),
            graph: plan.name.clone(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
        },
    );
    for finding in &plan.drift {
        emit(
            options,
            store,
            eventlog::RunEvent::DriftDetected {
                node: finding.node_id.clone(),
                recorded_fingerprint: finding.recorded_fingerprint.clone(),
                observed_fingerprint: finding.observed_fingerprint.clone(),
                detail: finding.detail.clone(),
            },
        );
    }

    let actions: IndexMap<String, Action> = plan
        .actions
        .iter()
        .map(|a| (a.node_id.clone(), a.clone()))
        .collect();
    let mut dag = Dag::new(actions.keys().cloned());
    for action in actions.values() {
        for dep in &action.deps {
            dag.add_edge(dep, &action.node_id)
                .map_err(EngineError::Parse)?;
        }
    }

    let mut status: HashMap<String, NodeStatus> = actions
        .keys()
        .map(|k| (k.clone(), NodeStatus::Pending))
        .collect();
    let mut report = ApplyReport::default();
    // Applied outputs, for substituting references left symbolic by the plan.
    let mut outputs: HashMap<String, IndexMap<String, AttrValue>> = HashMap::new();

    for action in actions.values() {
        if action.action == ActionKind::NoOp {
            status.insert(action.node_id.clone(), NodeStatus::Applied);
            report.unchanged.push(action.node_id.clone());
        }
    }

    let semaphore = Arc::new(Semaphore::new(options.max_parallel.max(1)));
    let mut workers: JoinSet<TaskOutput> = JoinSet::new();

    loop {
        let cancel_requested = cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false);

        let ready: Vec<String> = actions
            .values()
            .filter(|a| status[&a.node_id] == NodeStatus::Pending)
            .filter(|a| {
                a.deps
                    .iter()
                    .all(|d| status.get(d) == Some(&NodeStatus::Applied))
            })
            .map(|a| a.node_id.clone())
            .collect();

        for id in ready {
            if cancel_requested {
                cancel_subtree(&id, &dag, options, store, &mut status, &mut report);
                continue;
            }
            let action = &actions[&id];
            let adapter = adapters
                .get(&action.kind)
                .ok_or_else(|| EngineError::NoAdapter(action.kind.clone()))?;

            let mut task_action = action.clone();
            if let Err(missing) = substitute_outputs(&mut task_action.attributes, &outputs) {
                let error = format!("unresolved reference {}", missing);
                fail_node(&id, &error, &dag, options, store, &mut status, &mut report);
                continue;
            }

            status.insert(id.clone(), NodeStatus::Applying);
            emit(
                options,
                store,
                eventlog::RunEvent::ActionStarted {
                    node: id.clone(),
                    action: task_action.action.to_string(),
                },
            );

            let permits = semaphore.clone();
            let task_store = store.clone();
            workers.spawn(async move {
                let node_id = task_action.node_id.clone();
                let kind = task_action.action;
                let started = Instant::now();
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => run_action(task_action, adapter, task_store).await,
                    Err(_) => Err("scheduler shut down".to_string()),
                };
                TaskOutput {
                    node_id,
                    action: kind,
                    duration_seconds: started.elapsed().as_secs_f64(),
                    result,
                }
            });
        }

        let Some(joined) = workers.join_next().await else {
            break;
        };
        let out = joined.map_err(|e| EngineError::Parse(format!("worker task failed: {}", e)))?;
        match out.result {
            Ok(observed) => {
                status.insert(out.node_id.clone(), NodeStatus::Applied);
                let provider_id = observed
                    .as_ref()
                    .map(|o| o.provider_id.clone())
                    .unwrap_or_default();
                if let Some(obs) = observed {
                    outputs.insert(out.node_id.clone(), obs.attributes);
                }
                emit(
                    options,
                    store,
                    eventlog::RunEvent::ActionApplied {
                        node: out.node_id.clone(),
                        action: out.action.to_string(),
                        provider_id,
                        duration_seconds: out.duration_seconds,
                    },
                );
                report.applied.push(out.node_id);
            }
            Err(error) => {
                fail_node(
                    &out.node_id,
                    &error,
                    &dag,
                    options,
                    store,
                    &mut status,
                    &mut report,
                );
            }
        }
    }

    // Anything never scheduled (its subtree root was cancelled while it was
    // still multiple hops away) counts as cancelled.
    for (id, st) in &mut status {
        if *st == NodeStatus::Pending {
            *st = NodeStatus::Cancelled;
            report.cancelled.push(id.clone());
        }
    }

    report.total_duration = start.elapsed();
    emit(
        options,
        store,
        eventlog::RunEvent::RunCompleted {
            run_id,
            applied: report.applied.len() as u32,
            unchanged: report.unchanged.len() as u32,
            failed: report.failed.len() as u32,
            blocked: report.blocked.len() as u32,
            cancelled: report.cancelled.len() as u32,
            total_seconds: report.total_duration.as_secs_f64(),
        },
    );
    Ok(report)
}

fn emit(options: &ExecOptions, store: &StateStore, event: eventlog::RunEvent) {
    if !options.record_events {
        return;
    }
    if let Err(e) = eventlog::append_event(store.root(), event) {
        eprintln!("warning: event log write failed: {}", e);
    }
}

fn fail_node(
    id: &str,
    error: &str,
    dag: &Dag,
    options: &ExecOptions,
    store: &StateStore,
    status: &mut HashMap<String, NodeStatus>,
    report: &mut ApplyReport,
) {
    status.insert(id.to_string(), NodeStatus::Failed);
    emit(
        options,
        store,
        eventlog::RunEvent::ActionFailed {
            node: id.to_string(),
            error: error.to_string(),
        },
    );
    let mut blocked = Vec::new();
    for dependent in dag.dependents_transitive(id) {
        if status.get(&dependent) == Some(&NodeStatus::Pending) {
            status.insert(dependent.clone(), NodeStatus::Blocked);
            emit(
                options,
                store,
                eventlog::RunEvent::ActionBlocked {
                    node: dependent.clone(),
                    failed_dependency: id.to_string(),
                },
            );
            report.blocked.push(dependent.clone());
            blocked.push(dependent);
        }
    }
    report.failed.push(FailureReport {
        node_id: id.to_string(),
        error: error.to_string(),
        blocked_dependents: blocked,
    });
}

fn cancel_subtree(
    id: &str,
    dag: &Dag,
    options: &ExecOptions,
    store: &StateStore,
    status: &mut HashMap<String, NodeStatus>,
    report: &mut ApplyReport,
) {
    let mut members = vec![id.to_string()];
    members.extend(dag.dependents_transitive(id));
    for member in members {
        if status.get(&member) == Some(&NodeStatus::Pending) {
            status.insert(member.clone(), NodeStatus::Cancelled);
            emit(
                options,
                store,
                eventlog::RunEvent::ActionCancelled {
                    node: member.clone(),
                },
            );
            report.cancelled.push(member);
        }
    }
}

/// Substitute references against applied outputs. Every reference left in an
/// action's attributes targets a dependency this run has already applied.
fn substitute_outputs(
    attrs: &mut IndexMap<String, AttrValue>,
    outputs: &HashMap<String, IndexMap<String, AttrValue>>,
) -> Result<(), String> {
    for value in attrs.values_mut() {
        substitute_value(value, outputs)?;
    }
    Ok(())
}

fn substitute_value(
    value: &mut AttrValue,
    outputs: &HashMap<String, IndexMap<String, AttrValue>>,
) -> Result<(), String> {
    match value {
        AttrValue::Ref(r) => {
            let resolved = outputs
                .get(&r.node)
                .and_then(|o| o.get(&r.output))
                .cloned()
                .ok_or_else(|| r.to_string())?;
            *value = resolved;
        }
        AttrValue::List(items) => {
            for item in items {
                substitute_value(item, outputs)?;
            }
        }
        AttrValue::Map(map) => {
            for v in map.values_mut() {
                substitute_value(v, outputs)?;
            }
        }
        _literal => {}
    }
    Ok(())
}

async fn run_action(
    action: Action,
    adapter: Arc<dyn ProviderAdapter>,
    store: StateStore,
) -> Result<Option<Observed>, String> {
    match action.action {
        ActionKind::Create => {
            let record = mark_applying(&store, &action, String::new())?;
            let observed = with_retry(|| {
                adapter.create(&action.kind, &action.node_id, &action.attributes)
            })
            .await
            .map_err(|e| e.to_string())?;
            confirm_applied(&store, record, &observed)?;
            Ok(Some(observed))
        }
        ActionKind::Update => {
            let provider_id = action
                .provider_id
                .clone()
                .ok_or("update planned without a provider id")?;
            let record = mark_applying(&store, &action, provider_id.clone())?;
            let observed = with_retry(|| {
                adapter.update(&action.kind, &provider_id, &action.attributes, &action.changed)
            })
            .await
            .map_err(|e| e.to_string())?;
            confirm_applied(&store, record, &observed)?;
            Ok(Some(observed))
        }
        ActionKind::Replace => {
            // Tear down the old resource, then create under the same node id.
            let old_id = action
                .provider_id
                .clone()
                .ok_or("replace planned without a provider id")?;
            // The marker keeps the old id until the delete is confirmed, so a
            // failed delete phase refreshes against the still-live resource
            // instead of planning a conflicting create.
            let mut record = mark_applying(&store, &action, old_id.clone())?;
            with_retry(|| adapter.delete(&action.kind, &old_id))
                .await
                .map_err(|e| e.to_string())?;
            record.provider_id = String::new();
            store.save(&record).map_err(|e| e.to_string())?;
            let observed = with_retry(|| {
                adapter.create(&action.kind, &action.node_id, &action.attributes)
            })
            .await
            .map_err(|e| e.to_string())?;
            confirm_applied(&store, record, &observed)?;
            Ok(Some(observed))
        }
        ActionKind::Delete => {
            if let Some(provider_id) = &action.provider_id {
                mark_applying(&store, &action, provider_id.clone())?;
                with_retry(|| adapter.delete(&action.kind, provider_id))
                    .await
                    .map_err(|e| e.to_string())?;
            }
            store.remove(&action.node_id).map_err(|e| e.to_string())?;
            Ok(None)
        }
        ActionKind::NoOp => Ok(None),
    }
}

/// Write the in-flight marker before the mutating call. Keeps the previous
/// record's confirmed attributes where one exists so a crash mid-call leaves
/// enough to refresh from.
fn mark_applying(
    store: &StateStore,
    action: &Action,
    provider_id: String,
) -> Result<NodeState, String> {
    let mut record = match store.load(&action.node_id).map_err(|e| e.to_string())? {
        Some(existing) => existing,
        None => NodeState {
            schema: STATE_SCHEMA.to_string(),
            node_id: action.node_id.clone(),
            kind: action.kind.clone(),
            provider_id: String::new(),
            status: RecordStatus::Applying,
            attributes: attrs_to_yaml(&action.attributes),
            depends_on: action.deps.clone(),
            fingerprint: String::new(),
            applied_at: None,
        },
    };
    record.status = RecordStatus::Applying;
    record.provider_id = provider_id;
    record.depends_on = action.deps.clone();
    store.save(&record).map_err(|e| e.to_string())?;
    Ok(record)
}

fn confirm_applied(
    store: &StateStore,
    mut record: NodeState,
    observed: &Observed,
) -> Result<(), String> {
    record.status = RecordStatus::Applied;
    record.provider_id = observed.provider_id.clone();
    record.attributes = attrs_to_yaml(&observed.attributes);
    record.fingerprint = fingerprint::fingerprint_attrs(&observed.attributes);
    record.applied_at = Some(eventlog::now_iso8601());
    store.save(&record).map_err(|e| e.to_string())
}

/// Retry transient provider errors with exponential backoff; permanent
/// errors surface immediately.
async fn with_retry<T, F, Fut>(mut call: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Err(e) if e.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                tokio::time::sleep(Duration::from_millis(BACKOFF_BASE_MS << attempt)).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
