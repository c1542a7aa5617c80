use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Notify};

use crate::dag::PreparedGraph;
use crate::error::{Result, WeftError};
use crate::executor::{ExecutionContext, NodeExecutor};
use crate::types::{
    ExecutionId, ExecutionStatus, NodeId, ValueMap, WorkflowEvent, WorkflowEventType, WorkflowId,
};

/// Non-blocking writer onto a bounded per-execution event queue.
///
/// When the queue is full the event is dropped and counted; the scheduler
/// never stalls on a slow event consumer.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<WorkflowEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<WorkflowEvent>) -> Self {
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn emit(&self, event: WorkflowEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("execution event queue full, dropping event");
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }
}

/// Create the shared cancellation signal for one execution.
///
/// The sender side is held by whoever may cancel (the engine runtime, for
/// `stop` and deadlines); the scheduler trips the same signal on fail-fast.
pub fn cancel_signal() -> (Arc<watch::Sender<bool>>, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    (Arc::new(tx), rx)
}

/// Final state of a single node after a run.
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub node_id: NodeId,
    pub status: ExecutionStatus,
    pub outputs: Option<ValueMap>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Aggregate result of one graph run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: ExecutionStatus,
    /// Outputs of sink nodes, keyed by node id. Empty unless `Completed`.
    pub outputs: ValueMap,
    pub node_results: Vec<NodeOutcome>,
    /// First captured error; later errors land in `secondary_errors`.
    pub error: Option<String>,
    pub secondary_errors: Vec<String>,
}

impl RunReport {
    /// The taxonomy error for a non-successful run, if any.
    pub fn to_error(&self) -> Option<WeftError> {
        match self.status {
            ExecutionStatus::Failed => Some(WeftError::ExecutionFailed {
                message: self
                    .error
                    .clone()
                    .unwrap_or_else(|| "execution failed".to_string()),
                secondary: self.secondary_errors.clone(),
            }),
            ExecutionStatus::Cancelled => Some(WeftError::Cancelled),
            _ => None,
        }
    }
}

struct NodeRuntime {
    status: ExecutionStatus,
    ready: usize,
    result: Option<ValueMap>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct FailureState {
    first: Option<String>,
    secondary: Vec<String>,
}

struct RunState {
    execution_id: ExecutionId,
    workflow_id: WorkflowId,
    graph: PreparedGraph,
    // Per-node state; every mutation happens under that node's lock.
    nodes: HashMap<NodeId, Mutex<NodeRuntime>>,
    executors: HashMap<NodeId, Arc<dyn NodeExecutor>>,
    inputs: ValueMap,
    cancel: Arc<watch::Sender<bool>>,
    events: EventSink,
    // Wait counter: incremented before each launch, decremented as the very
    // last step of a node task. Cancellation only prevents new increments,
    // so termination is invariant on this reaching zero.
    inflight: AtomicUsize,
    done: Notify,
    failure: Mutex<FailureState>,
}

/// One runnable instance of a workflow graph.
///
/// Executes every node at most once, fanning out as far as dependencies
/// allow. `run` consumes the instance: a graph instance cannot be run twice.
pub struct DagRun {
    state: RunState,
}

impl DagRun {
    pub fn new(
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        graph: PreparedGraph,
        executors: HashMap<NodeId, Arc<dyn NodeExecutor>>,
        inputs: ValueMap,
        cancel: Arc<watch::Sender<bool>>,
        events: EventSink,
    ) -> Result<Self> {
        for id in graph.nodes.keys() {
            if !executors.contains_key(id) {
                return Err(WeftError::InvalidGraph(format!(
                    "no executor bound for node {}",
                    id
                )));
            }
        }

        let nodes = graph
            .order
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    Mutex::new(NodeRuntime {
                        status: ExecutionStatus::Pending,
                        ready: graph.ready[id],
                        result: None,
                        error: None,
                        started_at: None,
                        completed_at: None,
                    }),
                )
            })
            .collect();

        Ok(Self {
            state: RunState {
                execution_id,
                workflow_id,
                graph,
                executors,
                inputs,
                cancel,
                events,
                inflight: AtomicUsize::new(0),
                done: Notify::new(),
                failure: Mutex::new(FailureState::default()),
                nodes,
            },
        })
    }

    /// Run the graph to termination and report every node's final state.
    pub async fn run(self) -> RunReport {
        let state = Arc::new(self.state);

        if state.graph.node_count() == 0 {
            return RunReport {
                status: ExecutionStatus::Completed,
                outputs: ValueMap::new(),
                node_results: Vec::new(),
                error: None,
                secondary_errors: Vec::new(),
            };
        }

        for root in &state.graph.roots {
            let claimed = {
                let mut node = state.nodes[root].lock().unwrap();
                if node.status == ExecutionStatus::Pending && !*state.cancel.borrow() {
                    node.status = ExecutionStatus::Running;
                    true
                } else {
                    false
                }
            };
            if claimed {
                launch(&state, root.clone());
            }
        }

        loop {
            if state.inflight.load(Ordering::Acquire) == 0 {
                break;
            }
            state.done.notified().await;
        }

        // Anything still pending was never allowed to launch.
        for id in &state.graph.order {
            let mut node = state.nodes[id].lock().unwrap();
            if node.status == ExecutionStatus::Pending {
                node.status = ExecutionStatus::Cancelled;
                state.events.emit(node_event(
                    &state,
                    id,
                    WorkflowEventType::NodeCancelled,
                    ExecutionStatus::Cancelled,
                ));
            }
        }

        build_report(&state)
    }
}

fn build_report(state: &Arc<RunState>) -> RunReport {
    let failure = state.failure.lock().unwrap();

    let node_results: Vec<NodeOutcome> = state
        .graph
        .order
        .iter()
        .map(|id| {
            let node = state.nodes[id].lock().unwrap();
            NodeOutcome {
                node_id: id.clone(),
                status: node.status,
                outputs: node.result.clone(),
                error: node.error.clone(),
                started_at: node.started_at,
                completed_at: node.completed_at,
            }
        })
        .collect();

    let status = if failure.first.is_some() {
        ExecutionStatus::Failed
    } else if node_results
        .iter()
        .all(|n| n.status == ExecutionStatus::Completed)
    {
        ExecutionStatus::Completed
    } else {
        ExecutionStatus::Cancelled
    };

    let mut outputs = ValueMap::new();
    if status == ExecutionStatus::Completed {
        for sink in &state.graph.sinks {
            let node = state.nodes[sink].lock().unwrap();
            if let Some(result) = &node.result {
                outputs.insert(
                    sink.0.clone(),
                    serde_json::Value::Object(result.clone().into_iter().collect()),
                );
            }
        }
    }

    RunReport {
        status,
        outputs,
        node_results,
        error: failure.first.clone(),
        secondary_errors: failure.secondary.clone(),
    }
}

fn launch(state: &Arc<RunState>, node_id: NodeId) {
    state.inflight.fetch_add(1, Ordering::AcqRel);
    let state = state.clone();
    tokio::spawn(async move {
        execute_node(&state, &node_id).await;
        // Last step of every node task; see the wait-counter invariant.
        if state.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            state.done.notify_one();
        }
    });
}

async fn execute_node(state: &Arc<RunState>, node_id: &NodeId) {
    // The failure flag may have tripped between claim and spawn.
    if *state.cancel.borrow() {
        let mut node = state.nodes[node_id].lock().unwrap();
        node.status = ExecutionStatus::Cancelled;
        node.completed_at = Some(Utc::now());
        state.events.emit(node_event(
            state,
            node_id,
            WorkflowEventType::NodeCancelled,
            ExecutionStatus::Cancelled,
        ));
        return;
    }

    {
        let mut node = state.nodes[node_id].lock().unwrap();
        node.started_at = Some(Utc::now());
        state.events.emit(node_event(
            state,
            node_id,
            WorkflowEventType::NodeStarted,
            ExecutionStatus::Running,
        ));
    }

    let inputs = gather_inputs(state, node_id);
    let ctx = ExecutionContext::new(
        state.execution_id.clone(),
        state.workflow_id.clone(),
        node_id.clone(),
        state.cancel.subscribe(),
    );
    let executor = state.executors[node_id].clone();

    // The executor keeps running until it returns: already-running nodes are
    // allowed to finish after a failure elsewhere, and are expected to honor
    // the cancellation signal in `ctx` themselves.
    let result = executor.execute(&ctx, inputs).await;
    let cancelled = *state.cancel.borrow();

    match result {
        Ok(outputs) => {
            {
                let mut node = state.nodes[node_id].lock().unwrap();
                node.status = ExecutionStatus::Completed;
                node.result = Some(outputs);
                node.completed_at = Some(Utc::now());
                state.events.emit(node_event(
                    state,
                    node_id,
                    WorkflowEventType::NodeCompleted,
                    ExecutionStatus::Completed,
                ));
            }
            trigger_children(state, node_id);
        }
        Err(err) if cancelled => {
            // An error returned after the signal tripped is an aborted node,
            // not a new failure; keep the message as a secondary cause.
            state
                .failure
                .lock()
                .unwrap()
                .secondary
                .push(format!("node {}: {}", node_id, err));
            let mut node = state.nodes[node_id].lock().unwrap();
            node.status = ExecutionStatus::Cancelled;
            node.completed_at = Some(Utc::now());
            state.events.emit(node_event(
                state,
                node_id,
                WorkflowEventType::NodeCancelled,
                ExecutionStatus::Cancelled,
            ));
        }
        Err(err) => {
            let message = format!("node {}: {}", node_id, err);
            tracing::error!("execution {}: {}", state.execution_id, message);

            // Trip the signal before the failure becomes observable so no
            // launch can slip in after the failure event. send_replace
            // updates the flag even with no receiver subscribed.
            state.cancel.send_replace(true);
            {
                let mut failure = state.failure.lock().unwrap();
                if failure.first.is_none() {
                    failure.first = Some(message.clone());
                } else {
                    failure.secondary.push(message);
                }
            }
            {
                let mut node = state.nodes[node_id].lock().unwrap();
                node.status = ExecutionStatus::Failed;
                node.error = Some(err.to_string());
                node.completed_at = Some(Utc::now());
                state.events.emit(
                    node_event(
                        state,
                        node_id,
                        WorkflowEventType::NodeFailed,
                        ExecutionStatus::Failed,
                    )
                    .with_data("error", err.to_string()),
                );
            }
            cancel_descendants(state, node_id);
        }
    }
}

fn trigger_children(state: &Arc<RunState>, parent: &NodeId) {
    for child in &state.graph.children[parent] {
        let claimed = {
            let mut node = state.nodes[child].lock().unwrap();
            node.ready -= 1;
            if node.ready == 0
                && node.status == ExecutionStatus::Pending
                && !*state.cancel.borrow()
            {
                node.status = ExecutionStatus::Running;
                true
            } else {
                false
            }
        };
        if claimed {
            launch(state, child.clone());
        }
    }
}

/// Mark every not-yet-started transitive descendant of a failed node as
/// cancelled. Descendants cannot be running: their ancestry includes the
/// failed node, which never completed.
fn cancel_descendants(state: &Arc<RunState>, failed: &NodeId) {
    for id in state.graph.descendants(failed) {
        let mut node = state.nodes[&id].lock().unwrap();
        if node.status == ExecutionStatus::Pending {
            node.status = ExecutionStatus::Cancelled;
            state.events.emit(node_event(
                state,
                &id,
                WorkflowEventType::NodeCancelled,
                ExecutionStatus::Cancelled,
            ));
        }
    }
}

fn gather_inputs(state: &RunState, node_id: &NodeId) -> ValueMap {
    let def = &state.graph.nodes[node_id];
    if def.dependencies.is_empty() {
        // Roots receive the workflow-level inputs.
        return state.inputs.clone();
    }

    let mut inputs = ValueMap::new();
    for parent in &def.dependencies {
        let outputs = state.nodes[parent]
            .lock()
            .unwrap()
            .result
            .clone()
            .unwrap_or_default();
        inputs.insert(
            parent.0.clone(),
            serde_json::Value::Object(outputs.into_iter().collect()),
        );
    }
    inputs
}

fn node_event(
    state: &RunState,
    node_id: &NodeId,
    event_type: WorkflowEventType,
    status: ExecutionStatus,
) -> WorkflowEvent {
    WorkflowEvent::new(
        event_type,
        state.execution_id.clone(),
        state.workflow_id.clone(),
        status,
    )
    .for_node(node_id.clone())
}
