use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, RwLock};

use crate::dag;
use crate::error::{ErrorKind, Result, WeftError};
use crate::executor::{ExecutorFactory, NodeExecutor};
use crate::registry::DefinitionSource;
use crate::scheduler::{self, DagRun, EventSink};
use crate::transport::{
    from_wire, to_wire, EngineStatusResponse, HealthResponse, NodeResult, SubWorkflowRequest,
    SubWorkflowResponse, WorkflowRequest, WorkflowResponse,
};
use crate::types::{
    EngineId, ExecutionId, ExecutionRecord, ExecutionStatus, NodeId, WorkflowEvent,
    WorkflowEventType, RESERVED_INPUT_KEYS,
};

/// Default per-execution deadline when the request does not carry one.
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 600;

/// Capacity of the bounded per-execution event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 100;

struct ActiveExecution {
    record: ExecutionRecord,
    cancel: Arc<watch::Sender<bool>>,
    /// Claimed (at most once) by `stream_events`.
    events: Option<mpsc::Receiver<WorkflowEvent>>,
}

/// Hosts the DAG scheduler behind the engine-side operations dispatch
/// calls: execute, stop, health, status and event streaming. Enforces the
/// engine's advertised capacity before admitting an execution.
pub struct EngineRuntime {
    engine_id: EngineId,
    capacity: usize,
    definitions: Arc<dyn DefinitionSource>,
    executors: Arc<dyn ExecutorFactory>,
    active: RwLock<HashMap<ExecutionId, ActiveExecution>>,
}

impl EngineRuntime {
    pub fn new(
        engine_id: impl Into<String>,
        capacity: usize,
        definitions: Arc<dyn DefinitionSource>,
        executors: Arc<dyn ExecutorFactory>,
    ) -> Self {
        Self {
            engine_id: EngineId::new(engine_id),
            capacity,
            definitions,
            executors,
            active: RwLock::new(HashMap::new()),
        }
    }

    pub fn engine_id(&self) -> &EngineId {
        &self.engine_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Execute a workflow to termination and return its response.
    ///
    /// Fails with `AT_CAPACITY` before the execution ever enters `RUNNING`
    /// when the engine is full.
    pub async fn execute(&self, request: WorkflowRequest) -> Result<WorkflowResponse> {
        let definition = self
            .definitions
            .definition(&request.workflow_id, Some(&request.version))?;
        let graph = dag::prepare(&definition)?;

        let mut executors: HashMap<NodeId, Arc<dyn NodeExecutor>> = HashMap::new();
        for node in &definition.nodes {
            let executor = self
                .executors
                .resolve(&node.executor_type, &node.executor_payload, &node.config)
                .map_err(|e| {
                    WeftError::InvalidGraph(format!("node {}: {}", node.node_id, e))
                })?;
            executors.insert(node.node_id.clone(), executor);
        }

        let (cancel, _cancel_rx) = scheduler::cancel_signal();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let sink = EventSink::new(event_tx);

        let run = DagRun::new(
            request.execution_id.clone(),
            request.workflow_id.clone(),
            graph,
            executors,
            from_wire(&request.inputs),
            cancel.clone(),
            sink.clone(),
        )?;

        {
            let mut active = self.active.write().await;
            if active.len() >= self.capacity {
                return Err(WeftError::AtCapacity {
                    engine_id: self.engine_id.clone(),
                    capacity: self.capacity,
                });
            }
            active.insert(
                request.execution_id.clone(),
                ActiveExecution {
                    record: ExecutionRecord {
                        execution_id: request.execution_id.clone(),
                        workflow_id: request.workflow_id.clone(),
                        version: request.version.clone(),
                        parent_execution_id: request.parent_execution_id.clone(),
                        engine_id: Some(self.engine_id.clone()),
                        status: ExecutionStatus::Running,
                        started_at: Utc::now(),
                        ended_at: None,
                        outputs: None,
                        error: None,
                    },
                    cancel: cancel.clone(),
                    events: Some(event_rx),
                },
            );
        }

        tracing::info!(
            "engine {}: starting execution {} ({})",
            self.engine_id,
            request.execution_id,
            request.workflow_id
        );
        sink.emit(WorkflowEvent::new(
            WorkflowEventType::WorkflowStarted,
            request.execution_id.clone(),
            request.workflow_id.clone(),
            ExecutionStatus::Running,
        ));

        let timeout_secs = if request.timeout_seconds == 0 {
            DEFAULT_EXECUTION_TIMEOUT_SECS
        } else {
            request.timeout_seconds
        };

        let started = Instant::now();
        let run_fut = run.run();
        tokio::pin!(run_fut);
        let mut timed_out = false;
        let report = tokio::select! {
            report = &mut run_fut => report,
            _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
                timed_out = true;
                tracing::warn!(
                    "engine {}: execution {} hit its {}s deadline",
                    self.engine_id,
                    request.execution_id,
                    timeout_secs
                );
                cancel.send_replace(true);
                // The scheduler still winds down every node before reporting.
                run_fut.await
            }
        };

        let terminal_type = match report.status {
            ExecutionStatus::Completed => WorkflowEventType::WorkflowCompleted,
            ExecutionStatus::Failed => WorkflowEventType::WorkflowFailed,
            _ => WorkflowEventType::WorkflowCancelled,
        };
        let mut terminal = WorkflowEvent::new(
            terminal_type,
            request.execution_id.clone(),
            request.workflow_id.clone(),
            report.status,
        )
        .with_data(
            "success",
            (report.status == ExecutionStatus::Completed).to_string(),
        );
        if let Some(error) = &report.error {
            terminal = terminal.with_data("error", error.clone());
        }
        sink.emit(terminal);

        // Terminal status reached: release the record.
        self.active.write().await.remove(&request.execution_id);

        let error_kind = match report.status {
            ExecutionStatus::Failed => Some(ErrorKind::ExecutionFailed),
            ExecutionStatus::Cancelled if timed_out => Some(ErrorKind::Timeout),
            ExecutionStatus::Cancelled => Some(ErrorKind::Cancelled),
            _ => None,
        };
        let error_message = match report.status {
            ExecutionStatus::Failed => report.error.clone(),
            ExecutionStatus::Cancelled if timed_out => Some("deadline elapsed".to_string()),
            ExecutionStatus::Cancelled => Some("execution cancelled".to_string()),
            _ => None,
        };

        let mut outputs = HashMap::new();
        for (node_id, value) in &report.outputs {
            if let serde_json::Value::Object(map) = value {
                for (key, value) in map {
                    if RESERVED_INPUT_KEYS.contains(&key.as_str()) {
                        tracing::warn!(
                            "engine {}: node {} produced output under reserved key {}, dropping",
                            self.engine_id,
                            node_id,
                            key
                        );
                        continue;
                    }
                    let s = match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    outputs.insert(format!("{}.{}", node_id, key), s);
                }
            }
        }

        let node_results: Vec<NodeResult> = report
            .node_results
            .iter()
            .map(|n| NodeResult {
                node_id: n.node_id.clone(),
                status: n.status,
                outputs: n.outputs.as_ref().map(to_wire).unwrap_or_default(),
                error_message: n.error.clone(),
            })
            .collect();

        Ok(WorkflowResponse {
            execution_id: request.execution_id,
            success: report.status == ExecutionStatus::Completed,
            error_kind,
            error_message,
            outputs,
            duration_nanos: started.elapsed().as_nanos() as i64,
            node_results,
        })
    }

    /// Execute a sub-workflow; same path as `execute` with the parent
    /// identifiers threaded through.
    pub async fn execute_sub(&self, request: SubWorkflowRequest) -> Result<SubWorkflowResponse> {
        let response = self
            .execute(WorkflowRequest {
                workflow_id: request.sub_workflow_id,
                version: request.sub_workflow_version,
                execution_id: request.execution_id,
                inputs: request.inputs,
                parent_workflow_id: Some(request.parent_workflow_id),
                parent_execution_id: Some(request.parent_execution_id),
                timeout_seconds: request.timeout_seconds,
            })
            .await?;

        Ok(SubWorkflowResponse {
            execution_id: response.execution_id,
            success: response.success,
            error_kind: response.error_kind,
            error_message: response.error_message,
            outputs: response.outputs,
            duration_nanos: response.duration_nanos,
        })
    }

    /// Trip the cancellation signal of a running execution. Returns as soon
    /// as the signal is delivered; terminal events follow asynchronously.
    pub async fn stop(&self, execution_id: &ExecutionId) -> Result<()> {
        let active = self.active.read().await;
        let execution = active
            .get(execution_id)
            .ok_or_else(|| WeftError::NotFound(format!("execution {}", execution_id)))?;
        execution.cancel.send_replace(true);
        tracing::info!(
            "engine {}: stop delivered for execution {}",
            self.engine_id,
            execution_id
        );
        Ok(())
    }

    pub async fn health(&self) -> HealthResponse {
        let active = self.active.read().await.len();
        HealthResponse {
            healthy: true,
            status: "serving".to_string(),
            active,
            capacity: self.capacity,
            metadata: HashMap::new(),
        }
    }

    pub async fn status(&self) -> EngineStatusResponse {
        let active = self.active.read().await;
        EngineStatusResponse {
            engine_id: self.engine_id.clone(),
            status: if active.is_empty() { "idle" } else { "running" }.to_string(),
            active: active.len(),
            capacity: self.capacity,
            running: active.keys().cloned().collect(),
            metadata: HashMap::new(),
        }
    }

    /// Claim the event stream of a running execution. Each execution's
    /// stream can be claimed once; it drains buffered events and closes
    /// after the terminal event.
    pub async fn stream_events(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<mpsc::Receiver<WorkflowEvent>> {
        let mut active = self.active.write().await;
        let execution = active
            .get_mut(execution_id)
            .ok_or_else(|| WeftError::NotFound(format!("execution {}", execution_id)))?;
        execution.events.take().ok_or_else(|| {
            WeftError::Transport(format!(
                "event stream for {} already claimed",
                execution_id
            ))
        })
    }

    /// Snapshot of one active execution's record, if still running.
    pub async fn execution(&self, execution_id: &ExecutionId) -> Option<ExecutionRecord> {
        self.active
            .read()
            .await
            .get(execution_id)
            .map(|e| e.record.clone())
    }
}
