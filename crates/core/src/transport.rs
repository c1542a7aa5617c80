use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use crate::engine::EngineRuntime;
use crate::error::{ErrorKind, Result, WeftError};
use crate::types::{
    EngineId, EngineInfo, ExecutionId, ExecutionStatus, NodeId, ValueMap, WireMap, WorkflowEvent,
    WorkflowId,
};
use crate::version::Version;

/// A workflow execution request as it travels to an engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub workflow_id: WorkflowId,
    pub version: Version,
    pub execution_id: ExecutionId,
    pub inputs: WireMap,
    pub parent_workflow_id: Option<WorkflowId>,
    pub parent_execution_id: Option<ExecutionId>,
    /// Zero means "use the engine default".
    pub timeout_seconds: u64,
}

/// Result of a single node, as returned over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: NodeId,
    pub status: ExecutionStatus,
    pub outputs: WireMap,
    pub error_message: Option<String>,
}

/// A workflow execution response as it returns from an engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResponse {
    pub execution_id: ExecutionId,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub outputs: WireMap,
    pub duration_nanos: i64,
    pub node_results: Vec<NodeResult>,
}

/// Sub-workflow variant of [`WorkflowRequest`]; parent fields are required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubWorkflowRequest {
    pub sub_workflow_id: WorkflowId,
    pub sub_workflow_version: Version,
    pub parent_workflow_id: WorkflowId,
    pub parent_execution_id: ExecutionId,
    pub execution_id: ExecutionId,
    pub inputs: WireMap,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubWorkflowResponse {
    pub execution_id: ExecutionId,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub outputs: WireMap,
    pub duration_nanos: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub status: String,
    pub active: usize,
    pub capacity: usize,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatusResponse {
    pub engine_id: EngineId,
    pub status: String,
    pub active: usize,
    pub capacity: usize,
    pub running: Vec<ExecutionId>,
    pub metadata: HashMap<String, String>,
}

/// What the dispatch core requires from a transport binding.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, engine: &EngineInfo) -> Result<Arc<dyn Connection>>;

    async fn close(&self) -> Result<()>;
}

/// One connection to an engine.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn execute_workflow(&self, request: WorkflowRequest) -> Result<WorkflowResponse>;

    async fn execute_sub_workflow(
        &self,
        request: SubWorkflowRequest,
    ) -> Result<SubWorkflowResponse>;

    async fn health(&self) -> Result<HealthResponse>;

    async fn stop_workflow(&self, execution_id: &ExecutionId) -> Result<()>;

    async fn engine_status(&self) -> Result<EngineStatusResponse>;

    async fn stream_events(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<mpsc::Receiver<WorkflowEvent>>;
}

impl std::fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Convert executor-facing values to the wire's string-to-string form.
/// Plain strings pass through; anything else is JSON-encoded.
pub fn to_wire(values: &ValueMap) -> WireMap {
    values
        .iter()
        .map(|(k, v)| {
            let s = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), s)
        })
        .collect()
}

/// Convert wire strings to the opaque scalars executors see.
pub fn from_wire(strings: &WireMap) -> ValueMap {
    strings
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect()
}

/// In-process transport: routes connections straight to registered engine
/// runtimes. Serves single-process deployments and the integration tests;
/// network bindings implement the same pair of traits elsewhere.
pub struct LocalTransport {
    engines: RwLock<HashMap<EngineId, Arc<EngineRuntime>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, runtime: Arc<EngineRuntime>) {
        self.engines
            .write()
            .unwrap()
            .insert(runtime.engine_id().clone(), runtime);
    }

    pub fn deregister(&self, engine_id: &EngineId) {
        self.engines.write().unwrap().remove(engine_id);
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, engine: &EngineInfo) -> Result<Arc<dyn Connection>> {
        let runtime = self
            .engines
            .read()
            .unwrap()
            .get(&engine.engine_id)
            .cloned()
            .ok_or_else(|| {
                WeftError::Transport(format!("engine {} is not reachable", engine.engine_id))
            })?;
        Ok(Arc::new(LocalConnection { runtime }))
    }

    async fn close(&self) -> Result<()> {
        self.engines.write().unwrap().clear();
        Ok(())
    }
}

struct LocalConnection {
    runtime: Arc<EngineRuntime>,
}

#[async_trait]
impl Connection for LocalConnection {
    async fn execute_workflow(&self, request: WorkflowRequest) -> Result<WorkflowResponse> {
        self.runtime.execute(request).await
    }

    async fn execute_sub_workflow(
        &self,
        request: SubWorkflowRequest,
    ) -> Result<SubWorkflowResponse> {
        self.runtime.execute_sub(request).await
    }

    async fn health(&self) -> Result<HealthResponse> {
        Ok(self.runtime.health().await)
    }

    async fn stop_workflow(&self, execution_id: &ExecutionId) -> Result<()> {
        self.runtime.stop(execution_id).await
    }

    async fn engine_status(&self) -> Result<EngineStatusResponse> {
        Ok(self.runtime.status().await)
    }

    async fn stream_events(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<mpsc::Receiver<WorkflowEvent>> {
        self.runtime.stream_events(execution_id).await
    }
}
