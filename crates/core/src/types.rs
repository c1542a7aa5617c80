use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::version::Version;

/// Node inputs and outputs as executors see them: opaque scalar values keyed
/// by name.
pub type ValueMap = HashMap<String, serde_json::Value>;

/// Inputs and outputs as they travel on the wire (string-to-string).
pub type WireMap = HashMap<String, String>;

/// Unique identifier for a workflow definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a node within a workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier for an engine; survives address changes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EngineId(pub String);

impl EngineId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique identifier for one workflow execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of an execution or of a single node within one.
///
/// Transitions are monotone: `Pending -> Running -> (Completed | Failed |
/// Cancelled)`. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// A single node in a workflow graph.
///
/// `dependencies` lists node ids within the same workflow that must complete
/// successfully before this node runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub node_id: NodeId,
    pub dependencies: Vec<NodeId>,
    pub executor_type: String,
    pub executor_payload: String,
    pub config: ValueMap,
    pub metadata: ValueMap,
}

impl NodeDefinition {
    pub fn new(node_id: impl Into<String>, executor_type: impl Into<String>) -> Self {
        Self {
            node_id: NodeId::new(node_id),
            dependencies: Vec::new(),
            executor_type: executor_type.into(),
            executor_payload: String::new(),
            config: ValueMap::new(),
            metadata: ValueMap::new(),
        }
    }

    pub fn depends_on(mut self, node_id: impl Into<String>) -> Self {
        self.dependencies.push(NodeId::new(node_id));
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.executor_payload = payload.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A complete workflow definition. Immutable once accepted by the registry;
/// identity is `workflow_id` + `version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_id: WorkflowId,
    pub version: Version,
    pub name: String,
    pub nodes: Vec<NodeDefinition>,
    pub metadata: ValueMap,
}

impl WorkflowDefinition {
    pub fn new(workflow_id: impl Into<String>, version: Version, name: impl Into<String>) -> Self {
        Self {
            workflow_id: WorkflowId::new(workflow_id),
            version,
            name: name.into(),
            nodes: Vec::new(),
            metadata: ValueMap::new(),
        }
    }

    pub fn add_node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn find_node(&self, id: &NodeId) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| &n.node_id == id)
    }
}

/// Information about a discovered engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub engine_id: EngineId,
    pub address: String,
    pub port: u16,
    /// Maximum concurrent executions the engine advertises
    pub capacity: usize,
    pub metadata: HashMap<String, String>,
    pub last_seen: DateTime<Utc>,
}

impl EngineInfo {
    pub fn new(engine_id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            engine_id: EngineId::new(engine_id),
            address: address.into(),
            port,
            capacity: 10,
            metadata: HashMap::new(),
            last_seen: Utc::now(),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Record of one workflow execution. Owned by whichever actor started it:
/// root records by the dispatch core, child records by the sub-workflow
/// coordinator. Released once the execution reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub version: Version,
    pub parent_execution_id: Option<ExecutionId>,
    pub engine_id: Option<EngineId>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outputs: Option<ValueMap>,
    pub error: Option<String>,
}

/// Type of a workflow execution event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    NodeCancelled,
}

impl fmt::Display for WorkflowEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::WorkflowStarted => "workflow_started",
            Self::WorkflowCompleted => "workflow_completed",
            Self::WorkflowFailed => "workflow_failed",
            Self::WorkflowCancelled => "workflow_cancelled",
            Self::NodeStarted => "node_started",
            Self::NodeCompleted => "node_completed",
            Self::NodeFailed => "node_failed",
            Self::NodeCancelled => "node_cancelled",
        };
        write!(f, "{}", s)
    }
}

/// One event in an execution's event stream.
///
/// Within a single execution, events are emitted in the exact order the
/// scheduler transitions nodes; a terminal workflow event is the last event
/// for its `execution_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub event_type: WorkflowEventType,
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub node_id: Option<NodeId>,
    pub status: ExecutionStatus,
    pub data: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowEvent {
    pub fn new(
        event_type: WorkflowEventType,
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        status: ExecutionStatus,
    ) -> Self {
        Self {
            event_type,
            execution_id,
            workflow_id,
            node_id: None,
            status,
            data: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Input key injected by the sub-workflow coordinator: the parent's workflow id.
pub const PARENT_WORKFLOW_ID_KEY: &str = "_parent_workflow_id";
/// Input key injected by the sub-workflow coordinator: the parent's execution id.
pub const PARENT_EXECUTION_ID_KEY: &str = "_parent_execution_id";
/// Input key injected by trigger adapters: the trigger kind.
pub const TRIGGER_TYPE_KEY: &str = "_trigger_type";
/// Input key injected by trigger adapters: the trigger identity.
pub const TRIGGER_ID_KEY: &str = "_trigger_id";
/// Input key injected by trigger adapters: the firing time.
pub const TRIGGER_TIME_KEY: &str = "_trigger_time";

/// Keys reserved for injection by the coordinator and trigger adapters.
/// Workflows must not produce outputs under these keys; the engine drops
/// offenders on translation.
pub const RESERVED_INPUT_KEYS: [&str; 5] = [
    PARENT_WORKFLOW_ID_KEY,
    PARENT_EXECUTION_ID_KEY,
    TRIGGER_TYPE_KEY,
    TRIGGER_ID_KEY,
    TRIGGER_TIME_KEY,
];
