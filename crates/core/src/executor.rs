use std::sync::Arc;
use tokio::sync::watch;

use crate::types::{ExecutionId, NodeId, ValueMap, WorkflowId};

/// Per-node view of a running execution, handed to executors.
///
/// Carries the execution identity and the cooperative cancellation signal.
/// An executor that ignores the signal blocks termination of its execution;
/// honoring it is part of the executor contract.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub node_id: NodeId,
    cancel: watch::Receiver<bool>,
}

impl ExecutionContext {
    pub fn new(
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        node_id: NodeId,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            execution_id,
            workflow_id,
            node_id,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the execution's cancellation signal trips.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without tripping: cancellation can no longer
                // arrive on this signal.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Runs the logic of a single node.
///
/// Receives the inputs gathered from completed parents and returns the
/// node's outputs. Implementations live outside the core (script runners
/// and the like); the scheduler only depends on this seam.
#[async_trait::async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext, inputs: ValueMap) -> anyhow::Result<ValueMap>;
}

/// Resolves a node definition's `executor_type` / `executor_payload` to an
/// executor instance. The engine runtime calls this once per node per run.
pub trait ExecutorFactory: Send + Sync {
    fn resolve(
        &self,
        executor_type: &str,
        payload: &str,
        config: &ValueMap,
    ) -> anyhow::Result<Arc<dyn NodeExecutor>>;
}
