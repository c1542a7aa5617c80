use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use crate::dispatcher::DispatchResult;
use crate::error::{Result, WeftError};
use crate::types::{
    ExecutionId, ExecutionRecord, ExecutionStatus, ValueMap, WorkflowId,
    PARENT_EXECUTION_ID_KEY, PARENT_WORKFLOW_ID_KEY,
};
use crate::version::Version;

/// The slice of the dispatch core the coordinator consumes.
///
/// The coordinator must route child executions back through dispatch —
/// version resolution and capacity accounting have to pass through the
/// single authoritative point — while the dispatcher owns the coordinator.
/// This narrow interface, injected after construction and held weakly,
/// breaks that cycle.
#[async_trait]
pub trait DispatchHandle: Send + Sync {
    /// Execute a child workflow under a pre-minted execution id.
    async fn execute_child(
        &self,
        workflow_id: &WorkflowId,
        execution_id: ExecutionId,
        parent_workflow_id: WorkflowId,
        parent_execution_id: ExecutionId,
        inputs: ValueMap,
    ) -> Result<DispatchResult>;

    /// Deliver a stop to the engine owning `execution_id`.
    async fn stop_execution(&self, execution_id: &ExecutionId) -> Result<()>;
}

/// Tracks parent-to-children relationships for in-flight executions and
/// cascades cancellation.
pub struct SubWorkflowCoordinator {
    records: RwLock<HashMap<ExecutionId, ExecutionRecord>>,
    children: RwLock<HashMap<ExecutionId, Vec<ExecutionId>>>,
    dispatch: RwLock<Option<Weak<dyn DispatchHandle>>>,
}

impl SubWorkflowCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: RwLock::new(HashMap::new()),
            children: RwLock::new(HashMap::new()),
            dispatch: RwLock::new(None),
        })
    }

    /// Inject the dispatch handle. Called once, right after the dispatcher
    /// is constructed.
    pub fn bind(&self, handle: Weak<dyn DispatchHandle>) {
        *self.dispatch.write().unwrap() = Some(handle);
    }

    fn handle(&self) -> Result<Arc<dyn DispatchHandle>> {
        self.dispatch
            .read()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| WeftError::Transport("dispatcher is not available".to_string()))
    }

    /// Launch a sub-workflow asynchronously and return its execution id.
    ///
    /// The child record starts `PENDING`, flips to `RUNNING` when dispatch
    /// picks it up, and lands in `COMPLETED`/`FAILED` with the outputs or
    /// error. Parent identifiers are injected into the inputs under the
    /// reserved keys.
    pub fn execute_sub(
        self: &Arc<Self>,
        sub_workflow_id: WorkflowId,
        sub_version: Version,
        parent_workflow_id: WorkflowId,
        parent_execution_id: ExecutionId,
        mut inputs: ValueMap,
    ) -> Result<ExecutionId> {
        let handle = self.handle()?;

        let execution_id = ExecutionId::new(format!(
            "{}-sub-{}",
            parent_execution_id,
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));

        let record = ExecutionRecord {
            execution_id: execution_id.clone(),
            workflow_id: sub_workflow_id.clone(),
            version: sub_version,
            parent_execution_id: Some(parent_execution_id.clone()),
            engine_id: None,
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            outputs: None,
            error: None,
        };

        self.records
            .write()
            .unwrap()
            .insert(execution_id.clone(), record);
        self.children
            .write()
            .unwrap()
            .entry(parent_execution_id.clone())
            .or_default()
            .push(execution_id.clone());

        inputs.insert(
            PARENT_WORKFLOW_ID_KEY.to_string(),
            serde_json::Value::String(parent_workflow_id.0.clone()),
        );
        inputs.insert(
            PARENT_EXECUTION_ID_KEY.to_string(),
            serde_json::Value::String(parent_execution_id.0.clone()),
        );

        let coordinator = self.clone();
        let child_id = execution_id.clone();
        tokio::spawn(async move {
            // Claim the record; a cancellation may already have landed.
            {
                let mut records = coordinator.records.write().unwrap();
                match records.get_mut(&child_id) {
                    Some(record) if record.status == ExecutionStatus::Pending => {
                        record.status = ExecutionStatus::Running;
                    }
                    _ => return,
                }
            }

            let result = handle
                .execute_child(
                    &sub_workflow_id,
                    child_id.clone(),
                    parent_workflow_id,
                    parent_execution_id,
                    inputs,
                )
                .await;

            let mut records = coordinator.records.write().unwrap();
            if let Some(record) = records.get_mut(&child_id) {
                // A cancellation that raced us wins; terminal states are
                // sticky.
                if record.status == ExecutionStatus::Running {
                    match result {
                        Ok(response) => {
                            record.engine_id = Some(response.engine_id.clone());
                            if response.success {
                                record.status = ExecutionStatus::Completed;
                                record.outputs = Some(response.outputs);
                            } else {
                                record.status = ExecutionStatus::Failed;
                                record.error = response
                                    .error_message
                                    .or_else(|| Some("sub-workflow failed".to_string()));
                            }
                        }
                        Err(err) => {
                            record.status = ExecutionStatus::Failed;
                            record.error = Some(err.to_string());
                            tracing::error!("sub-workflow {} failed: {}", child_id, err);
                        }
                    }
                    record.ended_at = Some(Utc::now());
                }
            }
        });

        Ok(execution_id)
    }

    /// Current record for a child execution.
    pub fn status(&self, execution_id: &ExecutionId) -> Result<ExecutionRecord> {
        self.records
            .read()
            .unwrap()
            .get(execution_id)
            .cloned()
            .ok_or_else(|| WeftError::NotFound(format!("sub-workflow {}", execution_id)))
    }

    /// All child execution ids recorded for a parent.
    pub fn children(&self, parent_execution_id: &ExecutionId) -> Vec<ExecutionId> {
        self.children
            .read()
            .unwrap()
            .get(parent_execution_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Cancel every non-terminal child of a parent execution.
    ///
    /// For running children the stop is delivered to the engine first; the
    /// local record flips to `CANCELLED` only afterwards.
    pub async fn cancel_children(&self, parent_execution_id: &ExecutionId) -> Result<()> {
        let children = self.children(parent_execution_id);
        if children.is_empty() {
            return Ok(());
        }
        let handle = self.handle()?;

        for child_id in children {
            let status = self
                .records
                .read()
                .unwrap()
                .get(&child_id)
                .map(|record| record.status);

            match status {
                Some(ExecutionStatus::Pending) => {
                    self.mark_cancelled(&child_id);
                }
                Some(ExecutionStatus::Running) => {
                    if let Err(err) = handle.stop_execution(&child_id).await {
                        tracing::warn!(
                            "stop for child {} did not reach its engine: {}",
                            child_id,
                            err
                        );
                    }
                    self.mark_cancelled(&child_id);
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn mark_cancelled(&self, execution_id: &ExecutionId) {
        let mut records = self.records.write().unwrap();
        if let Some(record) = records.get_mut(execution_id) {
            if !record.status.is_terminal() {
                record.status = ExecutionStatus::Cancelled;
                record.ended_at = Some(Utc::now());
            }
        }
    }

    /// Drop a terminal child record and its parent index entry.
    pub fn release(&self, execution_id: &ExecutionId) {
        let mut records = self.records.write().unwrap();
        let Some(record) = records.get(execution_id) else {
            return;
        };
        if !record.status.is_terminal() {
            return;
        }
        let parent = record.parent_execution_id.clone();
        records.remove(execution_id);
        drop(records);

        if let Some(parent) = parent {
            let mut children = self.children.write().unwrap();
            if let Some(siblings) = children.get_mut(&parent) {
                siblings.retain(|id| id != execution_id);
                if siblings.is_empty() {
                    children.remove(&parent);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::EngineId;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeDispatch {
        /// (workflow_id, execution_id, inputs) per execute_child call.
        executed: Mutex<Vec<(WorkflowId, ExecutionId, ValueMap)>>,
        stopped: Mutex<Vec<ExecutionId>>,
        delay: Option<Duration>,
        fail: bool,
    }

    #[async_trait]
    impl DispatchHandle for FakeDispatch {
        async fn execute_child(
            &self,
            workflow_id: &WorkflowId,
            execution_id: ExecutionId,
            _parent_workflow_id: WorkflowId,
            _parent_execution_id: ExecutionId,
            inputs: ValueMap,
        ) -> Result<DispatchResult> {
            self.executed.lock().unwrap().push((
                workflow_id.clone(),
                execution_id.clone(),
                inputs,
            ));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(WeftError::NoEngine);
            }
            let mut outputs = ValueMap::new();
            outputs.insert("done".to_string(), serde_json::json!(true));
            Ok(DispatchResult {
                workflow_id: workflow_id.clone(),
                execution_id,
                engine_id: EngineId::new("e1"),
                version: Version::new(1, 0, 0),
                success: true,
                error_kind: None,
                error_message: None,
                outputs,
                node_results: Vec::new(),
                duration: Duration::from_millis(1),
            })
        }

        async fn stop_execution(&self, execution_id: &ExecutionId) -> Result<()> {
            self.stopped.lock().unwrap().push(execution_id.clone());
            Ok(())
        }
    }

    fn create_bound_coordinator(
        fake: Arc<FakeDispatch>,
    ) -> (Arc<SubWorkflowCoordinator>, Arc<FakeDispatch>) {
        let coordinator = SubWorkflowCoordinator::new();
        let dispatch_handle: Arc<dyn DispatchHandle> = fake.clone();
        let weak: Weak<dyn DispatchHandle> = Arc::downgrade(&dispatch_handle);
        coordinator.bind(weak);
        (coordinator, fake)
    }

    async fn wait_for_status(
        coordinator: &SubWorkflowCoordinator,
        id: &ExecutionId,
        wanted: ExecutionStatus,
    ) {
        for _ in 0..100 {
            if coordinator.status(id).unwrap().status == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "execution {} never reached {}, stuck at {}",
            id,
            wanted,
            coordinator.status(id).unwrap().status
        );
    }

    #[tokio::test]
    async fn test_execute_sub_lifecycle() {
        let (coordinator, handle) = create_bound_coordinator(Arc::new(FakeDispatch::default()));

        let child = coordinator
            .execute_sub(
                WorkflowId::new("child-wf"),
                Version::new(1, 0, 0),
                WorkflowId::new("parent-wf"),
                ExecutionId::new("exec-parent"),
                ValueMap::new(),
            )
            .unwrap();

        assert!(child.0.starts_with("exec-parent-sub-"));
        wait_for_status(&coordinator, &child, ExecutionStatus::Completed).await;

        let record = coordinator.status(&child).unwrap();
        assert_eq!(record.parent_execution_id, Some(ExecutionId::new("exec-parent")));
        assert_eq!(record.engine_id, Some(EngineId::new("e1")));
        assert!(record.ended_at.is_some());
        assert_eq!(
            record.outputs.unwrap().get("done"),
            Some(&serde_json::json!(true))
        );

        // Parent identifiers were injected under the reserved keys.
        let calls = handle.executed.lock().unwrap();
        let (_, _, inputs) = &calls[0];
        assert_eq!(
            inputs.get(PARENT_WORKFLOW_ID_KEY),
            Some(&serde_json::json!("parent-wf"))
        );
        assert_eq!(
            inputs.get(PARENT_EXECUTION_ID_KEY),
            Some(&serde_json::json!("exec-parent"))
        );
    }

    #[tokio::test]
    async fn test_failed_dispatch_marks_record_failed() {
        let (coordinator, _handle) = create_bound_coordinator(Arc::new(FakeDispatch {
            fail: true,
            ..Default::default()
        }));

        let child = coordinator
            .execute_sub(
                WorkflowId::new("child-wf"),
                Version::new(1, 0, 0),
                WorkflowId::new("parent-wf"),
                ExecutionId::new("exec-parent"),
                ValueMap::new(),
            )
            .unwrap();

        wait_for_status(&coordinator, &child, ExecutionStatus::Failed).await;
        let record = coordinator.status(&child).unwrap();
        assert!(record.error.unwrap().contains("no engine"));
    }

    #[tokio::test]
    async fn test_children_tracking_and_release() {
        let (coordinator, _handle) = create_bound_coordinator(Arc::new(FakeDispatch::default()));
        let parent = ExecutionId::new("exec-parent");

        let first = coordinator
            .execute_sub(
                WorkflowId::new("a"),
                Version::new(1, 0, 0),
                WorkflowId::new("parent-wf"),
                parent.clone(),
                ValueMap::new(),
            )
            .unwrap();
        let second = coordinator
            .execute_sub(
                WorkflowId::new("b"),
                Version::new(1, 0, 0),
                WorkflowId::new("parent-wf"),
                parent.clone(),
                ValueMap::new(),
            )
            .unwrap();

        assert_eq!(coordinator.children(&parent), vec![first.clone(), second.clone()]);

        wait_for_status(&coordinator, &first, ExecutionStatus::Completed).await;
        coordinator.release(&first);
        assert_eq!(coordinator.children(&parent), vec![second.clone()]);
        assert!(matches!(
            coordinator.status(&first),
            Err(WeftError::NotFound(_))
        ));

        // Non-terminal records refuse release.
        let (slow, _handle) = create_bound_coordinator(Arc::new(FakeDispatch {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        }));
        let running = slow
            .execute_sub(
                WorkflowId::new("c"),
                Version::new(1, 0, 0),
                WorkflowId::new("parent-wf"),
                parent.clone(),
                ValueMap::new(),
            )
            .unwrap();
        wait_for_status(&slow, &running, ExecutionStatus::Running).await;
        slow.release(&running);
        assert!(slow.status(&running).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_children_stops_engines_first() {
        let (coordinator, handle) = create_bound_coordinator(Arc::new(FakeDispatch {
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        }));
        let parent = ExecutionId::new("exec-parent");

        let first = coordinator
            .execute_sub(
                WorkflowId::new("a"),
                Version::new(1, 0, 0),
                WorkflowId::new("parent-wf"),
                parent.clone(),
                ValueMap::new(),
            )
            .unwrap();
        let second = coordinator
            .execute_sub(
                WorkflowId::new("b"),
                Version::new(1, 0, 0),
                WorkflowId::new("parent-wf"),
                parent.clone(),
                ValueMap::new(),
            )
            .unwrap();

        wait_for_status(&coordinator, &first, ExecutionStatus::Running).await;
        wait_for_status(&coordinator, &second, ExecutionStatus::Running).await;

        coordinator.cancel_children(&parent).await.unwrap();

        assert_eq!(
            coordinator.status(&first).unwrap().status,
            ExecutionStatus::Cancelled
        );
        assert_eq!(
            coordinator.status(&second).unwrap().status,
            ExecutionStatus::Cancelled
        );
        // The engines were instructed to stop before the records flipped.
        let stopped = handle.stopped.lock().unwrap();
        assert_eq!(stopped.as_slice(), &[first.clone(), second.clone()]);
    }

    #[tokio::test]
    async fn test_unbound_coordinator_refuses_dispatch() {
        let coordinator = SubWorkflowCoordinator::new();
        let err = coordinator
            .execute_sub(
                WorkflowId::new("a"),
                Version::new(1, 0, 0),
                WorkflowId::new("parent-wf"),
                ExecutionId::new("exec-parent"),
                ValueMap::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
