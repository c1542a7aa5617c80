use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::balancer::{ConsistentHashBalancer, LoadBalancer, RoundRobinBalancer};
use crate::config::Config;
use crate::dag;
use crate::discovery::ServiceDiscovery;
use crate::error::{ErrorKind, Result, WeftError};
use crate::monitor::Monitor;
use crate::registry::WorkflowRegistry;
use crate::subworkflow::{DispatchHandle, SubWorkflowCoordinator};
use crate::transport::{
    to_wire, NodeResult, SubWorkflowRequest, Transport, WorkflowRequest,
};
use crate::types::{EngineId, EngineInfo, ExecutionId, ValueMap, WorkflowId};
use crate::version::Version;

/// Default per-dispatch deadline; also the upper bound on caller deadlines.
pub const DEFAULT_DISPATCH_TIMEOUT_SECS: u64 = 600;

/// Deadline for a single health probe.
pub const HEALTH_CHECK_TIMEOUT_SECS: u64 = 5;

/// How many times selection is retried when it races an engine removal.
const SELECT_RETRIES: usize = 3;

/// Outcome of a dispatched execution, with the dispatch metadata attached.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub workflow_id: WorkflowId,
    pub execution_id: ExecutionId,
    pub engine_id: EngineId,
    pub version: Version,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub outputs: ValueMap,
    pub node_results: Vec<NodeResult>,
    pub duration: Duration,
}

/// Accepts execute requests, picks an engine, issues the remote call and
/// records active executions.
///
/// The engines map is authoritative; the load balancer is a derived index
/// rebuilt from discovery callbacks. Lock order across the call paths is
/// registry, then balancer, then engines.
pub struct Dispatcher {
    config: Config,
    registry: Arc<WorkflowRegistry>,
    balancer: Arc<dyn LoadBalancer>,
    transport: Arc<dyn Transport>,
    discovery: Arc<dyn ServiceDiscovery>,
    engines: RwLock<HashMap<EngineId, EngineInfo>>,
    /// Root executions in flight, mapped to the engine running them.
    active: RwLock<HashMap<ExecutionId, EngineId>>,
    counter: AtomicU64,
    coordinator: Arc<SubWorkflowCoordinator>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
    probe_task: Mutex<Option<JoinHandle<()>>>,
}

/// Decrements the engine's active count and releases the execution record
/// on every exit path.
struct DispatchGuard<'a> {
    dispatcher: &'a Dispatcher,
    engine_id: EngineId,
    execution_id: ExecutionId,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.balancer.decr(&self.engine_id);
        self.dispatcher
            .active
            .write()
            .unwrap()
            .remove(&self.execution_id);
    }
}

impl Dispatcher {
    pub fn new(
        config: Config,
        registry: Arc<WorkflowRegistry>,
        transport: Arc<dyn Transport>,
        discovery: Arc<dyn ServiceDiscovery>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let balancer: Arc<dyn LoadBalancer> = match config.load_balancer_type.as_str() {
            "round-robin" => Arc::new(RoundRobinBalancer::new()),
            _ => Arc::new(ConsistentHashBalancer::new(config.load_balancer_virtual_nodes)),
        };

        let coordinator = SubWorkflowCoordinator::new();
        let dispatcher = Arc::new(Self {
            config,
            registry,
            balancer,
            transport,
            discovery,
            engines: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(0),
            coordinator: coordinator.clone(),
            watch_task: Mutex::new(None),
            probe_task: Mutex::new(None),
        });

        let dispatch_handle: Arc<dyn DispatchHandle> = dispatcher.clone();
        let handle: Weak<dyn DispatchHandle> = Arc::downgrade(&dispatch_handle);
        coordinator.bind(handle);

        Ok(dispatcher)
    }

    /// Start following discovery. The watch task reconciles the engines map
    /// and the balancer on every membership callback.
    pub fn start(self: &Arc<Self>) {
        let dispatcher = self.clone();
        let discovery = self.discovery.clone();
        let task = tokio::spawn(async move {
            let reconciler = dispatcher.clone();
            if let Err(err) = discovery
                .watch(Box::new(move |engines| reconciler.reconcile(engines)))
                .await
            {
                // Discovery errors never fail dispatch by themselves.
                tracing::error!("discovery watch ended with error: {}", err);
            }
        });
        *self.watch_task.lock().unwrap() = Some(task);
    }

    /// Start probing engine health, reporting failures to the monitor as
    /// critical events.
    pub fn start_health_probe(self: &Arc<Self>, monitor: Arc<Monitor>) {
        let dispatcher = self.clone();
        let period = Duration::from_secs(self.config.health_check_interval_seconds);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let engines: Vec<EngineInfo> =
                    dispatcher.engines.read().unwrap().values().cloned().collect();
                for engine in engines {
                    let probe = async {
                        let connection = dispatcher.transport.connect(&engine).await?;
                        connection.health().await
                    };
                    let deadline = Duration::from_secs(HEALTH_CHECK_TIMEOUT_SECS);
                    match tokio::time::timeout(deadline, probe).await {
                        Ok(Ok(health)) if health.healthy => {}
                        Ok(Ok(health)) => monitor.record_engine_failure(
                            &engine.engine_id,
                            format!("engine reports unhealthy: {}", health.status),
                        ),
                        Ok(Err(err)) => {
                            monitor.record_engine_failure(&engine.engine_id, err.to_string())
                        }
                        Err(_) => monitor
                            .record_engine_failure(&engine.engine_id, "health probe timed out"),
                    }
                }
            }
        });
        *self.probe_task.lock().unwrap() = Some(task);
    }

    /// Apply a discovery snapshot: add new engines, refresh surviving ones,
    /// drop the departed. Callbacks arrive serialized, so snapshots never
    /// interleave.
    pub fn reconcile(&self, incoming: Vec<EngineInfo>) {
        let current: HashSet<EngineId> =
            self.engines.read().unwrap().keys().cloned().collect();
        let incoming_ids: HashSet<EngineId> =
            incoming.iter().map(|e| e.engine_id.clone()).collect();

        for engine in &incoming {
            if current.contains(&engine.engine_id) {
                let _ = self
                    .balancer
                    .update_capacity(&engine.engine_id, engine.capacity);
            } else {
                self.balancer.add(&engine.engine_id, engine.capacity);
                tracing::info!(
                    "discovered engine {} at {}:{}",
                    engine.engine_id,
                    engine.address,
                    engine.port
                );
            }
        }
        for engine_id in current.difference(&incoming_ids) {
            self.balancer.remove(engine_id);
            tracing::info!("removed engine {}", engine_id);
        }

        *self.engines.write().unwrap() = incoming
            .into_iter()
            .map(|engine| (engine.engine_id.clone(), engine))
            .collect();
    }

    /// Execute the latest version of a workflow on a selected engine.
    pub async fn execute(
        &self,
        workflow_id: &WorkflowId,
        inputs: ValueMap,
        deadline: Option<Duration>,
    ) -> Result<DispatchResult> {
        self.dispatch(workflow_id, None, inputs, deadline, None).await
    }

    async fn dispatch(
        &self,
        workflow_id: &WorkflowId,
        execution_id: Option<ExecutionId>,
        inputs: ValueMap,
        deadline: Option<Duration>,
        parent: Option<(WorkflowId, ExecutionId)>,
    ) -> Result<DispatchResult> {
        let record = self.registry.latest(workflow_id)?;
        let version = record.version.clone();

        let execution_id = execution_id.unwrap_or_else(|| self.next_execution_id());

        // Build through the registered builder before spending a remote
        // call; a broken builder fails here, not on the engine.
        let definition = self.registry.build(workflow_id)?;
        dag::validate(&definition)?;

        let (engine_id, engine) = self.select_engine(&workflow_id.0)?;

        self.balancer.incr(&engine_id);
        self.active
            .write()
            .unwrap()
            .insert(execution_id.clone(), engine_id.clone());
        let _guard = DispatchGuard {
            dispatcher: self,
            engine_id: engine_id.clone(),
            execution_id: execution_id.clone(),
        };

        let timeout = deadline
            .unwrap_or(Duration::from_secs(DEFAULT_DISPATCH_TIMEOUT_SECS))
            .min(Duration::from_secs(DEFAULT_DISPATCH_TIMEOUT_SECS));
        let timeout_seconds = timeout.as_secs().max(1);
        let wire_inputs = to_wire(&inputs);

        tracing::info!(
            "dispatching {} ({}) as {} to engine {}",
            workflow_id,
            version,
            execution_id,
            engine_id
        );

        let connection = self.transport.connect(&engine).await?;
        let started = Instant::now();

        let (success, error_kind, error_message, outputs, node_results) =
            if let Some((parent_workflow_id, parent_execution_id)) = parent {
                let request = SubWorkflowRequest {
                    sub_workflow_id: workflow_id.clone(),
                    sub_workflow_version: version.clone(),
                    parent_workflow_id,
                    parent_execution_id,
                    execution_id: execution_id.clone(),
                    inputs: wire_inputs,
                    timeout_seconds,
                };
                let response =
                    match tokio::time::timeout(timeout, connection.execute_sub_workflow(request))
                        .await
                    {
                        Ok(response) => response?,
                        Err(_) => return Err(WeftError::Timeout),
                    };
                (
                    response.success,
                    response.error_kind,
                    response.error_message,
                    response.outputs,
                    Vec::new(),
                )
            } else {
                let request = WorkflowRequest {
                    workflow_id: workflow_id.clone(),
                    version: version.clone(),
                    execution_id: execution_id.clone(),
                    inputs: wire_inputs,
                    parent_workflow_id: None,
                    parent_execution_id: None,
                    timeout_seconds,
                };
                let response =
                    match tokio::time::timeout(timeout, connection.execute_workflow(request)).await
                    {
                        Ok(response) => response?,
                        Err(_) => return Err(WeftError::Timeout),
                    };
                (
                    response.success,
                    response.error_kind,
                    response.error_message,
                    response.outputs,
                    response.node_results,
                )
            };

        Ok(DispatchResult {
            workflow_id: workflow_id.clone(),
            execution_id,
            engine_id,
            version,
            success,
            error_kind,
            error_message,
            outputs: outputs
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect(),
            node_results,
            duration: started.elapsed(),
        })
    }

    fn select_engine(&self, key: &str) -> Result<(EngineId, EngineInfo)> {
        for _ in 0..SELECT_RETRIES {
            let engine_id = self.balancer.select(key)?;
            let engine = self.engines.read().unwrap().get(&engine_id).cloned();
            if let Some(engine) = engine {
                return Ok((engine_id, engine));
            }
            // Selection raced a removal; the balancer converges on the next
            // reconcile, retry meanwhile.
        }
        Err(WeftError::NoEngine)
    }

    /// Strictly increasing per-dispatcher execution ids.
    fn next_execution_id(&self) -> ExecutionId {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        ExecutionId::new(format!(
            "exec-{}-{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            counter
        ))
    }

    pub fn sub_coordinator(&self) -> Arc<SubWorkflowCoordinator> {
        self.coordinator.clone()
    }

    /// Deliver a stop to the engine running `execution_id`.
    pub async fn stop_execution(&self, execution_id: &ExecutionId) -> Result<()> {
        let engine_id = self
            .active
            .read()
            .unwrap()
            .get(execution_id)
            .cloned()
            .ok_or_else(|| WeftError::NotFound(format!("execution {}", execution_id)))?;
        let engine = self
            .engines
            .read()
            .unwrap()
            .get(&engine_id)
            .cloned()
            .ok_or(WeftError::NoEngine)?;

        let connection = self.transport.connect(&engine).await?;
        connection.stop_workflow(execution_id).await
    }

    /// Execution ids currently in flight through this dispatcher.
    pub fn active_executions(&self) -> Vec<ExecutionId> {
        self.active.read().unwrap().keys().cloned().collect()
    }

    /// Snapshot of the known engines.
    pub fn engines(&self) -> Vec<EngineInfo> {
        self.engines.read().unwrap().values().cloned().collect()
    }

    /// Stop discovery, probing and the transport.
    pub async fn stop(&self) {
        self.discovery.shutdown();

        let watch = self.watch_task.lock().unwrap().take();
        if let Some(task) = watch {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                tracing::warn!("discovery watch did not stop in time");
            }
        }
        if let Some(task) = self.probe_task.lock().unwrap().take() {
            task.abort();
        }
        if let Err(err) = self.transport.close().await {
            tracing::warn!("transport close failed: {}", err);
        }
    }
}

#[async_trait]
impl DispatchHandle for Dispatcher {
    async fn execute_child(
        &self,
        workflow_id: &WorkflowId,
        execution_id: ExecutionId,
        parent_workflow_id: WorkflowId,
        parent_execution_id: ExecutionId,
        inputs: ValueMap,
    ) -> Result<DispatchResult> {
        self.dispatch(
            workflow_id,
            Some(execution_id),
            inputs,
            None,
            Some((parent_workflow_id, parent_execution_id)),
        )
        .await
    }

    async fn stop_execution(&self, execution_id: &ExecutionId) -> Result<()> {
        Dispatcher::stop_execution(self, execution_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticDiscovery;
    use crate::engine::EngineRuntime;
    use crate::executor::{ExecutionContext, ExecutorFactory, NodeExecutor};
    use crate::transport::LocalTransport;
    use crate::types::{ExecutionStatus, NodeDefinition, WorkflowDefinition};
    use std::collections::HashSet as StdHashSet;

    struct TestExecutor {
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl NodeExecutor for TestExecutor {
        async fn execute(
            &self,
            ctx: &ExecutionContext,
            _inputs: ValueMap,
        ) -> anyhow::Result<ValueMap> {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = ctx.cancelled() => anyhow::bail!("aborted on cancellation signal"),
            }
            if self.fail {
                anyhow::bail!("boom");
            }
            let mut outputs = ValueMap::new();
            outputs.insert("ok".to_string(), serde_json::json!(true));
            Ok(outputs)
        }
    }

    struct TestFactory;

    impl ExecutorFactory for TestFactory {
        fn resolve(
            &self,
            executor_type: &str,
            _payload: &str,
            _config: &ValueMap,
        ) -> anyhow::Result<Arc<dyn NodeExecutor>> {
            match executor_type {
                "noop" => Ok(Arc::new(TestExecutor {
                    delay: Duration::from_millis(5),
                    fail: false,
                })),
                "slow" => Ok(Arc::new(TestExecutor {
                    delay: Duration::from_secs(30),
                    fail: false,
                })),
                "fail" => Ok(Arc::new(TestExecutor {
                    delay: Duration::from_millis(5),
                    fail: true,
                })),
                other => anyhow::bail!("unknown executor type {}", other),
            }
        }
    }

    struct TestCluster {
        dispatcher: Arc<Dispatcher>,
        registry: Arc<WorkflowRegistry>,
        discovery: Arc<StaticDiscovery>,
        engines: Vec<Arc<EngineRuntime>>,
    }

    async fn create_test_cluster(engines: &[(&str, usize)]) -> TestCluster {
        let registry = Arc::new(WorkflowRegistry::new());
        let transport = Arc::new(LocalTransport::new());

        let mut infos = Vec::new();
        let mut runtimes = Vec::new();
        for (id, capacity) in engines {
            let runtime = Arc::new(EngineRuntime::new(
                *id,
                *capacity,
                registry.clone(),
                Arc::new(TestFactory),
            ));
            transport.register(runtime.clone());
            runtimes.push(runtime);
            infos.push(EngineInfo::new(*id, "127.0.0.1", 50051).with_capacity(*capacity));
        }

        let discovery = Arc::new(StaticDiscovery::new(infos));
        let dispatcher = Dispatcher::new(
            Config::default(),
            registry.clone(),
            transport,
            discovery.clone(),
        )
        .unwrap();
        dispatcher.start();
        // Let the initial discovery snapshot land.
        tokio::time::sleep(Duration::from_millis(20)).await;

        TestCluster {
            dispatcher,
            registry,
            discovery,
            engines: runtimes,
        }
    }

    fn register_pipeline(registry: &WorkflowRegistry, id: &str, executor_type: &'static str) {
        let id_owned = id.to_string();
        registry
            .register(
                id,
                "1.0.0",
                move || {
                    Ok(
                        WorkflowDefinition::new(id_owned.clone(), Version::new(1, 0, 0), "test")
                            .add_node(NodeDefinition::new("first", "noop"))
                            .add_node(
                                NodeDefinition::new("last", executor_type).depends_on("first"),
                            ),
                    )
                },
                ValueMap::new(),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_execute_end_to_end() {
        let cluster = create_test_cluster(&[("e1", 4)]).await;
        register_pipeline(&cluster.registry, "wf", "noop");

        let result = cluster
            .dispatcher
            .execute(&WorkflowId::new("wf"), ValueMap::new(), None)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.engine_id, EngineId::new("e1"));
        assert_eq!(result.version, Version::new(1, 0, 0));
        assert!(result.execution_id.0.starts_with("exec-"));
        assert_eq!(result.outputs.get("last.ok"), Some(&serde_json::json!("true")));
        assert_eq!(result.node_results.len(), 2);

        // Guard released the record on the way out.
        assert!(cluster.dispatcher.active_executions().is_empty());

        cluster.dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_workflow_not_found() {
        let cluster = create_test_cluster(&[("e1", 4)]).await;

        let err = cluster
            .dispatcher
            .execute(&WorkflowId::new("ghost"), ValueMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::NotFound(_)));

        cluster.dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_no_engine_without_members() {
        let cluster = create_test_cluster(&[]).await;
        register_pipeline(&cluster.registry, "wf", "noop");

        let err = cluster
            .dispatcher
            .execute(&WorkflowId::new("wf"), ValueMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::NoEngine));

        cluster.dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_execution_ids_unique_and_increasing() {
        let cluster = create_test_cluster(&[]).await;

        let mut seen = StdHashSet::new();
        let mut last_counter = 0u64;
        for _ in 0..1000 {
            let id = cluster.dispatcher.next_execution_id();
            assert!(seen.insert(id.clone()), "duplicate id {}", id);

            let counter: u64 = id.0.rsplit('-').next().unwrap().parse().unwrap();
            assert!(counter > last_counter);
            last_counter = counter;
        }

        cluster.dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_routing_is_sticky_per_workflow() {
        let cluster = create_test_cluster(&[("e1", 4), ("e2", 4), ("e3", 4)]).await;
        register_pipeline(&cluster.registry, "wf-a", "noop");

        let mut owners = StdHashSet::new();
        for _ in 0..5 {
            let result = cluster
                .dispatcher
                .execute(&WorkflowId::new("wf-a"), ValueMap::new(), None)
                .await
                .unwrap();
            owners.insert(result.engine_id);
        }
        assert_eq!(owners.len(), 1, "wf-a bounced between engines: {:?}", owners);

        cluster.dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_at_capacity_and_stop_execution() {
        let cluster = create_test_cluster(&[("e1", 1)]).await;
        register_pipeline(&cluster.registry, "wf", "slow");

        let background = {
            let dispatcher = cluster.dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .execute(&WorkflowId::new("wf"), ValueMap::new(), None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = cluster
            .dispatcher
            .execute(&WorkflowId::new("wf"), ValueMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::AtCapacity { .. }));

        let active = cluster.dispatcher.active_executions();
        assert_eq!(active.len(), 1);
        cluster.dispatcher.stop_execution(&active[0]).await.unwrap();

        let result = background.await.unwrap().unwrap();
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));

        cluster.dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_membership_changes_reconcile() {
        let cluster = create_test_cluster(&[("e1", 4)]).await;
        register_pipeline(&cluster.registry, "wf", "noop");

        assert_eq!(cluster.dispatcher.engines().len(), 1);

        cluster.discovery.update(Vec::new());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(cluster.dispatcher.engines().is_empty());
        let err = cluster
            .dispatcher
            .execute(&WorkflowId::new("wf"), ValueMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::NoEngine));

        cluster.dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_health_probe_reports_unreachable_engine() {
        let registry = Arc::new(WorkflowRegistry::new());
        let transport = Arc::new(LocalTransport::new());
        // The engine is discovered but no runtime answers for it.
        let discovery = Arc::new(StaticDiscovery::new(vec![EngineInfo::new(
            "ghost", "127.0.0.1", 50051,
        )]));

        let mut config = Config::default();
        config.health_check_interval_seconds = 1;
        let dispatcher =
            Dispatcher::new(config, registry, transport, discovery.clone()).unwrap();
        dispatcher.start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let monitor = Monitor::new();
        let mut subscription = monitor.subscribe();
        dispatcher.start_health_probe(monitor.clone());

        let event = tokio::time::timeout(Duration::from_secs(2), subscription.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.severity, crate::monitor::Severity::Critical);
        assert_eq!(event.engine_id, Some(EngineId::new("ghost")));

        dispatcher.stop().await;
        monitor.stop();
    }

    #[tokio::test]
    async fn test_subworkflow_cancellation_cascade() {
        let cluster = create_test_cluster(&[("e1", 4)]).await;
        register_pipeline(&cluster.registry, "child-wf", "slow");

        let coordinator = cluster.dispatcher.sub_coordinator();
        let parent = ExecutionId::new("exec-parent-1");

        let first = coordinator
            .execute_sub(
                WorkflowId::new("child-wf"),
                Version::new(1, 0, 0),
                WorkflowId::new("parent-wf"),
                parent.clone(),
                ValueMap::new(),
            )
            .unwrap();
        let second = coordinator
            .execute_sub(
                WorkflowId::new("child-wf"),
                Version::new(1, 0, 0),
                WorkflowId::new("parent-wf"),
                parent.clone(),
                ValueMap::new(),
            )
            .unwrap();

        // Wait until both children are running on the engine.
        for _ in 0..100 {
            if cluster.engines[0].status().await.active == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cluster.engines[0].status().await.active, 2);

        coordinator.cancel_children(&parent).await.unwrap();

        assert_eq!(
            coordinator.status(&first).unwrap().status,
            ExecutionStatus::Cancelled
        );
        assert_eq!(
            coordinator.status(&second).unwrap().status,
            ExecutionStatus::Cancelled
        );

        // The stops reached the engine; its slots drain.
        for _ in 0..100 {
            if cluster.engines[0].status().await.active == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cluster.engines[0].status().await.active, 0);

        cluster.dispatcher.stop().await;
    }
}
