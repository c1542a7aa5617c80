use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use crate::dag;
use crate::error::{Result, WeftError};
use crate::types::{ValueMap, WorkflowDefinition, WorkflowId};
use crate::version::Version;

/// Side-effect-free function producing a workflow definition.
///
/// The registry calls it once at registration to validate the produced
/// graph; the dispatch core may call it again at dispatch time.
pub type WorkflowBuilder = dyn Fn() -> anyhow::Result<WorkflowDefinition> + Send + Sync;

/// Where engines resolve definitions from. The registry is the in-process
/// implementation; a remote engine would back this with its own cache.
pub trait DefinitionSource: Send + Sync {
    fn definition(
        &self,
        workflow_id: &WorkflowId,
        version: Option<&Version>,
    ) -> Result<WorkflowDefinition>;
}

/// Registry record wrapping one accepted definition.
#[derive(Debug, Clone)]
pub struct WorkflowVersionRecord {
    pub workflow_id: WorkflowId,
    pub version: Version,
    pub definition: WorkflowDefinition,
    pub created_at: DateTime<Utc>,
    /// Other workflow ids this version invokes as sub-workflows, extracted
    /// from node metadata at registration.
    pub dependencies: Vec<WorkflowId>,
}

struct RegistryInner {
    versions: HashMap<WorkflowId, BTreeMap<Version, Arc<WorkflowVersionRecord>>>,
    latest: HashMap<WorkflowId, Version>,
    builders: HashMap<WorkflowId, Arc<WorkflowBuilder>>,
    metadata: HashMap<WorkflowId, ValueMap>,
    /// Referenced workflow id -> ids of workflows that reference it.
    dependents: HashMap<WorkflowId, BTreeSet<WorkflowId>>,
}

/// Stores workflow definitions keyed by `(id, version)` and gates updates
/// so a workflow other registered workflows depend on cannot change from
/// under them.
pub struct WorkflowRegistry {
    inner: RwLock<RegistryInner>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                versions: HashMap::new(),
                latest: HashMap::new(),
                builders: HashMap::new(),
                metadata: HashMap::new(),
                dependents: HashMap::new(),
            }),
        }
    }

    /// Register a workflow version.
    ///
    /// Admitted only if the id is new, or the proposed version strictly
    /// dominates the current latest, is not already present, and the
    /// current latest has no dependents.
    pub fn register(
        &self,
        workflow_id: impl Into<String>,
        version: &str,
        builder: impl Fn() -> anyhow::Result<WorkflowDefinition> + Send + Sync + 'static,
        metadata: ValueMap,
    ) -> Result<()> {
        let workflow_id = WorkflowId::new(workflow_id);
        let version: Version = version.parse()?;

        // Build once to validate the produced graph before touching state.
        let definition = builder()
            .map_err(|e| WeftError::InvalidGraph(format!("builder for {}: {}", workflow_id, e)))?;
        dag::validate(&definition)?;

        let dependencies = extract_dependencies(&definition);

        let mut inner = self.inner.write().unwrap();
        inner.check_update(&workflow_id, &version)?;

        let record = Arc::new(WorkflowVersionRecord {
            workflow_id: workflow_id.clone(),
            version: version.clone(),
            definition,
            created_at: Utc::now(),
            dependencies: dependencies.clone(),
        });

        inner
            .versions
            .entry(workflow_id.clone())
            .or_default()
            .insert(version.clone(), record);
        inner.latest.insert(workflow_id.clone(), version);
        inner.builders.insert(workflow_id.clone(), Arc::new(builder));
        inner.metadata.insert(workflow_id.clone(), metadata);

        for dependency in dependencies {
            inner
                .dependents
                .entry(dependency)
                .or_default()
                .insert(workflow_id.clone());
        }

        tracing::info!("registered workflow {}", workflow_id);
        Ok(())
    }

    /// Fetch a specific version, or the latest when `version` is `None`.
    pub fn get(
        &self,
        workflow_id: &WorkflowId,
        version: Option<&Version>,
    ) -> Result<Arc<WorkflowVersionRecord>> {
        let inner = self.inner.read().unwrap();
        let version = match version {
            Some(v) => v.clone(),
            None => inner
                .latest
                .get(workflow_id)
                .cloned()
                .ok_or_else(|| WeftError::NotFound(workflow_id.to_string()))?,
        };

        inner
            .versions
            .get(workflow_id)
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or_else(|| WeftError::NotFound(format!("{}@{}", workflow_id, version)))
    }

    /// The latest registered version of a workflow.
    pub fn latest(&self, workflow_id: &WorkflowId) -> Result<Arc<WorkflowVersionRecord>> {
        self.get(workflow_id, None)
    }

    /// Whether `(workflow_id, new_version)` would be admitted right now.
    pub fn can_update(&self, workflow_id: &WorkflowId, new_version: &Version) -> Result<()> {
        self.inner
            .read()
            .unwrap()
            .check_update(workflow_id, new_version)
    }

    /// Ids of registered workflows that reference this one as a sub-workflow.
    pub fn dependents(&self, workflow_id: &WorkflowId) -> Vec<WorkflowId> {
        self.inner
            .read()
            .unwrap()
            .dependents
            .get(workflow_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_workflow(&self, workflow_id: &WorkflowId) -> bool {
        self.inner.read().unwrap().builders.contains_key(workflow_id)
    }

    /// Build a fresh definition through the registered builder.
    pub fn build(&self, workflow_id: &WorkflowId) -> Result<WorkflowDefinition> {
        let builder = self
            .inner
            .read()
            .unwrap()
            .builders
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WeftError::NotFound(workflow_id.to_string()))?;

        builder()
            .map_err(|e| WeftError::InvalidGraph(format!("builder for {}: {}", workflow_id, e)))
    }

    pub fn metadata(&self, workflow_id: &WorkflowId) -> ValueMap {
        self.inner
            .read()
            .unwrap()
            .metadata
            .get(workflow_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DefinitionSource for WorkflowRegistry {
    fn definition(
        &self,
        workflow_id: &WorkflowId,
        version: Option<&Version>,
    ) -> Result<WorkflowDefinition> {
        self.get(workflow_id, version)
            .map(|record| record.definition.clone())
    }
}

impl RegistryInner {
    fn check_update(&self, workflow_id: &WorkflowId, new_version: &Version) -> Result<()> {
        let current = match self.latest.get(workflow_id) {
            Some(current) => current,
            // New workflow id: always admitted.
            None => return Ok(()),
        };

        let dependents = self.dependents.get(workflow_id);
        if let Some(dependents) = dependents {
            if !dependents.is_empty() {
                return Err(WeftError::HasDependents {
                    workflow_id: workflow_id.clone(),
                    dependents: dependents.iter().cloned().collect(),
                });
            }
        }

        if new_version <= current {
            return Err(WeftError::NotNewer {
                proposed: new_version.clone(),
                current: current.clone(),
            });
        }

        if self
            .versions
            .get(workflow_id)
            .is_some_and(|versions| versions.contains_key(new_version))
        {
            return Err(WeftError::Duplicate(new_version.clone()));
        }

        Ok(())
    }
}

/// Sub-workflow references hide in node metadata: a node with
/// `workflow_type = "sub-workflow"` names the referenced workflow in its
/// `workflow_id` field.
fn extract_dependencies(definition: &WorkflowDefinition) -> Vec<WorkflowId> {
    let mut seen = BTreeSet::new();
    for node in &definition.nodes {
        let is_sub = node
            .metadata
            .get("workflow_type")
            .and_then(|v| v.as_str())
            .map(|t| t == "sub-workflow")
            .unwrap_or(false);
        if !is_sub {
            continue;
        }
        if let Some(id) = node.metadata.get("workflow_id").and_then(|v| v.as_str()) {
            seen.insert(WorkflowId::new(id));
        }
    }
    seen.into_iter().collect()
}
