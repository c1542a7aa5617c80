use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

use crate::error::{Result, WeftError};
use crate::types::{NodeDefinition, NodeId, WorkflowDefinition};

/// Preprocessed form of a workflow graph, built once per graph instance.
///
/// Holds the child adjacency list and initial ready counters the scheduler
/// consumes. Immutable after construction.
#[derive(Debug)]
pub struct PreparedGraph {
    pub nodes: HashMap<NodeId, NodeDefinition>,
    /// Node ids in definition order.
    pub order: Vec<NodeId>,
    /// Direct children of each node (nodes that depend on it).
    pub children: HashMap<NodeId, Vec<NodeId>>,
    /// Unfulfilled-dependency count per node; a node may start only at zero.
    pub ready: HashMap<NodeId, usize>,
    /// Nodes with no dependencies; started first, in parallel.
    pub roots: Vec<NodeId>,
    /// Nodes with no children; their outputs form the run result.
    pub sinks: Vec<NodeId>,
}

impl PreparedGraph {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All transitive descendants of a node, in no particular order.
    pub fn descendants(&self, id: &NodeId) -> Vec<NodeId> {
        let mut seen: Vec<NodeId> = Vec::new();
        let mut stack: Vec<&NodeId> = self.children.get(id).map(|c| c.iter().collect()).unwrap_or_default();

        while let Some(next) = stack.pop() {
            if seen.contains(next) {
                continue;
            }
            seen.push(next.clone());
            if let Some(grandchildren) = self.children.get(next) {
                stack.extend(grandchildren.iter());
            }
        }

        seen
    }
}

/// Validate a definition without keeping the prepared form around.
/// The registry runs this against every builder's output at registration.
pub fn validate(definition: &WorkflowDefinition) -> Result<()> {
    prepare(definition).map(|_| ())
}

/// Build the prepared graph for a definition.
///
/// Fails with `INVALID_GRAPH` on duplicate node ids, dependencies on
/// undefined nodes, and cycles.
pub fn prepare(definition: &WorkflowDefinition) -> Result<PreparedGraph> {
    let mut nodes: HashMap<NodeId, NodeDefinition> = HashMap::new();
    for node in &definition.nodes {
        if nodes.insert(node.node_id.clone(), node.clone()).is_some() {
            return Err(WeftError::InvalidGraph(format!(
                "duplicate node id {}",
                node.node_id
            )));
        }
    }

    let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let mut ready: HashMap<NodeId, usize> = HashMap::new();

    let mut graph: DiGraph<NodeId, ()> = DiGraph::new();
    let mut indices: HashMap<NodeId, NodeIndex> = HashMap::new();
    for id in nodes.keys() {
        indices.insert(id.clone(), graph.add_node(id.clone()));
        children.insert(id.clone(), Vec::new());
    }

    for node in nodes.values() {
        ready.insert(node.node_id.clone(), node.dependencies.len());

        for dep in &node.dependencies {
            let dep_idx = *indices.get(dep).ok_or_else(|| {
                WeftError::InvalidGraph(format!(
                    "node {} depends on undefined node {}",
                    node.node_id, dep
                ))
            })?;
            graph.add_edge(dep_idx, indices[&node.node_id], ());
            children
                .get_mut(dep)
                .expect("all nodes indexed")
                .push(node.node_id.clone());
        }
    }

    if petgraph::algo::is_cyclic_directed(&graph) {
        return Err(WeftError::InvalidGraph(format!(
            "workflow {} contains a dependency cycle",
            definition.workflow_id
        )));
    }

    // Preserve definition order for deterministic root start-up and output
    // assembly.
    let roots: Vec<NodeId> = definition
        .nodes
        .iter()
        .filter(|n| n.dependencies.is_empty())
        .map(|n| n.node_id.clone())
        .collect();
    let sinks: Vec<NodeId> = definition
        .nodes
        .iter()
        .filter(|n| children[&n.node_id].is_empty())
        .map(|n| n.node_id.clone())
        .collect();

    let order: Vec<NodeId> = definition.nodes.iter().map(|n| n.node_id.clone()).collect();

    Ok(PreparedGraph {
        nodes,
        order,
        children,
        ready,
        roots,
        sinks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;

    fn create_test_workflow(nodes: Vec<NodeDefinition>) -> WorkflowDefinition {
        let mut def = WorkflowDefinition::new("wf", Version::new(1, 0, 0), "test workflow");
        for node in nodes {
            def = def.add_node(node);
        }
        def
    }

    #[test]
    fn test_diamond_shape() {
        let def = create_test_workflow(vec![
            NodeDefinition::new("a", "noop"),
            NodeDefinition::new("b", "noop").depends_on("a"),
            NodeDefinition::new("c", "noop").depends_on("a"),
            NodeDefinition::new("d", "noop").depends_on("b").depends_on("c"),
        ]);

        let graph = prepare(&def).unwrap();

        assert_eq!(graph.roots, vec![NodeId::new("a")]);
        assert_eq!(graph.sinks, vec![NodeId::new("d")]);
        assert_eq!(graph.ready[&NodeId::new("d")], 2);
        assert_eq!(graph.children[&NodeId::new("a")].len(), 2);

        let mut descendants = graph.descendants(&NodeId::new("a"));
        descendants.sort();
        assert_eq!(
            descendants,
            vec![NodeId::new("b"), NodeId::new("c"), NodeId::new("d")]
        );
    }

    #[test]
    fn test_cycle_rejected() {
        let def = create_test_workflow(vec![
            NodeDefinition::new("a", "noop").depends_on("b"),
            NodeDefinition::new("b", "noop").depends_on("a"),
        ]);

        let err = prepare(&def).unwrap_err();
        assert!(matches!(err, WeftError::InvalidGraph(_)));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let def = create_test_workflow(vec![NodeDefinition::new("a", "noop").depends_on("a")]);
        assert!(matches!(prepare(&def), Err(WeftError::InvalidGraph(_))));
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let def = create_test_workflow(vec![NodeDefinition::new("a", "noop").depends_on("ghost")]);

        let err = prepare(&def).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_duplicate_node_id_rejected() {
        let def = create_test_workflow(vec![
            NodeDefinition::new("a", "noop"),
            NodeDefinition::new("a", "noop"),
        ]);

        let err = prepare(&def).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_empty_graph_is_valid() {
        let def = create_test_workflow(vec![]);
        let graph = prepare(&def).unwrap();
        assert_eq!(graph.node_count(), 0);
        assert!(graph.roots.is_empty());
    }
}
