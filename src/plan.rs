use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::core::{CapabilityId, Params, Request};
use crate::engine::{Node, State};
use crate::error::PlanError;
use crate::registry::{Capability, Registry};

/// The execution plan of a single request.
///
/// A `Plan` is a DAG with one [`Node`] per capability in the dependency
/// closure of the request. Edges point from a producer to its dependents.
/// Nodes are stored in registration order, which makes building a plan
/// deterministic: the same registry and request always yield the same plan.
///
/// Once the scheduler has finished with it, a plan is read-only.
pub struct Plan {
    pub(crate) graph: Graph<Node, ()>,
    pub(crate) params: Arc<Params>,
    layers: Vec<Vec<NodeIndex>>,
    index: HashMap<CapabilityId, NodeIndex>,
}

impl Plan {
    /// Builds the plan for `request`.
    ///
    /// 1. Computes the closure of the requested capabilities under "depends on".
    /// 2. Creates one node per member and wires each node to its dependencies.
    /// 3. Rejects cycles, naming the capabilities along the cycle.
    /// 4. Computes a topological layering for inspection.
    pub fn build(registry: &Registry, request: &Request) -> Result<Self, PlanError> {
        let members = closure(registry, request.capabilities())?;

        let mut graph = Graph::with_capacity(members.len(), members.len());
        let mut index = HashMap::with_capacity(members.len());

        for capability in members {
            let id = capability.id.clone();
            let node = graph.add_node(Node::new(capability));
            index.insert(id, node);
        }

        let nodes: Vec<NodeIndex> = graph.node_indices().collect();
        for node in nodes {
            let dependencies: Vec<NodeIndex> = graph[node]
                .capability
                .dependencies
                .iter()
                .map(|dep| index[dep])
                .collect();

            for &dependency in &dependencies {
                graph.add_edge(dependency, node, ());
            }

            graph[node].dependencies = dependencies;
        }

        detect_cycle(&graph)?;
        let layers = layering(&graph);

        tracing::debug!(
            "planned {} capabilities in {} layers",
            graph.node_count(),
            layers.len()
        );

        Ok(Self {
            graph,
            params: request.shared_params(),
            layers,
            index,
        })
    }

    /// Nodes in plan order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_indices().map(|index| &self.graph[index])
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&index| &self.graph[index])
    }

    pub fn state(&self, id: &str) -> Option<&State> {
        self.node(id).map(Node::state)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Topological layering: every node's dependencies sit in strictly
    /// earlier layers.
    pub fn layers(&self) -> Vec<Vec<&CapabilityId>> {
        self.layers
            .iter()
            .map(|layer| layer.iter().map(|&index| self.graph[index].id()).collect())
            .collect()
    }

    pub fn layer_of(&self, id: &str) -> Option<usize> {
        let index = *self.index.get(id)?;
        self.layers.iter().position(|layer| layer.contains(&index))
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Whether every node reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.nodes().all(|node| node.state().is_terminal())
    }
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("layers", &self.layers())
            .field("params", &self.params)
            .finish()
    }
}

/// Renders the plan as a Mermaid flowchart.
impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let name = self.graph[index].id().replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {:?} --> {:?}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

/// Requested capabilities plus everything they transitively depend on, in
/// registration order.
fn closure(
    registry: &Registry,
    requested: &[CapabilityId],
) -> Result<Vec<Arc<Capability>>, PlanError> {
    let mut included: HashSet<CapabilityId> = HashSet::new();
    let mut stack: Vec<Arc<Capability>> = Vec::new();

    for id in requested {
        let capability = registry.lookup(id)?;
        if included.insert(capability.id.clone()) {
            stack.push(capability.clone());
        }
    }

    let mut members = Vec::new();
    while let Some(capability) = stack.pop() {
        for dep in &capability.dependencies {
            let dependency = registry.lookup(dep)?;
            if included.insert(dependency.id.clone()) {
                stack.push(dependency.clone());
            }
        }
        members.push(capability);
    }

    members.sort_by_key(|capability| registry.position(&capability.id));
    Ok(members)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Grey,
    Black,
}

/// Three-colour depth-first search along dependency edges.
fn detect_cycle(graph: &Graph<Node, ()>) -> Result<(), PlanError> {
    let mut marks = vec![Mark::White; graph.node_count()];
    let mut path = Vec::new();

    for start in graph.node_indices() {
        if marks[start.index()] == Mark::White {
            visit(graph, start, &mut marks, &mut path)?;
        }
    }

    Ok(())
}

fn visit(
    graph: &Graph<Node, ()>,
    node: NodeIndex,
    marks: &mut [Mark],
    path: &mut Vec<NodeIndex>,
) -> Result<(), PlanError> {
    marks[node.index()] = Mark::Grey;
    path.push(node);

    for &dependency in &graph[node].dependencies {
        match marks[dependency.index()] {
            Mark::White => visit(graph, dependency, marks, path)?,
            Mark::Grey => {
                // back edge, the cycle is the tail of the current path
                let start = path.iter().position(|&n| n == dependency).unwrap_or(0);
                let mut cycle: Vec<CapabilityId> = path[start..]
                    .iter()
                    .map(|&n| graph[n].id().clone())
                    .collect();
                cycle.push(graph[dependency].id().clone());

                return Err(PlanError::CyclicDependency { cycle });
            }
            Mark::Black => {}
        }
    }

    path.pop();
    marks[node.index()] = Mark::Black;
    Ok(())
}

fn layering(graph: &Graph<Node, ()>) -> Vec<Vec<NodeIndex>> {
    let mut placed = vec![false; graph.node_count()];
    let mut layers: Vec<Vec<NodeIndex>> = Vec::new();
    let mut remaining = graph.node_count();

    while remaining > 0 {
        let layer: Vec<NodeIndex> = graph
            .node_indices()
            .filter(|&node| !placed[node.index()])
            .filter(|&node| {
                graph[node]
                    .dependencies
                    .iter()
                    .all(|dep| placed[dep.index()])
            })
            .collect();

        if layer.is_empty() {
            break;
        }

        for node in &layer {
            placed[node.index()] = true;
        }

        remaining -= layer.len();
        layers.push(layer);
    }

    layers
}
