//! DAG construction and build-time validation.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::EngineError;
use crate::node::{InputSource, NodeRegistry};
use crate::state::ExecutionState;

/// Predicate over the post-node execution state, returning an outcome label.
pub type RouterFn = dyn Fn(&ExecutionState) -> String + Send + Sync;

/// Conditional edge: maps the router function's outcome label to one of N
/// successor nodes.
#[derive(Clone)]
pub struct Router {
    decide: Arc<RouterFn>,
    outcomes: HashMap<String, String>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("outcomes", &self.outcomes)
            .finish_non_exhaustive()
    }
}

impl Router {
    pub fn new(
        decide: impl Fn(&ExecutionState) -> String + Send + Sync + 'static,
        outcomes: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self {
            decide: Arc::new(decide),
            outcomes: outcomes.into_iter().collect(),
        }
    }

    /// Successor chosen for the current state, if the outcome label is known.
    pub fn route(&self, state: &ExecutionState) -> Option<&str> {
        let label = (self.decide)(state);
        self.outcomes.get(&label).map(String::as_str)
    }

    pub fn successors(&self) -> impl Iterator<Item = &String> {
        self.outcomes.values()
    }
}

/// A validated DAG: named nodes, directed edges, one entry node, and
/// optional routers. Construction goes through [`GraphBuilder::build`],
/// which performs all structural checks, so a `FlowGraph` in hand is
/// sound to schedule.
#[derive(Clone, Debug)]
pub struct FlowGraph {
    name: String,
    nodes: Vec<String>,
    edges: HashMap<String, Vec<String>>,
    entry: String,
    routers: HashMap<String, Router>,
}

impl FlowGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.iter().any(|node| node == name)
    }

    pub fn successors(&self, name: &str) -> &[String] {
        self.edges.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn router(&self, name: &str) -> Option<&Router> {
        self.routers.get(name)
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.successors(from).iter().any(|succ| succ == to)
    }

    /// Incoming-edge counts for Kahn scheduling.
    pub(crate) fn in_degrees(&self) -> HashMap<String, usize> {
        let mut degrees: HashMap<String, usize> =
            self.nodes.iter().map(|node| (node.clone(), 0)).collect();
        for targets in self.edges.values() {
            for target in targets {
                if let Some(degree) = degrees.get_mut(target) {
                    *degree += 1;
                }
            }
        }
        degrees
    }
}

/// Assembles a [`FlowGraph`] and validates it against the node registry.
pub struct GraphBuilder {
    name: String,
    nodes: Vec<String>,
    edges: Vec<(String, String)>,
    entry: Option<String>,
    routers: HashMap<String, Router>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            entry: None,
            routers: HashMap::new(),
        }
    }

    pub fn add_node(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.nodes.contains(&name) {
            self.nodes.push(name);
        }
        self
    }

    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    pub fn set_entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    /// Attach a conditional router after `from`. Every outcome's successor
    /// also becomes an edge of the graph, so the cycle check covers all
    /// branches.
    pub fn add_router(
        mut self,
        from: impl Into<String>,
        decide: impl Fn(&ExecutionState) -> String + Send + Sync + 'static,
        outcomes: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        let from = from.into();
        let outcomes: HashMap<String, String> = outcomes
            .into_iter()
            .map(|(label, target)| (label.into(), target.into()))
            .collect();
        for target in outcomes.values() {
            self.edges.push((from.clone(), target.clone()));
        }
        self.routers.insert(
            from,
            Router {
                decide: Arc::new(decide),
                outcomes,
            },
        );
        self
    }

    pub fn build(self, registry: &NodeRegistry) -> Result<FlowGraph, EngineError> {
        let name = self.name;

        for node in &self.nodes {
            if !registry.contains(node) {
                return Err(EngineError::UnknownNode(node.clone()));
            }
        }

        let entry = self.entry.ok_or_else(|| EngineError::MissingEntry(name.clone()))?;
        if !self.nodes.contains(&entry) {
            return Err(EngineError::UnknownEdgeTarget {
                graph: name,
                target: entry,
            });
        }

        let mut edges: HashMap<String, Vec<String>> = HashMap::new();
        for (from, to) in &self.edges {
            for endpoint in [from, to] {
                if !self.nodes.contains(endpoint) {
                    return Err(EngineError::UnknownEdgeTarget {
                        graph: name,
                        target: endpoint.clone(),
                    });
                }
            }
            let targets = edges.entry(from.clone()).or_default();
            if !targets.contains(to) {
                targets.push(to.clone());
            }
        }

        // Input bindings must resolve within this graph: non-entry nodes
        // declare exactly one upstream producer, or a join over several.
        for node in &self.nodes {
            let spec = registry
                .get(node)
                .ok_or_else(|| EngineError::UnknownNode(node.clone()))?;
            match &spec.input_source {
                InputSource::Entry => {
                    if node != &entry {
                        return Err(EngineError::InvalidConfiguration(format!(
                            "node '{node}' reads the entry payload but is not the entry of graph '{name}'"
                        )));
                    }
                }
                InputSource::Upstream(upstream) => {
                    if !self.nodes.contains(upstream) {
                        return Err(EngineError::MissingUpstream {
                            node: node.clone(),
                            upstream: upstream.clone(),
                        });
                    }
                }
                InputSource::Join(upstreams) => {
                    for upstream in upstreams {
                        if !self.nodes.contains(upstream) {
                            return Err(EngineError::MissingUpstream {
                                node: node.clone(),
                                upstream: upstream.clone(),
                            });
                        }
                    }
                }
            }
        }

        let graph = FlowGraph {
            name,
            nodes: self.nodes,
            edges,
            entry,
            routers: self.routers,
        };
        graph_is_acyclic(&graph)?;
        Ok(graph)
    }
}

/// Depth-first cycle check over all edges, router branches included.
fn graph_is_acyclic(graph: &FlowGraph) -> Result<(), EngineError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    fn visit(
        graph: &FlowGraph,
        node: &str,
        marks: &mut HashMap<String, Mark>,
    ) -> Result<(), EngineError> {
        match marks.get(node).copied().unwrap_or(Mark::Unvisited) {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                return Err(EngineError::CyclicGraph {
                    graph: graph.name().to_string(),
                    node: node.to_string(),
                });
            }
            Mark::Unvisited => {}
        }
        marks.insert(node.to_string(), Mark::InProgress);
        for successor in graph.successors(node) {
            visit(graph, successor, marks)?;
        }
        marks.insert(node.to_string(), Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for node in graph.nodes() {
        visit(graph, node, &mut marks)?;
    }
    Ok(())
}
