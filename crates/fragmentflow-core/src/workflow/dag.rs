//! Node dependency graph, cycle detection, and parallel wave computation.
//!
//! Edges come from two places: explicit `dependencies` on each node, and
//! the source side of every `Connection` targeting a node. Connections from
//! the seeded `input`/`global` namespaces are not edges.

use std::collections::{HashMap, HashSet};

use fragmentflow_types::workflow::WorkflowDefinition;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use super::validator::ValidationError;

/// Directed graph of node ids, edge from dependency -> dependent.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph from explicit dependencies and connection edges.
    ///
    /// Fails if a dependency or a connection endpoint names a node that
    /// does not exist. Does not check for cycles.
    pub fn build(workflow: &WorkflowDefinition) -> Result<Self, ValidationError> {
        let mut graph = DiGraph::<String, ()>::new();
        let mut index = HashMap::new();
        for node in &workflow.nodes {
            if index.contains_key(&node.id) {
                return Err(ValidationError::DuplicateNode(node.id.clone()));
            }
            let idx = graph.add_node(node.id.clone());
            index.insert(node.id.clone(), idx);
        }

        for node in &workflow.nodes {
            let to = index[&node.id];
            for dep in &node.dependencies {
                let from = index.get(dep).ok_or_else(|| ValidationError::UnknownDependency {
                    node_id: node.id.clone(),
                    dependency: dep.clone(),
                })?;
                graph.update_edge(*from, to, ());
            }
        }

        for conn in &workflow.connections {
            let to = *index
                .get(&conn.target.node_id)
                .ok_or_else(|| ValidationError::UnknownNode {
                    connection_id: conn.id.clone(),
                    node_id: conn.target.node_id.clone(),
                })?;
            if conn.source.is_seeded() {
                continue;
            }
            let from = *index
                .get(&conn.source.node_id)
                .ok_or_else(|| ValidationError::UnknownNode {
                    connection_id: conn.id.clone(),
                    node_id: conn.source.node_id.clone(),
                })?;
            graph.update_edge(from, to, ());
        }

        Ok(Self { graph, index })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Resolved dependencies of a node (explicit and connection-inferred).
    pub fn predecessors(&self, node_id: &str) -> Vec<&str> {
        self.neighbors(node_id, Direction::Incoming)
    }

    /// Nodes that depend on `node_id`.
    pub fn successors(&self, node_id: &str) -> Vec<&str> {
        self.neighbors(node_id, Direction::Outgoing)
    }

    fn neighbors(&self, node_id: &str, dir: Direction) -> Vec<&str> {
        let Some(&idx) = self.index.get(node_id) else {
            return Vec::new();
        };
        let mut out: Vec<NodeIndex> = self.graph.neighbors_directed(idx, dir).collect();
        // petgraph yields neighbors newest-edge-first; keep definition order.
        out.sort();
        out.into_iter().map(|i| self.graph[i].as_str()).collect()
    }

    /// Number of unresolved dependencies per node, the seed for Kahn's algorithm.
    pub fn in_degrees(&self) -> HashMap<String, usize> {
        self.graph
            .node_indices()
            .map(|i| {
                let deg = self
                    .graph
                    .neighbors_directed(i, Direction::Incoming)
                    .count();
                (self.graph[i].clone(), deg)
            })
            .collect()
    }

    /// Nodes with no dependencies, in definition order.
    pub fn entry_nodes(&self) -> Vec<&str> {
        self.graph
            .node_indices()
            .filter(|&i| {
                self.graph
                    .neighbors_directed(i, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|i| self.graph[i].as_str())
            .collect()
    }

    /// Depth-first search with a recursion stack.
    ///
    /// Returns the cycle as a path of node ids, first node repeated at the
    /// end (e.g. `["a", "b", "a"]`), or `None` for an acyclic graph.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut on_stack: HashSet<NodeIndex> = HashSet::new();

        for start in self.graph.node_indices() {
            if visited.contains(&start) {
                continue;
            }
            // Explicit stack of (node, remaining successors) frames.
            let mut path: Vec<NodeIndex> = vec![start];
            let mut frames: Vec<Vec<NodeIndex>> = vec![self.sorted_successors(start)];
            visited.insert(start);
            on_stack.insert(start);

            while let Some(frame) = frames.last_mut() {
                match frame.pop() {
                    Some(next) if on_stack.contains(&next) => {
                        let pos = path.iter().position(|&n| n == next).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[pos..].iter().map(|&i| self.graph[i].clone()).collect();
                        cycle.push(self.graph[next].clone());
                        return Some(cycle);
                    }
                    Some(next) if visited.contains(&next) => {}
                    Some(next) => {
                        visited.insert(next);
                        on_stack.insert(next);
                        path.push(next);
                        frames.push(self.sorted_successors(next));
                    }
                    None => {
                        frames.pop();
                        if let Some(done) = path.pop() {
                            on_stack.remove(&done);
                        }
                    }
                }
            }
        }
        None
    }

    // Reversed so that `pop()` visits successors in definition order.
    fn sorted_successors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut next: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        next.sort();
        next.reverse();
        next
    }

    /// Group nodes into waves where every node's dependencies lie in earlier
    /// waves. The executor logs this as the run's plan but admits nodes
    /// individually as soon as their own dependencies finish.
    pub fn execution_waves(&self) -> Result<Vec<Vec<String>>, ValidationError> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            ValidationError::CyclicGraph {
                path: vec![self.graph[cycle.node_id()].clone()],
            }
        })?;

        let mut depths: HashMap<NodeIndex, usize> = HashMap::new();
        for &idx in &sorted {
            let depth = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .map(|dep| depths.get(&dep).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            depths.insert(idx, depth);
        }

        let max_depth = depths.values().copied().max().unwrap_or(0);
        let mut waves: Vec<Vec<String>> = vec![Vec::new(); max_depth + 1];
        for idx in self.graph.node_indices() {
            waves[depths[&idx]].push(self.graph[idx].clone());
        }
        if self.is_empty() {
            waves.clear();
        }
        Ok(waves)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
