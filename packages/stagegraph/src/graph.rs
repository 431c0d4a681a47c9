//! Stage dependency graph
//!
//! Nodes are dense, zero-based stage indices. An edge `(depender, dependee)`
//! means the depender stage can only start once the dependee has been built.
//!
//! Both node and edge lists are kept sorted and unique, so two graphs built
//! from the same edges compare equal regardless of insertion order.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

/// Stage identifier (index of the stage in the build definition)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Node(pub usize);

impl Node {
    pub fn index(self) -> usize {
        self.0
    }
}

impl From<usize> for Node {
    fn from(index: usize) -> Self {
        Node(index)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Directed dependency edge
///
/// Field order matters: the derived ordering sorts by depender first, then
/// dependee.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Edge {
    /// Stage that requires the other one
    pub depender: Node,
    /// Stage that must complete first
    pub dependee: Node,
}

impl Edge {
    pub fn new(depender: impl Into<Node>, dependee: impl Into<Node>) -> Self {
        Self {
            depender: depender.into(),
            dependee: dependee.into(),
        }
    }

    pub fn is_self_loop(&self) -> bool {
        self.depender == self.dependee
    }
}

/// Append-only dependency graph
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from nodes and edges in any order
    pub fn from_parts(
        nodes: impl IntoIterator<Item = Node>,
        edges: impl IntoIterator<Item = Edge>,
    ) -> Self {
        let mut g = Self::new();
        for n in nodes {
            g.add_node(n);
        }
        for e in edges {
            g.add_edge(e);
        }
        g
    }

    /// Insert a node, keeping the node list sorted. No-op if already present.
    pub fn add_node(&mut self, node: Node) {
        if let Err(pos) = self.nodes.binary_search(&node) {
            self.nodes.insert(pos, node);
        }
    }

    /// Insert an edge and both of its endpoints. No-op if already present.
    pub fn add_edge(&mut self, edge: Edge) {
        if let Err(pos) = self.edges.binary_search(&edge) {
            self.edges.insert(pos, edge);
        }
        self.add_node(edge.depender);
        self.add_node(edge.dependee);
    }

    pub fn has_node(&self, node: Node) -> bool {
        self.nodes.binary_search(&node).is_ok()
    }

    pub fn has_edge(&self, edge: Edge) -> bool {
        self.edges.binary_search(&edge).is_ok()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes that depend on `node`, ascending. `node` itself is never included
    /// even when a self-loop exists.
    pub fn dependers(&self, node: Node) -> Vec<Node> {
        self.edges
            .iter()
            .filter(|e| e.dependee == node && e.depender != node)
            .map(|e| e.depender)
            .collect()
    }

    /// Nodes that `node` depends on, ascending.
    pub fn dependees(&self, node: Node) -> Vec<Node> {
        let start = self.edges.partition_point(|e| e.depender < node);
        self.edges[start..]
            .iter()
            .take_while(|e| e.depender == node)
            .filter(|e| e.dependee != node)
            .map(|e| e.dependee)
            .collect()
    }

    /// Nodes that depend on nothing (never a depender), ascending
    pub fn component_roots(&self) -> Vec<Node> {
        let dependers: BTreeSet<Node> = self.edges.iter().map(|e| e.depender).collect();
        self.nodes
            .iter()
            .filter(|n| !dependers.contains(n))
            .copied()
            .collect()
    }

    /// Everything that transitively depends on `root`, including `root`
    ///
    /// The result is a fresh graph holding only the discovered nodes and the
    /// edges among them. Returns `None` if `root` is not part of this graph.
    pub fn subgraph(&self, root: Node) -> Option<Graph> {
        if !self.has_node(root) {
            return None;
        }

        let mut reached = BTreeSet::from([root]);
        let mut queue = VecDeque::from([root]);
        while let Some(current) = queue.pop_front() {
            for depender in self.dependers(current) {
                if reached.insert(depender) {
                    queue.push_back(depender);
                }
            }
        }

        let mut sub = Graph::new();
        for &n in &reached {
            sub.add_node(n);
        }
        for e in &self.edges {
            if reached.contains(&e.depender) && reached.contains(&e.dependee) {
                sub.add_edge(*e);
            }
        }
        Some(sub)
    }

    /// First dependency cycle found, as a closed path (`a -> b -> a`)
    ///
    /// Self-loops are reported as `[n, n]`.
    pub fn find_cycle(&self) -> Option<Vec<Node>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unseen,
            OnPath,
            Done,
        }

        let mut marks = std::collections::HashMap::new();
        for &n in &self.nodes {
            marks.insert(n, Mark::Unseen);
        }

        for &start in &self.nodes {
            if marks[&start] != Mark::Unseen {
                continue;
            }
            // Iterative DFS along depender -> dependee edges
            let mut path: Vec<Node> = vec![start];
            let mut pending: Vec<Vec<Node>> = vec![self.dependees_with_loops(start)];
            marks.insert(start, Mark::OnPath);

            while let Some(next) = pending.last_mut().and_then(|stack| stack.pop()) {
                match marks[&next] {
                    Mark::OnPath => {
                        let from = path.iter().position(|&n| n == next).unwrap_or(0);
                        let mut cycle = path[from..].to_vec();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Mark::Done => {}
                    Mark::Unseen => {
                        marks.insert(next, Mark::OnPath);
                        path.push(next);
                        pending.push(self.dependees_with_loops(next));
                    }
                }
                while pending.last().map_or(false, |stack| stack.is_empty()) {
                    pending.pop();
                    if let Some(done) = path.pop() {
                        marks.insert(done, Mark::Done);
                    }
                }
            }
            for n in path.drain(..) {
                marks.insert(n, Mark::Done);
            }
        }
        None
    }

    /// Dependees of `node` including itself on a self-loop, descending so
    /// that popping yields them in ascending order
    fn dependees_with_loops(&self, node: Node) -> Vec<Node> {
        let start = self.edges.partition_point(|e| e.depender < node);
        let end = self.edges.partition_point(|e| e.depender <= node);
        self.edges[start..end].iter().rev().map(|e| e.dependee).collect()
    }
}
