//! Parallel schedule derivation
//!
//! A schedule is a forest: one tree per component root (a stage that depends
//! on nothing). Each tree node's children are the stages that depend on it.
//! Children run in parallel once their parent has completed.
//!
//! Stages with several dependencies (diamonds) appear once per path. The
//! executor deduplicates them at run time.

use crate::graph::{Edge, Graph, Node};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Schedule tree node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub node: Node,
    /// Executed in parallel after `node`.
    /// A sequential schedule is a chain of single-child schedules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Schedule>,
}

impl Schedule {
    pub fn leaf(node: impl Into<Node>) -> Self {
        Self {
            node: node.into(),
            children: Vec::new(),
        }
    }

    pub fn with_children(node: impl Into<Node>, children: Vec<Schedule>) -> Self {
        Self {
            node: node.into(),
            children,
        }
    }

    /// Longest root-to-leaf chain, counted in nodes
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(Schedule::depth).max().unwrap_or(0)
    }

    fn collect_nodes(&self, out: &mut BTreeSet<Node>) {
        out.insert(self.node);
        for c in &self.children {
            c.collect_nodes(out);
        }
    }
}

/// Schedule forest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRoot {
    pub children: Vec<Schedule>,
}

impl ScheduleRoot {
    pub fn new(children: Vec<Schedule>) -> Self {
        Self { children }
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Distinct nodes anywhere in the forest, ascending
    pub fn distinct_nodes(&self) -> BTreeSet<Node> {
        let mut nodes = BTreeSet::new();
        for c in &self.children {
            c.collect_nodes(&mut nodes);
        }
        nodes
    }

    /// Graph implied by the forest: each child depends on its parent
    ///
    /// For a forest derived from an acyclic graph this recovers every edge
    /// reachable from a root, including all parents of a duplicated node.
    pub fn dependency_graph(&self) -> Graph {
        fn walk(s: &Schedule, g: &mut Graph) {
            g.add_node(s.node);
            for c in &s.children {
                g.add_edge(Edge::new(c.node, s.node));
                walk(c, g);
            }
        }

        let mut g = Graph::new();
        for c in &self.children {
            walk(c, &mut g);
        }
        g
    }

    /// Indented text rendering; `label` turns a node into display text
    pub fn render_with<F>(&self, label: F) -> String
    where
        F: Fn(Node) -> String,
    {
        fn walk<F>(s: &Schedule, depth: usize, label: &F, out: &mut Vec<String>)
        where
            F: Fn(Node) -> String,
        {
            let indent = "   ".repeat(depth.saturating_sub(1));
            let marker = if depth == 0 { "" } else { "└─ " };
            out.push(format!("{}{}{}", indent, marker, label(s.node)));
            for c in &s.children {
                walk(c, depth + 1, label, out);
            }
        }

        let mut lines = Vec::new();
        for c in &self.children {
            walk(c, 0, &label, &mut lines);
        }
        lines.join("\n")
    }

    pub fn render(&self) -> String {
        self.render_with(|n| format!("stage {}", n))
    }
}

/// Number of distinct nodes in the forest
pub fn count_nodes(root: &ScheduleRoot) -> usize {
    root.distinct_nodes().len()
}

/// Derive the schedule forest from a (possibly disconnected) graph
pub fn determine_schedule(g: &Graph) -> ScheduleRoot {
    let mut root = ScheduleRoot::default();
    for r in g.component_roots() {
        if let Some(sub) = g.subgraph(r) {
            let mut path = BTreeSet::new();
            root.children.push(schedule_from(&sub, r, &mut path));
        }
    }
    debug!(trees = root.children.len(), "determined schedule:\n{}", root.render());
    root
}

/// Schedule tree rooted at `node` within `g` (the closure of `node`'s dependers)
fn schedule_from(g: &Graph, node: Node, path: &mut BTreeSet<Node>) -> Schedule {
    path.insert(node);
    let mut sched = Schedule::leaf(node);
    for depender in g.dependers(node) {
        if path.contains(&depender) {
            warn!(%node, %depender, "dependency cycle, skipping back-edge");
            continue;
        }
        if let Some(sub) = g.subgraph(depender) {
            sched.children.push(schedule_from(&sub, depender, path));
        }
    }
    path.remove(&node);
    sched
}
