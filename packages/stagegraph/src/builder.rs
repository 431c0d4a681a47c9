//! Stage list -> dependency graph

use crate::error::{Result, SchedulerError};
use crate::graph::{Edge, Graph, Node};
use crate::stage::{Stage, StageIndex};
use tracing::{debug, warn};

/// Build the stage dependency graph
///
/// One node per stage (node id = stage index), one edge per dependency that
/// resolves to a local stage. Unresolved references are treated as external
/// images and produce no edge. Cyclic references are rejected.
pub fn create_dag(stages: &[Stage]) -> Result<Graph> {
    let mut g = Graph::new();
    for i in 0..stages.len() {
        g.add_node(Node(i));
    }

    let index = StageIndex::new(stages);
    for (i, stage) in stages.iter().enumerate() {
        for dep in &stage.dependencies {
            match index.resolve(dep) {
                Some(dependee) => g.add_edge(Edge::new(i, dependee)),
                None => debug!(stage = i, reference = %dep, "external reference, no edge"),
            }
        }
    }

    if let Some(cycle) = g.find_cycle() {
        warn!(?cycle, "stage dependency cycle");
        return Err(SchedulerError::DagCycleDetected { cycle });
    }
    Ok(g)
}
