use crate::graph::Node;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unknown stage index {0}")]
    UnknownStage(usize),

    #[error("DAG cycle detected: {}", format_cycle(.cycle))]
    DagCycleDetected { cycle: Vec<Node> },

    /// The stage callback returned an error. Every caller that waited on the
    /// same node observes the same shared error value.
    #[error("Stage {node} failed: {error}")]
    StageFailed {
        node: Node,
        error: Arc<anyhow::Error>,
    },

    #[error("Stage {0} cancelled before it started")]
    Cancelled(Node),

    #[error("Stage {node} skipped: dependency {dependency} did not succeed")]
    DependencyFailed { node: Node, dependency: Node },

    /// The task that claimed a node went away without publishing an outcome.
    #[error("Stage {0} abandoned by its executing task")]
    StageAbandoned(Node),

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SchedulerError {
    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    /// Node whose execution produced this error, if any
    pub fn node(&self) -> Option<Node> {
        match self {
            Self::StageFailed { node, .. }
            | Self::Cancelled(node)
            | Self::DependencyFailed { node, .. }
            | Self::StageAbandoned(node) => Some(*node),
            _ => None,
        }
    }

    /// True for errors raised by the stage callback itself
    pub fn is_stage_failure(&self) -> bool {
        matches!(self, Self::StageFailed { .. })
    }
}

fn format_cycle(cycle: &[Node]) -> String {
    cycle
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}
