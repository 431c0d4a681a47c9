//! Concurrent schedule execution
//!
//! Walks the schedule forest, running a caller-supplied callback once per
//! distinct node:
//! - a node's children are spawned only after its callback succeeded
//! - a node reachable through several paths runs once, after every parent in
//!   the forest succeeded; other paths wait for and share its outcome
//! - at most `parallelism` callbacks run at the same time
//! - the first error wins; sibling subtrees already started run to completion

use crate::error::{Result, SchedulerError};
use crate::graph::{Graph, Node};
use crate::schedule::{count_nodes, Schedule, ScheduleRoot};
use crate::single_flight::{Abandoned, FlightStatus, SingleFlight};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-node execution state. Nodes never reached are `Unvisited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Unvisited,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// Not run because a dependency failed or was cancelled
    Skipped,
}

/// Cached outcome shared by every path that reaches a node
#[derive(Debug, Clone)]
enum NodeFailure {
    Failed(Arc<anyhow::Error>),
    Cancelled,
    DependencyFailed(Node),
}

type Outcome = std::result::Result<(), NodeFailure>;

impl NodeFailure {
    fn into_error(self, node: Node) -> SchedulerError {
        match self {
            NodeFailure::Failed(error) => SchedulerError::StageFailed { node, error },
            NodeFailure::Cancelled => SchedulerError::Cancelled(node),
            NodeFailure::DependencyFailed(dependency) => {
                SchedulerError::DependencyFailed { node, dependency }
            }
        }
    }
}

/// Result of one schedule execution
#[derive(Debug)]
pub struct ExecutionReport<T> {
    pub run_id: Uuid,
    /// Output of every node whose callback succeeded
    pub outputs: BTreeMap<Node, T>,
    /// Final state of every node that was reached
    pub states: BTreeMap<Node, NodeState>,
    /// Concurrency bound actually applied
    pub parallelism: usize,
    pub duration: Duration,
    /// First error observed, if any
    pub error: Option<SchedulerError>,
}

impl<T> ExecutionReport<T> {
    pub fn state(&self, node: Node) -> NodeState {
        self.states.get(&node).copied().unwrap_or(NodeState::Unvisited)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(mut self) -> Result<Self> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

/// Schedule executor configuration
#[derive(Debug, Clone)]
pub struct ScheduleExecutor {
    parallelism: usize,
    fail_fast: bool,
    cancel: CancellationToken,
}

impl ScheduleExecutor {
    /// `parallelism == 0` means one slot per distinct node
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism,
            fail_fast: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancel stages that have not started yet (and signal running ones)
    /// as soon as any stage fails
    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    /// Use a caller-owned token; cancelling it stops scheduling new stages
    ///
    /// Each run derives its own child token, so `fail_fast` never cancels
    /// the caller's token or later runs.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub async fn execute<F, Fut, T>(
        &self,
        root: &ScheduleRoot,
        exec: F,
    ) -> Result<ExecutionReport<T>>
    where
        F: Fn(Node, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + Sync + 'static,
    {
        self.execute_detailed(root, exec).await.into_result()
    }

    /// Like [`execute`](Self::execute), but always returns the report
    pub async fn execute_detailed<F, Fut, T>(
        &self,
        root: &ScheduleRoot,
        exec: F,
    ) -> ExecutionReport<T>
    where
        F: Fn(Node, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + Sync + 'static,
    {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let total = count_nodes(root);
        let parallelism = if self.parallelism == 0 {
            total.max(1)
        } else {
            self.parallelism
        };

        info!(%run_id, stages = total, parallelism, "executing schedule");

        let graph = root.dependency_graph();
        if let Some(cycle) = graph.find_cycle() {
            error!(%run_id, ?cycle, "schedule contains a dependency cycle");
            return ExecutionReport {
                run_id,
                outputs: BTreeMap::new(),
                states: BTreeMap::new(),
                parallelism,
                duration: started.elapsed(),
                error: Some(SchedulerError::DagCycleDetected { cycle }),
            };
        }

        let shared = Arc::new(Shared {
            exec,
            graph,
            permits: Semaphore::new(parallelism),
            flights: SingleFlight::new(),
            outputs: DashMap::new(),
            cancel: self.cancel.child_token(),
            fail_fast: self.fail_fast,
        });

        let mut tasks = JoinSet::new();
        for tree in &root.children {
            tasks.spawn(visit(shared.clone(), tree.clone()));
        }
        let error = join_first_error(&mut tasks).await;

        let mut states = BTreeMap::new();
        let mut outputs = BTreeMap::new();
        for node in shared.flights.keys() {
            states.insert(node, shared.state(node));
            if let Some((node, output)) = shared.outputs.remove(&node) {
                outputs.insert(node, output);
            }
        }

        let duration = started.elapsed();
        match &error {
            None => info!(%run_id, stages = outputs.len(), ?duration, "schedule completed"),
            Some(e) => error!(%run_id, error = %e, ?duration, "schedule failed"),
        }

        ExecutionReport {
            run_id,
            outputs,
            states,
            parallelism,
            duration,
            error,
        }
    }
}

/// Execute `root`, calling `exec` exactly once per distinct node
///
/// `parallelism` bounds concurrently running callbacks; 0 means one slot per
/// distinct node.
pub async fn execute_schedule<F, Fut, T>(
    root: &ScheduleRoot,
    parallelism: usize,
    exec: F,
) -> Result<ExecutionReport<T>>
where
    F: Fn(Node, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + Sync + 'static,
{
    ScheduleExecutor::new(parallelism).execute(root, exec).await
}

struct Shared<F, T> {
    exec: F,
    /// Forest parent/child relation; parents must succeed before a child runs
    graph: Graph,
    permits: Semaphore,
    flights: SingleFlight<Node, Outcome>,
    outputs: DashMap<Node, T>,
    /// Per-run token, child of the executor's token
    cancel: CancellationToken,
    fail_fast: bool,
}

impl<F, Fut, T> Shared<F, T>
where
    F: Fn(Node, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + Sync + 'static,
{
    /// Outcome of `node`, running it here if no other path has claimed it
    fn settle(
        self: Arc<Self>,
        node: Node,
    ) -> BoxFuture<'static, std::result::Result<Outcome, Abandoned>> {
        async move {
            let leader = self.clone();
            self.flights.run(node, move || leader.run_stage(node)).await
        }
        .boxed()
    }

    /// Runs the callback for `node`; only called by the claiming path
    async fn run_stage(self: Arc<Self>, node: Node) -> Outcome {
        for dep in self.graph.dependees(node) {
            match self.clone().settle(dep).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(Abandoned) => {
                    warn!(%node, dependency = %dep, "dependency did not succeed, stage skipped");
                    return Err(NodeFailure::DependencyFailed(dep));
                }
            }
        }

        if self.cancel.is_cancelled() {
            warn!(%node, "stage cancelled before start");
            return Err(NodeFailure::Cancelled);
        }

        let _permit = tokio::select! {
            permit = self.permits.acquire() => match permit {
                Ok(p) => p,
                Err(_) => return Err(NodeFailure::Cancelled),
            },
            _ = self.cancel.cancelled() => {
                warn!(%node, "stage cancelled while waiting for a slot");
                return Err(NodeFailure::Cancelled);
            }
        };

        debug!(%node, "stage started");
        let started = Instant::now();
        match (self.exec)(node, self.cancel.child_token()).await {
            Ok(output) => {
                self.outputs.insert(node, output);
                info!(%node, elapsed = ?started.elapsed(), "stage succeeded");
                Ok(())
            }
            Err(e) => {
                error!(%node, elapsed = ?started.elapsed(), error = %e, "stage failed");
                if self.fail_fast {
                    self.cancel.cancel();
                }
                Err(NodeFailure::Failed(Arc::new(e)))
            }
        }
    }

    fn state(&self, node: Node) -> NodeState {
        match self.flights.status(&node) {
            FlightStatus::Vacant => NodeState::Unvisited,
            FlightStatus::Running => NodeState::Running,
            FlightStatus::Done(Ok(())) => NodeState::Succeeded,
            FlightStatus::Done(Err(NodeFailure::Failed(_))) => NodeState::Failed,
            FlightStatus::Done(Err(NodeFailure::Cancelled)) => NodeState::Cancelled,
            FlightStatus::Done(Err(NodeFailure::DependencyFailed(_))) => NodeState::Skipped,
        }
    }
}

/// Run `sched.node` (or wait for whoever claimed it), then its children in parallel
fn visit<F, Fut, T>(shared: Arc<Shared<F, T>>, sched: Schedule) -> BoxFuture<'static, Result<()>>
where
    F: Fn(Node, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + Sync + 'static,
{
    async move {
        let node = sched.node;
        let outcome = shared
            .clone()
            .settle(node)
            .await
            .map_err(|_| SchedulerError::StageAbandoned(node))?;
        // Children of a failed node are never scheduled
        outcome.map_err(|failure| failure.into_error(node))?;

        if sched.children.is_empty() {
            return Ok(());
        }
        let mut tasks = JoinSet::new();
        for child in sched.children {
            tasks.spawn(visit(shared.clone(), child));
        }
        match join_first_error(&mut tasks).await {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
    .boxed()
}

/// Wait for every task; keep the first error to arrive
///
/// A stage failure replaces an earlier secondary error (cancellation or a
/// skipped stage) so the report names the stage that actually broke.
async fn join_first_error(tasks: &mut JoinSet<Result<()>>) -> Option<SchedulerError> {
    let mut first: Option<SchedulerError> = None;
    while let Some(joined) = tasks.join_next().await {
        let result = match joined {
            Ok(r) => r,
            Err(join_err) => Err(SchedulerError::TaskPanicked(join_err.to_string())),
        };
        if let Err(e) = result {
            match &first {
                None => first = Some(e),
                Some(prev) if !prev.is_stage_failure() && e.is_stage_failure() => first = Some(e),
                Some(_) => debug!(error = %e, "additional failure after first error"),
            }
        }
    }
    first
}
