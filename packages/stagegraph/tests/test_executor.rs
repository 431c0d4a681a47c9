//! Integration tests for schedule execution
//!
//! Covers:
//! - Exactly-once execution of duplicated nodes
//! - Partial order across the forest
//! - Error short-circuit and first-error reporting
//! - Cancellation of a running build

use async_trait::async_trait;
use parking_lot::Mutex;
use stagegraph::{
    execute_schedule, BuildPlan, Node, NodeState, Schedule, ScheduleExecutor, ScheduleRoot,
    SchedulerConfig, SchedulerError, StageBuilder, StageContext,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 0 -> 2 -> {4, 5}, 1 -> 3 -> {5}
fn duplicated_forest() -> ScheduleRoot {
    ScheduleRoot::new(vec![
        Schedule::with_children(
            0,
            vec![Schedule::with_children(
                2,
                vec![Schedule::leaf(4), Schedule::leaf(5)],
            )],
        ),
        Schedule::with_children(1, vec![Schedule::with_children(3, vec![Schedule::leaf(5)])]),
    ])
}

fn position(order: &[Node], n: usize) -> usize {
    order
        .iter()
        .position(|&x| x == Node(n))
        .unwrap_or_else(|| panic!("node {} missing from {:?}", n, order))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_once_under_duplication() {
    for _ in 0..20 {
        let counts = Arc::new(Mutex::new(HashMap::<Node, usize>::new()));
        let c = counts.clone();

        let report = execute_schedule(&duplicated_forest(), 0, move |n, _| {
            let c = c.clone();
            async move {
                *c.lock().entry(n).or_default() += 1;
                tokio::task::yield_now().await;
                Ok(n.index() * 10)
            }
        })
        .await
        .unwrap();

        let counts = counts.lock();
        assert_eq!(counts.len(), 6);
        assert!(counts.values().all(|&c| c == 1), "{:?}", *counts);
        assert_eq!(report.outputs.get(&Node(5)), Some(&50));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partial_order_respected() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let o = order.clone();

    execute_schedule(&duplicated_forest(), 0, move |n, _| {
        let o = o.clone();
        async move {
            // odd nodes finish slower so interleavings vary
            let delay = if n.index() % 2 == 1 { 15 } else { 3 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            o.lock().push(n);
            Ok(())
        }
    })
    .await
    .unwrap();

    let order = order.lock().clone();
    assert_eq!(order.len(), 6);
    assert!(position(&order, 0) < position(&order, 2));
    assert!(position(&order, 2) < position(&order, 4));
    assert!(position(&order, 2) < position(&order, 5));
    assert!(position(&order, 3) < position(&order, 5));
    assert!(position(&order, 1) < position(&order, 3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_error_short_circuit() {
    let invoked = Arc::new(Mutex::new(Vec::new()));
    let seen = invoked.clone();

    let result = execute_schedule(&duplicated_forest(), 0, move |n, _| {
        let seen = seen.clone();
        async move {
            seen.lock().push(n);
            if n == Node(2) {
                anyhow::bail!("exit code 137");
            }
            Ok(())
        }
    })
    .await;

    let invoked = invoked.lock().clone();
    assert!(!invoked.contains(&Node(4)));
    assert!(!invoked.contains(&Node(5)));
    assert!(invoked.contains(&Node(1)));
    assert!(invoked.contains(&Node(3)));

    match result {
        Err(SchedulerError::StageFailed { node, error }) => {
            assert_eq!(node, Node(2));
            assert_eq!(error.to_string(), "exit code 137");
        }
        other => panic!("expected failure of stage 2, got {:?}", other.map(|r| r.outputs.len())),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_report_states_after_failure() {
    let report = ScheduleExecutor::new(2)
        .execute_detailed(&duplicated_forest(), |n, _| async move {
            if n == Node(3) {
                anyhow::bail!("no space left on device");
            }
            Ok(())
        })
        .await;

    assert_eq!(report.parallelism, 2);
    assert_eq!(report.state(Node(3)), NodeState::Failed);
    assert_eq!(report.state(Node(4)), NodeState::Succeeded);
    assert_eq!(report.state(Node(5)), NodeState::Skipped);
    assert!(!report.outputs.contains_key(&Node(5)));
    assert!(report.error.unwrap().is_stage_failure());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_running_build() {
    let token = CancellationToken::new();
    let started = Arc::new(AtomicUsize::new(0));
    let s = started.clone();

    let executor = ScheduleExecutor::new(0).with_cancellation(token.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let report = executor
        .execute_detailed(&duplicated_forest(), move |_, cancel| {
            let s = s.clone();
            async move {
                s.fetch_add(1, Ordering::SeqCst);
                tokio::select! {
                    _ = cancel.cancelled() => anyhow::bail!("interrupted"),
                    _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(()),
                }
            }
        })
        .await;
    canceller.await.unwrap();

    // only the two roots ever started; their children were never scheduled
    assert_eq!(started.load(Ordering::SeqCst), 2);
    assert!(report.error.is_some());
    assert_eq!(report.state(Node(2)), NodeState::Unvisited);
    assert!(report.duration < Duration::from_secs(5));
}

struct ImageBuilder {
    calls: AtomicUsize,
}

#[async_trait]
impl StageBuilder for ImageBuilder {
    async fn build_stage(
        &self,
        ctx: StageContext,
        _cancel: CancellationToken,
    ) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(format!(
            "{}@{}",
            ctx.name.unwrap_or_else(|| "anonymous".to_string()),
            ctx.instructions.len()
        ))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_build_plan_end_to_end() {
    let text = "FROM alpine AS base
RUN apk add build-base
FROM base AS lib
RUN make lib
FROM base AS bin
RUN make bin
FROM scratch
COPY --from=lib /lib /lib
COPY --from=bin /bin /bin
";
    let plan = BuildPlan::from_dockerfile(text).unwrap();
    let builder = Arc::new(ImageBuilder {
        calls: AtomicUsize::new(0),
    });

    let config = SchedulerConfig::default().with_parallelism(2);
    let report = plan.execute(&config, builder.clone()).await.unwrap();

    assert!(report.is_success());
    assert_eq!(builder.calls.load(Ordering::SeqCst), 4);
    assert_eq!(report.outputs[&Node(0)], "base@2");
    assert_eq!(report.outputs[&Node(1)], "lib@4");
    // base, lib, bin, then the final stage
    assert_eq!(report.outputs[&Node(3)], "anonymous@9");
}
