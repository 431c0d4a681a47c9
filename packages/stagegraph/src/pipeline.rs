//! Build pipeline: build definition -> stages -> graph -> schedule -> execution

use crate::builder::create_dag;
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::executor::{ExecutionReport, ScheduleExecutor};
use crate::graph::{Graph, Node};
use crate::instruction::{parse, Instruction};
use crate::schedule::{determine_schedule, ScheduleRoot};
use crate::stage::{dependency_order, parse_stages, Stage};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything a builder needs to build one stage on its own
#[derive(Debug, Clone)]
pub struct StageContext {
    pub node: Node,
    pub name: Option<String>,
    /// References declared by this stage
    pub dependencies: Vec<String>,
    /// Instructions of every stage this one depends on (each once,
    /// dependencies first), followed by the stage's own instructions
    pub instructions: Vec<Instruction>,
    /// Build-definition text cut from the same stages, when the plan was
    /// created from text
    pub source: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
}

/// Stage builder trait (pluggable backends)
#[async_trait]
pub trait StageBuilder: Send + Sync {
    /// Build one stage and return the produced image identifier
    async fn build_stage(
        &self,
        ctx: StageContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<String>;
}

/// Parsed, validated and scheduled build definition
#[derive(Debug, Clone)]
pub struct BuildPlan {
    stages: Vec<Stage>,
    graph: Graph,
    schedule: ScheduleRoot,
    contexts: Arc<Vec<StageContext>>,
}

impl BuildPlan {
    pub fn from_dockerfile(text: &str) -> Result<Self> {
        let tree = parse(text)?;
        Self::build(parse_stages(&tree), Some(text))
    }

    pub fn from_stages(stages: Vec<Stage>) -> Result<Self> {
        Self::build(stages, None)
    }

    fn build(stages: Vec<Stage>, text: Option<&str>) -> Result<Self> {
        let graph = create_dag(&stages)?;
        let schedule = determine_schedule(&graph);

        let mut contexts = Vec::with_capacity(stages.len());
        for (i, stage) in stages.iter().enumerate() {
            let order = dependency_order(&stages, i)?;
            let instructions = order
                .iter()
                .flat_map(|&j| stages[j].instructions.iter().cloned())
                .collect();
            let source = text.map(|t| {
                order
                    .iter()
                    .map(|&j| stages[j].source(t))
                    .collect::<Vec<_>>()
                    .join("\n")
            });
            contexts.push(StageContext {
                node: Node(i),
                name: stage.name.clone(),
                dependencies: stage.dependencies.clone(),
                instructions,
                source,
                start_line: stage.start_line,
                end_line: stage.end_line,
            });
        }

        info!(
            stages = stages.len(),
            edges = graph.edges().len(),
            trees = schedule.children.len(),
            "build plan ready"
        );
        Ok(Self {
            stages,
            graph,
            schedule,
            contexts: Arc::new(contexts),
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn schedule(&self) -> &ScheduleRoot {
        &self.schedule
    }

    pub fn context(&self, node: Node) -> Option<&StageContext> {
        self.contexts.get(node.index())
    }

    /// Schedule rendered with stage labels
    pub fn execution_plan(&self) -> String {
        self.schedule.render_with(|n| match self.stages.get(n.index()) {
            Some(stage) => format!("stage {}", stage.label(n.index())),
            None => format!("stage {}", n),
        })
    }

    /// Run every stage through `builder`; the report maps node -> image id
    ///
    /// Fails early only on an invalid config. Stage failures are reported in
    /// `ExecutionReport::error`.
    pub async fn execute(
        &self,
        config: &SchedulerConfig,
        builder: Arc<dyn StageBuilder>,
    ) -> Result<ExecutionReport<String>> {
        self.execute_with(config, builder, CancellationToken::new()).await
    }

    pub async fn execute_with(
        &self,
        config: &SchedulerConfig,
        builder: Arc<dyn StageBuilder>,
        cancel: CancellationToken,
    ) -> Result<ExecutionReport<String>> {
        config.validate()?;
        let executor = ScheduleExecutor::new(config.effective_parallelism())
            .fail_fast(config.fail_fast)
            .with_cancellation(cancel);

        let contexts = self.contexts.clone();
        let report = executor
            .execute_detailed(&self.schedule, move |node, cancel| {
                let builder = builder.clone();
                let ctx = contexts.get(node.index()).cloned();
                async move {
                    let ctx = ctx.ok_or_else(|| anyhow::anyhow!("no stage for node {}", node))?;
                    builder.build_stage(ctx, cancel).await
                }
            })
            .await;
        Ok(report)
    }
}
