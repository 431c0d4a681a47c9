//! Stagegraph CLI
//!
//! # Usage
//!
//! ```bash
//! # Print stages, dependency edges and the parallel schedule
//! cargo run --bin stagegraph -- plan Dockerfile
//!
//! # Same as JSON
//! cargo run --bin stagegraph -- plan Dockerfile --format json
//!
//! # Run the schedule with a builder that only sleeps
//! RUST_LOG=debug cargo run --bin stagegraph -- simulate Dockerfile --parallelism 2
//! ```

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use stagegraph::{
    BuildPlan, Graph, NodeState, ScheduleRoot, SchedulerConfig, Stage, StageBuilder, StageContext,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stagegraph")]
#[command(about = "Multi-stage build scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the build plan
    Plan {
        /// Build definition file
        file: PathBuf,

        #[arg(long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Execute the plan with a simulated builder
    Simulate {
        /// Build definition file
        file: PathBuf,

        /// Scheduler config (YAML, version 1)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the configured parallelism
        #[arg(short, long)]
        parallelism: Option<usize>,

        /// Cancel pending stages after the first failure
        #[arg(long)]
        fail_fast: bool,

        /// Simulated build time per instruction
        #[arg(long, default_value = "50")]
        delay_ms: u64,

        /// Make this stage (name or index) fail
        #[arg(long)]
        fail: Option<String>,
    },
}

#[derive(Serialize)]
struct PlanDump<'a> {
    stages: &'a [Stage],
    graph: &'a Graph,
    schedule: &'a ScheduleRoot,
}

/// Sleeps in proportion to the stage size instead of building anything
struct SimulatedBuilder {
    delay: Duration,
    fail: Option<String>,
}

impl SimulatedBuilder {
    /// `delay` per instruction, saturating at `Duration::MAX`
    fn build_time(&self, instructions: usize) -> Duration {
        let steps = u32::try_from(instructions).unwrap_or(u32::MAX);
        self.delay.saturating_mul(steps)
    }
}

#[async_trait]
impl StageBuilder for SimulatedBuilder {
    async fn build_stage(
        &self,
        ctx: StageContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<String> {
        let wanted = |f: &String| {
            let f = f.to_ascii_lowercase();
            ctx.name.as_deref() == Some(f.as_str()) || f == ctx.node.to_string()
        };
        tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("cancelled"),
            _ = tokio::time::sleep(self.build_time(ctx.instructions.len())) => {}
        }
        if self.fail.as_ref().map_or(false, wanted) {
            anyhow::bail!("simulated failure");
        }
        Ok(format!("sim:{}", ctx.node))
    }
}

fn load_plan(file: &Path) -> anyhow::Result<BuildPlan> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    Ok(BuildPlan::from_dockerfile(&text)?)
}

fn print_plan(plan: &BuildPlan, format: Format) -> anyhow::Result<()> {
    match format {
        Format::Json => {
            let dump = PlanDump {
                stages: plan.stages(),
                graph: plan.graph(),
                schedule: plan.schedule(),
            };
            println!("{}", serde_json::to_string_pretty(&dump)?);
        }
        Format::Text => {
            println!("Stages:");
            for (i, stage) in plan.stages().iter().enumerate() {
                println!(
                    "  {:<20} lines {}-{}  deps {:?}",
                    stage.label(i),
                    stage.start_line,
                    stage.end_line,
                    stage.dependencies
                );
            }
            println!("Edges:");
            for e in plan.graph().edges() {
                println!("  {} -> {}", e.depender, e.dependee);
            }
            println!("Schedule:");
            for line in plan.execution_plan().lines() {
                println!("  {}", line);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Plan { file, format } => {
            let plan = load_plan(&file)?;
            print_plan(&plan, format)?;
        }
        Commands::Simulate {
            file,
            config,
            parallelism,
            fail_fast,
            delay_ms,
            fail,
        } => {
            let mut cfg = match config {
                Some(path) => SchedulerConfig::from_yaml(&path)?,
                None => SchedulerConfig::default(),
            }
            .with_env_overrides()?;
            if let Some(p) = parallelism {
                cfg = cfg.with_parallelism(p);
            }
            if fail_fast {
                cfg = cfg.with_fail_fast(true);
            }

            let plan = load_plan(&file)?;
            let builder = Arc::new(SimulatedBuilder {
                delay: Duration::from_millis(delay_ms),
                fail,
            });
            let report = plan.execute(&cfg, builder).await?;

            for (node, state) in &report.states {
                let label = plan
                    .stages()
                    .get(node.index())
                    .map(|s| s.label(node.index()))
                    .unwrap_or_else(|| node.to_string());
                let output = report.outputs.get(node).map(String::as_str).unwrap_or("-");
                println!("{:<20} {:<10} {}", label, format!("{:?}", state), output);
            }
            let succeeded = report
                .states
                .values()
                .filter(|s| **s == NodeState::Succeeded)
                .count();
            info!(
                run_id = %report.run_id,
                succeeded,
                total = plan.stages().len(),
                elapsed = ?report.duration,
                "simulation finished"
            );

            if let Some(e) = report.error {
                return Err(e.into());
            }
        }
    }

    Ok(())
}
