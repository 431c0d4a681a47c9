/*
 * Stagegraph - Multi-Stage Build Scheduler
 *
 * Turns a multi-stage build definition into a dependency graph of stages and
 * runs it with maximal parallelism.
 *
 * Architecture:
 * - Instruction reader (line continuations, flags, JSON form)
 * - Stage extraction (names, --from references, line ranges)
 * - Dependency graph (canonical, cycle-checked)
 * - Schedule forest (one tree per component root)
 * - Executor (exactly-once per stage, bounded concurrency, cancellation)
 */

// Public modules
pub mod builder;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod instruction;
pub mod pipeline;
pub mod schedule;
pub mod single_flight;
pub mod stage;

// Re-exports
pub use builder::create_dag;
pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError};
pub use executor::{execute_schedule, ExecutionReport, NodeState, ScheduleExecutor};
pub use graph::{Edge, Graph, Node};
pub use instruction::{parse, Instruction, InstructionTree};
pub use pipeline::{BuildPlan, StageBuilder, StageContext};
pub use schedule::{count_nodes, determine_schedule, Schedule, ScheduleRoot};
pub use single_flight::{Abandoned, FlightStatus, SingleFlight};
pub use stage::{parse_stages, stage_with_dependencies, Stage, StageIndex};
