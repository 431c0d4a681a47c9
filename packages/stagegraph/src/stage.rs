//! Stage extraction
//!
//! Splits a parsed build definition into stages. A stage starts at each
//! base-image instruction (`FROM`) and records:
//! - its declared name (`FROM image AS name`), if any
//! - the stages it copies from (`COPY --from=<ref>`), plus an earlier stage
//!   used as its base image
//!
//! References that do not name a local stage (e.g. `COPY --from=nginx:latest`)
//! are kept as dependency strings but never resolve to a stage.

use crate::error::{Result, SchedulerError};
use crate::instruction::{Instruction, InstructionTree};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

const FROM: &str = "from";
const COPY: &str = "copy";
const FROM_FLAG: &str = "--from";

/// One build stage, prior to graph construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Instructions of this stage only, starting with its `FROM`.
    /// Dependency stages are not included, so this cannot be built directly.
    pub instructions: Vec<Instruction>,
    /// Declared name, lowercased. `None` for anonymous stages.
    pub name: Option<String>,
    /// References found in this stage, in document order
    pub dependencies: Vec<String>,
    /// Line of the opening `FROM`, 1-based
    pub start_line: usize,
    /// Last line belonging to this stage (inclusive)
    pub end_line: usize,
}

impl Stage {
    fn open(from: &Instruction) -> Self {
        Self {
            instructions: vec![from.clone()],
            name: parse_stage_name(from),
            dependencies: Vec::new(),
            start_line: from.start_line,
            end_line: from.end_line,
        }
    }

    /// Human-readable label for logs and plans
    pub fn label(&self, index: usize) -> String {
        match &self.name {
            Some(name) => format!("#{} ({})", index, name),
            None => format!("#{}", index),
        }
    }

    /// Cut this stage's line range out of the original build-definition text
    pub fn source(&self, text: &str) -> String {
        let start = self.start_line.saturating_sub(1);
        let len = self.end_line.saturating_sub(start);
        text.lines().skip(start).take(len).collect::<Vec<_>>().join("\n")
    }
}

/// Name declared by a trailing `AS <name>` clause
///
/// A missing or malformed clause yields `None`.
pub fn parse_stage_name(from: &Instruction) -> Option<String> {
    match from.values.as_slice() {
        [_image, as_kw, name, ..] if as_kw.eq_ignore_ascii_case("as") && !name.is_empty() => {
            Some(name.to_ascii_lowercase())
        }
        _ => None,
    }
}

/// Reference from a `--from=<ref>` or `--from <ref>` flag
pub fn parse_dependency(copy: &Instruction) -> Option<String> {
    for flag in &copy.flags {
        if flag == FROM_FLAG {
            return copy.values.first().filter(|v| !v.is_empty()).cloned();
        }
        if let Some(reference) = flag.strip_prefix("--from=") {
            if reference.is_empty() {
                return None;
            }
            return Some(reference.to_string());
        }
    }
    None
}

/// Split the instruction tree into stages, in document order
pub fn parse_stages(tree: &InstructionTree) -> Vec<Stage> {
    let mut stages: Vec<Stage> = Vec::new();
    let mut current: Option<Stage> = None;

    for inst in &tree.children {
        if inst.is(FROM) {
            if let Some(mut done) = current.take() {
                done.end_line = inst.start_line.saturating_sub(1).max(done.start_line);
                stages.push(done);
            }
            let mut stage = Stage::open(inst);
            if let Some(base) = inst.values.first() {
                let base = base.to_ascii_lowercase();
                if stages.iter().any(|s| s.name.as_deref() == Some(base.as_str())) {
                    stage.dependencies.push(base);
                }
            }
            current = Some(stage);
            continue;
        }

        let Some(stage) = current.as_mut() else {
            debug!(
                directive = %inst.directive,
                line = inst.start_line,
                "instruction before first stage, not assigned to any stage"
            );
            continue;
        };

        if inst.is(COPY) {
            if let Some(dep) = parse_dependency(inst) {
                stage.dependencies.push(dep);
            }
        }
        stage.end_line = inst.end_line;
        stage.instructions.push(inst.clone());
    }

    if let Some(done) = current.take() {
        stages.push(done);
    }
    stages
}

/// Resolves dependency references to stage indices
pub struct StageIndex {
    by_name: HashMap<String, usize>,
    len: usize,
}

impl StageIndex {
    pub fn new(stages: &[Stage]) -> Self {
        let mut by_name = HashMap::new();
        for (i, stage) in stages.iter().enumerate() {
            if let Some(name) = &stage.name {
                // First declaration wins
                by_name.entry(name.clone()).or_insert(i);
            }
        }
        Self {
            by_name,
            len: stages.len(),
        }
    }

    /// Declared names first, then a numeric stage index
    pub fn resolve(&self, reference: &str) -> Option<usize> {
        if let Some(&idx) = self.by_name.get(&reference.to_ascii_lowercase()) {
            return Some(idx);
        }
        if !reference.is_empty() && reference.bytes().all(|b| b.is_ascii_digit()) {
            return reference.parse::<usize>().ok().filter(|&i| i < self.len);
        }
        None
    }
}

/// Instructions needed to build stage `idx`: every stage it transitively
/// depends on (each once, dependencies first), then the stage itself
pub fn stage_with_dependencies(stages: &[Stage], idx: usize) -> Result<Vec<Instruction>> {
    Ok(dependency_order(stages, idx)?
        .into_iter()
        .flat_map(|i| stages[i].instructions.iter().cloned())
        .collect())
}

/// Stage indices needed to build stage `idx`, dependencies first, ending with `idx`
pub fn dependency_order(stages: &[Stage], idx: usize) -> Result<Vec<usize>> {
    if idx >= stages.len() {
        return Err(SchedulerError::UnknownStage(idx));
    }
    let index = StageIndex::new(stages);
    let mut visited = vec![false; stages.len()];
    let mut order = Vec::new();
    collect_dependencies(stages, &index, idx, &mut visited, &mut order);
    Ok(order)
}

fn collect_dependencies(
    stages: &[Stage],
    index: &StageIndex,
    idx: usize,
    visited: &mut [bool],
    order: &mut Vec<usize>,
) {
    if visited[idx] {
        return;
    }
    visited[idx] = true;
    for dep in &stages[idx].dependencies {
        // External images are not stages
        if let Some(dep_idx) = index.resolve(dep) {
            collect_dependencies(stages, index, dep_idx, visited, order);
        }
    }
    order.push(idx);
}
