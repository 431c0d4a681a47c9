//! Minimal build-definition reader
//!
//! Turns build-definition text into a flat list of instructions carrying the
//! fields the scheduler consumes: directive, flags, values and line bounds.
//! It is not a full grammar: variable expansion, heredocs and per-instruction
//! validation belong to the image builder.

use crate::error::{Result, SchedulerError};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ESCAPE: char = '\\';

/// Directives whose shell form is kept as a single value
const SHELL_FORM_DIRECTIVES: &[&str] = &["run", "cmd", "entrypoint", "shell", "healthcheck"];

/// One parsed instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    /// Lowercased directive keyword (`from`, `copy`, ...)
    pub directive: String,
    /// Leading `--flag` / `--flag=value` words, in order
    pub flags: Vec<String>,
    /// Remaining arguments, in order
    pub values: Vec<String>,
    /// First source line, 1-based
    pub start_line: usize,
    /// Last source line (inclusive)
    pub end_line: usize,
    /// Instruction text with continuations joined
    pub original: String,
}

impl Instruction {
    pub fn is(&self, directive: &str) -> bool {
        self.directive.eq_ignore_ascii_case(directive)
    }

    /// S-expression rendering, e.g. `(copy ["--from=foo"] "/a" "/b")`
    pub fn dump(&self) -> String {
        let mut out = format!("({}", self.directive);
        if !self.flags.is_empty() {
            let flags: Vec<String> = self.flags.iter().map(|f| format!("{:?}", f)).collect();
            out.push_str(&format!(" [{}]", flags.join(" ")));
        }
        for v in &self.values {
            out.push_str(&format!(" {:?}", v));
        }
        out.push(')');
        out
    }
}

/// Parsed build definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionTree {
    pub children: Vec<Instruction>,
}

impl InstructionTree {
    pub fn new(children: Vec<Instruction>) -> Self {
        Self { children }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn dump(&self) -> String {
        self.children
            .iter()
            .map(Instruction::dump)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Parse build-definition text into an instruction tree
pub fn parse(text: &str) -> Result<InstructionTree> {
    let lines: Vec<&str> = text.lines().collect();
    let (escape, first_line) = read_parser_directives(&lines)?;

    let mut children = Vec::new();
    let mut idx = first_line;
    while idx < lines.len() {
        let trimmed = lines[idx].trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            idx += 1;
            continue;
        }

        let start_line = idx + 1;
        let mut joined = String::new();
        let mut end_line = start_line;
        let mut current = trimmed.to_string();
        loop {
            match strip_continuation(&current, escape) {
                Some(head) => {
                    joined.push_str(head);
                    joined.push(' ');
                    idx += 1;
                    // Comments and blank lines inside a continuation are dropped
                    while idx < lines.len() && is_skippable(lines[idx]) {
                        idx += 1;
                    }
                    if idx >= lines.len() {
                        break;
                    }
                    end_line = idx + 1;
                    current = lines[idx].trim().to_string();
                }
                None => {
                    joined.push_str(&current);
                    idx += 1;
                    break;
                }
            }
        }

        children.push(parse_instruction(joined.trim(), start_line, end_line));
    }

    Ok(InstructionTree { children })
}

fn is_skippable(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

fn strip_continuation(line: &str, escape: char) -> Option<&str> {
    line.strip_suffix(escape).map(str::trim_end)
}

/// Reads `# escape=` style directives at the top of the file.
/// Returns the escape character and the index of the first line after them.
fn read_parser_directives(lines: &[&str]) -> Result<(char, usize)> {
    let mut escape = DEFAULT_ESCAPE;
    let mut idx = 0;
    while idx < lines.len() {
        let Some(body) = lines[idx].trim().strip_prefix('#') else {
            break;
        };
        let Some((key, value)) = body.split_once('=') else {
            break;
        };
        let key = key.trim().to_ascii_lowercase();
        if key.contains(char::is_whitespace) || key.is_empty() {
            break;
        }
        if key == "escape" {
            escape = match value.trim() {
                "\\" => '\\',
                "`" => '`',
                other => {
                    return Err(SchedulerError::parse(format!(
                        "invalid escape token '{}' on line {}: must be ` or \\",
                        other,
                        idx + 1
                    )))
                }
            };
        }
        idx += 1;
    }
    Ok((escape, idx))
}

fn parse_instruction(text: &str, start_line: usize, end_line: usize) -> Instruction {
    let (keyword, rest) = match text.split_once(char::is_whitespace) {
        Some((k, r)) => (k, r.trim_start()),
        None => (text, ""),
    };
    let directive = keyword.to_ascii_lowercase();

    let mut flags = Vec::new();
    let mut rest = rest;
    while rest.starts_with("--") {
        let (flag, tail) = match rest.split_once(char::is_whitespace) {
            Some((f, t)) => (f, t.trim_start()),
            None => (rest, ""),
        };
        flags.push(flag.to_string());
        rest = tail;
    }

    let values = if let Some(json) = parse_json_form(rest) {
        json
    } else if SHELL_FORM_DIRECTIVES.contains(&directive.as_str()) {
        if rest.is_empty() {
            Vec::new()
        } else {
            vec![rest.to_string()]
        }
    } else {
        rest.split_whitespace().map(str::to_string).collect()
    };

    Instruction {
        directive,
        flags,
        values,
        start_line,
        end_line,
        original: text.to_string(),
    }
}

fn parse_json_form(rest: &str) -> Option<Vec<String>> {
    if !rest.starts_with('[') {
        return None;
    }
    serde_json::from_str::<Vec<String>>(rest).ok()
}
