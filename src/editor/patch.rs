//! Line/column addressed multi-edit patches.
//!
//! Record shape: `filepath|startLine,startCol|endLine,endCol|content`, with
//! 1-indexed coordinates. The span keeps the start line's prefix before
//! `startCol` and the end line's suffix from `endCol`, so `2,1|2,1` is a pure
//! insertion at the head of line 2. Records are applied bottom-up so earlier
//! edits never shift the coordinates of later ones.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use tracing::debug;

use crate::error::{ToolError, ToolErrorCode, ToolResult};
use crate::sandbox::SandboxGuard;

/// Zero-indexed position; parsed from and displayed as 1-indexed `line,col`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position {
    pub line: usize,
    pub col: usize,
}

impl FromStr for Position {
    type Err = ToolError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let Some((line, col)) = raw.split_once(',') else {
            return Err(ToolError::parse(format!(
                "position `{raw}` must look like `line,col`"
            )));
        };
        Ok(Self {
            line: parse_coordinate(line, raw)?,
            col: parse_coordinate(col, raw)?,
        })
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.line + 1, self.col + 1)
    }
}

fn parse_coordinate(value: &str, raw: &str) -> ToolResult<usize> {
    let n = value.trim().parse::<usize>().map_err(|_| {
        ToolError::parse(format!("position `{raw}` has a non-numeric coordinate"))
    })?;
    n.checked_sub(1)
        .ok_or_else(|| ToolError::parse(format!("position `{raw}` is 1-indexed, got 0")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchCommand {
    pub filepath: String,
    pub start: Position,
    pub end: Position,
    pub content: String,
}

impl PatchCommand {
    pub fn parse(record: &str) -> ToolResult<Self> {
        let mut parts = record.splitn(4, '|');
        let (Some(filepath), Some(start), Some(end)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ToolError::parse(format!(
                "patch record `{}` must look like `filepath|line,col|line,col|content`",
                preview(record)
            )));
        };
        let content = parts.next().unwrap_or_default();
        let filepath = filepath.trim();
        if filepath.is_empty() {
            return Err(ToolError::parse("patch record has an empty filepath"));
        }

        let start = start.parse::<Position>()?;
        let end = end.parse::<Position>()?;
        if end < start {
            return Err(ToolError::parse(format!(
                "patch record for `{filepath}` ends at {end} before it starts at {start}"
            )));
        }
        Ok(Self {
            filepath: filepath.to_owned(),
            start,
            end,
            content: content.to_owned(),
        })
    }
}

impl fmt::Display for PatchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.filepath, self.start, self.end)
    }
}

/// Splits a bulk patch on `delimiter` and parses every non-empty record.
pub fn parse_batch(text: &str, delimiter: &str) -> ToolResult<Vec<PatchCommand>> {
    text.split(delimiter)
        .filter(|record| !record.trim().is_empty())
        .enumerate()
        .map(|(index, record)| {
            PatchCommand::parse(record).map_err(|err| {
                ToolError::parse(format!("record #{}: {}", index + 1, err.message))
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PatchSummary {
    pub records: usize,
    pub written: usize,
    pub deleted: usize,
}

impl fmt::Display for PatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "successfully wrote {}, deleted {}", self.written, self.deleted)
    }
}

/// First failing record of a batch plus what was committed before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchError {
    /// 1-based position of the record in the submitted batch.
    pub index: usize,
    pub record: String,
    pub applied: PatchSummary,
    pub source: ToolError,
}

impl PatchError {
    pub fn code(&self) -> ToolErrorCode {
        self.source.code
    }
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "patch record #{} (`{}`) failed: {}",
            self.index, self.record, self.source.message
        )?;
        if self.applied.records > 0 {
            write!(
                f,
                "; {} earlier record(s) were already applied (wrote {}, deleted {})",
                self.applied.records, self.applied.written, self.applied.deleted
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for PatchError {}

#[derive(Debug, Clone)]
pub struct PatchEngine {
    guard: SandboxGuard,
    delimiter: String,
}

impl PatchEngine {
    pub fn new(guard: SandboxGuard, delimiter: impl Into<String>) -> Self {
        Self {
            guard,
            delimiter: delimiter.into(),
        }
    }

    pub fn parse(&self, text: &str) -> ToolResult<Vec<PatchCommand>> {
        parse_batch(text, &self.delimiter)
    }

    /// Applies `batch` bottom-up, stopping at the first record that fails.
    pub fn patch(&self, batch: &[PatchCommand]) -> Result<PatchSummary, PatchError> {
        let mut order = (0..batch.len()).collect::<Vec<_>>();
        order.sort_by(|a, b| batch[*b].start.cmp(&batch[*a].start));

        let mut summary = PatchSummary::default();
        for index in order {
            let command = &batch[index];
            match self.apply(command) {
                Ok((written, deleted)) => {
                    summary.records += 1;
                    summary.written += written;
                    summary.deleted += deleted;
                }
                Err(source) => {
                    return Err(PatchError {
                        index: index + 1,
                        record: command.to_string(),
                        applied: summary,
                        source,
                    })
                }
            }
        }
        Ok(summary)
    }

    fn apply(&self, command: &PatchCommand) -> ToolResult<(usize, usize)> {
        let resolved = self.guard.resolve(&command.filepath)?;
        let original = std::fs::read_to_string(&resolved).map_err(|err| {
            ToolError::io(format!(
                "failed reading file {}: {err}",
                self.guard.display(&resolved)
            ))
        })?;
        let updated = splice(&original, command.start, command.end, &command.content)?;
        std::fs::write(&resolved, updated.as_bytes()).map_err(|err| {
            ToolError::io(format!(
                "failed writing file {}: {err}",
                self.guard.display(&resolved)
            ))
        })?;

        let before = original.chars().count();
        let after = updated.chars().count();
        let written = command.content.chars().count();
        debug!(
            "patched {} at {}..{} ({} -> {} chars)",
            self.guard.display(&resolved),
            command.start,
            command.end,
            before,
            after
        );
        Ok((written, before + written - after))
    }
}

/// Replaces the span `start..end` of `original` with `content`.
pub fn splice(original: &str, start: Position, end: Position, content: &str) -> ToolResult<String> {
    let lines = original.split_inclusive('\n').collect::<Vec<_>>();
    let prefix_end = offset_in(&lines, start)?;
    let suffix_start = offset_in(&lines, end)?;

    let mut out = String::with_capacity(original.len() + content.len());
    for line in &lines[..start.line] {
        out.push_str(line);
    }
    out.push_str(&lines[start.line][..prefix_end]);
    out.push_str(content);
    out.push_str(&lines[end.line][suffix_start..]);
    for line in &lines[end.line + 1..] {
        out.push_str(line);
    }
    Ok(out)
}

fn offset_in(lines: &[&str], at: Position) -> ToolResult<usize> {
    let Some(line) = lines.get(at.line) else {
        return Err(ToolError::out_of_range(format!(
            "line {} is past the end of the file ({} lines)",
            at.line + 1,
            lines.len()
        )));
    };
    let chars = line.chars().count();
    if at.col == chars {
        return Ok(line.len());
    }
    line.char_indices()
        .nth(at.col)
        .map(|(offset, _)| offset)
        .ok_or_else(|| {
            ToolError::out_of_range(format!(
                "column {} is past the end of line {} ({} characters)",
                at.col + 1,
                at.line + 1,
                chars
            ))
        })
}

fn preview(record: &str) -> String {
    let first = record.lines().next().unwrap_or_default();
    if first.chars().count() > 80 {
        format!("{}...", first.chars().take(80).collect::<String>())
    } else {
        first.to_owned()
    }
}
