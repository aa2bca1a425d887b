use crate::error::{ToolError, ToolResult};
use crate::sandbox::SandboxGuard;

/// Returns lines `start..=end` (1-indexed) with their line endings intact.
pub fn read_lines(
    guard: &SandboxGuard,
    filepath: &str,
    start: usize,
    end: usize,
) -> ToolResult<String> {
    if start > end {
        return Err(ToolError::invalid_args(format!(
            "start line {start} is after end line {end}"
        )));
    }
    let text = read_source(guard, filepath)?;
    let lines = text.split_inclusive('\n').collect::<Vec<_>>();
    if start == 0 || end > lines.len() {
        return Err(ToolError::out_of_range(format!(
            "lines {start}-{end} are outside {filepath} (1-{})",
            lines.len()
        )));
    }
    Ok(lines[start - 1..end].concat())
}

/// Parses `filepath|start-end`.
pub fn parse_read_request(input: &str) -> ToolResult<(String, usize, usize)> {
    let Some((filepath, range)) = input.trim_end_matches('\n').rsplit_once('|') else {
        return Err(ToolError::parse(format!(
            "read request `{input}` must look like `filepath|start-end`"
        )));
    };
    let Some((start, end)) = range.split_once('-') else {
        return Err(ToolError::parse(format!(
            "line range `{range}` must look like `start-end`"
        )));
    };
    let parse = |value: &str| {
        value
            .trim()
            .parse::<usize>()
            .map_err(|_| ToolError::parse(format!("line range `{range}` is not numeric")))
    };
    Ok((filepath.trim().to_owned(), parse(start)?, parse(end)?))
}

/// Outline of `filepath` as `"<lineNo>: <line>"` rows down to `depth`.
///
/// With `parent`, the outline starts at the first line containing that text
/// and `depth` counts from there.
pub fn summarize(
    guard: &SandboxGuard,
    filepath: &str,
    depth: usize,
    parent: Option<&str>,
) -> ToolResult<String> {
    let text = read_source(guard, filepath)?;
    let tree = CodeTree::from_source(&text);
    let nodes = match parent.filter(|p| !p.is_empty()) {
        None => tree.down_to(CodeTree::ROOT, depth),
        Some(needle) => {
            let Some(anchor) = tree.find(CodeTree::ROOT, needle) else {
                return Err(ToolError::invalid_args(format!(
                    "no line in {filepath} contains `{needle}`"
                )));
            };
            tree.down_to(anchor, depth)
        }
    };

    let mut out = String::new();
    for idx in nodes {
        let node = &tree.nodes[idx];
        out.push_str(&format!(
            "{}: {}\n",
            node.line_number,
            node.content.trim_end_matches(&['\r', '\n'][..])
        ));
    }
    Ok(out)
}

/// Parses `filepath|depth` or `filepath|depth|parentContent`.
pub fn parse_summary_request(input: &str) -> ToolResult<(String, usize, Option<String>)> {
    let mut parts = input.trim_end_matches('\n').splitn(3, '|');
    let filepath = parts.next().unwrap_or_default().trim();
    let Some(depth) = parts.next() else {
        return Err(ToolError::parse(format!(
            "summary request `{input}` must look like `filepath|depth[|parent]`"
        )));
    };
    let depth = depth.trim().parse::<usize>().map_err(|_| {
        ToolError::parse(format!(
            "depth `{}` is not a non-negative integer",
            depth.trim()
        ))
    })?;
    Ok((
        filepath.to_owned(),
        depth,
        parts.next().map(ToOwned::to_owned),
    ))
}

fn read_source(guard: &SandboxGuard, filepath: &str) -> ToolResult<String> {
    let resolved = guard.resolve(filepath)?;
    std::fs::read_to_string(&resolved).map_err(|err| {
        ToolError::io(format!(
            "failed reading file {}: {err}",
            guard.display(&resolved)
        ))
    })
}

#[derive(Debug)]
struct CodeLine {
    content: String,
    line_number: usize,
    indent: usize,
    depth: isize,
    children: Vec<usize>,
}

/// Indentation tree of the non-blank lines of a file, stored as an arena.
#[derive(Debug)]
pub struct CodeTree {
    nodes: Vec<CodeLine>,
}

impl CodeTree {
    const ROOT: usize = 0;

    pub fn from_source(text: &str) -> Self {
        let mut tree = Self {
            nodes: vec![CodeLine {
                content: "\n".to_owned(),
                line_number: 0,
                indent: 1,
                depth: -1,
                children: Vec::new(),
            }],
        };
        for (idx, line) in text.split_inclusive('\n').enumerate() {
            if !line.trim().is_empty() {
                tree.append(line, idx + 1);
            }
        }
        tree
    }

    fn append(&mut self, content: &str, line_number: usize) {
        let indent = leading_whitespace(content);

        // Walk the rightmost branch; attach under the deepest line that is
        // shallower than the new one.
        let mut parent = Self::ROOT;
        let mut parent_indent: isize = -1;
        for idx in self.rightmost_branch() {
            let node_indent = self.nodes[idx].indent as isize;
            if parent_indent < indent as isize && indent as isize <= node_indent {
                break;
            }
            parent = idx;
            parent_indent = node_indent;
        }

        let depth = self.nodes[parent].depth + 1;
        let idx = self.nodes.len();
        self.nodes.push(CodeLine {
            content: content.to_owned(),
            line_number,
            indent,
            depth,
            children: Vec::new(),
        });
        self.nodes[parent].children.push(idx);
    }

    fn rightmost_branch(&self) -> Vec<usize> {
        let mut branch = vec![Self::ROOT];
        let mut cursor = Self::ROOT;
        while let Some(&last) = self.nodes[cursor].children.last() {
            branch.push(last);
            cursor = last;
        }
        branch
    }

    /// Preorder nodes under `from` whose depth is within `depth` of it.
    /// The root itself is never listed.
    fn down_to(&self, from: usize, depth: usize) -> Vec<usize> {
        let limit = if from == Self::ROOT {
            depth as isize
        } else {
            depth as isize + self.nodes[from].depth
        };
        let mut out = Vec::new();
        self.collect(from, limit, &mut out);
        out.retain(|idx| *idx != Self::ROOT);
        out
    }

    fn collect(&self, idx: usize, limit: isize, out: &mut Vec<usize>) {
        let node = &self.nodes[idx];
        if node.depth > limit {
            return;
        }
        out.push(idx);
        for child in &node.children {
            self.collect(*child, limit, out);
        }
    }

    fn find(&self, idx: usize, needle: &str) -> Option<usize> {
        if idx != Self::ROOT && self.nodes[idx].content.contains(needle) {
            return Some(idx);
        }
        self.nodes[idx]
            .children
            .iter()
            .find_map(|child| self.find(*child, needle))
    }
}

fn leading_whitespace(content: &str) -> usize {
    content.chars().take_while(|c| c.is_whitespace()).count()
}
