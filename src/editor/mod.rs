//! Code editor operations over the sandbox: line-range reads, an indentation
//! outline, whole-file writes and appends, multi-edit patches, and truncation.
//!
//! Each operation has a typed entry point and a `*_command` wrapper that
//! accepts the compact string protocol agents send.

mod patch;
mod read;
mod write;

use tracing::info;

use crate::config::EditorConfig;
use crate::error::{ToolError, ToolResult};
use crate::sandbox::SandboxGuard;

pub use patch::{PatchCommand, PatchEngine, PatchError, PatchSummary};
pub use read::{parse_read_request, parse_summary_request, read_lines, summarize};
pub use write::{clear_file, parse_write_request, tail_lines, write_file, WriteMode};

#[derive(Debug, Clone)]
pub struct CodeEditor {
    guard: SandboxGuard,
    patcher: PatchEngine,
    confirm_tail_lines: usize,
}

impl CodeEditor {
    pub fn new(guard: SandboxGuard, cfg: &EditorConfig) -> Self {
        Self {
            patcher: PatchEngine::new(guard.clone(), cfg.patch_delimiter.clone()),
            guard,
            confirm_tail_lines: cfg.confirm_tail_lines,
        }
    }

    pub fn guard(&self) -> &SandboxGuard {
        &self.guard
    }

    pub fn read(&self, filepath: &str, start: usize, end: usize) -> ToolResult<String> {
        read_lines(&self.guard, filepath, start, end)
    }

    pub fn read_command(&self, input: &str) -> ToolResult<String> {
        let (filepath, start, end) = parse_read_request(input)?;
        self.read(&filepath, start, end)
    }

    pub fn summary(
        &self,
        filepath: &str,
        depth: usize,
        parent: Option<&str>,
    ) -> ToolResult<String> {
        summarize(&self.guard, filepath, depth, parent)
    }

    pub fn summary_command(&self, input: &str) -> ToolResult<String> {
        let (filepath, depth, parent) = parse_summary_request(input)?;
        self.summary(&filepath, depth, parent.as_deref())
    }

    pub fn write(&self, filepath: &str, content: &str, mode: WriteMode) -> ToolResult<String> {
        let written = write_file(&self.guard, filepath, content, mode)?;
        info!(
            "{} {} bytes to {}",
            match mode {
                WriteMode::Overwrite => "wrote",
                WriteMode::Append => "appended",
            },
            written.len(),
            filepath
        );
        Ok(written)
    }

    /// Runs the write protocol and returns the confirmation text.
    pub fn write_command(&self, input: &str, mode: WriteMode) -> ToolResult<String> {
        let (filepath, content) = parse_write_request(input)?;
        let written = self.write(&filepath, &content, mode)?;
        Ok(format!(
            "Last {} line was:\n{}",
            self.confirm_tail_lines,
            tail_lines(&written, self.confirm_tail_lines)
        ))
    }

    pub fn patch(&self, batch: &[PatchCommand]) -> Result<PatchSummary, PatchError> {
        let summary = self.patcher.patch(batch)?;
        info!(
            "applied {} patch record(s): wrote {}, deleted {}",
            summary.records, summary.written, summary.deleted
        );
        Ok(summary)
    }

    /// Parses and applies a bulk patch; failures come back as text that names
    /// the failing record and the partial application.
    pub fn patch_command(&self, input: &str) -> ToolResult<PatchSummary> {
        let batch = self.patcher.parse(input)?;
        self.patch(&batch)
            .map_err(|err| ToolError::new(err.code(), err.to_string()))
    }

    pub fn delete(&self, filepath: &str) -> ToolResult<()> {
        clear_file(&self.guard, filepath.trim())?;
        info!("truncated {}", filepath.trim());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::EditorConfig;
    use crate::error::ToolErrorCode;
    use crate::sandbox::tests::temp_path;
    use crate::sandbox::SandboxGuard;

    use super::{CodeEditor, WriteMode};

    fn editor(tag: &str) -> CodeEditor {
        let guard = SandboxGuard::new(temp_path(tag)).expect("guard");
        CodeEditor::new(guard, &EditorConfig::default())
    }

    #[test]
    fn write_then_read_and_patch_through_protocols() {
        let editor = editor("editor-flow");
        let confirmation = editor
            .write_command("app.py\nimport os\n\nprint('hi')\n", WriteMode::Overwrite)
            .expect("write");
        assert_eq!(confirmation, "Last 3 line was:\n\nprint('hi')\n");

        editor
            .write_command("app.py\nprint('bye')\n", WriteMode::Append)
            .expect("append");
        assert_eq!(
            editor.read_command("app.py|3-4").expect("read"),
            "print('hi')\nprint('bye')\n"
        );

        let summary = editor
            .patch_command("app.py|3,8|3,10|hello")
            .expect("patch");
        assert_eq!(summary.to_string(), "successfully wrote 5, deleted 2");
        assert_eq!(editor.read("app.py", 3, 3).expect("read"), "print('hello')\n");

        assert_eq!(
            editor.summary_command("app.py|0").expect("summary"),
            "1: import os\n3: print('hello')\n4: print('bye')\n"
        );

        editor.delete("app.py").expect("delete");
        let err = editor.read("app.py", 1, 1).expect_err("empty file");
        assert_eq!(err.code, ToolErrorCode::OutOfRange);
    }

    #[test]
    fn patch_command_failure_keeps_code_and_context() {
        let editor = editor("editor-patch-fail");
        let err = editor
            .patch_command("nothing.py|1,1|1,1|x")
            .expect_err("missing file");
        assert_eq!(err.code, ToolErrorCode::Io);
        assert!(err.message.starts_with("patch record #1 (`nothing.py|1,1|1,1`) failed"));
    }
}
