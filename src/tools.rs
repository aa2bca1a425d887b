use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::editor::{CodeEditor, WriteMode};
use crate::error::{ToolError, ToolErrorCode, ToolResult};
use crate::sandbox::SandboxGuard;
use crate::terminal::{ExitReason, Supervisor};

pub const TOOL_NAMES: &[&str] = &[
    "terminal",
    "code_editor.read",
    "code_editor.summary",
    "code_editor.write",
    "code_editor.append",
    "code_editor.patch",
    "code_editor.delete",
];

#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    #[serde(alias = "tool", alias = "toolName")]
    pub tool_name: String,
    #[serde(default)]
    pub input: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolTranscriptEntry {
    pub tool_name: String,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<&'static str>,
}

/// Tool output plus, for the terminal, how the command ended.
struct ToolOutcome {
    text: String,
    exit_reason: Option<ExitReason>,
}

impl From<String> for ToolOutcome {
    fn from(text: String) -> Self {
        Self {
            text,
            exit_reason: None,
        }
    }
}

/// Dispatches agent tool calls by name and turns every outcome into text.
pub struct ToolHost {
    editor: CodeEditor,
    supervisor: Supervisor,
    transcript_limit: usize,
    transcript: Mutex<VecDeque<ToolTranscriptEntry>>,
}

impl ToolHost {
    pub fn new(cfg: &Config) -> ToolResult<Arc<Self>> {
        let guard = SandboxGuard::new(&cfg.sandbox.root)?;
        Ok(Arc::new(Self::with_parts(
            CodeEditor::new(guard.clone(), &cfg.editor),
            Supervisor::new(&guard, &cfg.terminal),
            cfg.tools.transcript_limit,
        )))
    }

    pub fn with_parts(editor: CodeEditor, supervisor: Supervisor, transcript_limit: usize) -> Self {
        Self {
            editor,
            supervisor,
            transcript_limit,
            transcript: Mutex::new(VecDeque::new()),
        }
    }

    /// Runs one tool call. Failures come back as `error[<code>]: <message>`.
    pub async fn invoke(&self, request: ToolRequest) -> String {
        match self.execute(request).await {
            Ok(output) => output,
            Err(err) => err.to_string(),
        }
    }

    pub async fn execute(&self, request: ToolRequest) -> ToolResult<String> {
        let started_at_ms = now_ms();
        let tool_name = normalize_tool_name(&request.tool_name);
        let result = if tool_name.is_empty() {
            Err(ToolError::invalid_args("tool_name must be a non-empty string"))
        } else {
            self.execute_inner(&tool_name, &request.input).await
        };

        match &result {
            Ok(outcome) => debug!("tool `{tool_name}` ok ({} bytes)", outcome.text.len()),
            Err(err) => warn!("tool `{tool_name}` failed: {err}"),
        }
        let exit_reason = result.as_ref().ok().and_then(|outcome| outcome.exit_reason);
        self.record_transcript(started_at_ms, &tool_name, result.as_ref().err(), exit_reason)
            .await;
        result.map(|outcome| outcome.text)
    }

    pub async fn transcript(&self) -> Vec<ToolTranscriptEntry> {
        self.transcript.lock().await.iter().cloned().collect()
    }

    async fn execute_inner(&self, tool_name: &str, input: &str) -> ToolResult<ToolOutcome> {
        let text = match tool_name {
            "terminal" => return self.execute_terminal(input).await,
            "code_editor.read" => self.editor.read_command(input),
            "code_editor.summary" => self.editor.summary_command(input),
            "code_editor.write" => self.editor.write_command(input, WriteMode::Overwrite),
            "code_editor.append" => self.editor.write_command(input, WriteMode::Append),
            "code_editor.patch" => self
                .editor
                .patch_command(input)
                .map(|summary| summary.to_string()),
            "code_editor.delete" => self.editor.delete(input).map(|()| "success".to_owned()),
            _ => Err(ToolError::new(
                ToolErrorCode::UnsupportedTool,
                format!(
                    "unsupported tool `{tool_name}` (expected one of: {})",
                    TOOL_NAMES.join(", ")
                ),
            )),
        };
        text.map(ToolOutcome::from)
    }

    async fn execute_terminal(&self, input: &str) -> ToolResult<ToolOutcome> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ToolError::invalid_args("terminal input must be a shell command"));
        }
        // A JSON array of strings is a command list run in one shell; anything
        // else, including `[ -f x ]` tests, is a raw command.
        let result = match command_list(trimmed) {
            Some(commands) => self.supervisor.execute_all(&commands).await,
            None => self.supervisor.execute(input).await,
        };
        Ok(ToolOutcome {
            text: result.render(),
            exit_reason: Some(result.reason),
        })
    }

    async fn record_transcript(
        &self,
        started_at_ms: u64,
        tool_name: &str,
        error: Option<&ToolError>,
        exit_reason: Option<ExitReason>,
    ) {
        // A command that did not run to completion counts as a failed call.
        let process_code = match exit_reason {
            None | Some(ExitReason::Exited) => None,
            Some(ExitReason::Error) => Some("process_error"),
            Some(other) => Some(other.as_str()),
        };
        let error_code = error.map(|value| value.code.as_str()).or(process_code);
        let mut guard = self.transcript.lock().await;
        guard.push_back(ToolTranscriptEntry {
            tool_name: tool_name.to_owned(),
            started_at_ms,
            finished_at_ms: now_ms(),
            status: if error_code.is_none() { "ok" } else { "error" },
            error_code,
            exit_reason: exit_reason.map(ExitReason::as_str),
        });
        while guard.len() > self.transcript_limit {
            guard.pop_front();
        }
    }
}

fn command_list(input: &str) -> Option<Vec<String>> {
    if !input.starts_with('[') {
        return None;
    }
    serde_json::from_str::<Vec<String>>(input).ok()
}

/// Lowercases, maps `-` to `_`, and folds legacy names onto the canonical set.
pub fn normalize_tool_name(value: &str) -> String {
    let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
    let normalized = match normalized.strip_prefix("codeeditor.") {
        Some(op) => format!("code_editor.{op}"),
        None => normalized,
    };
    match normalized.as_str() {
        "bash" | "shell" | "exec" => "terminal".to_owned(),
        _ => normalized,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::{Config, EditorConfig, TerminalConfig};
    use crate::editor::CodeEditor;
    use crate::sandbox::tests::temp_path;
    use crate::sandbox::SandboxGuard;
    use crate::terminal::Supervisor;

    use super::{normalize_tool_name, ToolHost, ToolRequest};

    fn host(tag: &str, transcript_limit: usize) -> ToolHost {
        let guard = SandboxGuard::new(temp_path(tag)).expect("guard");
        ToolHost::with_parts(
            CodeEditor::new(guard.clone(), &EditorConfig::default()),
            Supervisor::new(&guard, &TerminalConfig::default())
                .with_output_callback(Arc::new(|_, _| {})),
            transcript_limit,
        )
    }

    fn request(tool: &str, input: &str) -> ToolRequest {
        ToolRequest {
            tool_name: tool.to_owned(),
            input: input.to_owned(),
        }
    }

    #[test]
    fn normalizes_tool_aliases() {
        assert_eq!(normalize_tool_name(" Bash "), "terminal");
        assert_eq!(normalize_tool_name("CodeEditor.PATCH"), "code_editor.patch");
        assert_eq!(normalize_tool_name("code-editor.read"), "code_editor.read");
        assert_eq!(normalize_tool_name("terminal"), "terminal");
    }

    #[tokio::test]
    async fn editor_tools_round_trip_through_strings() {
        let host = host("tools-editor", 16);
        let written = host
            .invoke(request("CodeEditor.WRITE", "hello.py\nprint('hello')\n"))
            .await;
        assert_eq!(written, "Last 3 line was:\nprint('hello')\n");

        let output = host.invoke(request("terminal", "cat hello.py")).await;
        assert_eq!(output, "print('hello')\n");

        let patched = host
            .invoke(request("code_editor.patch", "hello.py|1,8|1,13|world"))
            .await;
        assert_eq!(patched, "successfully wrote 5, deleted 5");
        assert_eq!(
            host.invoke(request("code_editor.read", "hello.py|1-1")).await,
            "print('world')\n"
        );
        assert_eq!(host.invoke(request("code_editor.delete", "hello.py")).await, "success");
    }

    #[tokio::test]
    async fn failures_become_error_strings_and_are_transcribed() {
        let host = host("tools-errors", 16);
        let escaped = host
            .invoke(request("code_editor.read", "../../etc/passwd|1-1"))
            .await;
        assert!(escaped.starts_with("error[sandbox_violation]:"), "{escaped}");

        let malformed = host.invoke(request("code_editor.patch", "a.py|oops")).await;
        assert!(malformed.starts_with("error[parse_error]:"), "{malformed}");

        let unknown = host.invoke(request("browser", "")).await;
        assert!(unknown.starts_with("error[unsupported_tool]:"), "{unknown}");

        let transcript = host.transcript().await;
        assert_eq!(transcript.len(), 3);
        assert!(transcript.iter().all(|entry| entry.status == "error"));
        assert_eq!(transcript[0].error_code, Some("sandbox_violation"));
        assert_eq!(transcript[2].tool_name, "browser");
    }

    #[tokio::test]
    async fn terminal_accepts_command_lists() {
        let host = host("tools-list", 16);
        let output = host
            .invoke(request("shell", r#"["echo a", "echo b"]"#))
            .await;
        assert_eq!(output, "a\nb\n");

        let transcript = host.transcript().await;
        assert_eq!(transcript[0].status, "ok");
        assert_eq!(transcript[0].exit_reason, Some("exited"));
    }

    #[tokio::test]
    async fn bracket_test_commands_run_as_shell() {
        let host = host("tools-bracket", 16);
        assert_eq!(
            host.invoke(request("terminal", "[ -d . ] && echo yes")).await,
            "yes\n"
        );
        let missing = host
            .invoke(request("terminal", "[ -f a.py ] || echo missing"))
            .await;
        assert_eq!(missing, "missing\n");
    }

    #[tokio::test]
    async fn failed_commands_are_transcribed_as_errors() {
        let cfg = TerminalConfig {
            shell: "/nonexistent/shell".to_owned(),
            ..TerminalConfig::default()
        };
        let guard = SandboxGuard::new(temp_path("tools-process-error")).expect("guard");
        let host = ToolHost::with_parts(
            CodeEditor::new(guard.clone(), &EditorConfig::default()),
            Supervisor::new(&guard, &cfg).with_output_callback(Arc::new(|_, _| {})),
            16,
        );
        let output = host.invoke(request("terminal", "true")).await;
        assert!(output.starts_with("error[process_error]:"), "{output}");

        let transcript = host.transcript().await;
        assert_eq!(transcript[0].status, "error");
        assert_eq!(transcript[0].error_code, Some("process_error"));
        assert_eq!(transcript[0].exit_reason, Some("error"));
    }

    #[tokio::test]
    async fn transcript_is_bounded() {
        let host = host("tools-bounded", 2);
        for _ in 0..5 {
            host.invoke(request("terminal", "true")).await;
        }
        assert_eq!(host.transcript().await.len(), 2);
    }

    #[test]
    fn host_builds_from_config() {
        let mut cfg = Config::default();
        cfg.sandbox.root = temp_path("tools-config");
        let host = ToolHost::new(&cfg).expect("host");
        assert!(cfg.sandbox.root.exists());
        drop(host);
    }
}
