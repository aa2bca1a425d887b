use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub editor: EditorConfig,
    #[serde(default)]
    pub tools: ToolHostConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_root")]
    pub root: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: default_sandbox_root(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserverKind {
    Poll,
    Syscall,
    Auto,
}

impl ObserverKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::Syscall => "syscall",
            Self::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_shell_args")]
    pub shell_args: Vec<String>,
    #[serde(default = "default_observer")]
    pub observer: ObserverKind,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default)]
    pub absolute_timeout_ms: Option<u64>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_syscall_deadline_ms")]
    pub syscall_deadline_ms: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            shell_args: default_shell_args(),
            observer: default_observer(),
            idle_timeout_ms: default_idle_timeout_ms(),
            absolute_timeout_ms: None,
            poll_interval_ms: default_poll_interval_ms(),
            syscall_deadline_ms: default_syscall_deadline_ms(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl TerminalConfig {
    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            idle: Duration::from_millis(self.idle_timeout_ms),
            absolute: self.absolute_timeout_ms.map(Duration::from_millis),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            syscall_deadline: Duration::from_millis(self.syscall_deadline_ms),
        }
    }
}

/// Deadlines applied to one command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// Longest stretch without new output before the poll observer kills the child.
    pub idle: Duration,
    /// Wall-clock limit for the whole execution, independent of output.
    pub absolute: Option<Duration>,
    pub poll_interval: Duration,
    /// Longest single trace wait for the syscall observer.
    pub syscall_deadline: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        TerminalConfig::default().timeout_policy()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditorConfig {
    #[serde(default = "default_patch_delimiter")]
    pub patch_delimiter: String,
    #[serde(default = "default_confirm_tail_lines")]
    pub confirm_tail_lines: usize,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            patch_delimiter: default_patch_delimiter(),
            confirm_tail_lines: default_confirm_tail_lines(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolHostConfig {
    #[serde(default = "default_transcript_limit")]
    pub transcript_limit: usize,
}

impl Default for ToolHostConfig {
    fn default() -> Self {
        Self {
            transcript_limit: default_transcript_limit(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            Self::from_toml(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str::<Config>(text)?)
    }

    pub fn apply_cli_overrides(
        &mut self,
        sandbox_root: Option<&Path>,
        observer: Option<ObserverKind>,
        idle_timeout_ms: Option<u64>,
    ) {
        if let Some(root) = sandbox_root {
            self.sandbox.root = root.to_path_buf();
        }
        if let Some(observer) = observer {
            self.terminal.observer = observer;
        }
        if let Some(ms) = idle_timeout_ms {
            self.terminal.idle_timeout_ms = ms;
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("PLAYGROUND_RS_SANDBOX_ROOT").or_else(|_| env::var("PLAYGROUND_DIR"))
        {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.sandbox.root = PathBuf::from(trimmed);
            }
        }
        if let Ok(v) = env::var("PLAYGROUND_RS_SHELL") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.terminal.shell = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("PLAYGROUND_RS_OBSERVER") {
            if let Some(kind) = parse_observer_kind(&v) {
                self.terminal.observer = kind;
            }
        }
        if let Ok(v) = env::var("PLAYGROUND_RS_IDLE_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.terminal.idle_timeout_ms = n.max(100);
            }
        }
        if let Ok(v) = env::var("PLAYGROUND_RS_ABSOLUTE_TIMEOUT_MS") {
            let trimmed = v.trim();
            self.terminal.absolute_timeout_ms = if trimmed.is_empty() {
                None
            } else {
                trimmed.parse::<u64>().ok()
            };
        }
        if let Ok(v) = env::var("PLAYGROUND_RS_POLL_INTERVAL_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.terminal.poll_interval_ms = n.max(1);
            }
        }
        if let Ok(v) = env::var("PLAYGROUND_RS_SYSCALL_DEADLINE_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.terminal.syscall_deadline_ms = n.max(10);
            }
        }
        if let Ok(v) = env::var("PLAYGROUND_RS_MAX_OUTPUT_BYTES") {
            if let Ok(n) = v.parse::<usize>() {
                self.terminal.max_output_bytes = n.max(64);
            }
        }
        if let Ok(v) = env::var("PLAYGROUND_RS_TRANSCRIPT_LIMIT") {
            if let Ok(n) = v.parse::<usize>() {
                self.tools.transcript_limit = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sandbox.root.as_os_str().is_empty() {
            anyhow::bail!("sandbox.root must not be empty");
        }
        if self.terminal.shell.trim().is_empty() {
            anyhow::bail!("terminal.shell must not be empty");
        }
        if self.terminal.idle_timeout_ms == 0 {
            anyhow::bail!("terminal.idle_timeout_ms must be > 0");
        }
        if self.terminal.poll_interval_ms == 0 {
            anyhow::bail!("terminal.poll_interval_ms must be > 0");
        }
        if self.terminal.poll_interval_ms >= self.terminal.idle_timeout_ms {
            anyhow::bail!("terminal.poll_interval_ms must be lower than terminal.idle_timeout_ms");
        }
        if self.terminal.syscall_deadline_ms == 0 {
            anyhow::bail!("terminal.syscall_deadline_ms must be > 0");
        }
        if self.terminal.absolute_timeout_ms == Some(0) {
            anyhow::bail!("terminal.absolute_timeout_ms must be > 0 when provided");
        }
        if self.terminal.max_output_bytes == 0 {
            anyhow::bail!("terminal.max_output_bytes must be > 0");
        }
        if self.editor.patch_delimiter.trim().is_empty() {
            anyhow::bail!("editor.patch_delimiter must contain visible characters");
        }
        if self.editor.patch_delimiter.contains('|') {
            anyhow::bail!("editor.patch_delimiter must not contain the `|` field separator");
        }
        Ok(())
    }
}

pub fn parse_observer_kind(s: &str) -> Option<ObserverKind> {
    match s.trim().to_ascii_lowercase().as_str() {
        "poll" | "stdout" | "polling" => Some(ObserverKind::Poll),
        "syscall" | "ptrace" | "trace" => Some(ObserverKind::Syscall),
        "auto" => Some(ObserverKind::Auto),
        _ => None,
    }
}

fn default_sandbox_root() -> PathBuf {
    PathBuf::from("playground")
}

fn default_shell() -> String {
    "/bin/sh".to_owned()
}

fn default_shell_args() -> Vec<String> {
    vec!["-c".to_owned()]
}

fn default_observer() -> ObserverKind {
    ObserverKind::Poll
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_syscall_deadline_ms() -> u64 {
    5_000
}

fn default_max_output_bytes() -> usize {
    30_000
}

fn default_patch_delimiter() -> String {
    "\n---~~~+++===+++~~~---\n".to_owned()
}

fn default_confirm_tail_lines() -> usize {
    3
}

fn default_transcript_limit() -> usize {
    512
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{parse_observer_kind, Config, ObserverKind};

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg = Config::from_toml(
            r#"
[sandbox]
root = "/srv/playground"

[terminal]
observer = "syscall"
idle_timeout_ms = 5000
"#,
        )
        .expect("parse config");

        assert_eq!(cfg.sandbox.root.to_str(), Some("/srv/playground"));
        assert_eq!(cfg.terminal.observer, ObserverKind::Syscall);
        assert_eq!(cfg.terminal.shell, "/bin/sh");
        assert_eq!(cfg.editor.patch_delimiter, "\n---~~~+++===+++~~~---\n");

        let policy = cfg.terminal.timeout_policy();
        assert_eq!(policy.idle, Duration::from_secs(5));
        assert_eq!(policy.poll_interval, Duration::from_millis(100));
        assert_eq!(policy.syscall_deadline, Duration::from_secs(5));
        assert_eq!(policy.absolute, None);
        cfg.validate().expect("valid config");
    }

    #[test]
    fn validate_rejects_inconsistent_timeouts() {
        let mut cfg = Config::default();
        cfg.terminal.poll_interval_ms = 500;
        cfg.terminal.idle_timeout_ms = 200;
        let err = cfg.validate().expect_err("poll interval above idle timeout");
        assert!(err.to_string().contains("poll_interval_ms"));

        let mut cfg = Config::default();
        cfg.terminal.absolute_timeout_ms = Some(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_delimiter_with_field_separator() {
        let mut cfg = Config::default();
        cfg.editor.patch_delimiter = "\n|||\n".to_owned();
        assert!(cfg.validate().is_err());

        cfg.editor.patch_delimiter = "\n\n".to_owned();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cli_overrides_replace_loaded_values() {
        let mut cfg = Config::default();
        cfg.apply_cli_overrides(
            Some(std::path::Path::new("/tmp/box")),
            Some(ObserverKind::Auto),
            Some(1_500),
        );
        assert_eq!(cfg.sandbox.root.to_str(), Some("/tmp/box"));
        assert_eq!(cfg.terminal.observer, ObserverKind::Auto);
        assert_eq!(cfg.terminal.idle_timeout_ms, 1_500);
    }

    #[test]
    fn observer_kind_aliases() {
        assert_eq!(parse_observer_kind(" Ptrace "), Some(ObserverKind::Syscall));
        assert_eq!(parse_observer_kind("stdout"), Some(ObserverKind::Poll));
        assert_eq!(parse_observer_kind("auto"), Some(ObserverKind::Auto));
        assert_eq!(parse_observer_kind("strace"), None);
    }
}
