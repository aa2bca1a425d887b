mod config;
mod editor;
mod error;
mod sandbox;
mod terminal;
mod tools;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{parse_observer_kind, Config, ObserverKind};
use editor::{CodeEditor, WriteMode};
use sandbox::SandboxGuard;
use serde::Serialize;
use serde_json::json;
use terminal::{ExitReason, Supervisor};
use tools::{ToolHost, ToolRequest};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(
    author,
    version,
    about = "Sandboxed terminal supervisor and code editor tools for agent playgrounds"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "PLAYGROUND_RS_CONFIG",
        default_value = "playground-rs.toml"
    )]
    config: PathBuf,

    /// Override the sandbox root directory.
    #[arg(long, global = true)]
    sandbox_root: Option<PathBuf>,

    /// Override the output observer: poll, syscall or auto.
    #[arg(long, global = true, value_parser = parse_observer_arg)]
    observer: Option<ObserverKind>,

    /// Override the idle timeout in milliseconds.
    #[arg(long = "idle-timeout-ms", global = true)]
    idle_timeout_ms: Option<u64>,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "PLAYGROUND_RS_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Run shell command(s) inside the sandbox root.
    Exec(ExecArgs),
    /// Print a 1-indexed inclusive line range of a file.
    Read(ReadArgs),
    /// Overwrite a file with content from --content or stdin.
    Write(WriteArgs),
    /// Append content from --content or stdin to a file.
    Append(WriteArgs),
    /// Apply a multi-edit patch batch from --file or stdin.
    Patch(PatchArgs),
    /// Print the indentation outline of a file.
    Summary(SummaryArgs),
    /// Truncate a file to empty.
    Delete(DeleteArgs),
    /// Invoke a tool by name with its string protocol.
    Tool(ToolArgs),
    /// Run non-interactive diagnostics for the sandbox and observers.
    Doctor(DoctorArgs),
}

#[derive(Debug, Clone, Args)]
struct ExecArgs {
    /// Commands to run; several are joined with `; `.
    #[arg(required = true)]
    commands: Vec<String>,
    /// Wall-clock limit for this run in milliseconds.
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,
    /// Emit the execution result as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args)]
struct ReadArgs {
    path: String,
    start: usize,
    end: usize,
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args)]
struct WriteArgs {
    path: String,
    /// Content to write; read from stdin when omitted.
    #[arg(long)]
    content: Option<String>,
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args)]
struct PatchArgs {
    /// File holding the patch batch; read from stdin when omitted.
    #[arg(long)]
    file: Option<PathBuf>,
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args)]
struct SummaryArgs {
    path: String,
    #[arg(default_value_t = 1)]
    depth: usize,
    /// Start the outline at the first line containing this text.
    #[arg(long)]
    parent: Option<String>,
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args)]
struct DeleteArgs {
    path: String,
}

#[derive(Debug, Clone, Args)]
struct ToolArgs {
    /// Tool name, e.g. terminal or code_editor.patch. When omitted, stdin
    /// holds a JSON request such as `{"tool": "terminal", "input": "ls"}`.
    name: Option<String>,
    /// Tool input; read from stdin when omitted.
    input: Option<String>,
    /// Emit output and transcript entry as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Emit doctor output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorReport {
    ok: bool,
    checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    status: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    match cli.command.clone() {
        CliCommand::Doctor(args) => run_doctor(&cli, args),
        CliCommand::Exec(args) => run_exec(load_config(&cli)?, args).await,
        CliCommand::Tool(args) => run_tool(load_config(&cli)?, args).await,
        command => run_editor_command(load_config(&cli)?, command),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(cli.sandbox_root.as_deref(), cli.observer, cli.idle_timeout_ms);
    cfg.validate()?;
    Ok(cfg)
}

fn parse_observer_arg(value: &str) -> Result<ObserverKind, String> {
    parse_observer_kind(value)
        .ok_or_else(|| format!("unknown observer `{value}` (expected poll, syscall or auto)"))
}

async fn run_exec(cfg: Config, args: ExecArgs) -> Result<()> {
    let guard = SandboxGuard::new(&cfg.sandbox.root)?;
    let supervisor = Supervisor::new(&guard, &cfg.terminal);
    let mut policy = cfg.terminal.timeout_policy();
    if let Some(ms) = args.timeout_ms {
        policy.absolute = Some(Duration::from_millis(ms));
    }
    let handle = supervisor.spawn_with_policy(terminal::join_commands(&args.commands), policy);
    info!(
        "exec #{} started with {} observer",
        handle.id(),
        supervisor.observer().as_str()
    );

    let token = handle.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling command");
            token.cancel();
        }
    });
    let result = handle.wait().await;
    interrupt.abort();

    if args.json {
        print_json_value(&serde_json::to_value(&result)?);
    } else {
        print!("{}", result.render());
        if !result.render().ends_with('\n') {
            println!();
        }
    }

    if result.succeeded() {
        return Ok(());
    }
    match result.reason {
        ExitReason::Exited => Err(anyhow!(
            "command exited with code {}",
            result.exit_code.unwrap_or(-1)
        )),
        reason => Err(anyhow!("command ended: {}", reason.as_str())),
    }
}

async fn run_tool(cfg: Config, args: ToolArgs) -> Result<()> {
    let request = match (args.name, args.input) {
        (Some(tool_name), Some(input)) => ToolRequest { tool_name, input },
        (Some(tool_name), None) => ToolRequest {
            tool_name,
            input: read_stdin()?,
        },
        (None, _) => parse_tool_request(&read_stdin()?)?,
    };
    let host = ToolHost::new(&cfg)?;
    let output = host.invoke(request).await;
    if args.json {
        print_json_value(&json!({
            "output": output,
            "transcript": host.transcript().await,
        }));
    } else {
        println!("{output}");
    }
    Ok(())
}

fn parse_tool_request(text: &str) -> Result<ToolRequest> {
    serde_json::from_str::<ToolRequest>(text).context("failed parsing JSON tool request")
}

fn run_editor_command(cfg: Config, command: CliCommand) -> Result<()> {
    let editor = CodeEditor::new(SandboxGuard::new(&cfg.sandbox.root)?, &cfg.editor);
    match command {
        CliCommand::Read(args) => {
            let text = editor.read(&args.path, args.start, args.end)?;
            if args.json {
                print_json_value(&json!({ "path": args.path, "content": text }));
            } else {
                print!("{text}");
            }
        }
        CliCommand::Write(args) => write_with_mode(&editor, args, WriteMode::Overwrite)?,
        CliCommand::Append(args) => write_with_mode(&editor, args, WriteMode::Append)?,
        CliCommand::Patch(args) => {
            let text = match args.file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed reading patch file {}", path.display()))?,
                None => read_stdin()?,
            };
            let summary = editor.patch_command(&text)?;
            if args.json {
                print_json_value(&serde_json::to_value(summary)?);
            } else {
                println!("{summary}");
            }
        }
        CliCommand::Summary(args) => {
            let outline = editor.summary(&args.path, args.depth, args.parent.as_deref())?;
            if args.json {
                print_json_value(&json!({ "path": args.path, "outline": outline }));
            } else {
                print!("{outline}");
            }
        }
        CliCommand::Delete(args) => {
            editor.delete(&args.path)?;
            println!(
                "truncated {}",
                editor.guard().display(&editor.guard().resolve(&args.path)?)
            );
        }
        CliCommand::Exec(_) | CliCommand::Tool(_) | CliCommand::Doctor(_) => {
            return Err(anyhow!("not an editor command"));
        }
    }
    Ok(())
}

fn write_with_mode(editor: &CodeEditor, args: WriteArgs, mode: WriteMode) -> Result<()> {
    let content = match args.content {
        Some(content) => content,
        None => read_stdin()?,
    };
    let written = editor.write(&args.path, &content, mode)?;
    if args.json {
        print_json_value(&json!({
            "path": args.path,
            "mode": match mode {
                WriteMode::Overwrite => "overwrite",
                WriteMode::Append => "append",
            },
            "bytes": written.len(),
        }));
    } else {
        println!("wrote {} bytes to {}", written.len(), args.path);
    }
    Ok(())
}

fn read_stdin() -> Result<String> {
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .context("failed reading stdin")?;
    Ok(text)
}

fn print_json_value(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_owned())
    );
}

fn run_doctor(cli: &Cli, args: DoctorArgs) -> Result<()> {
    let config_result = load_config(cli).map_err(|err| err.to_string());
    let report = build_doctor_report(config_result, &cli.config);
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

fn build_doctor_report(config_result: Result<Config, String>, config_path: &Path) -> DoctorReport {
    let mut checks = Vec::new();
    let mut config = None;

    match config_result {
        Ok(cfg) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "pass".to_owned(),
                message: if config_path.exists() {
                    format!("loaded {}", config_path.display())
                } else {
                    format!("{} not found, using defaults", config_path.display())
                },
                detail: None,
            });
            config = Some(cfg);
        }
        Err(err) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "fail".to_owned(),
                message: format!("failed to load {}", config_path.display()),
                detail: Some(err),
            });
        }
    }

    if let Some(cfg) = config.as_ref() {
        match SandboxGuard::new(&cfg.sandbox.root) {
            Ok(guard) => checks.push(DoctorCheck {
                id: "sandbox.root".to_owned(),
                status: "pass".to_owned(),
                message: guard.root().display().to_string(),
                detail: None,
            }),
            Err(err) => checks.push(DoctorCheck {
                id: "sandbox.root".to_owned(),
                status: "fail".to_owned(),
                message: cfg.sandbox.root.display().to_string(),
                detail: Some(err.to_string()),
            }),
        }

        let shell_ok = shell_available(&cfg.terminal.shell, &cfg.terminal.shell_args);
        checks.push(DoctorCheck {
            id: "terminal.shell".to_owned(),
            status: if shell_ok { "pass" } else { "fail" }.to_owned(),
            message: format!("{} {}", cfg.terminal.shell, cfg.terminal.shell_args.join(" ")),
            detail: None,
        });

        let tracing_supported = terminal::syscall_tracing_supported();
        let effective = terminal::resolve_observer_kind(cfg.terminal.observer);
        checks.push(DoctorCheck {
            id: "terminal.observer".to_owned(),
            status: if effective == ObserverKind::Syscall && !tracing_supported {
                "fail"
            } else {
                "pass"
            }
            .to_owned(),
            message: format!(
                "requested {} -> {}",
                cfg.terminal.observer.as_str(),
                effective.as_str()
            ),
            detail: Some(format!("syscall tracing supported={tracing_supported}")),
        });
    }

    let ok = checks.iter().all(|check| check.status != "fail");
    DoctorReport { ok, checks }
}

fn print_doctor_report(report: &DoctorReport, json_output: bool) {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(report)
                .unwrap_or_else(|_| "{\"ok\":false,\"checks\":[]}".to_owned())
        );
        return;
    }

    println!("doctor: {}", if report.ok { "ok" } else { "issues" });
    for check in &report.checks {
        let detail = check
            .detail
            .as_deref()
            .map(|value| format!(" ({value})"))
            .unwrap_or_default();
        println!(
            "[{}] {}: {}{}",
            check.status.to_uppercase(),
            check.id,
            check.message,
            detail
        );
    }
}

fn shell_available(shell: &str, shell_args: &[String]) -> bool {
    Command::new(shell)
        .args(shell_args)
        .arg("true")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_exec_with_overrides() {
        let cli = Cli::parse_from([
            "playground-agent-rs",
            "--observer",
            "ptrace",
            "--idle-timeout-ms",
            "5000",
            "exec",
            "--json",
            "cd src",
            "ls",
        ]);
        assert_eq!(cli.observer, Some(ObserverKind::Syscall));
        assert_eq!(cli.idle_timeout_ms, Some(5_000));
        match cli.command {
            CliCommand::Exec(args) => {
                assert!(args.json);
                assert_eq!(args.commands, vec!["cd src".to_owned(), "ls".to_owned()]);
            }
            _ => panic!("expected exec command"),
        }
    }

    #[test]
    fn cli_rejects_unknown_observer() {
        let parsed = Cli::try_parse_from(["playground-agent-rs", "--observer", "strace", "doctor"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn cli_parses_summary_with_parent() {
        let cli = Cli::parse_from([
            "playground-agent-rs",
            "summary",
            "app.py",
            "2",
            "--parent",
            "class App",
        ]);
        match cli.command {
            CliCommand::Summary(args) => {
                assert_eq!(args.path, "app.py");
                assert_eq!(args.depth, 2);
                assert_eq!(args.parent.as_deref(), Some("class App"));
            }
            _ => panic!("expected summary command"),
        }
    }

    #[test]
    fn cli_parses_tool_invocation() {
        let cli = Cli::parse_from(["playground-agent-rs", "tool", "CodeEditor.READ", "a.py|1-3"]);
        match cli.command {
            CliCommand::Tool(args) => {
                assert_eq!(args.name.as_deref(), Some("CodeEditor.READ"));
                assert_eq!(args.input.as_deref(), Some("a.py|1-3"));
            }
            _ => panic!("expected tool command"),
        }

        let cli = Cli::parse_from(["playground-agent-rs", "tool", "--json"]);
        match cli.command {
            CliCommand::Tool(args) => assert!(args.name.is_none() && args.json),
            _ => panic!("expected tool command"),
        }
    }

    #[test]
    fn json_tool_requests_accept_name_aliases() {
        let request = parse_tool_request(r#"{"toolName": "bash", "input": "ls"}"#)
            .expect("camelCase request");
        assert_eq!(request.tool_name, "bash");
        assert_eq!(request.input, "ls");

        let request = parse_tool_request(r#"{"tool": "code_editor.delete"}"#).expect("no input");
        assert_eq!(request.tool_name, "code_editor.delete");
        assert_eq!(request.input, "");

        assert!(parse_tool_request(r#"{"input": "ls"}"#).is_err());
    }

    #[test]
    fn exec_accepts_per_call_timeout() {
        let cli = Cli::parse_from(["playground-agent-rs", "exec", "--timeout-ms", "250", "ls"]);
        match cli.command {
            CliCommand::Exec(args) => assert_eq!(args.timeout_ms, Some(250)),
            _ => panic!("expected exec command"),
        }
    }

    #[test]
    fn doctor_reports_config_failure_as_blocking() {
        let report = build_doctor_report(
            Err("bad toml".to_owned()),
            Path::new("missing-playground-rs.toml"),
        );
        assert!(!report.ok);
        assert_eq!(report.checks[0].id, "config.load");
        assert_eq!(report.checks[0].detail.as_deref(), Some("bad toml"));
    }

    #[test]
    fn doctor_passes_with_default_config() {
        let mut cfg = Config::default();
        cfg.sandbox.root = sandbox::tests::temp_path("doctor-defaults");
        let report = build_doctor_report(Ok(cfg), Path::new("missing-playground-rs.toml"));
        assert!(report.ok, "{:?}", report.checks);
        assert!(report.checks.iter().any(|check| check.id == "terminal.observer"));
    }
}
