use std::fs::OpenOptions;
use std::io::Write;

use crate::error::{ToolError, ToolResult};
use crate::sandbox::SandboxGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Overwrite,
    Append,
}

/// Writes `content` to `filepath`, creating parent directories, and returns it.
pub fn write_file(
    guard: &SandboxGuard,
    filepath: &str,
    content: &str,
    mode: WriteMode,
) -> ToolResult<String> {
    let resolved = guard.resolve(filepath)?;
    if let Some(parent) = resolved.parent() {
        std::fs::create_dir_all(parent).map_err(|err| {
            ToolError::io(format!(
                "failed creating directory {}: {err}",
                guard.display(parent)
            ))
        })?;
    }

    let mut options = OpenOptions::new();
    match mode {
        WriteMode::Overwrite => options.write(true).create(true).truncate(true),
        WriteMode::Append => options.append(true).create(true),
    };
    let mut file = options.open(&resolved).map_err(|err| {
        ToolError::io(format!(
            "failed opening file {}: {err}",
            guard.display(&resolved)
        ))
    })?;
    file.write_all(content.as_bytes()).map_err(|err| {
        ToolError::io(format!(
            "failed writing file {}: {err}",
            guard.display(&resolved)
        ))
    })?;
    Ok(content.to_owned())
}

/// Truncates `filepath` to zero bytes, creating it if missing.
pub fn clear_file(guard: &SandboxGuard, filepath: &str) -> ToolResult<()> {
    write_file(guard, filepath, "", WriteMode::Overwrite).map(|_| ())
}

/// Splits the write protocol: the first line is the path, the rest is content.
pub fn parse_write_request(input: &str) -> ToolResult<(String, String)> {
    let (filepath, content) = input.split_once('\n').unwrap_or((input, ""));
    let filepath = filepath.trim();
    if filepath.is_empty() {
        return Err(ToolError::parse(
            "write request must start with the file path on its own line",
        ));
    }
    Ok((filepath.to_owned(), content.to_owned()))
}

/// Last `lines` lines of `content`, as echoed back after a write.
pub fn tail_lines(content: &str, lines: usize) -> String {
    let all = content.split('\n').collect::<Vec<_>>();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(test)]
mod tests {
    use crate::error::ToolErrorCode;
    use crate::sandbox::tests::{outside_file, temp_path};
    use crate::sandbox::SandboxGuard;

    use super::{clear_file, parse_write_request, tail_lines, write_file, WriteMode};

    #[test]
    fn overwrite_is_idempotent_and_creates_parents() {
        let guard = SandboxGuard::new(temp_path("write-overwrite")).expect("guard");
        for _ in 0..2 {
            let echoed = write_file(&guard, "pkg/sub/mod.py", "x = 1\n", WriteMode::Overwrite)
                .expect("write");
            assert_eq!(echoed, "x = 1\n");
        }
        let on_disk =
            std::fs::read_to_string(guard.root().join("pkg/sub/mod.py")).expect("read back");
        assert_eq!(on_disk, "x = 1\n");
    }

    #[test]
    fn append_extends_existing_file() {
        let guard = SandboxGuard::new(temp_path("write-append")).expect("guard");
        write_file(&guard, "log.txt", "a\n", WriteMode::Overwrite).expect("write");
        write_file(&guard, "log.txt", "b\n", WriteMode::Append).expect("append");
        assert_eq!(
            std::fs::read_to_string(guard.root().join("log.txt")).expect("read"),
            "a\nb\n"
        );
    }

    #[test]
    fn escaping_write_leaves_target_untouched() {
        let guard = SandboxGuard::new(temp_path("write-escape")).expect("guard");
        let (outside, relative) = outside_file("write-escape-target", "keep me\n");
        for mode in [WriteMode::Append, WriteMode::Overwrite] {
            let err = write_file(&guard, &relative, "x", mode).expect_err("escape");
            assert_eq!(err.code, ToolErrorCode::SandboxViolation);
        }
        let err = clear_file(&guard, &relative).expect_err("escape");
        assert_eq!(err.code, ToolErrorCode::SandboxViolation);
        assert_eq!(std::fs::read(&outside).expect("outside"), b"keep me\n");
    }

    #[test]
    fn clear_truncates() {
        let guard = SandboxGuard::new(temp_path("write-clear")).expect("guard");
        write_file(&guard, "a.py", "print(1)\n", WriteMode::Overwrite).expect("write");
        clear_file(&guard, "a.py").expect("clear");
        assert_eq!(std::fs::read_to_string(guard.root().join("a.py")).expect("read"), "");
    }

    #[test]
    fn parses_write_protocol() {
        assert_eq!(
            parse_write_request("a.py\nline 1\nline 2\n").expect("parse"),
            ("a.py".to_owned(), "line 1\nline 2\n".to_owned())
        );
        assert_eq!(
            parse_write_request("empty.py").expect("no content"),
            ("empty.py".to_owned(), String::new())
        );
        assert!(parse_write_request("\ncontent").is_err());
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail_lines("a\nb\nc\nd\n", 3), "c\nd\n");
        assert_eq!(tail_lines("only", 3), "only");
    }
}
