//! Path confinement for every filesystem-touching tool.
//!
//! A [`SandboxGuard`] owns the canonical sandbox root. Request paths are
//! joined to it, normalised, and resolved through their longest existing
//! prefix so symlinks pointing outside the root are caught as well as `..`
//! traversal.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use crate::error::{ToolError, ToolErrorCode, ToolResult};

#[derive(Debug, Clone)]
pub struct SandboxGuard {
    root: PathBuf,
}

impl SandboxGuard {
    /// Creates the root if it does not exist yet and pins its canonical form.
    pub fn new(root: impl AsRef<Path>) -> ToolResult<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|err| {
            ToolError::io(format!(
                "failed creating sandbox root {}: {err}",
                root.display()
            ))
        })?;
        let root = root.canonicalize().map_err(|err| {
            ToolError::io(format!(
                "failed canonicalizing sandbox root {}: {err}",
                root.display()
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, raw: &str) -> ToolResult<PathBuf> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ToolError::invalid_args("path must be a non-empty string"));
        }

        let candidate = if Path::new(trimmed).is_absolute() {
            PathBuf::from(trimmed)
        } else {
            self.root.join(trimmed)
        };
        let resolved = canonicalize_with_missing_segments(&normalize_lexically(&candidate))?;
        if !resolved.starts_with(&self.root) {
            return Err(ToolError::new(
                ToolErrorCode::SandboxViolation,
                format!(
                    "path `{}` escapes sandbox root {}",
                    raw,
                    self.root.display()
                ),
            ));
        }
        Ok(resolved)
    }

    pub fn display(&self, path: &Path) -> String {
        if let Ok(relative) = path.strip_prefix(&self.root) {
            let text = relative.to_string_lossy().to_string();
            if text.is_empty() {
                ".".to_owned()
            } else {
                text.replace('\\', "/")
            }
        } else {
            path.display().to_string()
        }
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `/..` stays `/`
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

fn canonicalize_with_missing_segments(path: &Path) -> ToolResult<PathBuf> {
    let mut cursor = path.to_path_buf();
    let mut missing = Vec::<OsString>::new();
    loop {
        if cursor.exists() {
            let mut resolved = cursor.canonicalize().map_err(|err| {
                ToolError::io(format!(
                    "failed canonicalizing path {}: {err}",
                    cursor.display()
                ))
            })?;
            for part in missing.iter().rev() {
                resolved.push(part);
            }
            return Ok(resolved);
        }

        let file_name = cursor.file_name().ok_or_else(|| {
            ToolError::invalid_args(format!(
                "unable to resolve parent path for {}",
                path.display()
            ))
        })?;
        missing.push(file_name.to_os_string());
        cursor = cursor.parent().map(Path::to_path_buf).ok_or_else(|| {
            ToolError::invalid_args(format!(
                "unable to resolve parent path for {}",
                path.display()
            ))
        })?;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use crate::error::ToolErrorCode;

    use super::SandboxGuard;

    pub(crate) fn temp_path(tag: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        root.push(format!("playground-rs-{tag}-{stamp}"));
        root
    }

    /// A file next to (not inside) any sandbox root, plus the relative path
    /// that reaches it from a root.
    pub(crate) fn outside_file(tag: &str, content: &str) -> (PathBuf, String) {
        let dir = temp_path(tag);
        std::fs::create_dir_all(&dir).expect("outside dir");
        let file = dir.join("secret.txt");
        std::fs::write(&file, content).expect("outside file");
        let name = dir
            .file_name()
            .and_then(|name| name.to_str())
            .expect("utf8 dir name");
        (file, format!("../{name}/secret.txt"))
    }

    #[test]
    fn resolves_relative_and_missing_paths_inside_root() {
        let guard = SandboxGuard::new(temp_path("sandbox-resolve")).expect("guard");
        let resolved = guard.resolve("src/new/main.py").expect("resolve");
        assert!(resolved.starts_with(guard.root()));
        assert_eq!(guard.display(&resolved), "src/new/main.py");

        let dotted = guard.resolve("./a/../b.txt").expect("resolve dotted");
        assert_eq!(guard.display(&dotted), "b.txt");
    }

    #[test]
    fn rejects_traversal_outside_root() {
        let guard = SandboxGuard::new(temp_path("sandbox-escape")).expect("guard");
        for raw in [
            "../../etc/passwd",
            "missing/../../../outside.txt",
            "/etc/passwd",
        ] {
            let err = guard.resolve(raw).expect_err(raw);
            assert_eq!(err.code, ToolErrorCode::SandboxViolation, "{raw}");
        }
    }

    #[test]
    fn accepts_absolute_path_inside_root() {
        let guard = SandboxGuard::new(temp_path("sandbox-absolute")).expect("guard");
        let inside = guard.root().join("notes.md");
        let resolved = guard
            .resolve(inside.to_str().expect("utf8 path"))
            .expect("resolve absolute");
        assert_eq!(resolved, inside);
    }

    #[test]
    fn rejects_empty_path() {
        let guard = SandboxGuard::new(temp_path("sandbox-empty")).expect("guard");
        let err = guard.resolve("   ").expect_err("empty path");
        assert_eq!(err.code, ToolErrorCode::InvalidArgs);
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_pointing_outside_root() {
        let outside = temp_path("sandbox-outside");
        std::fs::create_dir_all(&outside).expect("outside dir");
        let guard = SandboxGuard::new(temp_path("sandbox-symlink")).expect("guard");
        std::os::unix::fs::symlink(&outside, guard.root().join("link")).expect("symlink");

        let err = guard.resolve("link/secret.txt").expect_err("symlink escape");
        assert_eq!(err.code, ToolErrorCode::SandboxViolation);
    }
}
