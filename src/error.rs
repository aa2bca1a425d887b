use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorCode {
    InvalidArgs,
    ParseError,
    SandboxViolation,
    OutOfRange,
    Io,
    UnsupportedTool,
}

impl ToolErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgs => "invalid_args",
            Self::ParseError => "parse_error",
            Self::SandboxViolation => "sandbox_violation",
            Self::OutOfRange => "out_of_range",
            Self::Io => "io_error",
            Self::UnsupportedTool => "unsupported_tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolError {
    pub code: ToolErrorCode,
    pub message: String,
}

impl ToolError {
    pub fn new(code: ToolErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(ToolErrorCode::InvalidArgs, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ToolErrorCode::ParseError, message)
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::new(ToolErrorCode::OutOfRange, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ToolErrorCode::Io, message)
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error[{}]: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ToolError {}

pub type ToolResult<T> = Result<T, ToolError>;
