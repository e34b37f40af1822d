use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineErrorCode {
    ClassificationUnavailable,
    NoOperationSelected,
    UnknownOperation,
    MissingArgument,
    UnexpectedArgument,
    InvalidArgument,
    SandboxViolation,
    OperationFailed,
    HandlerFault,
}

impl PipelineErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClassificationUnavailable => "classification_unavailable",
            Self::NoOperationSelected => "no_operation_selected",
            Self::UnknownOperation => "unknown_operation",
            Self::MissingArgument => "missing_argument",
            Self::UnexpectedArgument => "unexpected_argument",
            Self::InvalidArgument => "invalid_argument",
            Self::SandboxViolation => "sandbox_violation",
            Self::OperationFailed => "operation_failed",
            Self::HandlerFault => "handler_fault",
        }
    }

    /// Status code the HTTP boundary answers with for this failure.
    pub fn http_status(self) -> u16 {
        match self {
            Self::HandlerFault => 500,
            _ => 400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineError {
    pub code: PipelineErrorCode,
    pub message: String,
}

impl PipelineError {
    pub fn new(code: PipelineErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn classification_unavailable(message: impl Into<String>) -> Self {
        Self::new(PipelineErrorCode::ClassificationUnavailable, message)
    }

    pub fn unknown_operation(name: &str) -> Self {
        Self::new(
            PipelineErrorCode::UnknownOperation,
            format!("unknown operation `{name}`"),
        )
    }

    pub fn missing_argument(name: &str) -> Self {
        Self::new(
            PipelineErrorCode::MissingArgument,
            format!("missing required argument `{name}`"),
        )
    }

    pub fn unexpected_argument(name: &str) -> Self {
        Self::new(
            PipelineErrorCode::UnexpectedArgument,
            format!("unexpected argument `{name}`"),
        )
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(PipelineErrorCode::InvalidArgument, message)
    }

    pub fn sandbox_violation(message: impl Into<String>) -> Self {
        Self::new(PipelineErrorCode::SandboxViolation, message)
    }

    pub fn handler_fault(message: impl Into<String>) -> Self {
        Self::new(PipelineErrorCode::HandlerFault, message)
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for PipelineError {}

pub type PipelineResult<T> = Result<T, PipelineError>;
