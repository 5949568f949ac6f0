use thiserror::Error;

use crate::cell::Ref;

/// Process exit status of a VM run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    Uncaught,
    NoMainMethod,
    OutOfMemory,
    NoRunnableOrWaitingThreads,
    MaxClasspathSegments,
    InflateNotEnabled,
    UnknownCompressionMethod,
    NumericSizeSanity,
    Internal,
    /// Status handed to `System.exit`.
    Explicit(i32),
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::Uncaught => 1,
            ExitCode::NoMainMethod => 2,
            ExitCode::OutOfMemory => 3,
            ExitCode::NoRunnableOrWaitingThreads => 4,
            ExitCode::MaxClasspathSegments => 5,
            ExitCode::InflateNotEnabled => 6,
            ExitCode::UnknownCompressionMethod => 7,
            ExitCode::NumericSizeSanity => 8,
            ExitCode::Internal => 9,
            ExitCode::Explicit(code) => code,
        }
    }
}

#[derive(Debug, Error)]
pub enum VmError {
    /// A Java throwable unwinding to the nearest catch site.
    #[error("java throwable {0:?}")]
    Throw(Ref),
    #[error("fatal: {message} ({code:?})")]
    Fatal { code: ExitCode, message: String },
    #[error("exit({0})")]
    Exit(i32),
}

impl VmError {
    pub fn fatal(code: ExitCode, message: impl Into<String>) -> Self {
        VmError::Fatal {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::fatal(ExitCode::Internal, message)
    }
}

pub type VmResult<T> = Result<T, VmError>;
