//! Error types shared by every faultline crate.

use thiserror::Error;

use crate::fault::FaultReport;

/// Failure to register fault interception with the platform.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InitError {
    #[error("failed to install handler for signal {signal} (errno {errno})")]
    Install { signal: i32, errno: i32 },
    #[error("failed to create thread-specific key for guard state (errno {0})")]
    ThreadKey(i32),
    #[error("fault interception is not supported on this platform")]
    Unsupported,
}

/// Errors raised by the managed runtime and the primitives that act on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// A fault was captured inside a supervised call.
    #[error("{0}")]
    Fault(FaultReport),
    /// Fault interception could not be initialized.
    #[error(transparent)]
    Init(#[from] InitError),
    /// Malformed arguments; nothing was mutated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An ordinary error raised by user code.
    #[error("{0}")]
    Raised(String),
    #[error("'{type_name}' object has no attribute '{attr}'")]
    AttributeNotFound { type_name: String, attr: String },
    #[error("cannot set attribute '{attr}' of immutable type '{type_name}'")]
    ImmutableType { type_name: String, attr: String },
    #[error("{callable}() got an unexpected keyword argument '{keyword}'")]
    UnexpectedKeyword { callable: String, keyword: String },
    #[error("{callable}() takes {expected} positional arguments but {given} were given")]
    TooManyArguments {
        callable: String,
        expected: usize,
        given: usize,
    },
    #[error("local variable '{0}' is not defined in this frame")]
    UnknownLocal(String),
    #[error("address {0:#x} does not refer to a live tracked object")]
    Dereference(usize),
    #[error("supervised calls nested deeper than {0}")]
    NestingTooDeep(usize),
    #[error("stack allocation of {requested} bytes exceeds the {limit}-byte limit")]
    StackAllocation { requested: usize, limit: usize },
    #[error("pointers to items on the stack may not be freed dynamically")]
    StackFree,
    #[error("stack buffer at {0:#x} has already been freed")]
    BufferFreed(usize),
    /// Access to, or a second free of, heap memory that was already freed.
    #[error("memory at {0:#x} has already been freed")]
    FreedMemory(usize),
    #[error("failed to allocate {0} bytes")]
    Allocation(usize),
    #[error("access of {len} bytes at offset {offset} exceeds buffer of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
}

impl RuntimeError {
    /// Shorthand for an ordinary user-raised error.
    #[must_use]
    pub fn raised(message: impl Into<String>) -> Self {
        Self::Raised(message.into())
    }

    /// The captured fault, if this error is one.
    #[must_use]
    pub fn as_fault(&self) -> Option<&FaultReport> {
        match self {
            Self::Fault(report) => Some(report),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultKind;

    #[test]
    fn fault_error_displays_report_text() {
        let err = RuntimeError::Fault(FaultReport::new(FaultKind::Bus, 7, "mmap_tail", 0));
        assert_eq!(err.to_string(), "bus error occurred during execution of mmap_tail");
        assert_eq!(err.as_fault().map(|r| r.kind), Some(FaultKind::Bus));
    }

    #[test]
    fn init_error_is_transparent() {
        let err = RuntimeError::from(InitError::Install {
            signal: 11,
            errno: 22,
        });
        assert_eq!(
            err.to_string(),
            "failed to install handler for signal 11 (errno 22)"
        );
        assert!(err.as_fault().is_none());
    }
}
