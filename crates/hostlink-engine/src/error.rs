//! Error types for the engine

use std::fmt;

use crate::class::ClassId;
use crate::value::Value;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Built-in error constructors an engine can throw
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Plain `Error`
    Error,
    /// `TypeError`
    TypeError,
    /// `RangeError`
    RangeError,
    /// `ReferenceError`
    ReferenceError,
    /// `SyntaxError`
    SyntaxError,
    /// `InternalError`
    InternalError,
}

impl ErrorKind {
    /// The value of the `name` property of errors of this kind
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::InternalError => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A thrown script value.
///
/// Carries the value itself, so it can be rethrown with its identity intact,
/// plus a snapshot of its `name` and `message` taken when it was thrown.
#[derive(Clone)]
pub struct Exception {
    value: Value,
    name: String,
    message: String,
}

impl Exception {
    pub(crate) fn new(value: Value, name: String, message: String) -> Self {
        Self {
            value,
            name,
            message,
        }
    }

    /// The thrown value
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Take the thrown value
    pub fn into_value(self) -> Value {
        self.value
    }

    /// `name` of the thrown error, empty for non-error values
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `message` of the thrown error, or the value rendered as a string
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exception")
            .field("name", &self.name)
            .field("message", &self.message)
            .finish()
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

/// Engine error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// A script value was thrown
    #[error("uncaught exception: {0}")]
    Exception(Exception),

    /// The class identity space is exhausted
    #[error("class identity limit of {max} reached")]
    ClassLimit {
        /// The ceiling that was hit
        max: u32,
    },

    /// A class identity was used before it was allocated or defined
    #[error("unknown class {0}")]
    UnknownClass(ClassId),

    /// A class identity was defined twice
    #[error("class {0} is already defined")]
    ClassAlreadyDefined(ClassId),

    /// Allocation would exceed the configured memory limit
    #[error("out of memory: limit of {limit} bytes exceeded")]
    OutOfMemory {
        /// Configured limit in bytes
        limit: usize,
    },

    /// Nested calls exceeded the configured depth
    #[error("maximum call depth of {max} exceeded")]
    StackOverflow {
        /// Configured depth limit
        max: usize,
    },

    /// The interrupt handler or the execute timeout stopped execution
    #[error("execution interrupted")]
    Interrupted,

    /// The runtime has been torn down
    #[error("runtime has been closed")]
    RuntimeClosed,

    /// The context (realm) has been closed
    #[error("context has been closed")]
    ContextClosed,

    /// A value from another runtime was passed in
    #[error("value belongs to a different runtime")]
    WrongRuntime,
}

impl EngineError {
    /// The thrown value, if this is a script exception
    pub fn exception(&self) -> Option<&Exception> {
        match self {
            EngineError::Exception(exception) => Some(exception),
            _ => None,
        }
    }

    /// Whether this error is a thrown script value
    pub fn is_exception(&self) -> bool {
        matches!(self, EngineError::Exception(_))
    }
}

/// Conversion failure when reading a host type out of a value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("type mismatch: expected {expected}, got {got}")]
pub struct ConvertError {
    /// Expected type name
    pub expected: &'static str,
    /// Actual type name
    pub got: &'static str,
}
