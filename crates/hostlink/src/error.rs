//! Bridge error types

use hostlink_engine::{ConvertError, EngineError};

use crate::handle::{HandleError, HandleId};

/// A script exception surfaced to the host: the thrown value plus a
/// `name`/`message` snapshot
pub type ScriptError = hostlink_engine::Exception;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the bridge
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A class or function description was rejected before any side effect
    #[error("invalid definition: {0}")]
    Validation(String),

    /// The engine refused one of the registration steps
    #[error("failed to register {what}: {source}")]
    Registration {
        /// The step that failed
        what: String,
        source: EngineError,
    },

    /// A value had the wrong type or class
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// The handle was never stored or has already been released
    #[error("no host value for handle {0}")]
    NotFound(HandleId),

    #[error(transparent)]
    Overflow(#[from] HandleError),

    /// A script exception
    #[error("{0}")]
    Exception(ScriptError),

    /// A non-exception engine failure (limits, interrupts, closed runtime)
    #[error(transparent)]
    Engine(EngineError),

    /// Failure raised by host code; thrown into scripts as an `Error`
    #[error("{0}")]
    Host(String),

    /// The pinned engine thread has stopped
    #[error("engine thread is no longer running")]
    Disconnected,
}

impl Error {
    pub fn host(message: impl Into<String>) -> Self {
        Error::Host(message.into())
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Error::TypeMismatch(message.into())
    }

    pub(crate) fn registration(what: impl Into<String>, source: EngineError) -> Self {
        Error::Registration {
            what: what.into(),
            source,
        }
    }

    /// The script exception, if this error is one
    pub fn exception(&self) -> Option<&ScriptError> {
        match self {
            Error::Exception(exception) => Some(exception),
            _ => None,
        }
    }
}

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Exception(exception) => Error::Exception(exception),
            other => Error::Engine(other),
        }
    }
}

impl From<ConvertError> for Error {
    fn from(err: ConvertError) -> Self {
        Error::TypeMismatch(format!("expected {}, got {}", err.expected, err.got))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_exceptions_become_script_errors() {
        let err: Error = EngineError::Interrupted.into();
        assert!(matches!(err, Error::Engine(EngineError::Interrupted)));
        assert!(err.exception().is_none());
    }

    #[test]
    fn test_convert_error_is_type_mismatch() {
        let err: Error = ConvertError {
            expected: "int32",
            got: "string",
        }
        .into();
        assert_eq!(err.to_string(), "type mismatch: expected int32, got string");
    }

    #[test]
    fn test_registration_message_names_step() {
        let err = Error::registration("class identity", EngineError::ClassLimit { max: 8 });
        assert_eq!(
            err.to_string(),
            "failed to register class identity: class identity limit of 8 reached"
        );
    }
}
