//! Error type for engine, catalog and transport operations

use bpio_core::{DataType, FormatError};

/// Errors surfaced through the engine call-return channel
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed descriptor, bad selection or misuse of the step protocol
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{kind} '{name}' is already defined")]
    AlreadyDefined { kind: &'static str, name: String },

    /// Name or step absent from the index
    #[error("not found: {0}")]
    NotFound(String),

    /// Step or selection outside the index bounds
    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("type mismatch for '{name}': requested {requested}, stored {stored}")]
    TypeMismatch {
        name: String,
        requested: DataType,
        stored: DataType,
    },

    #[error("engine '{0}' is closed")]
    ClosedEngine(String),

    /// Transport-level failure; never retried by the engine
    #[error("I/O failure while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Buffer growth beyond the configured ceiling
    #[error("buffer needs {requested} bytes but the ceiling is {max} bytes")]
    OutOfMemory { requested: u64, max: u64 },

    #[error("format error: {0}")]
    Format(FormatError),

    /// A collective operation failed on some rank
    #[error("collective operation failed: {0}")]
    CollectiveFailure(String),

    #[error("operator '{name}' failed: {message}")]
    Operator { name: String, message: String },
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the error was raised by a collective and is fatal for all ranks
    pub fn is_collective(&self) -> bool {
        matches!(self, Error::CollectiveFailure(_))
    }
}

impl From<FormatError> for Error {
    fn from(err: FormatError) -> Self {
        Error::Format(err)
    }
}

/// Attach context to `std::io` results
pub(crate) trait IoContext<T> {
    fn context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|source| Error::io(context(), source))
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;
