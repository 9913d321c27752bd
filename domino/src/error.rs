use std::fmt;

/// Classification of the failures the messaging layer can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The driver cannot reach the broker, or cannot create or bind a queue.
    ConnectivityFailure,
    /// An inbound payload is not valid JSON.
    DecodeFailure,
    /// A reply arrived with a correlation id nobody waits for.
    UnmatchedReply,
    /// An operation needs a started queue object.
    PrematureUse,
    /// `start` was called on a queue object which is already active.
    AlreadyStarted,
    /// No reply arrived in time.
    Timeout,
    /// The broker refused the operation, like acking an unknown delivery tag.
    PreconditionFailed,
    /// The request was abandoned because the reply stream has ended.
    Cancelled,
}

/// Represents an error of the messaging layer. It travels inside an `anyhow::Error`, so callers
/// get it back with `err.downcast::<DominoError>()`.
#[derive(Clone, Debug, PartialEq)]
pub struct DominoError {
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for DominoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DominoError")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for DominoError {}

impl DominoError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        DominoError {
            kind,
            message: message.into(),
        }
    }
}

/// Returns the kind of the error if it is a `DominoError`.
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.downcast_ref::<DominoError>().map(|e| e.kind)
}

/// Shorthand for creating errors in async functions.
#[macro_export]
macro_rules! domino_error {
    ($kind:expr, $message:expr) => {
        ::std::result::Result::Err(::anyhow::Error::new($crate::error::DominoError {
            kind: $kind,
            message: ::std::string::String::from($message),
        }))
    };
}

/// Log the error of an expression and go on.
#[macro_export]
macro_rules! logerr {
    ($val:expr) => {
        if let Err(e) = $val {
            ::log::error!("Error {:?}", e);
        }
    };
}
