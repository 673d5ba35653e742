/// Errors surfaced by chain elements.
///
/// Kernel backends convert their own errors into `Kernel` or `Namespace`
/// with enough context to tell which link, address or table was involved.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to parse {what} {value:?}: {reason}")]
    Parse {
        what: &'static str,
        value: String,
        reason: String,
    },

    #[error("kernel operation failed: {0}")]
    Kernel(String),

    #[error("network namespace error: {0}")]
    Namespace(String),

    #[error("link {0} not found")]
    MissingLink(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("{error}; connection closed with error: {close}")]
    Rollback { error: Box<Error>, close: Box<Error> },

    #[error("close failed: {}", .0.join("; "))]
    Teardown(Vec<String>),

    #[error("kernel backend not available: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn parse(what: &'static str, value: impl Into<String>, reason: impl ToString) -> Self {
        Self::Parse {
            what,
            value: value.into(),
            reason: reason.to_string(),
        }
    }

    /// Attach the outcome of a rollback `Close` to the error that caused it.
    ///
    /// A successful close leaves the original error untouched.
    pub fn with_close(self, close: Result<()>) -> Self {
        match close {
            Ok(()) => self,
            Err(close) => Self::Rollback {
                error: Box::new(self),
                close: Box::new(close),
            },
        }
    }

    /// The error that started a rollback, skipping the close annotation.
    pub fn root(&self) -> &Error {
        match self {
            Self::Rollback { error, .. } => error.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Combine an element's own cleanup with the downstream Close. Both have
/// already run; failures are reported together.
pub fn join_close(own: Result<()>, downstream: Result<()>) -> Result<()> {
    match (own, downstream) {
        (Ok(()), other) | (other, Ok(())) => other,
        (Err(own), Err(downstream)) => Err(Error::Teardown(vec![
            own.to_string(),
            downstream.to_string(),
        ])),
    }
}
