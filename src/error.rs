//! Error types and error handling strategy for spindle.
//!
//! Two kinds of failure surface at a fiber suspension point, and they are
//! deliberately kept apart:
//!
//! - [`Error`]: an operation error reported by the asynchronous substrate
//!   (a cancelled timer, a dropped completion, a stopped context). These
//!   compose and chain like ordinary errors.
//! - [`crate::fiber::Interrupt`]: a pending interruption delivered at the
//!   suspension point. It is not an [`Error`], implements no conversion
//!   into one, and does not implement [`std::error::Error`], so a broad
//!   `?`-into-boxed-error handler cannot absorb it by accident.
//!
//! [`WaitError`] is the union of the two, returned when awaiting an
//! asynchronous operation through the plain completion token.

use core::fmt;
use std::sync::Arc;

use crate::fiber::Interrupt;

/// The kind of an operation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The operation was cancelled before it completed.
    Cancelled,
    /// The completion for the operation was dropped without being invoked.
    Abandoned,
    /// A resource needed by the runtime could not be acquired.
    Resource,
    /// The owning I/O context was stopped while the operation was pending.
    Shutdown,
}

impl ErrorKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "operation cancelled",
            Self::Abandoned => "completion abandoned",
            Self::Resource => "resource unavailable",
            Self::Shutdown => "context stopped",
        }
    }
}

/// An operation error from the asynchronous substrate.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error reports a cancelled operation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// A specialized Result type for spindle operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error returned when awaiting an asynchronous operation from a fiber.
///
/// The two variants answer different questions: [`WaitError::Interrupted`]
/// says the *fiber* was told to wind down, [`WaitError::Op`] says the
/// *operation* failed. An interruption normally propagates out of the body
/// with `?`; an operation error is usually handled in place.
///
/// This type intentionally does not implement [`std::error::Error`]; it is
/// control flow, not a reportable condition.
#[derive(Debug)]
pub enum WaitError {
    /// A pending interrupt was delivered at this suspension point.
    Interrupted(Interrupt),
    /// The operation itself failed.
    Op(Error),
}

impl WaitError {
    /// Returns true if the wait ended because the fiber was interrupted.
    #[must_use]
    pub const fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }

    /// Extracts the interruption, if that is what ended the wait.
    #[must_use]
    pub fn into_interrupt(self) -> Option<Interrupt> {
        match self {
            Self::Interrupted(i) => Some(i),
            Self::Op(_) => None,
        }
    }

    /// Extracts the operation error, if that is what ended the wait.
    #[must_use]
    pub fn into_op(self) -> Option<Error> {
        match self {
            Self::Interrupted(_) => None,
            Self::Op(e) => Some(e),
        }
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted(i) => write!(f, "{i}"),
            Self::Op(e) => write!(f, "{e}"),
        }
    }
}

impl From<Interrupt> for WaitError {
    fn from(i: Interrupt) -> Self {
        Self::Interrupted(i)
    }
}

impl From<Error> for WaitError {
    fn from(e: Error) -> Self {
        Self::Op(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_context() {
        let err = Error::new(ErrorKind::Cancelled);
        assert_eq!(err.to_string(), "operation cancelled");
    }

    #[test]
    fn display_with_context() {
        let err = Error::new(ErrorKind::Shutdown).with_context("timer wait");
        assert_eq!(err.to_string(), "context stopped: timer wait");
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::new(ErrorKind::Resource)
            .with_context("outer")
            .with_source(Underlying);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn result_ext_adds_context() {
        let res: core::result::Result<(), Error> = Err(Error::new(ErrorKind::Cancelled));
        let err = res.context("wait failed").expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(err.to_string(), "operation cancelled: wait failed");
    }

    #[test]
    fn predicates_match_kind() {
        assert!(Error::new(ErrorKind::Cancelled).is_cancelled());
        assert!(!Error::new(ErrorKind::Abandoned).is_cancelled());
    }

    #[test]
    fn wait_error_partitions() {
        let op = WaitError::from(Error::new(ErrorKind::Cancelled));
        assert!(!op.is_interrupted());
        assert!(op.into_op().is_some());
    }
}
