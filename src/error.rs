//! Error objects and the propagation token.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Raising installs the error in the thread's pending slot and returns a
//!   [`Raised`] token; propagation is an ordinary `Err` flowing through `?`,
//!   so it can never bypass scope unwinding
//! - Handlers propagate by default: an unrecognized kind is rethrown
//!   unchanged, preserving the error's identity
//! - The out-of-memory constructor performs no allocation, so exhaustion is
//!   reportable even when allocating an error object would itself fail
//!
//! # Error Categories
//!
//! - **Exhaustion**: allocation failure
//! - **InvalidOperation**: capability violations and handle misuse
//! - **PendingHandle**: `take_latest` called with nothing pending
//! - **Collaborator**: opaque failures owned by resource constructors
//!   (I/O, truncation, signals, lookup, generic failure), propagated
//!   unchanged through this channel

use core::fmt;
use std::borrow::Cow;
use std::panic::Location;
use std::path::Path;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Heap or resource allocation failed.
    ResourceExhaustion,

    // === Capability violations / handle misuse ===
    /// The handle's transferable capability is unset.
    NotTransferable,
    /// The handle's shareable capability is unset.
    NotShareable,
    /// The handle's submittable capability is unset.
    NotSubmittable,
    /// A weak reference was expected but something else was given.
    NotAWeakHandle,
    /// The payload is not reachable through this handle.
    NotWritable,
    /// The handle was already consumed (destructed, transferred, or
    /// submitted).
    StaleHandle,
    /// The payload is not of the requested type.
    TypeMismatch,

    // === Latest-handle marker ===
    /// No handle was created since the last consuming operation.
    NoPendingHandle,

    // === Collaborator failures ===
    /// An I/O operation failed.
    Io,
    /// Output was truncated.
    Truncated,
    /// An operation was interrupted by a signal.
    Signal,
    /// A name lookup failed.
    Name,
    /// A collaborator reported a generic failure.
    Failure,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::ResourceExhaustion => ErrorCategory::Exhaustion,
            Self::NotTransferable
            | Self::NotShareable
            | Self::NotSubmittable
            | Self::NotAWeakHandle
            | Self::NotWritable
            | Self::StaleHandle
            | Self::TypeMismatch => ErrorCategory::InvalidOperation,
            Self::NoPendingHandle => ErrorCategory::PendingHandle,
            Self::Io | Self::Truncated | Self::Signal | Self::Name | Self::Failure => {
                ErrorCategory::Collaborator
            }
        }
    }

    /// Returns true if this kind reports misuse of the handle API.
    #[must_use]
    pub const fn is_invalid_operation(&self) -> bool {
        matches!(self.category(), ErrorCategory::InvalidOperation)
    }
}

/// High-level error category for grouping related kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Allocation failure.
    Exhaustion,
    /// Capability violations and handle misuse.
    InvalidOperation,
    /// Latest-handle marker misuse.
    PendingHandle,
    /// Opaque failures owned by collaborators.
    Collaborator,
}

/// An error object: kind, formatted description, optional opaque source,
/// and the origin site where it was constructed.
///
/// Exactly one thread owns an error at a time. It is destroyed when a
/// handler finishes with it (dropping the value returned by
/// [`recover`](crate::ThreadContext::recover)), or immediately if a new
/// error pre-empts a pending one.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<Cow<'static, str>>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    origin: &'static Location<'static>,
}

impl Error {
    /// Creates a new error with the given kind.
    ///
    /// The origin site is captured from the caller.
    #[must_use]
    #[track_caller]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
            origin: Location::caller(),
        }
    }

    /// Creates the allocation-failure error without allocating.
    #[must_use]
    #[track_caller]
    pub const fn out_of_memory() -> Self {
        Self {
            kind: ErrorKind::ResourceExhaustion,
            message: Some(Cow::Borrowed("out of heap memory")),
            source: None,
            origin: Location::caller(),
        }
    }

    /// Creates an I/O error for `operation` on `path`.
    #[must_use]
    #[track_caller]
    pub fn io(operation: &str, path: &Path, source: std::io::Error) -> Self {
        Self::new(ErrorKind::Io)
            .with_message(format!("{operation} '{}'", path.display()))
            .with_source(source)
    }

    /// Creates a truncation error for `operation` with the buffer size that
    /// was exceeded.
    #[must_use]
    #[track_caller]
    pub fn truncated(operation: &str, buffer_size: usize) -> Self {
        Self::new(ErrorKind::Truncated)
            .with_message(format!("{operation}: output truncated at {buffer_size} bytes"))
    }

    /// Creates a signal-interruption error.
    #[must_use]
    #[track_caller]
    pub fn signal(operation: &str, signal: i32) -> Self {
        Self::new(ErrorKind::Signal)
            .with_message(format!("{operation}: interrupted by signal {signal}"))
    }

    /// Creates a name-lookup error.
    #[must_use]
    #[track_caller]
    pub fn name(detail: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Name).with_message(detail)
    }

    /// Creates a generic failure error for `operation` with its return
    /// value.
    #[must_use]
    #[track_caller]
    pub fn failure(operation: &str, code: i32) -> Self {
        Self::new(ErrorKind::Failure).with_message(format!("{operation} returned {code}"))
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Adds an opaque source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns the origin site where the error was constructed.
    #[must_use]
    pub const fn origin(&self) -> &'static Location<'static> {
        self.origin
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as _)
    }
}

/// Token proving that an error is installed in the thread's pending slot.
///
/// Returned by [`raise`](crate::ThreadContext::raise) and propagated with
/// `?` until a recovery point takes the pending error back out.
#[must_use = "a raised error must be propagated to the nearest recovery point"]
#[derive(Debug)]
pub struct Raised(());

impl Raised {
    pub(crate) const fn new() -> Self {
        Self(())
    }
}

/// A specialized Result type for descope operations.
///
/// The default error type is the propagation token; recovery points use
/// `Result<T, Error>` to hand the caught error object back.
pub type Result<T, E = Raised> = core::result::Result<T, E>;
