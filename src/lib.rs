//! Descope: deterministic scope-bound resource cleanup with structured
//! error propagation.
//!
//! # Overview
//!
//! Descope gives thread-confined code two coupled mechanisms: a per-thread
//! stack of owned resources that is unwound in reverse creation order, and
//! an error channel that cannot bypass that unwinding. An error raised
//! anywhere releases every resource acquired since the nearest enclosing
//! recovery point, in reverse order, exactly once.
//!
//! # Core Guarantees
//!
//! - **LIFO cleanup**: unwinding a scope destructs handles in exactly
//!   reverse creation order, each destructor running exactly once
//! - **No silent leaks**: an untracked early exit only defers destruction
//!   until the next enclosing unwind; thread teardown drains everything
//! - **Failure-path safety**: an uncaught error triggers a full-stack
//!   unwind before the thread terminates
//! - **Shared ownership**: reference-counted nodes with independent strong
//!   and weak counts; weak references are promoted with a safe
//!   check-and-rollback that can never observe freed state
//!
//! # Module Structure
//!
//! - [`context`]: the per-thread [`ThreadContext`] and the scope stack
//!   manager (`mark` / `unwind_to` / `teardown` / `scope`)
//! - [`handle`]: unique ownership handles and their operations
//! - [`shared`]: reference-counted shared ownership nodes
//! - [`resource`]: the owned payload/destructor pair
//! - [`error`]: error objects, kinds, and the propagation token
//! - [`recover`]: raising, recovery points, and uncaught-error handling
//! - [`wrappers`]: collaborator constructors for common OS resources
//! - [`tracing_compat`]: feature-gated structured logging facade
//!
//! # Example
//!
//! ```
//! use descope::{Error, ErrorKind, ThreadContext};
//!
//! let mut ctx = ThreadContext::new();
//! let caught = ctx.recover(|ctx| -> descope::Result<()> {
//!     let _buffer = ctx.adopt_dropping(vec![0u8; 64]);
//!     Err(ctx.raise(Error::new(ErrorKind::Failure).with_message("gave up")))
//! });
//! // The buffer was released during the unwind; the error is ours to inspect.
//! assert_eq!(caught.unwrap_err().kind(), ErrorKind::Failure);
//! assert_eq!(ctx.live_handles(), 0);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod context;
pub mod error;
pub mod handle;
pub mod recover;
pub mod resource;
pub mod shared;
mod table;
pub mod tracing_compat;
pub mod wrappers;

pub use context::{ScopeMark, ThreadContext};
pub use error::{Error, ErrorCategory, ErrorKind, Raised, Result};
pub use handle::{Capabilities, HandleId};
pub use recover::run;
pub use resource::Resource;
pub use shared::Shared;
