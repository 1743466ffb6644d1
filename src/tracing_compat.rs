//! Structured-logging facade.
//!
//! Provides a unified interface for logging that works whether or not the
//! `tracing-integration` feature is enabled:
//!
//! - **With the feature**: re-exports the level macros from the `tracing`
//!   crate.
//! - **Without it**: no-op macros that compile to nothing, for zero runtime
//!   overhead.
//!
//! ```rust,ignore
//! use descope::tracing_compat::{debug, trace};
//!
//! debug!(handle = %id, "handle pushed");
//! ```

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    //! No-op implementations when tracing is disabled.

    /// No-op trace-level logging macro.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    /// No-op debug-level logging macro.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// No-op info-level logging macro.
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {};
    }

    /// No-op warn-level logging macro.
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }

    /// No-op error-level logging macro.
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {};
    }

    pub use crate::{debug, error, info, trace, warn};
}

#[cfg(not(feature = "tracing-integration"))]
pub use noop::*;
