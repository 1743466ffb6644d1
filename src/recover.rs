//! Raising, recovery points, and uncaught-error handling.
//!
//! There are no non-local jumps here: raising installs the error in the
//! thread's pending slot and hands back a [`Raised`] token that the caller
//! propagates with `?`. Every scope between the raise site and the nearest
//! recovery point unwinds as the `Err` bubbles out through it, innermost
//! first, so cleanup order is identical to a direct unwind and cannot be
//! skipped.
//!
//! A recovery point is a [`recover`](ThreadContext::recover) call. The
//! handler gets the error object by value: dropping it ends the
//! propagation, [`rethrow`](ThreadContext::rethrow) continues it with the
//! same object. A thread entry point that wants the classic
//! report-and-terminate behavior wraps its body in [`run`].

use crate::context::ThreadContext;
use crate::error::{Error, ErrorKind, Raised, Result};
use crate::tracing_compat::{debug, error};

impl ThreadContext {
    /// Installs `err` as the thread's propagating error and returns the
    /// token to carry through `?`.
    ///
    /// A different pending error is destroyed first; an error object is
    /// never leaked by being overwritten.
    pub fn raise(&mut self, err: Error) -> Raised {
        if let Some(previous) = self.pending.take() {
            debug!(kind = ?previous.kind(), "pre-empting pending error");
            drop(previous);
        }
        debug!(kind = ?err.kind(), origin = %err.origin(), "raising");
        self.pending = Some(err);
        Raised::new()
    }

    /// Continues propagating an error taken from a recovery point.
    ///
    /// The object is re-installed untouched: same kind, payload, and
    /// origin. Use this from a handler that does not recognize the error's
    /// kind: propagate by default, don't catch by default.
    pub fn rethrow(&mut self, err: Error) -> Raised {
        self.pending = Some(err);
        Raised::new()
    }

    /// Takes the pending error out of the slot, ending its propagation.
    ///
    /// Recovery points do this implicitly; it is exposed for handlers
    /// built on the low-level `mark`/`unwind_to` API.
    pub fn take_pending(&mut self) -> Option<Error> {
        self.pending.take()
    }

    /// Runs `body` under a recovery point.
    ///
    /// The recovery point coincides with a scope boundary: a mark is taken
    /// on entry and the scope is unwound on every exit path. If `body`
    /// propagates a raised error, the unwind runs first and the error
    /// object is returned for inspection. Dropping it clears the channel;
    /// passing it to [`rethrow`](Self::rethrow) propagates it further.
    pub fn recover<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T, Error> {
        let mark = self.enter_scope();
        let out = body(self);
        self.exit_scope(mark);
        match out {
            Ok(value) => Ok(value),
            Err(_raised) => match self.pending.take() {
                Some(caught) => {
                    debug!(kind = ?caught.kind(), "recovered");
                    Err(caught)
                }
                None => Err(Error::new(ErrorKind::Failure)
                    .with_message("recovery point reached with no pending error")),
            },
        }
    }
}

/// Runs `body` with a fresh context as a thread (or process) entry point.
///
/// On an uncaught error every outstanding handle on the thread is
/// destructed, the error's kind-specific description and origin site are
/// reported, and the process exits with a non-zero status. This is the
/// behavior a host gets for free by structuring a worker's main function
/// as `run(|ctx| ...)`.
pub fn run<T>(body: impl FnOnce(&mut ThreadContext) -> Result<T>) -> T {
    let mut ctx = ThreadContext::new();
    match body(&mut ctx) {
        Ok(value) => {
            ctx.teardown();
            value
        }
        Err(_raised) => {
            let report = ctx.take_pending().unwrap_or_else(|| {
                Error::new(ErrorKind::Failure).with_message("terminated with no pending error")
            });
            ctx.teardown();
            error!(kind = ?report.kind(), origin = %report.origin(), "uncaught error");
            eprintln!("uncaught error ({}): {report}", report.origin());
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use core::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct DropProbe(Arc<AtomicUsize>);

    impl Drop for DropProbe {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl fmt::Display for DropProbe {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "probe")
        }
    }

    impl std::error::Error for DropProbe {}

    #[test]
    fn recover_returns_the_raised_error() {
        let mut ctx = ThreadContext::new();
        let caught = ctx.recover(|ctx| -> Result<()> {
            Err(ctx.raise(Error::new(ErrorKind::Io).with_message("disk on fire")))
        });
        let err = caught.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.message(), Some("disk on fire"));
        assert!(!ctx.has_pending_error());
    }

    #[test]
    fn recover_passes_values_through() {
        let mut ctx = ThreadContext::new();
        let value = ctx.recover(|_| Ok(17_u32)).unwrap();
        assert_eq!(value, 17);
    }

    #[test]
    fn raise_preempts_and_destroys_the_previous_error() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let mut ctx = ThreadContext::new();

        let first = Error::new(ErrorKind::Failure).with_source(DropProbe(Arc::clone(&dropped)));
        let _ = ctx.raise(first);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        let _ = ctx.raise(Error::new(ErrorKind::Io));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);

        let pending = ctx.take_pending().unwrap();
        assert_eq!(pending.kind(), ErrorKind::Io);
    }

    #[test]
    fn rethrow_preserves_identity_and_destroys_once() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let mut ctx = ThreadContext::new();

        let mut inner_line = 0;
        let caught = ctx.recover(|ctx| -> Result<()> {
            let inner = ctx.recover(|ctx| -> Result<()> {
                Err(ctx.raise(
                    Error::new(ErrorKind::Signal).with_source(DropProbe(Arc::clone(&dropped))),
                ))
            });
            // Unrecognized kind: propagate unchanged.
            let err = inner.unwrap_err();
            inner_line = err.origin().line();
            assert_eq!(dropped.load(Ordering::SeqCst), 0);
            Err(ctx.rethrow(err))
        });

        let err = caught.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Signal);
        assert_eq!(err.origin().line(), inner_line);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        drop(err);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unwind_runs_before_the_handler_sees_the_error() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut ctx = ThreadContext::new();

        let probe = Arc::clone(&released);
        let caught = ctx.recover(|ctx| -> Result<()> {
            ctx.adopt(0_u8, move |_| {
                probe.fetch_add(1, Ordering::SeqCst);
            });
            Err(ctx.raise(Error::new(ErrorKind::Failure)))
        });

        assert!(caught.is_err());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.live_handles(), 0);
    }

    #[test]
    fn nested_scopes_unwind_innermost_first_during_propagation() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut ctx = ThreadContext::new();

        let log = |tag: &'static str, order: &Arc<std::sync::Mutex<Vec<&'static str>>>| {
            let order = Arc::clone(order);
            move |_: u8| order.lock().unwrap().push(tag)
        };

        let caught = ctx.recover(|ctx| {
            ctx.adopt(0_u8, log("outer", &order));
            ctx.scope(|ctx| {
                ctx.adopt(0_u8, log("middle", &order));
                ctx.scope(|ctx| {
                    ctx.adopt(0_u8, log("inner", &order));
                    Err::<(), _>(ctx.raise(Error::new(ErrorKind::Failure)))
                })
            })
        });

        assert!(caught.is_err());
        assert_eq!(*order.lock().unwrap(), vec!["inner", "middle", "outer"]);
    }

    #[test]
    fn handlers_propagate_unrecognized_kinds_by_default() {
        let mut ctx = ThreadContext::new();

        let outcome = ctx.recover(|ctx| -> Result<u32> {
            let inner = ctx.recover(|ctx| -> Result<u32> {
                Err(ctx.raise(Error::new(ErrorKind::ResourceExhaustion)))
            });
            match inner {
                Ok(v) => Ok(v),
                Err(err) if err.category() == ErrorCategory::Collaborator => Ok(0),
                Err(err) => Err(ctx.rethrow(err)),
            }
        });

        assert_eq!(
            outcome.unwrap_err().kind(),
            ErrorKind::ResourceExhaustion
        );
    }
}
