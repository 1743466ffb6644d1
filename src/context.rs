//! Per-thread context: the scope stack manager and error-channel state.
//!
//! All operations in this crate go through an explicit [`ThreadContext`]
//! rather than process-wide or thread-local globals. A context owns the
//! thread's handle stack (a doubly-linked LIFO chain through the handle
//! table), the latest-handle marker, the scope nesting depth, and the
//! pending-error slot.
//!
//! # Scope brackets
//!
//! Language braces trigger nothing here. Code that wants scoped cleanup
//! brackets itself explicitly: [`scope`](ThreadContext::scope) (or the
//! lower-level [`enter_scope`](ThreadContext::enter_scope) /
//! [`exit_scope`](ThreadContext::exit_scope) pair) records a mark on entry
//! and unwinds back to it on every exit path. Skipping the exit call is
//! not a leak: destruction is deferred until the next unwind performed by
//! any enclosing scope, or thread teardown at the latest.

use crate::error::{Error, Result};
use crate::handle::{Capabilities, Content, HandleId, HandleRecord};
use crate::table::HandleTable;
use crate::tracing_compat::{debug, trace};

/// Opaque snapshot of the stack top at scope entry, used to bound a
/// cleanup pass.
#[derive(Clone, Copy, Debug)]
pub struct ScopeMark {
    pub(crate) top: Option<HandleId>,
    pub(crate) level: i32,
}

/// The per-thread state every operation threads through.
///
/// A context is confined to one thread at a time by `&mut` discipline;
/// moving the whole value to another thread is the explicit hand-off, and
/// moves every handle it owns along with it. Dropping a context is the
/// thread-teardown hook: the entire stack is drained in LIFO order and any
/// pending error is discarded.
pub struct ThreadContext {
    pub(crate) table: HandleTable,
    pub(crate) top: Option<HandleId>,
    pub(crate) latest: Option<HandleId>,
    pub(crate) depth: i32,
    pub(crate) pending: Option<Error>,
}

impl ThreadContext {
    /// Creates an empty context for the current thread.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            table: HandleTable::new(),
            top: None,
            latest: None,
            depth: 0,
            pending: None,
        }
    }

    /// Returns the current stack top as a cleanup boundary.
    #[must_use]
    pub const fn mark(&self) -> ScopeMark {
        ScopeMark {
            top: self.top,
            level: self.depth,
        }
    }

    /// Pops and destructs handles above `mark` in LIFO order, each
    /// destructor running exactly once.
    ///
    /// Handles whose scope level is below `min_level` are skipped in place
    /// (left linked where they are) rather than destructed; this is how a
    /// yielded handle survives its own scope's unwind. The boundary is
    /// exclusive: the handle recorded as the mark's top survives. If that
    /// handle was itself destructed since the mark was taken, the walk
    /// drains the rest of the stack.
    pub fn unwind_to(&mut self, mark: ScopeMark, min_level: i32) {
        let mut cursor = self.top;
        while cursor != mark.top {
            let Some(id) = cursor else { break };
            let Some(record) = self.table.get(id) else {
                break;
            };
            let prev = record.prev;
            if record.level >= min_level {
                if let Some(removed) = self.unlink_remove(id) {
                    trace!(handle = %id, level = removed.level, "destructing during unwind");
                    drop(removed);
                }
            }
            cursor = prev;
        }
    }

    /// Drains the whole stack, then discards any pending error.
    ///
    /// Hosts call this when a worker thread exits; dropping the context
    /// does it implicitly. Idempotent.
    pub fn teardown(&mut self) {
        let bottom = ScopeMark {
            top: None,
            level: i32::MIN,
        };
        self.unwind_to(bottom, i32::MIN);
        self.latest = None;
        self.depth = 0;
        if let Some(error) = self.pending.take() {
            debug!(kind = ?error.kind(), "discarding pending error at teardown");
            drop(error);
        }
    }

    /// Opens a scope: records a mark and raises the nesting depth.
    ///
    /// Pair with [`exit_scope`](Self::exit_scope). Leaving the scope
    /// without the exit call defers cleanup to the next enclosing unwind.
    pub fn enter_scope(&mut self) -> ScopeMark {
        let mark = self.mark();
        self.depth += 1;
        mark
    }

    /// Closes a scope opened by [`enter_scope`](Self::enter_scope):
    /// restores the nesting depth recorded in `mark` and unwinds back to
    /// it, skipping handles yielded to the enclosing scope.
    ///
    /// Restoring the depth from the mark (rather than decrementing) keeps
    /// the accounting right even when an abandoned inner scope was never
    /// exited; its deferred handles are picked up here.
    pub fn exit_scope(&mut self, mark: ScopeMark) {
        self.depth = mark.level;
        self.unwind_to(mark, mark.level + 1);
    }

    /// Runs `body` inside a bracketed scope.
    ///
    /// The scope is unwound on every exit path, whether `body` returns
    /// normally or propagates a raised error.
    pub fn scope<T>(&mut self, body: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let mark = self.enter_scope();
        let out = body(self);
        self.exit_scope(mark);
        out
    }

    /// Number of live handles owned by this context.
    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.table.live()
    }

    /// Returns true if `handle` has not been consumed.
    #[must_use]
    pub fn is_live(&self, handle: HandleId) -> bool {
        self.table.contains(handle)
    }

    /// Returns true if an error is installed and propagating.
    #[must_use]
    pub const fn has_pending_error(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn push_record(
        &mut self,
        content: Content,
        caps: Capabilities,
        level: i32,
    ) -> HandleId {
        let prev = self.top;
        let id = self.table.insert(HandleRecord {
            content,
            caps,
            level,
            prev,
            next: None,
        });
        if let Some(prev_id) = prev {
            if let Some(prev_record) = self.table.get_mut(prev_id) {
                prev_record.next = Some(id);
            }
        }
        self.top = Some(id);
        self.latest = Some(id);
        trace!(handle = %id, level, "handle pushed");
        id
    }

    /// Detaches a record from the stack chain without firing anything.
    pub(crate) fn unlink_remove(&mut self, id: HandleId) -> Option<HandleRecord> {
        let record = self.table.remove(id)?;
        if let Some(prev) = record.prev {
            if let Some(neighbor) = self.table.get_mut(prev) {
                neighbor.next = record.next;
            }
        }
        if let Some(next) = record.next {
            if let Some(neighbor) = self.table.get_mut(next) {
                neighbor.prev = record.prev;
            }
        }
        if self.top == Some(id) {
            self.top = record.prev;
        }
        if self.latest == Some(id) {
            self.latest = None;
        }
        Some(record)
    }
}

impl Default for ThreadContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        if !self.table.is_empty() {
            debug!(live = self.table.live(), "context dropped with live handles");
        }
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::sync::Mutex;

    fn logging_ctx() -> (ThreadContext, Arc<Mutex<Vec<u32>>>) {
        (ThreadContext::new(), Arc::new(Mutex::new(Vec::new())))
    }

    fn adopt_logged(ctx: &mut ThreadContext, log: &Arc<Mutex<Vec<u32>>>, tag: u32) -> HandleId {
        let log = Arc::clone(log);
        ctx.adopt(tag, move |value| log.lock().unwrap().push(value))
    }

    #[test]
    fn unwind_destructs_in_reverse_creation_order() {
        let (mut ctx, log) = logging_ctx();
        let mark = ctx.mark();
        for tag in 1..=4 {
            adopt_logged(&mut ctx, &log, tag);
        }
        ctx.unwind_to(mark, i32::MIN);
        assert_eq!(*log.lock().unwrap(), vec![4, 3, 2, 1]);
        assert_eq!(ctx.live_handles(), 0);
    }

    #[test]
    fn unwind_stops_at_the_mark_exclusively() {
        let (mut ctx, log) = logging_ctx();
        let survivor = adopt_logged(&mut ctx, &log, 1);
        let mark = ctx.mark();
        adopt_logged(&mut ctx, &log, 2);
        adopt_logged(&mut ctx, &log, 3);

        ctx.unwind_to(mark, i32::MIN);
        assert_eq!(*log.lock().unwrap(), vec![3, 2]);
        assert!(ctx.is_live(survivor));
    }

    #[test]
    fn scope_unwinds_on_normal_exit() {
        let (mut ctx, log) = logging_ctx();
        adopt_logged(&mut ctx, &log, 1);
        ctx.scope(|ctx| {
            adopt_logged(ctx, &log, 2);
            Ok(())
        })
        .unwrap();
        assert_eq!(*log.lock().unwrap(), vec![2]);
        assert_eq!(ctx.live_handles(), 1);
    }

    #[test]
    fn yielded_handle_survives_its_own_scope() {
        let (mut ctx, log) = logging_ctx();
        let mut yielded = None;
        ctx.scope(|ctx| {
            adopt_logged(ctx, &log, 2);
            let keep = adopt_logged(ctx, &log, 3);
            ctx.yield_up(keep)?;
            yielded = Some(keep);
            Ok(())
        })
        .unwrap();

        // The yielded handle was at the physical top when the scope closed.
        let keep = yielded.unwrap();
        assert!(ctx.is_live(keep));
        assert_eq!(*log.lock().unwrap(), vec![2]);

        ctx.teardown();
        assert_eq!(*log.lock().unwrap(), vec![2, 3]);
    }

    #[test]
    fn untracked_escape_defers_cleanup_until_enclosing_unwind() {
        let (mut ctx, log) = logging_ctx();
        let outer = ctx.mark();
        adopt_logged(&mut ctx, &log, 1);

        let _inner = ctx.enter_scope();
        adopt_logged(&mut ctx, &log, 2);
        // Untracked escape: no exit_scope call. Nothing is destructed yet.
        assert_eq!(log.lock().unwrap().len(), 0);

        ctx.unwind_to(outer, i32::MIN);
        assert_eq!(*log.lock().unwrap(), vec![2, 1]);
    }

    #[test]
    fn teardown_is_idempotent_and_drop_drains() {
        let fired = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&fired);
        {
            let mut ctx = ThreadContext::new();
            ctx.adopt(0_u8, move |_| {
                probe.fetch_add(1, Ordering::SeqCst);
            });
            ctx.teardown();
            ctx.teardown();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_mark_drains_the_stack() {
        let (mut ctx, log) = logging_ctx();
        let boundary = adopt_logged(&mut ctx, &log, 1);
        let mark = ctx.mark();
        adopt_logged(&mut ctx, &log, 2);
        ctx.destruct(boundary).unwrap();

        ctx.unwind_to(mark, i32::MIN);
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
        assert_eq!(ctx.live_handles(), 0);
    }
}
