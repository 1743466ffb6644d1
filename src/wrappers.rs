//! Collaborator constructors for common OS resources.
//!
//! Reference implementations of the construction contract: acquire the
//! resource, [`adopt`](ThreadContext::adopt) it so the current scope owns
//! its cleanup, and hand the handle back. On failure nothing is adopted
//! and a Collaborator-category error is raised.
//!
//! Callers that only need the resource for the current scope can ignore
//! the returned handle entirely; callers that need to extend or move
//! ownership use it (or [`take_latest`](ThreadContext::take_latest)) with
//! `transfer`, `share`, or `yield_up`.

use std::fs::File;
use std::path::Path;

use crate::context::ThreadContext;
use crate::error::{Error, Result};
use crate::handle::HandleId;
use crate::tracing_compat::debug;

/// Opens an existing file for reading and adopts it into the current
/// scope.
pub fn open_file(ctx: &mut ThreadContext, path: &Path) -> Result<HandleId> {
    match File::open(path) {
        Ok(file) => {
            debug!(path = %path.display(), "opened managed file");
            Ok(ctx.adopt_dropping(file))
        }
        Err(source) => Err(ctx.raise(Error::io("open", path, source))),
    }
}

/// Creates (or truncates) a file for writing and adopts it into the
/// current scope.
pub fn create_file(ctx: &mut ThreadContext, path: &Path) -> Result<HandleId> {
    match File::create(path) {
        Ok(file) => {
            debug!(path = %path.display(), "created managed file");
            Ok(ctx.adopt_dropping(file))
        }
        Err(source) => Err(ctx.raise(Error::io("create", path, source))),
    }
}

/// Allocates a zero-filled byte buffer of `len` bytes and adopts it.
///
/// Raises the allocation-failure error if the reservation is refused.
pub fn alloc_buffer(ctx: &mut ThreadContext, len: usize) -> Result<HandleId> {
    let mut buffer: Vec<u8> = Vec::new();
    if buffer.try_reserve_exact(len).is_err() {
        return Err(ctx.raise(Error::out_of_memory()));
    }
    buffer.resize(len, 0);
    Ok(ctx.adopt_dropping(buffer))
}

/// Resizes a buffer created by [`alloc_buffer`], zero-filling any new
/// tail. The reallocation idiom: the handle keeps its place on the stack.
///
/// On allocation failure the buffer handle is destructed (the shrunken
/// resource is not left half-usable) and the allocation-failure error is
/// raised.
pub fn grow_buffer(ctx: &mut ThreadContext, handle: HandleId, new_len: usize) -> Result<()> {
    let grown = ctx.with_payload_mut(handle, |buffer: &mut Vec<u8>| {
        let additional = new_len.saturating_sub(buffer.len());
        if additional > 0 && buffer.try_reserve_exact(additional).is_err() {
            return false;
        }
        buffer.resize(new_len, 0);
        true
    })?;
    if grown {
        Ok(())
    } else {
        ctx.destruct(handle)?;
        Err(ctx.raise(Error::out_of_memory()))
    }
}

/// Adopts an owned copy of a string slice.
pub fn duplicate_str(ctx: &mut ThreadContext, value: &str) -> HandleId {
    ctx.adopt_dropping(value.to_owned())
}
