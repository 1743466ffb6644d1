//! Unique ownership handles.
//!
//! A handle is a single node on the thread's cleanup stack: an owned
//! resource (or a forward link to a shared node), a capability set, and a
//! recorded scope level. Handles are addressed by generational
//! [`HandleId`]s, so a consumed handle id goes stale instead of dangling.
//!
//! Handle contents are an explicit tagged enum: a handle either owns its
//! resource directly, is empty (a reserved transfer destination), or is a
//! strong/weak forward link whose destruction releases one reference unit
//! on a shared node.

use core::any::Any;
use core::fmt;
use core::mem;
use std::sync::Arc;

use crate::context::ThreadContext;
use crate::error::{Error, ErrorKind, Result};
use crate::resource::Resource;
use crate::shared::{SharedNode, StrongLink, WeakLink};

/// Identifier of a handle on a thread's cleanup stack.
///
/// Ids are generational: once the handle is consumed (destructed,
/// transferred away, submitted, or unwound) the id goes stale and further
/// operations on it raise [`ErrorKind::StaleHandle`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId {
    index: u32,
    generation: u32,
}

impl HandleId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub(crate) const fn index(self) -> u32 {
        self.index
    }

    pub(crate) const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleId({}:{})", self.index, self.generation)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "H{}", self.index)
    }
}

/// Capability flags carried by every handle.
///
/// Newly adopted handles are fully capable. Forward links and weak
/// references are transfer-only; a handle produced by locking a weak
/// reference has no capabilities at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// May be moved into another handle with `transfer` or `swap`.
    pub transferable: bool,
    /// May be turned into a shared node with `share`.
    pub shareable: bool,
    /// May be relocated under a shared node with `submit`.
    pub submittable: bool,
}

impl Capabilities {
    /// All capabilities set; the default for adopted handles.
    pub const FULL: Self = Self {
        transferable: true,
        shareable: true,
        submittable: true,
    };

    /// Transfer-only; forward links and weak references.
    pub const FORWARD: Self = Self {
        transferable: true,
        shareable: false,
        submittable: false,
    };

    /// No capabilities; handles produced by `lock_weak`.
    pub const NONE: Self = Self {
        transferable: false,
        shareable: false,
        submittable: false,
    };
}

/// What a handle holds.
pub(crate) enum Content {
    /// Reserved transfer destination; nothing to release.
    Empty,
    /// Directly owned resource.
    Owned(Resource),
    /// Strong forward link; dropping releases one strong unit.
    Strong(StrongLink),
    /// Weak forward link; dropping releases one weak unit.
    Weak(WeakLink),
}

/// One node of the cleanup stack.
pub(crate) struct HandleRecord {
    pub(crate) content: Content,
    pub(crate) caps: Capabilities,
    pub(crate) level: i32,
    pub(crate) prev: Option<HandleId>,
    pub(crate) next: Option<HandleId>,
}

/// How the payload behind a handle can be reached.
enum Route {
    Deny(ErrorKind),
    Direct,
    Via(Arc<SharedNode>),
}

impl ThreadContext {
    /// Adopts a resource: pushes a new fully-capable handle for `payload`
    /// onto the stack at the current scope level.
    ///
    /// The destructor receives the payload back when the handle is
    /// destructed or unwound. Constructors that allocate a resource call
    /// this before returning; their caller can pick the handle up with
    /// [`take_latest`](Self::take_latest).
    pub fn adopt<T, F>(&mut self, payload: T, destructor: F) -> HandleId
    where
        T: Any + Send,
        F: FnOnce(T) + Send + 'static,
    {
        self.adopt_resource(Resource::new(payload, destructor))
    }

    /// Adopts a payload whose ordinary `Drop` is its destructor.
    pub fn adopt_dropping<T: Any + Send>(&mut self, payload: T) -> HandleId {
        self.adopt_resource(Resource::dropping(payload))
    }

    /// Adopts an already-built [`Resource`].
    pub fn adopt_resource(&mut self, resource: Resource) -> HandleId {
        let level = self.depth;
        self.push_record(Content::Owned(resource), Capabilities::FULL, level)
    }

    /// Creates an empty handle to serve as a `transfer` destination.
    pub fn reserve(&mut self) -> HandleId {
        let level = self.depth;
        self.push_record(Content::Empty, Capabilities::FULL, level)
    }

    /// Returns and clears the most-recently-created handle marker.
    ///
    /// Raises [`ErrorKind::NoPendingHandle`] if no handle was created since
    /// the last consuming operation (`share`, `destruct`, `submit`,
    /// `transfer`, or a previous `take_latest`).
    pub fn take_latest(&mut self) -> Result<HandleId> {
        match self.latest.take() {
            Some(id) => Ok(id),
            None => Err(self.raise(Error::new(ErrorKind::NoPendingHandle))),
        }
    }

    /// Destructs a handle immediately, unlinking it from the stack.
    ///
    /// Useful for releasing critical resources before their scope ends.
    /// A consumed id raises [`ErrorKind::StaleHandle`].
    pub fn destruct(&mut self, handle: HandleId) -> Result<()> {
        self.latest = None;
        match self.unlink_remove(handle) {
            Some(record) => {
                drop(record);
                Ok(())
            }
            None => Err(self.raise(Error::new(ErrorKind::StaleHandle))),
        }
    }

    /// Moves the contents and capabilities of `from` into `to`, then
    /// destroys the emptied `from` without firing its destructor.
    ///
    /// `to` must already exist, typically via [`reserve`](Self::reserve);
    /// whatever it previously held is released first. Raises
    /// [`ErrorKind::NotTransferable`] if `from` lacks the capability or the
    /// two ids are the same handle.
    pub fn transfer(&mut self, from: HandleId, to: HandleId) -> Result<()> {
        let gate = if from == to {
            Some(ErrorKind::NotTransferable)
        } else {
            match (self.table.get(from), self.table.get(to)) {
                (None, _) | (_, None) => Some(ErrorKind::StaleHandle),
                (Some(source), Some(_)) if !source.caps.transferable => {
                    Some(ErrorKind::NotTransferable)
                }
                _ => None,
            }
        };
        if let Some(kind) = gate {
            return Err(self.raise(Error::new(kind)));
        }

        let (content, caps) = match self.table.get_mut(from) {
            Some(record) => (
                mem::replace(&mut record.content, Content::Empty),
                record.caps,
            ),
            None => return Err(self.raise(Error::new(ErrorKind::StaleHandle))),
        };
        let displaced = match self.table.get_mut(to) {
            Some(record) => {
                record.caps = caps;
                mem::replace(&mut record.content, content)
            }
            None => return Err(self.raise(Error::new(ErrorKind::StaleHandle))),
        };
        drop(displaced);

        self.latest = None;
        drop(self.unlink_remove(from));
        Ok(())
    }

    /// Exchanges the contents and capabilities of two handles.
    ///
    /// Stack positions and scope levels stay put. Raises
    /// [`ErrorKind::NotTransferable`] if either handle lacks the
    /// transferable capability.
    pub fn swap(&mut self, a: HandleId, b: HandleId) -> Result<()> {
        let gate = if a == b {
            Some(ErrorKind::NotTransferable)
        } else {
            match (self.table.get(a), self.table.get(b)) {
                (None, _) | (_, None) => Some(ErrorKind::StaleHandle),
                (Some(left), Some(right))
                    if !(left.caps.transferable && right.caps.transferable) =>
                {
                    Some(ErrorKind::NotTransferable)
                }
                _ => None,
            }
        };
        if let Some(kind) = gate {
            return Err(self.raise(Error::new(kind)));
        }

        let (content_a, caps_a) = match self.table.get_mut(a) {
            Some(record) => (
                mem::replace(&mut record.content, Content::Empty),
                record.caps,
            ),
            None => return Err(self.raise(Error::new(ErrorKind::StaleHandle))),
        };
        let (content_b, caps_b) = match self.table.get_mut(b) {
            Some(record) => (
                mem::replace(&mut record.content, content_a),
                mem::replace(&mut record.caps, caps_a),
            ),
            None => return Err(self.raise(Error::new(ErrorKind::StaleHandle))),
        };
        if let Some(record) = self.table.get_mut(a) {
            record.content = content_b;
            record.caps = caps_b;
        }
        Ok(())
    }

    /// Lowers a handle's recorded scope level to one above the current
    /// scope, so the enclosing scope's unwind destroys it instead of the
    /// current one's.
    ///
    /// A lightweight alternative to `transfer` for returning ownership up
    /// one level without a pre-reserved destination.
    pub fn yield_up(&mut self, handle: HandleId) -> Result<()> {
        let parent = self.depth - 1;
        match self.table.get_mut(handle) {
            Some(record) => {
                record.level = parent;
                Ok(())
            }
            None => Err(self.raise(Error::new(ErrorKind::StaleHandle))),
        }
    }

    /// Reads the payload behind a handle, following a strong forward link
    /// to the shared node's payload slot if necessary.
    ///
    /// Raises [`ErrorKind::NotWritable`] for weak links and empty handles,
    /// and [`ErrorKind::TypeMismatch`] if the payload is not a `T`.
    pub fn with_payload<T, R, F>(&mut self, handle: HandleId, f: F) -> Result<R>
    where
        T: Any,
        F: FnOnce(&T) -> R,
    {
        match self.payload_route(handle) {
            Route::Deny(kind) => Err(self.raise(Error::new(kind))),
            Route::Direct => {
                let kind = match self.table.get(handle).map(|record| &record.content) {
                    Some(Content::Owned(resource)) => match resource.downcast_ref::<T>() {
                        Some(value) => return Ok(f(value)),
                        None => ErrorKind::TypeMismatch,
                    },
                    _ => ErrorKind::StaleHandle,
                };
                Err(self.raise(Error::new(kind)))
            }
            Route::Via(node) => {
                let outcome = {
                    let guard = node.payload.lock();
                    match guard.as_ref() {
                        Some(resource) => match resource.downcast_ref::<T>() {
                            Some(value) => Ok(f(value)),
                            None => Err(ErrorKind::TypeMismatch),
                        },
                        None => Err(ErrorKind::StaleHandle),
                    }
                };
                outcome.map_err(|kind| self.raise(Error::new(kind)))
            }
        }
    }

    /// Mutable variant of [`with_payload`](Self::with_payload).
    pub fn with_payload_mut<T, R, F>(&mut self, handle: HandleId, f: F) -> Result<R>
    where
        T: Any,
        F: FnOnce(&mut T) -> R,
    {
        match self.payload_route(handle) {
            Route::Deny(kind) => Err(self.raise(Error::new(kind))),
            Route::Direct => {
                let kind = match self.table.get_mut(handle).map(|record| &mut record.content) {
                    Some(Content::Owned(resource)) => match resource.downcast_mut::<T>() {
                        Some(value) => return Ok(f(value)),
                        None => ErrorKind::TypeMismatch,
                    },
                    _ => ErrorKind::StaleHandle,
                };
                Err(self.raise(Error::new(kind)))
            }
            Route::Via(node) => {
                let outcome = {
                    let mut guard = node.payload.lock();
                    match guard.as_mut() {
                        Some(resource) => match resource.downcast_mut::<T>() {
                            Some(value) => Ok(f(value)),
                            None => Err(ErrorKind::TypeMismatch),
                        },
                        None => Err(ErrorKind::StaleHandle),
                    }
                };
                outcome.map_err(|kind| self.raise(Error::new(kind)))
            }
        }
    }

    /// Replaces the payload behind a handle with a new value of the same
    /// type, keeping the destructor.
    ///
    /// This is the reallocation idiom: the handle keeps its stack position
    /// while its payload is renewed. Raises [`ErrorKind::NotWritable`] for
    /// weak links and empty handles.
    pub fn update<T: Any + Send>(&mut self, handle: HandleId, payload: T) -> Result<()> {
        match self.payload_route(handle) {
            Route::Deny(kind) => Err(self.raise(Error::new(kind))),
            Route::Direct => {
                let kind = match self.table.get_mut(handle).map(|record| &mut record.content) {
                    Some(Content::Owned(resource)) => {
                        if resource.replace_value(payload) {
                            return Ok(());
                        }
                        ErrorKind::TypeMismatch
                    }
                    _ => ErrorKind::StaleHandle,
                };
                Err(self.raise(Error::new(kind)))
            }
            Route::Via(node) => {
                let kind = {
                    let mut guard = node.payload.lock();
                    match guard.as_mut() {
                        Some(resource) => {
                            if resource.replace_value(payload) {
                                None
                            } else {
                                Some(ErrorKind::TypeMismatch)
                            }
                        }
                        None => Some(ErrorKind::StaleHandle),
                    }
                };
                match kind {
                    None => Ok(()),
                    Some(kind) => Err(self.raise(Error::new(kind))),
                }
            }
        }
    }

    /// Returns the capabilities of a handle, if it is still live.
    #[must_use]
    pub fn capabilities(&self, handle: HandleId) -> Option<Capabilities> {
        self.table.get(handle).map(|record| record.caps)
    }

    fn payload_route(&self, handle: HandleId) -> Route {
        match self.table.get(handle) {
            None => Route::Deny(ErrorKind::StaleHandle),
            Some(record) => match &record.content {
                Content::Owned(_) => Route::Direct,
                Content::Strong(link) => Route::Via(Arc::clone(link.node())),
                Content::Weak(_) | Content::Empty => Route::Deny(ErrorKind::NotWritable),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn caught_kind(ctx: &mut ThreadContext) -> ErrorKind {
        ctx.take_pending().expect("expected a pending error").kind()
    }

    #[test]
    fn take_latest_returns_then_clears() {
        let mut ctx = ThreadContext::new();
        let id = ctx.adopt_dropping(1_u8);
        assert_eq!(ctx.take_latest().unwrap(), id);
        assert!(ctx.take_latest().is_err());
        assert_eq!(caught_kind(&mut ctx), ErrorKind::NoPendingHandle);
    }

    #[test]
    fn consuming_operations_clear_latest() {
        let mut ctx = ThreadContext::new();
        let id = ctx.adopt_dropping(1_u8);
        ctx.destruct(id).unwrap();
        assert!(ctx.take_latest().is_err());
        ctx.take_pending();
    }

    #[test]
    fn destruct_twice_is_a_stale_handle() {
        let mut ctx = ThreadContext::new();
        let id = ctx.adopt_dropping(5_u32);
        ctx.destruct(id).unwrap();
        assert!(ctx.destruct(id).is_err());
        assert_eq!(caught_kind(&mut ctx), ErrorKind::StaleHandle);
    }

    #[test]
    fn transfer_moves_ownership_without_double_fire() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);

        let mut ctx = ThreadContext::new();
        let destination = ctx.reserve();
        let source = ctx.adopt(9_u32, |_| {
            FIRED.fetch_add(1, Ordering::SeqCst);
        });

        ctx.transfer(source, destination).unwrap();
        assert!(!ctx.is_live(source));
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);

        ctx.destruct(destination).unwrap();
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transfer_releases_displaced_destination_content() {
        static DISPLACED: AtomicUsize = AtomicUsize::new(0);

        let mut ctx = ThreadContext::new();
        let destination = ctx.adopt(1_u8, |_| {
            DISPLACED.fetch_add(1, Ordering::SeqCst);
        });
        let source = ctx.adopt_dropping(2_u8);

        ctx.transfer(source, destination).unwrap();
        assert_eq!(DISPLACED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transfer_to_self_is_rejected() {
        let mut ctx = ThreadContext::new();
        let id = ctx.adopt_dropping(1_u8);
        assert!(ctx.transfer(id, id).is_err());
        assert_eq!(caught_kind(&mut ctx), ErrorKind::NotTransferable);
        assert!(ctx.is_live(id));
    }

    #[test]
    fn swap_exchanges_contents_in_place() {
        let mut ctx = ThreadContext::new();
        let a = ctx.adopt_dropping(String::from("first"));
        let b = ctx.adopt_dropping(String::from("second"));

        ctx.swap(a, b).unwrap();

        let in_a = ctx
            .with_payload::<String, _, _>(a, Clone::clone)
            .unwrap();
        let in_b = ctx
            .with_payload::<String, _, _>(b, Clone::clone)
            .unwrap();
        assert_eq!(in_a, "second");
        assert_eq!(in_b, "first");
    }

    #[test]
    fn update_replaces_payload_and_keeps_destructor() {
        static SEEN: AtomicUsize = AtomicUsize::new(0);

        let mut ctx = ThreadContext::new();
        let id = ctx.adopt(10_usize, |value| {
            SEEN.store(value, Ordering::SeqCst);
        });
        ctx.update(id, 42_usize).unwrap();
        ctx.destruct(id).unwrap();
        assert_eq!(SEEN.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn update_rejects_wrong_type() {
        let mut ctx = ThreadContext::new();
        let id = ctx.adopt_dropping(1_u32);
        assert!(ctx.update(id, "str").is_err());
        assert_eq!(caught_kind(&mut ctx), ErrorKind::TypeMismatch);
    }

    #[test]
    fn empty_handles_expose_no_payload() {
        let mut ctx = ThreadContext::new();
        let id = ctx.reserve();
        assert!(ctx.with_payload::<u8, _, _>(id, |v| *v).is_err());
        assert_eq!(caught_kind(&mut ctx), ErrorKind::NotWritable);
    }
}
