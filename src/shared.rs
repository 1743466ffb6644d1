//! Reference-counted shared ownership nodes.
//!
//! A shared node carries independent strong and weak counts, the managed
//! resource, and a list of child resources submitted to it. It is created
//! only by sharing an existing handle, never directly, and is reachable
//! only through handles and [`Shared`] references.
//!
//! # Lifecycle
//!
//! A node is **Alive** while its strong count is positive. When the last
//! strong unit is released the node becomes a **Zombie**: children are
//! destructed in LIFO order, the payload destructor runs, and the implicit
//! weak unit attributed to the strong side drops. When the weak count
//! reaches zero the node is **Gone** and its storage is reclaimed with the
//! last link to it. Transitions are monotonic; promotion of a weak
//! reference is the only operation that can observe a Zombie or Gone node,
//! and it fails safely by rolling back its speculative increment.
//!
//! # Concurrency
//!
//! Counter transitions are lock-free atomics; increments are relaxed and
//! decrements release, with an acquire fence before teardown, mirroring
//! the standard counted-pointer protocol. The payload slot and the child
//! list are guarded by per-node mutexes, because the thread that releases
//! the last strong unit (and therefore runs the destructors) can be any
//! thread that ever held a reference.

use core::fmt;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::context::ThreadContext;
use crate::error::{Error, ErrorKind, Result};
use crate::handle::{Capabilities, Content, HandleId};
use crate::resource::Resource;
use crate::tracing_compat::{debug, trace};

type Children = SmallVec<[Resource; 4]>;

/// The node behind every strong/weak forward link.
pub(crate) struct SharedNode {
    strong: AtomicU32,
    weak: AtomicU32,
    pub(crate) payload: Mutex<Option<Resource>>,
    children: Mutex<Children>,
}

impl SharedNode {
    fn new(resource: Resource) -> Self {
        Self {
            strong: AtomicU32::new(1),
            weak: AtomicU32::new(1),
            payload: Mutex::new(Some(resource)),
            children: Mutex::new(SmallVec::new()),
        }
    }

    /// Accounts one more strong unit. If the count was transiently zero
    /// (concurrent teardown), restores the weak unit the strong side owns.
    fn acquire_strong(&self) {
        if self.strong.fetch_add(1, Ordering::Relaxed) == 0 {
            self.weak.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn acquire_weak(&self) {
        self.weak.fetch_add(1, Ordering::Relaxed);
    }

    /// Speculatively takes a strong unit; rolls back and reports failure
    /// if the payload is already gone.
    fn try_acquire_strong(&self) -> bool {
        if self.strong.fetch_add(1, Ordering::Acquire) == 0 {
            self.strong.fetch_sub(1, Ordering::Release);
            return false;
        }
        true
    }

    fn release_strong(node: &Arc<Self>) {
        if node.strong.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            let mut drained = core::mem::take(&mut *node.children.lock());
            while let Some(child) = drained.pop() {
                drop(child);
            }
            let payload = node.payload.lock().take();
            drop(payload);
            Self::release_weak(node);
        }
    }

    fn release_weak(node: &Arc<Self>) {
        if node.weak.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            trace!("shared node reclaimed");
        }
    }
}

impl fmt::Debug for SharedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedNode")
            .field("strong", &self.strong.load(Ordering::Relaxed))
            .field("weak", &self.weak.load(Ordering::Relaxed))
            .finish()
    }
}

/// One owned strong unit on a shared node.
///
/// Constructed only after the unit has been accounted; dropping releases
/// it, which may tear the node down.
#[derive(Debug)]
pub(crate) struct StrongLink(Arc<SharedNode>);

impl StrongLink {
    pub(crate) fn new(node: Arc<SharedNode>) -> Self {
        Self(node)
    }

    pub(crate) const fn node(&self) -> &Arc<SharedNode> {
        &self.0
    }
}

impl Drop for StrongLink {
    fn drop(&mut self) {
        SharedNode::release_strong(&self.0);
    }
}

/// One owned weak unit on a shared node.
#[derive(Debug)]
pub(crate) struct WeakLink(Arc<SharedNode>);

impl WeakLink {
    pub(crate) fn new(node: Arc<SharedNode>) -> Self {
        Self(node)
    }

    pub(crate) const fn node(&self) -> &Arc<SharedNode> {
        &self.0
    }
}

impl Drop for WeakLink {
    fn drop(&mut self) {
        SharedNode::release_weak(&self.0);
    }
}

/// Reference to a shared ownership node.
///
/// `Shared` is the value handed across threads (through an externally
/// synchronized channel) so another owner can take its own references.
/// Holding a `Shared` does not count as a reference: it keeps the node's
/// storage reachable but neither the payload nor the node's bookkeeping
/// alive. Take a strong or weak reference to participate in ownership.
#[derive(Clone)]
pub struct Shared {
    pub(crate) node: Arc<SharedNode>,
}

impl Shared {
    /// Snapshot of the strong count. Racy by nature; exact only while no
    /// other thread mutates the node.
    #[must_use]
    pub fn strong_count(&self) -> u32 {
        self.node.strong.load(Ordering::Relaxed)
    }

    /// Snapshot of the weak count, including the unit attributed to the
    /// strong side while any strong reference exists.
    #[must_use]
    pub fn weak_count(&self) -> u32 {
        self.node.weak.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("strong", &self.strong_count())
            .field("weak", &self.weak_count())
            .finish()
    }
}

impl ThreadContext {
    /// Moves a handle's resource into a fresh shared node and turns the
    /// handle into a strong forward link to it.
    ///
    /// The node starts with one strong and one weak unit, both attributed
    /// to the converted handle. Raises [`ErrorKind::NotShareable`] if the
    /// handle lacks the capability or does not directly own a resource
    /// (forward links and empty handles cannot be shared).
    pub fn share(&mut self, handle: HandleId) -> Result<Shared> {
        let gate = match self.table.get(handle) {
            None => Some(ErrorKind::StaleHandle),
            Some(record) if !record.caps.shareable => Some(ErrorKind::NotShareable),
            Some(record) if !matches!(record.content, Content::Owned(_)) => {
                Some(ErrorKind::NotShareable)
            }
            Some(_) => None,
        };
        if let Some(kind) = gate {
            return Err(self.raise(Error::new(kind)));
        }

        self.latest = None;
        if let Some(record) = self.table.get_mut(handle) {
            if let Content::Owned(resource) = core::mem::replace(&mut record.content, Content::Empty)
            {
                let node = Arc::new(SharedNode::new(resource));
                record.content = Content::Strong(StrongLink::new(Arc::clone(&node)));
                record.caps = Capabilities::FORWARD;
                debug!(handle = %handle, "handle shared");
                return Ok(Shared { node });
            }
        }
        Err(self.raise(Error::new(ErrorKind::NotShareable)))
    }

    /// Creates a new strong forward link to `target` on this thread's
    /// stack, incrementing the strong count.
    pub fn strong_reference(&mut self, target: &Shared) -> HandleId {
        target.node.acquire_strong();
        let level = self.depth;
        self.push_record(
            Content::Strong(StrongLink::new(Arc::clone(&target.node))),
            Capabilities::FORWARD,
            level,
        )
    }

    /// Creates a new weak forward link to `target`, incrementing the weak
    /// count only. The handle cannot itself be shared or submitted.
    pub fn weak_reference(&mut self, target: &Shared) -> HandleId {
        target.node.acquire_weak();
        let level = self.depth;
        self.push_record(
            Content::Weak(WeakLink::new(Arc::clone(&target.node))),
            Capabilities::FORWARD,
            level,
        )
    }

    /// Promotes a weak reference to a strong one.
    ///
    /// Returns `Ok(None)` if the managed resource is already gone: the
    /// speculative strong increment found a zero count and was rolled
    /// back, so no freed state is ever touched. On success the new handle
    /// has no capabilities and its scope level is yielded up one, matching
    /// the lock-then-return-to-caller idiom. Raises
    /// [`ErrorKind::NotAWeakHandle`] if `handle` is not a weak reference.
    pub fn lock_weak(&mut self, handle: HandleId) -> Result<Option<HandleId>> {
        let node = match self.table.get(handle) {
            None => return Err(self.raise(Error::new(ErrorKind::StaleHandle))),
            Some(record) => match &record.content {
                Content::Weak(link) => Arc::clone(link.node()),
                _ => return Err(self.raise(Error::new(ErrorKind::NotAWeakHandle))),
            },
        };

        if !node.try_acquire_strong() {
            return Ok(None);
        }
        let level = self.depth - 1;
        let id = self.push_record(Content::Strong(StrongLink::new(node)), Capabilities::NONE, level);
        Ok(Some(id))
    }

    /// Relocates a handle to be a child of `target`: unlinks it from the
    /// stack without firing its destructor and appends its resource to the
    /// node's child list.
    ///
    /// The child is destructed when the node's strong count reaches zero,
    /// before the node's own payload. Raises
    /// [`ErrorKind::NotSubmittable`] if the handle lacks the capability
    /// (true for any forward link or weak reference).
    pub fn submit(&mut self, handle: HandleId, target: &Shared) -> Result<()> {
        let gate = match self.table.get(handle) {
            None => Some(ErrorKind::StaleHandle),
            Some(record) if !record.caps.submittable => Some(ErrorKind::NotSubmittable),
            Some(_) => None,
        };
        if let Some(kind) = gate {
            return Err(self.raise(Error::new(kind)));
        }

        self.latest = None;
        match self.unlink_remove(handle) {
            Some(record) => {
                if let Content::Owned(resource) = record.content {
                    target.node.children.lock().push(resource);
                }
                Ok(())
            }
            None => Err(self.raise(Error::new(ErrorKind::StaleHandle))),
        }
    }
}
