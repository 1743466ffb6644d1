//! Owned payload/destructor pairs.
//!
//! A [`Resource`] couples a type-erased payload with the destructor that
//! releases it. Dropping a `Resource` runs the destructor exactly once;
//! moving it between owners (handle to handle, handle to shared node)
//! carries the obligation along without running it.
//!
//! Payloads and destructors must be `Send`: a resource submitted to a
//! shared node may be released by whichever thread drops the last strong
//! reference.

use core::any::Any;
use core::fmt;

type Payload = Box<dyn Any + Send>;
type DestructorFn = Box<dyn FnOnce(Payload) + Send>;

/// A type-erased payload plus the destructor that releases it.
pub struct Resource {
    payload: Option<Payload>,
    destructor: Option<DestructorFn>,
}

impl Resource {
    /// Couples `payload` with `destructor`.
    ///
    /// The destructor receives the payload back by value when the resource
    /// is released.
    pub fn new<T, F>(payload: T, destructor: F) -> Self
    where
        T: Any + Send,
        F: FnOnce(T) + Send + 'static,
    {
        Self {
            payload: Some(Box::new(payload)),
            destructor: Some(Box::new(move |raw: Payload| {
                if let Ok(value) = raw.downcast::<T>() {
                    destructor(*value);
                }
            })),
        }
    }

    /// Couples `payload` with its ordinary `Drop` implementation.
    pub fn dropping<T: Any + Send>(payload: T) -> Self {
        Self::new(payload, drop)
    }

    /// Returns the payload if it is a `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref())
    }

    /// Returns the payload mutably if it is a `T`.
    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.payload.as_mut().and_then(|p| p.downcast_mut())
    }

    /// Replaces the payload with a new value of the same type.
    ///
    /// The destructor is kept; the previous payload is dropped through its
    /// ordinary `Drop`. Returns false (and drops `value`) if the current
    /// payload is not a `T`.
    pub(crate) fn replace_value<T: Any + Send>(&mut self, value: T) -> bool {
        match self.payload.as_ref() {
            Some(current) if current.is::<T>() => {
                self.payload = Some(Box::new(value));
                true
            }
            _ => false,
        }
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        if let (Some(payload), Some(destructor)) = (self.payload.take(), self.destructor.take()) {
            destructor(payload);
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("armed", &self.destructor.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn destructor_receives_payload_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&fired);
        let resource = Resource::new(7_u32, move |value| {
            assert_eq!(value, 7);
            probe.fetch_add(1, Ordering::SeqCst);
        });
        drop(resource);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_variant_runs_drop() {
        struct Probe(Arc<AtomicUsize>);
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let resource = Resource::dropping(Probe(Arc::clone(&dropped)));
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        drop(resource);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn downcast_respects_type() {
        let mut resource = Resource::dropping(String::from("abc"));
        assert!(resource.downcast_ref::<String>().is_some());
        assert!(resource.downcast_ref::<u32>().is_none());
        resource.downcast_mut::<String>().unwrap().push('d');
        assert_eq!(resource.downcast_ref::<String>().unwrap(), "abcd");
    }

    #[test]
    fn replace_value_checks_type() {
        let mut resource = Resource::dropping(vec![1_u8, 2]);
        assert!(resource.replace_value(vec![3_u8]));
        assert!(!resource.replace_value("wrong type"));
        assert_eq!(resource.downcast_ref::<Vec<u8>>().unwrap(), &[3]);
    }
}
