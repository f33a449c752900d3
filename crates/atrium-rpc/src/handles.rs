//! Integer handles for objects referenced across the process boundary.
//!
//! A handle is a small surrogate for a live object owned by one side; the
//! other side only ever sees the integer. Handles are category-scoped (one
//! [`HandleMap`] per category) and monotonic: a released handle's number is
//! never reissued within the process lifetime, so a stale reference can be
//! told apart from a fresh one.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use atrium_proto::RemoteError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    pub fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Distinguished "no such handle" condition, distinct from generic failures
/// so callers can treat "the other side already disposed this" as expected.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum HandleError {
    #[error("no such handle: {handle}")]
    NotFound { handle: Handle },
}

impl From<HandleError> for RemoteError {
    fn from(err: HandleError) -> Self {
        match err {
            HandleError::NotFound { handle } => RemoteError::no_such_handle(handle.raw()),
        }
    }
}

/// Handle table for one object category on the owning side.
#[derive(Debug)]
pub struct HandleMap<T> {
    next: u64,
    entries: HashMap<u64, T>,
}

impl<T> HandleMap<T> {
    pub fn new() -> Self {
        Self {
            next: 0,
            entries: HashMap::new(),
        }
    }

    /// Issues the next handle. Counter only; the handle is dangling until
    /// [`HandleMap::bind`] is called.
    pub fn allocate(&mut self) -> Handle {
        let handle = Handle(self.next);
        self.next += 1;
        handle
    }

    pub fn bind(&mut self, handle: Handle, value: T) {
        debug_assert!(
            !self.entries.contains_key(&handle.raw()),
            "handle {handle} bound twice"
        );
        self.entries.insert(handle.raw(), value);
    }

    /// `allocate` + `bind` in one step.
    pub fn insert(&mut self, value: T) -> Handle {
        let handle = self.allocate();
        self.bind(handle, value);
        handle
    }

    pub fn resolve(&self, handle: Handle) -> Result<&T, HandleError> {
        self.entries
            .get(&handle.raw())
            .ok_or(HandleError::NotFound { handle })
    }

    pub fn resolve_mut(&mut self, handle: Handle) -> Result<&mut T, HandleError> {
        self.entries
            .get_mut(&handle.raw())
            .ok_or(HandleError::NotFound { handle })
    }

    /// Invalidates the handle and returns the object, if it was still bound.
    /// The handle number is not reused.
    pub fn release(&mut self, handle: Handle) -> Option<T> {
        self.entries.remove(&handle.raw())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for HandleMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe [`HandleMap`] for use inside service handlers.
#[derive(Debug)]
pub struct SharedHandleMap<T> {
    inner: Arc<Mutex<HandleMap<T>>>,
}

impl<T> SharedHandleMap<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HandleMap::new())),
        }
    }

    pub fn insert(&self, value: T) -> Handle {
        self.inner.lock().unwrap().insert(value)
    }

    pub fn with<R>(&self, handle: Handle, f: impl FnOnce(&T) -> R) -> Result<R, HandleError> {
        let map = self.inner.lock().unwrap();
        map.resolve(handle).map(f)
    }

    pub fn release(&self, handle: Handle) -> Option<T> {
        self.inner.lock().unwrap().release(handle)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

impl<T> Default for SharedHandleMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for SharedHandleMap<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_handles_resolve_until_released() {
        let mut map = HandleMap::new();
        let h = map.insert("completion-provider");
        assert_eq!(*map.resolve(h).unwrap(), "completion-provider");

        assert_eq!(map.release(h), Some("completion-provider"));
        assert_eq!(map.resolve(h), Err(HandleError::NotFound { handle: h }));
    }

    #[test]
    fn released_handle_numbers_are_never_reissued() {
        let mut map = HandleMap::new();
        let first = map.insert(1);
        map.release(first);
        let second = map.insert(2);
        assert_ne!(first, second);
        assert!(second.raw() > first.raw());
    }

    #[test]
    fn categories_count_independently() {
        let mut trees = HandleMap::new();
        let mut decorations = HandleMap::new();
        let t = trees.insert("tree");
        let d = decorations.insert("decoration");
        // Same number, different categories; each resolves only in its own map.
        assert_eq!(t.raw(), d.raw());
        assert!(trees.resolve(d).is_ok());
        assert!(decorations.resolve(t).is_ok());
    }

    #[test]
    fn resolve_on_never_bound_handle_is_not_found() {
        let map: HandleMap<()> = HandleMap::new();
        let stale = Handle::from_raw(99);
        assert_eq!(
            map.resolve(stale),
            Err(HandleError::NotFound { handle: stale })
        );
    }

    #[test]
    fn handle_error_maps_to_the_remote_no_such_handle_code() {
        use atrium_proto::RemoteErrorCode;

        let err: RemoteError = HandleError::NotFound {
            handle: Handle::from_raw(7),
        }
        .into();
        assert_eq!(err.code, RemoteErrorCode::NoSuchHandle);
    }
}
