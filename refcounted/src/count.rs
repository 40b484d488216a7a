use crate::loom::sync::atomic::{
    AtomicUsize,
    Ordering::{Acquire, Relaxed, Release},
};
use std::{
    fmt::{Debug, Formatter},
    ptr::NonNull,
};

// Past this point the counter could be driven around to zero by leaked
// references, which would free an object that is still in use.
const MAX_REFCOUNT: usize = isize::MAX as usize;

/// A thread-safe reference count embedded in a counted object.
///
/// A new counter starts at 1, accounting for the [`IntrusivePtr`] the object
/// is about to be handed to.
///
/// [`IntrusivePtr`]: crate::IntrusivePtr
pub struct RefCount(AtomicUsize);

impl RefCount {
    pub fn new() -> Self {
        Self(AtomicUsize::new(1))
    }

    /// Adds a reference.
    ///
    /// Aborts the process if the count exceeds `isize::MAX`.
    pub fn increment(&self) {
        // A new reference can only be made from an existing one, which
        // already keeps the object alive, so no ordering is needed here.
        let prev = self.0.fetch_add(1, Relaxed);
        if prev > MAX_REFCOUNT {
            std::process::abort();
        }
    }

    /// Removes a reference.
    ///
    /// Returns `true` if this was the last reference. Among any number of
    /// concurrent decrements of the same counter, exactly one observes the
    /// transition to zero.
    ///
    /// # Safety
    ///
    /// The caller must own one of the references counted here and must not
    /// use it after this call.
    #[must_use]
    pub unsafe fn decrement(&self) -> bool {
        let prev = self.0.fetch_sub(1, Release);
        debug_assert_ne!(prev, 0, "reference count underflow");
        if prev != 1 {
            return false;
        }

        // Pairs with the Release decrements of all the other owners so that
        // their accesses to the object happen before it is destroyed.
        let _ = self.0.load(Acquire);
        true
    }

    /// Returns `true` if exactly one reference exists.
    ///
    /// This is a snapshot. If another thread may be sharing the object at the
    /// same time, the answer can be stale by the time it is returned.
    pub fn is_unique(&self) -> bool {
        self.0.load(Acquire) == 1
    }

    /// Returns the number of references at the time of the call.
    pub fn get(&self) -> usize {
        self.0.load(Relaxed)
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloning a counted value produces a new object, so the clone starts with a
/// fresh count of 1 instead of copying the references of the original.
impl Clone for RefCount {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl Debug for RefCount {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RefCount").field(&self.get()).finish()
    }
}

/// A type that carries its own reference count and can therefore be managed
/// by an [`IntrusivePtr`].
///
/// The trait is object safe. A trait extending `RefCounted` makes its trait
/// objects countable, and an object released through such a trait object is
/// torn down as its concrete type.
///
/// ```
/// use refcounted::{RefCount, RefCounted};
///
/// struct Node {
///     rc: RefCount,
///     value: u32,
/// }
///
/// unsafe impl RefCounted for Node {
///     fn ref_count(&self) -> &RefCount {
///         &self.rc
///     }
/// }
/// ```
///
/// # Safety
///
/// `ref_count` must return the same [`RefCount`], owned by `self`, on every
/// call. A derived type that embeds another counted type must forward to the
/// embedded counter rather than carry a second one.
///
/// [`IntrusivePtr`]: crate::IntrusivePtr
pub unsafe trait RefCounted {
    fn ref_count(&self) -> &RefCount;

    /// Returns `true` if exactly one reference to `self` exists.
    ///
    /// This is a convenience for callers holding a `&T`. [`IntrusivePtr`]
    /// never calls it and reads the counter itself, so an override cannot
    /// affect whether mutable access is granted.
    ///
    /// [`IntrusivePtr`]: crate::IntrusivePtr
    fn unique(&self) -> bool {
        self.ref_count().is_unique()
    }
}

/// Adds a reference to the object at `ptr`.
///
/// # Safety
///
/// `ptr` must point to a live object, and the reference created here must
/// eventually be given back through [`release`].
pub unsafe fn retain<T: ?Sized + RefCounted>(ptr: NonNull<T>) {
    ptr.as_ref().ref_count().increment();
}

/// Removes a reference to the object at `ptr`, destroying the object if it
/// was the last one.
///
/// Destruction runs the drop glue of the object's concrete type and frees its
/// memory, even when `T` is a trait object.
///
/// # Safety
///
/// `ptr` must point to a live object allocated as a `Box<T>`, and the caller
/// must own one of its references and not use it afterwards.
pub unsafe fn release<T: ?Sized + RefCounted>(ptr: NonNull<T>) {
    if ptr.as_ref().ref_count().decrement() {
        drop(Box::from_raw(ptr.as_ptr()));
    }
}
