use crate::{
    count::{release, retain, RefCounted},
    Error, Result,
};
use std::{
    alloc::Layout,
    cmp::Ordering,
    fmt::{self, Debug, Formatter, Pointer},
    hash::{Hash, Hasher},
    marker::PhantomData,
    mem::ManuallyDrop,
    ops::Deref,
    ptr::NonNull,
};

/// A shared-ownership pointer to an object that carries its own reference
/// count.
///
/// Unlike [`std::sync::Arc`], the count lives inside the pointee (see
/// [`RefCounted`]), so the pointer is a single machine word and can be
/// recreated from a raw address at any time. `T` may be a trait object, in
/// which case the object is destroyed as its concrete type when the last
/// pointer goes away.
///
/// An `IntrusivePtr` can also be null. Dereferencing a null pointer panics.
pub struct IntrusivePtr<T: ?Sized + RefCounted> {
    ptr: Option<NonNull<T>>,
    phantom: PhantomData<T>,
}

unsafe impl<T: ?Sized + RefCounted + Sync + Send> Send for IntrusivePtr<T> {}
unsafe impl<T: ?Sized + RefCounted + Sync + Send> Sync for IntrusivePtr<T> {}

impl<T: RefCounted> IntrusivePtr<T> {
    /// Moves `value` to the heap and returns the only pointer to it.
    ///
    /// The embedded count of `value` must be 1, which is the case for any
    /// freshly constructed or cloned [`RefCount`]. A higher count only leaks
    /// the object.
    ///
    /// [`RefCount`]: crate::RefCount
    pub fn new(value: T) -> Self {
        Self::from(Box::new(value))
    }

    /// Like [`new`], but reports allocation failure instead of aborting.
    ///
    /// On failure `value` is dropped and no object is created.
    ///
    /// [`new`]: #method.new
    pub fn try_new(value: T) -> Result<Self> {
        let layout = Layout::new::<T>();
        if layout.size() == 0 {
            return Ok(Self::new(value));
        }

        // SAFETY: The layout has a non-zero size.
        let raw = unsafe { std::alloc::alloc(layout) }.cast::<T>();
        let Some(ptr) = NonNull::new(raw) else {
            return Err(Error::AllocationFailed {
                size: layout.size(),
                align: layout.align(),
            });
        };

        // SAFETY: The memory was allocated by the global allocator with the
        //         layout of T, which is what Box<T> expects when freeing it.
        unsafe {
            ptr.as_ptr().write(value);
            Ok(Self::adopt(ptr))
        }
    }
}

impl<T: ?Sized + RefCounted> IntrusivePtr<T> {
    pub const fn null() -> Self {
        Self {
            ptr: None,
            phantom: PhantomData,
        }
    }

    /// Takes over a reference that the caller already owns, without
    /// incrementing the count.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live object allocated as a `Box<T>` and the
    /// caller must own one of its references, which is transferred to the
    /// returned pointer.
    pub unsafe fn adopt(ptr: NonNull<T>) -> Self {
        Self {
            ptr: Some(ptr),
            phantom: PhantomData,
        }
    }

    /// Creates a new reference to the object at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live object allocated as a `Box<T>`, kept alive
    /// by some other reference for the duration of this call.
    pub unsafe fn share(ptr: NonNull<T>) -> Self {
        retain(ptr);
        Self::adopt(ptr)
    }

    /// Consumes the pointer without giving up its reference.
    ///
    /// The reference can be reclaimed with [`adopt`] later. Returns `None` for
    /// a null pointer.
    ///
    /// [`adopt`]: #method.adopt
    #[must_use]
    pub fn into_raw(this: Self) -> Option<NonNull<T>> {
        ManuallyDrop::new(this).ptr
    }

    /// Converts the pointer into a pointer to `U` without touching the count.
    ///
    /// Most callers want [`upcast!`], which only admits the conversions that
    /// are sound.
    ///
    /// # Safety
    ///
    /// `f` must return a pointer to the same object, viewed as a type whose
    /// [`RefCounted`] implementation reaches the same counter and whose drop
    /// glue and layout are those of the object.
    ///
    /// [`upcast!`]: crate::upcast
    pub unsafe fn map_raw<U, F>(this: Self, f: F) -> IntrusivePtr<U>
    where
        U: ?Sized + RefCounted,
        F: FnOnce(NonNull<T>) -> NonNull<U>,
    {
        match Self::into_raw(this) {
            Some(ptr) => {
                let mapped = f(ptr);
                debug_assert_eq!(ptr.as_ptr().cast::<()>(), mapped.as_ptr().cast::<()>());
                IntrusivePtr::adopt(mapped)
            }
            None => IntrusivePtr::null(),
        }
    }

    pub const fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    pub const fn as_ptr(&self) -> Option<NonNull<T>> {
        self.ptr
    }

    pub fn get(&self) -> Option<&T> {
        // SAFETY: A non-null pointer holds a reference, so the object is
        //         alive for as long as self is borrowed.
        self.ptr.map(|ptr| unsafe { ptr.as_ref() })
    }

    /// Returns a mutable reference to the object if this is the only pointer
    /// to it.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        if !self.unique() {
            return None;
        }
        // SAFETY: No other pointer exists, and no new one can be made from
        //         this one while it is mutably borrowed.
        self.ptr.map(|mut ptr| unsafe { ptr.as_mut() })
    }

    /// Returns `true` if this is the only pointer to the object. Returns
    /// `false` for a null pointer.
    ///
    /// The answer is only reliable if no other thread can be copying a
    /// pointer to the same object concurrently.
    pub fn unique(&self) -> bool {
        // Goes straight to the counter. `RefCounted::unique` can be
        // overridden, and `get_mut` must not trust it.
        self.get().is_some_and(|value| value.ref_count().is_unique())
    }

    /// Returns the number of references to the object, or 0 for a null
    /// pointer.
    pub fn use_count(&self) -> usize {
        self.get().map_or(0, |value| value.ref_count().get())
    }

    /// Returns `true` if both pointers refer to the same object, or both are
    /// null, regardless of their static types.
    pub fn ptr_eq<U: ?Sized + RefCounted>(&self, other: &IntrusivePtr<U>) -> bool {
        self.addr() == other.addr()
    }

    /// Makes this pointer null and returns its previous value.
    #[must_use]
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Replaces the pointee with that of `other`, returning the old pointer.
    #[must_use]
    pub fn replace(&mut self, other: Self) -> Self {
        std::mem::replace(self, other)
    }

    pub fn swap(&mut self, other: &mut Self) {
        std::mem::swap(self, other);
    }

    /// Gives up this pointer's reference, destroying the object if it was the
    /// last one, and makes the pointer null.
    pub fn reset(&mut self) {
        drop(self.take());
    }

    /// Adopts `ptr` as in [`adopt`] and then gives up the previous reference.
    ///
    /// # Safety
    ///
    /// See [`adopt`].
    ///
    /// [`adopt`]: #method.adopt
    pub unsafe fn reset_adopt(&mut self, ptr: Option<NonNull<T>>) {
        *self = match ptr {
            Some(ptr) => Self::adopt(ptr),
            None => Self::null(),
        };
    }

    /// Shares `ptr` as in [`share`] and then gives up the previous reference.
    ///
    /// Resetting to the object already held is harmless: the new reference is
    /// taken before the old one is given up.
    ///
    /// # Safety
    ///
    /// See [`share`].
    ///
    /// [`share`]: #method.share
    pub unsafe fn reset_share(&mut self, ptr: Option<NonNull<T>>) {
        *self = match ptr {
            Some(ptr) => Self::share(ptr),
            None => Self::null(),
        };
    }

    fn addr(&self) -> *const () {
        self.ptr
            .map_or(std::ptr::null(), |ptr| ptr.as_ptr().cast_const().cast())
    }
}

impl<T: RefCounted + Clone> IntrusivePtr<T> {
    /// Returns a mutable reference to the object, first replacing it with a
    /// private copy if it is shared.
    ///
    /// # Panics
    ///
    /// Panics if the pointer is null.
    pub fn make_mut(&mut self) -> &mut T {
        if !self.unique() {
            let copy = T::clone(&**self);
            *self = Self::new(copy);
        }
        let Some(mut ptr) = self.ptr else {
            null_deref()
        };
        // SAFETY: The object is unique and self is mutably borrowed.
        unsafe { ptr.as_mut() }
    }
}

impl<T: ?Sized + RefCounted> From<Box<T>> for IntrusivePtr<T> {
    /// Takes ownership of a boxed object, including unsized ones such as
    /// `Box<dyn Trait>`.
    fn from(value: Box<T>) -> Self {
        // SAFETY: The object has just been leaked from a Box. Its count is at
        //         least 1 since it can only be decremented unsafely, and the
        //         reference it accounts for is not held by anyone else.
        unsafe { Self::adopt(NonNull::from(Box::leak(value))) }
    }
}

impl<T: ?Sized + RefCounted> Default for IntrusivePtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: ?Sized + RefCounted> Clone for IntrusivePtr<T> {
    fn clone(&self) -> Self {
        match self.ptr {
            // SAFETY: self holds a reference that keeps the object alive.
            Some(ptr) => unsafe { Self::share(ptr) },
            None => Self::null(),
        }
    }

    fn clone_from(&mut self, source: &Self) {
        if self.ptr_eq(source) {
            return;
        }
        // The right-hand side takes its reference before the old pointee is
        // released.
        *self = source.clone();
    }
}

impl<T: ?Sized + RefCounted> Drop for IntrusivePtr<T> {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr {
            // SAFETY: self owns a reference and is not used after this.
            unsafe { release(ptr) };
        }
    }
}

impl<T: ?Sized + RefCounted> Deref for IntrusivePtr<T> {
    type Target = T;

    #[track_caller]
    fn deref(&self) -> &T {
        let Some(value) = self.get() else {
            null_deref()
        };
        value
    }
}

#[cold]
#[track_caller]
fn null_deref() -> ! {
    panic!("dereferenced a null IntrusivePtr")
}

impl<T, U> PartialEq<IntrusivePtr<U>> for IntrusivePtr<T>
where
    T: ?Sized + RefCounted,
    U: ?Sized + RefCounted,
{
    fn eq(&self, other: &IntrusivePtr<U>) -> bool {
        self.ptr_eq(other)
    }
}

impl<T: ?Sized + RefCounted> Eq for IntrusivePtr<T> {}

impl<T: ?Sized + RefCounted> PartialOrd for IntrusivePtr<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: ?Sized + RefCounted> Ord for IntrusivePtr<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr().cmp(&other.addr())
    }
}

impl<T: ?Sized + RefCounted> Hash for IntrusivePtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl<T: ?Sized + RefCounted + Debug> Debug for IntrusivePtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => Debug::fmt(value, f),
            None => f.write_str("null"),
        }
    }
}

impl<T: ?Sized + RefCounted> Pointer for IntrusivePtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Pointer::fmt(&self.addr(), f)
    }
}
