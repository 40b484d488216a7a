mod count;
mod loom;
mod ptr;

pub use count::{release, retain, RefCount, RefCounted};
pub use ptr::IntrusivePtr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The global allocator could not provide memory for a new object.
    #[error("failed to allocate {size} bytes (align {align}) for a counted object")]
    AllocationFailed { size: usize, align: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Allocates `value` on the heap and returns the only pointer to it.
///
/// ```
/// use refcounted::{make_counted, RefCount, RefCounted};
///
/// struct Message {
///     rc: RefCount,
///     text: String,
/// }
///
/// unsafe impl RefCounted for Message {
///     fn ref_count(&self) -> &RefCount {
///         &self.rc
///     }
/// }
///
/// let msg = make_counted(Message {
///     rc: RefCount::new(),
///     text: "hello".into(),
/// });
/// let copy = msg.clone();
/// assert_eq!(copy.text, "hello");
/// assert!(!msg.unique());
/// drop(copy);
/// assert!(msg.unique());
/// ```
pub fn make_counted<T: RefCounted>(value: T) -> IntrusivePtr<T> {
    IntrusivePtr::new(value)
}

/// Like [`make_counted`], but returns [`Error::AllocationFailed`] if the
/// allocator runs out of memory instead of aborting.
pub fn try_make_counted<T: RefCounted>(value: T) -> Result<IntrusivePtr<T>> {
    IntrusivePtr::try_new(value)
}

/// Converts an [`IntrusivePtr`] to a concrete type into one to a trait object
/// it implements, keeping the same object and count.
///
/// ```
/// use refcounted::{make_counted, upcast, IntrusivePtr, RefCount, RefCounted};
///
/// trait Shape: RefCounted {
///     fn area(&self) -> f64;
/// }
///
/// struct Square {
///     rc: RefCount,
///     side: f64,
/// }
///
/// unsafe impl RefCounted for Square {
///     fn ref_count(&self) -> &RefCount {
///         &self.rc
///     }
/// }
///
/// impl Shape for Square {
///     fn area(&self) -> f64 {
///         self.side * self.side
///     }
/// }
///
/// let square = make_counted(Square { rc: RefCount::new(), side: 2.0 });
/// let shape: IntrusivePtr<dyn Shape> = upcast!(square.clone() => dyn Shape);
/// assert_eq!(shape.area(), 4.0);
/// assert!(shape == square);
/// ```
#[macro_export]
macro_rules! upcast {
    ($ptr:expr => $target:ty) => {{
        let ptr: $crate::IntrusivePtr<_> = $ptr;
        // SAFETY: The closure only type-checks for unsizing coercions, which
        //         keep the address and the drop glue of the object.
        unsafe { $crate::IntrusivePtr::map_raw(ptr, |raw| -> ::core::ptr::NonNull<$target> { raw }) }
    }};
}
