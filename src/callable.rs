use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop, MaybeUninit};
use std::ptr;

use static_assertions::const_assert;

/// Inline capacity of a [`Callable`] cell. Continuations that fit (the
/// overwhelmingly common case for completion handlers capturing a few
/// pointers and an executor handle) are stored without allocating.
const INLINE_CAPACITY: usize = 256;
const INLINE_ALIGN: usize = 16;

#[repr(C, align(16))]
struct Storage {
    bytes: [MaybeUninit<u8>; INLINE_CAPACITY],
}

// The storage must at least be able to hold the heap indirection pointer.
const_assert!(mem::size_of::<*mut u8>() <= INLINE_CAPACITY);

/// A move-only, single-shot, type-erased continuation cell.
///
/// A cell is created around an `FnOnce(A)` and is either invoked exactly
/// once (consuming it) or dropped without invocation, in which case the
/// captured state is destroyed. Rust move semantics stand in for the
/// moved-from state of the source design: there is no way to observe a
/// hollowed-out cell.
///
/// Callables that do not fit the inline buffer, or whose alignment
/// exceeds the buffer's, are placed behind a heap indirection. Invoking
/// the heap variant moves the callable onto the stack and frees the
/// indirection first, so no intermediate storage is alive while user
/// code runs.
pub(crate) struct Callable<A> {
    invoke_fn: unsafe fn(*mut u8, A),
    drop_fn: unsafe fn(*mut u8),
    storage: Storage,
    _marker: PhantomData<fn(A)>,
}

// The constructor requires `F: Send`, so the erased storage is sound to
// move across threads even though the compiler can no longer see `F`.
unsafe impl<A> Send for Callable<A> {}

const fn fits_inline<F>() -> bool {
    mem::size_of::<F>() <= INLINE_CAPACITY && mem::align_of::<F>() <= INLINE_ALIGN
}

unsafe fn invoke_inline<A, F: FnOnce(A)>(slot: *mut u8, arg: A) {
    let f = ptr::read(slot.cast::<F>());
    f(arg)
}

unsafe fn drop_inline<F>(slot: *mut u8) {
    ptr::drop_in_place(slot.cast::<F>())
}

unsafe fn invoke_boxed<A, F: FnOnce(A)>(slot: *mut u8, arg: A) {
    let raw = ptr::read(slot.cast::<*mut F>());
    // Moving out of the box releases the indirection before the call.
    let f = *Box::from_raw(raw);
    f(arg)
}

unsafe fn drop_boxed<F>(slot: *mut u8) {
    let raw = ptr::read(slot.cast::<*mut F>());
    drop(Box::from_raw(raw));
}

impl<A> Callable<A> {
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: FnOnce(A) + Send + 'static,
    {
        let mut storage = Storage {
            bytes: [MaybeUninit::uninit(); INLINE_CAPACITY],
        };
        let slot = storage.bytes.as_mut_ptr().cast::<u8>();
        if fits_inline::<F>() {
            unsafe { ptr::write(slot.cast::<F>(), f) };
            Callable {
                invoke_fn: invoke_inline::<A, F>,
                drop_fn: drop_inline::<F>,
                storage,
                _marker: PhantomData,
            }
        } else {
            let raw = Box::into_raw(Box::new(f));
            unsafe { ptr::write(slot.cast::<*mut F>(), raw) };
            Callable {
                invoke_fn: invoke_boxed::<A, F>,
                drop_fn: drop_boxed::<F>,
                storage,
                _marker: PhantomData,
            }
        }
    }

    /// Invokes the stored continuation, consuming the cell.
    pub(crate) fn invoke(self, arg: A) {
        let mut this = ManuallyDrop::new(self);
        let slot = this.storage.bytes.as_mut_ptr().cast::<u8>();
        unsafe { (this.invoke_fn)(slot, arg) }
    }
}

impl<A> Drop for Callable<A> {
    fn drop(&mut self) {
        let slot = self.storage.bytes.as_mut_ptr().cast::<u8>();
        unsafe { (self.drop_fn)(slot) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_inline_invoke() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let c = Callable::new(move |n: usize| {
            hits2.fetch_add(n, Ordering::Relaxed);
        });
        c.invoke(3);
        assert_eq!(hits.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_heap_fallback_invoke() {
        // Capture more than the inline buffer can hold.
        let big = [7u8; 2 * INLINE_CAPACITY];
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let c = Callable::new(move |_: ()| {
            hits2.fetch_add(big.iter().map(|&b| b as usize).sum(), Ordering::Relaxed);
        });
        c.invoke(());
        assert_eq!(hits.load(Ordering::Relaxed), 7 * 2 * INLINE_CAPACITY);
    }

    #[test]
    fn test_overaligned_capture_goes_through_heap() {
        #[repr(align(64))]
        #[derive(Clone, Copy)]
        struct Chunky([u8; 64]);

        let chunk = Chunky([1; 64]);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let c = Callable::new(move |_: ()| {
            hits2.fetch_add(chunk.0[0] as usize, Ordering::Relaxed);
        });
        c.invoke(());
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_drop_without_invoke_releases_captures() {
        let token = Arc::new(());
        let captured = Arc::clone(&token);
        let c = Callable::new(move |_: ()| {
            let _keep = &captured;
        });
        assert_eq!(Arc::strong_count(&token), 2);
        drop(c);
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn test_owned_capture_moves_through_cell() {
        let (tx, rx) = std::sync::mpsc::channel();
        let message = String::from("carried");
        let c = Callable::new(move |suffix: &'static str| {
            tx.send(format!("{message} {suffix}")).unwrap();
        });
        c.invoke("across");
        assert_eq!(rx.recv().unwrap(), "carried across");
    }

    #[test]
    fn test_cell_crosses_threads() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let c = Callable::new(move |_: ()| {
            hits2.fetch_add(1, Ordering::Relaxed);
        });
        std::thread::spawn(move || c.invoke(())).join().unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
