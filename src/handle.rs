use std::fmt;
use std::mem;

use tracing::trace;

/// Describes one kind of externally-acquired resource: the raw handle type,
/// the value that means "nothing owned", and how to give the resource back.
///
/// A kind is a value, so it may carry state the release call needs (a buffer
/// length, a parent handle). Stateless kinds usually derive `Default`.
pub trait HandleKind {
    type Raw: Copy + PartialEq;

    /// The sentinel meaning "no resource". Must return the same value for the
    /// lifetime of the kind.
    fn invalid(&self) -> Self::Raw;

    /// Relinquish `raw`. Only ever called with a non-invalid value, once per
    /// value. Must not panic; failures are the kind's to log or ignore.
    fn release(&mut self, raw: Self::Raw);
}

/// A kind built from a sentinel and a release closure.
///
/// ```
/// use unique_handle::{ReleaseFn, UniqueHandle};
///
/// let mut closed = Vec::new();
/// {
///     let kind = ReleaseFn::new(-1, |fd: i32| closed.push(fd));
///     let mut fd = UniqueHandle::with_kind(kind, 3);
///     fd.reset(4);
/// }
/// assert_eq!(closed, vec![3, 4]);
/// ```
#[derive(Clone)]
pub struct ReleaseFn<T, F> {
    invalid: T,
    release: F,
}

impl<T, F> ReleaseFn<T, F>
where
    T: Copy + PartialEq,
    F: FnMut(T),
{
    pub fn new(invalid: T, release: F) -> Self {
        Self { invalid, release }
    }
}

impl<T, F> HandleKind for ReleaseFn<T, F>
where
    T: Copy + PartialEq,
    F: FnMut(T),
{
    type Raw = T;

    fn invalid(&self) -> T {
        self.invalid
    }

    fn release(&mut self, raw: T) {
        (self.release)(raw)
    }
}

impl<T: fmt::Debug, F> fmt::Debug for ReleaseFn<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseFn")
            .field("invalid", &self.invalid)
            .finish_non_exhaustive()
    }
}

/// Sole owner of a raw handle of kind `K`.
///
/// Every non-invalid value stored in a `UniqueHandle` is passed to
/// [`HandleKind::release`] exactly once: when it is replaced by [`reset`],
/// or when the handle is dropped. [`release`] hands the value back to the
/// caller without releasing it.
///
/// The type is neither `Clone` nor `Copy`. Rust moves never run `Drop` on the
/// moved-from place, so moving a `UniqueHandle` transfers ownership; use
/// [`transfer`] to move out of a `&mut` while leaving an empty handle behind.
///
/// No internal synchronisation: a handle is `Send`/`Sync` only when its kind
/// and raw type are.
///
/// [`reset`]: UniqueHandle::reset
/// [`release`]: UniqueHandle::release
/// [`transfer`]: UniqueHandle::transfer
pub struct UniqueHandle<K: HandleKind> {
    value: K::Raw,
    kind: K,
}

impl<K: HandleKind + Default> UniqueHandle<K> {
    /// An empty handle.
    pub fn new() -> Self {
        Self::empty(K::default())
    }

    /// Take ownership of `raw`. No validation is done beyond the sentinel
    /// comparison; passing the sentinel yields an empty handle.
    pub fn from_raw(raw: K::Raw) -> Self {
        Self::with_kind(K::default(), raw)
    }
}

impl<K: HandleKind + Default> Default for UniqueHandle<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: HandleKind> UniqueHandle<K> {
    pub fn with_kind(kind: K, raw: K::Raw) -> Self {
        Self { value: raw, kind }
    }

    pub fn empty(kind: K) -> Self {
        let value = kind.invalid();
        Self { value, kind }
    }

    /// Run a creation call and adopt what it returns. On error nothing is
    /// owned and the error is passed through untouched.
    pub fn acquire_with<E>(kind: K, create: impl FnOnce() -> Result<K::Raw, E>) -> Result<Self, E> {
        create().map(|raw| Self::with_kind(kind, raw))
    }

    pub fn is_valid(&self) -> bool {
        self.value != self.kind.invalid()
    }

    /// The raw value, for calls that borrow the resource without taking it.
    pub fn get(&self) -> K::Raw {
        self.value
    }

    /// Release the owned value (if any), then own `raw`. Returns whether the
    /// handle now owns something.
    pub fn reset(&mut self, raw: K::Raw) -> bool {
        self.close();
        self.value = raw;
        self.is_valid()
    }

    /// Release the owned value (if any) and become empty.
    pub fn clear(&mut self) {
        self.close();
    }

    /// Like [`reset`](Self::reset), but the new value comes from a fallible
    /// creation call. The current value is released before `create` runs, so
    /// on error the handle is left empty.
    pub fn reset_with<E>(&mut self, create: impl FnOnce() -> Result<K::Raw, E>) -> Result<bool, E> {
        self.close();
        let raw = create()?;
        Ok(self.reset(raw))
    }

    /// Give up ownership without releasing. The caller becomes responsible
    /// for the returned value; the handle is empty afterwards.
    #[must_use = "the released value is no longer owned by anything"]
    pub fn release(&mut self) -> K::Raw {
        let invalid = self.kind.invalid();
        mem::replace(&mut self.value, invalid)
    }

    /// Move the owned value into a new handle, leaving `self` empty.
    pub fn transfer(&mut self) -> Self
    where
        K: Clone,
    {
        let raw = self.release();
        Self::with_kind(self.kind.clone(), raw)
    }

    /// Pointer to the internal slot, for creation APIs that write the new
    /// handle through an out-parameter.
    ///
    /// Writing through the pointer does not release what the slot held
    /// before, so the handle must be empty when this is used; anything it
    /// owned at that point leaks. The pointer is valid until `self` is moved
    /// or otherwise borrowed.
    pub fn as_out_ptr(&mut self) -> *mut K::Raw {
        debug_assert!(!self.is_valid(), "out-pointer taken on an owning handle");
        &mut self.value
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    fn close(&mut self) {
        if self.is_valid() {
            // Clear the slot first so a panicking release is never re-run
            // from Drop for the same value.
            let raw = self.release();
            trace!(kind = std::any::type_name::<K>(), "releasing handle");
            self.kind.release(raw);
        }
    }
}

impl<K: HandleKind> Drop for UniqueHandle<K> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<K> fmt::Debug for UniqueHandle<K>
where
    K: HandleKind,
    K::Raw: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniqueHandle")
            .field("value", &self.value)
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::panic::{self, AssertUnwindSafe};
    use std::rc::Rc;

    /// Kind over `i32` with sentinel `-1` that records every release.
    #[derive(Clone, Default)]
    struct Recorder {
        released: Rc<RefCell<Vec<i32>>>,
    }

    impl Recorder {
        fn released(&self) -> Vec<i32> {
            self.released.borrow().clone()
        }
    }

    impl HandleKind for Recorder {
        type Raw = i32;

        fn invalid(&self) -> i32 {
            -1
        }

        fn release(&mut self, raw: i32) {
            self.released.borrow_mut().push(raw);
        }
    }

    #[test]
    fn reset_twice_then_drop_releases_each_value_in_order() {
        let rec = Recorder::default();
        {
            let mut h = UniqueHandle::empty(rec.clone());
            assert!(h.reset(5));
            assert!(h.reset(7));
            assert_eq!(rec.released(), vec![5]);
        }
        assert_eq!(rec.released(), vec![5, 7]);
    }

    #[test]
    fn empty_handle_never_releases() {
        let rec = Recorder::default();
        {
            let h = UniqueHandle::empty(rec.clone());
            assert!(!h.is_valid());
            assert_eq!(h.get(), -1);
        }
        assert!(rec.released().is_empty());
    }

    #[test]
    fn release_hands_value_back_without_releasing() {
        let rec = Recorder::default();
        {
            let mut h = UniqueHandle::with_kind(rec.clone(), 9);
            assert_eq!(h.release(), 9);
            assert!(!h.is_valid());
            assert_eq!(h.get(), -1);
        }
        assert!(rec.released().is_empty());
    }

    #[test]
    fn reset_to_invalid_releases_once() {
        let rec = Recorder::default();
        let mut h = UniqueHandle::with_kind(rec.clone(), 3);
        assert!(!h.reset(-1));
        assert_eq!(rec.released(), vec![3]);
        drop(h);
        assert_eq!(rec.released(), vec![3]);
    }

    #[test]
    fn reset_invalid_on_empty_is_a_no_op() {
        let rec = Recorder::default();
        let mut h = UniqueHandle::empty(rec.clone());
        assert!(!h.reset(-1));
        h.clear();
        drop(h);
        assert!(rec.released().is_empty());
    }

    #[test]
    fn get_is_idempotent() {
        let rec = Recorder::default();
        let h = UniqueHandle::with_kind(rec.clone(), 11);
        for _ in 0..5 {
            assert_eq!(h.get(), 11);
            assert!(h.is_valid());
        }
        assert!(rec.released().is_empty());
    }

    #[test]
    fn release_count_matches_replaced_values() {
        let rec = Recorder::default();
        {
            let mut h = UniqueHandle::with_kind(rec.clone(), 1);
            for v in [2, -1, 3, 4, -1, -1, 5] {
                h.reset(v);
            }
        }
        assert_eq!(rec.released(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn transfer_leaves_source_empty() {
        let rec = Recorder::default();
        let mut src = UniqueHandle::with_kind(rec.clone(), 42);
        let dst = src.transfer();
        assert!(!src.is_valid());
        assert_eq!(dst.get(), 42);
        drop(src);
        assert!(rec.released().is_empty());
        drop(dst);
        assert_eq!(rec.released(), vec![42]);
    }

    #[test]
    fn moved_handle_releases_once() {
        let rec = Recorder::default();
        let h = UniqueHandle::with_kind(rec.clone(), 8);
        let holder = vec![h];
        drop(holder);
        assert_eq!(rec.released(), vec![8]);
    }

    #[test]
    fn released_value_can_be_adopted_elsewhere() {
        let rec = Recorder::default();
        let mut a = UniqueHandle::with_kind(rec.clone(), 6);
        let mut b = UniqueHandle::empty(rec.clone());
        b.reset(a.release());
        drop(a);
        assert!(rec.released().is_empty());
        drop(b);
        assert_eq!(rec.released(), vec![6]);
    }

    #[test]
    fn acquire_with_passes_errors_through() {
        let rec = Recorder::default();
        let err = UniqueHandle::acquire_with(rec.clone(), || Err::<i32, _>("busy")).unwrap_err();
        assert_eq!(err, "busy");

        let h = UniqueHandle::acquire_with(rec.clone(), || Ok::<_, &str>(12)).unwrap();
        assert_eq!(h.get(), 12);
        drop(h);
        assert_eq!(rec.released(), vec![12]);
    }

    #[test]
    fn reset_with_releases_before_create_runs() {
        let rec = Recorder::default();
        let mut h = UniqueHandle::with_kind(rec.clone(), 1);
        let seen = rec.clone();
        let res = h.reset_with(|| {
            assert_eq!(seen.released(), vec![1]);
            Err::<i32, _>(())
        });
        assert!(res.is_err());
        assert!(!h.is_valid());

        assert_eq!(h.reset_with(|| Ok::<_, ()>(2)), Ok(true));
        drop(h);
        assert_eq!(rec.released(), vec![1, 2]);
    }

    #[test]
    fn out_ptr_populates_empty_handle() {
        fn create(out: *mut i32) -> i32 {
            unsafe { *out = 77 };
            0
        }

        let rec = Recorder::default();
        let mut h = UniqueHandle::empty(rec.clone());
        assert_eq!(create(h.as_out_ptr()), 0);
        assert!(h.is_valid());
        assert_eq!(h.get(), 77);
        drop(h);
        assert_eq!(rec.released(), vec![77]);
    }

    #[test]
    fn release_fn_captures_state() {
        let size = 4096usize;
        let freed = RefCell::new(Vec::new());
        {
            let kind = ReleaseFn::new(0usize, |addr: usize| freed.borrow_mut().push((addr, size)));
            let mut region = UniqueHandle::with_kind(kind, 0x1000);
            region.reset(0x2000);
        }
        assert_eq!(freed.into_inner(), vec![(0x1000, 4096), (0x2000, 4096)]);
    }

    #[test]
    fn default_kind_constructors() {
        let empty = UniqueHandle::<Recorder>::new();
        assert!(!empty.is_valid());
        assert!(!UniqueHandle::<Recorder>::default().is_valid());

        let h = UniqueHandle::<Recorder>::from_raw(21);
        let rec = h.kind().clone();
        assert!(h.is_valid());
        drop(h);
        assert_eq!(rec.released(), vec![21]);

        let h = UniqueHandle::<Recorder>::from_raw(-1);
        let rec = h.kind().clone();
        assert!(!h.is_valid());
        drop(h);
        assert!(rec.released().is_empty());
    }

    /// Kind whose release counts the call, then panics.
    struct PanicOnRelease {
        calls: Rc<Cell<u32>>,
    }

    impl HandleKind for PanicOnRelease {
        type Raw = i32;

        fn invalid(&self) -> i32 {
            -1
        }

        fn release(&mut self, _raw: i32) {
            self.calls.set(self.calls.get() + 1);
            panic!("release failed");
        }
    }

    #[test]
    fn panicking_release_runs_once() {
        let calls = Rc::new(Cell::new(0));
        let kind = PanicOnRelease {
            calls: calls.clone(),
        };
        let result = panic::catch_unwind(AssertUnwindSafe(move || {
            let mut h = UniqueHandle::with_kind(kind, 4);
            h.reset(5);
        }));
        assert!(result.is_err());
        // The handle was dropped while unwinding; its slot was already empty.
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn debug_shows_value_and_validity() {
        let h = UniqueHandle::with_kind(Recorder::default(), 5);
        assert_eq!(format!("{h:?}"), "UniqueHandle { value: 5, valid: true }");
    }
}
