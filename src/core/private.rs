//! Purpose: Process-wide, lazily keyed thread-local slots with a per-slot destructor.
//! Exports: `PrivateSlot`.
//! Role: Carries each spawned thread's self-reference until thread exit.
//! Invariants: Exactly one OS key is created per slot, even under a racing first use.
//! Invariants: The destructor runs once per thread holding a value, with its last value.
//! Invariants: A value lent out by `with` cannot be replaced or removed until the closure returns.
//! Notes: Keys are never deleted; slots live for the whole process.
use std::cell::{Cell, UnsafeCell};
use std::ffi::c_void;
use std::marker::PhantomData;
use std::ptr;
#[cfg(test)]
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

struct KeyCell {
    key: UnsafeCell<libc::pthread_key_t>,
    ready: AtomicBool,
}

impl KeyCell {
    fn new() -> Self {
        Self {
            key: UnsafeCell::new(0),
            ready: AtomicBool::new(false),
        }
    }
}

struct Entry<V> {
    value: V,
    destroy: fn(V),
    lent: Cell<bool>,
}

// Marks an entry as lent for the duration of a `with` call, unwinding included.
struct Lend<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

impl<'a> Lend<'a> {
    fn new(flag: &'a Cell<bool>) -> Self {
        let previous = flag.replace(true);
        Self { flag, previous }
    }
}

impl Drop for Lend<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}

/// A named thread-local cell declared as a `static`.
///
/// ```
/// use jacques::api::PrivateSlot;
///
/// static REQUEST_ID: PrivateSlot<u64> = PrivateSlot::with_drop();
///
/// assert_eq!(REQUEST_ID.get(), None);
/// REQUEST_ID.set(7);
/// assert_eq!(REQUEST_ID.get(), Some(7));
/// ```
pub struct PrivateSlot<V: 'static> {
    cell: AtomicPtr<KeyCell>,
    destroy: fn(V),
    #[cfg(test)]
    creations: AtomicUsize,
    _values: PhantomData<fn(V)>,
}

impl<V: 'static> PrivateSlot<V> {
    /// Declares a slot whose thread-exit destructor is `destroy`.
    pub const fn new(destroy: fn(V)) -> Self {
        Self {
            cell: AtomicPtr::new(ptr::null_mut()),
            destroy,
            #[cfg(test)]
            creations: AtomicUsize::new(0),
            _values: PhantomData,
        }
    }

    /// Declares a slot whose destructor simply drops the value.
    pub const fn with_drop() -> Self {
        Self::new(drop::<V>)
    }

    /// Whether any thread has touched the slot yet.
    pub fn is_initialized(&self) -> bool {
        !self.cell.load(Ordering::Acquire).is_null()
    }

    fn key(&self) -> libc::pthread_key_t {
        let mut cell = self.cell.load(Ordering::Acquire);
        if cell.is_null() {
            let candidate = Box::into_raw(Box::new(KeyCell::new()));
            match self.cell.compare_exchange(
                ptr::null_mut(),
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let rc = unsafe {
                        libc::pthread_key_create((*candidate).key.get(), Some(run_destructor::<V>))
                    };
                    assert_eq!(rc, 0, "pthread_key_create failed: out of thread-local keys");
                    #[cfg(test)]
                    self.creations.fetch_add(1, Ordering::SeqCst);
                    unsafe { (*candidate).ready.store(true, Ordering::Release) };
                    cell = candidate;
                }
                Err(winner) => {
                    drop(unsafe { Box::from_raw(candidate) });
                    cell = winner;
                }
            }
        }

        // A loser of the race may arrive before the winner finished creating the key.
        let cell = unsafe { &*cell };
        while !cell.ready.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        unsafe { *cell.key.get() }
    }

    fn current(&self, key: libc::pthread_key_t) -> *mut Entry<V> {
        unsafe { libc::pthread_getspecific(key) as *mut Entry<V> }
    }

    fn ensure_not_lent(&self, entry: *mut Entry<V>) {
        if !entry.is_null() && unsafe { (*entry).lent.get() } {
            panic!("PrivateSlot value replaced while lent out by `with`");
        }
    }

    /// Runs `f` against the calling thread's value.
    ///
    /// # Panics
    ///
    /// Panics if the OS runs out of thread-local keys on first use. Calling
    /// [`PrivateSlot::set`] or [`PrivateSlot::take`] on this slot from inside
    /// `f` panics instead of invalidating the borrowed value.
    pub fn with<R>(&self, f: impl FnOnce(Option<&V>) -> R) -> R {
        let entry = self.current(self.key());
        if entry.is_null() {
            return f(None);
        }
        let entry = unsafe { &*entry };
        let _lend = Lend::new(&entry.lent);
        f(Some(&entry.value))
    }

    /// Returns a copy of the calling thread's value, if it ever set one.
    ///
    /// # Panics
    ///
    /// Panics if the OS runs out of thread-local keys on first use.
    pub fn get(&self) -> Option<V>
    where
        V: Clone,
    {
        self.with(|value| value.cloned())
    }

    /// Stores `value` for the calling thread and hands back the value it
    /// replaces; the replaced value does not go through the destructor.
    ///
    /// # Panics
    ///
    /// Panics if the OS runs out of thread-local keys or refuses to store
    /// the value, and when called from inside [`PrivateSlot::with`] on the
    /// same slot.
    pub fn set(&self, value: V) -> Option<V> {
        let key = self.key();
        let previous = self.current(key);
        self.ensure_not_lent(previous);
        let entry = Box::into_raw(Box::new(Entry {
            value,
            destroy: self.destroy,
            lent: Cell::new(false),
        }));
        let rc = unsafe { libc::pthread_setspecific(key, entry as *const c_void) };
        assert_eq!(rc, 0, "pthread_setspecific failed");
        unpack(previous)
    }

    /// Removes the calling thread's value without running the destructor.
    ///
    /// # Panics
    ///
    /// Panics when called from inside [`PrivateSlot::with`] on the same slot.
    pub fn take(&self) -> Option<V> {
        let key = self.key();
        let previous = self.current(key);
        self.ensure_not_lent(previous);
        if !previous.is_null() {
            unsafe {
                libc::pthread_setspecific(key, ptr::null());
            }
        }
        unpack(previous)
    }

    #[cfg(test)]
    pub(crate) fn key_creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }
}

fn unpack<V>(entry: *mut Entry<V>) -> Option<V> {
    if entry.is_null() {
        return None;
    }
    let entry = unsafe { Box::from_raw(entry) };
    Some(entry.value)
}

unsafe extern "C" fn run_destructor<V>(data: *mut c_void) {
    if data.is_null() {
        return;
    }
    let entry = unsafe { Box::from_raw(data as *mut Entry<V>) };
    let Entry { value, destroy, .. } = *entry;
    destroy(value);
}
