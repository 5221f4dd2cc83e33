//! Purpose: Explicit-lifecycle mutex and condition variable over POSIX threads.
//! Exports: `Mutex`, `MutexGuard`, `Condvar`.
//! Role: Leaf primitives the thread handle and module registry lock with.
//! Invariants: OS objects live in a `Box` and never move after `pthread_*_init`.
//! Invariants: Unlock happens only through guard drop; clear happens only through value drop.
//! Notes: Locking is not reentrant; relocking from the owning thread deadlocks.
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr;

struct RawMutex(UnsafeCell<libc::pthread_mutex_t>);

impl RawMutex {
    fn boxed() -> Box<Self> {
        let raw = Box::new(Self(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER)));
        let rc = unsafe { libc::pthread_mutex_init(raw.0.get(), ptr::null()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_init");
        raw
    }

    fn lock(&self) {
        let rc = unsafe { libc::pthread_mutex_lock(self.0.get()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_lock");
    }

    fn try_lock(&self) -> bool {
        unsafe { libc::pthread_mutex_trylock(self.0.get()) == 0 }
    }

    /// # Safety
    ///
    /// The calling thread must hold the lock.
    unsafe fn unlock(&self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.0.get()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_unlock");
    }
}

impl Drop for RawMutex {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_destroy(self.0.get());
        }
    }
}

/// Mutual-exclusion lock guarding a value of type `T`.
///
/// `new` is the init step; dropping the mutex (or calling
/// [`Mutex::into_inner`]) is the clear step and releases the OS lock.
pub struct Mutex<T: ?Sized> {
    raw: Box<RawMutex>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            raw: RawMutex::boxed(),
            data: UnsafeCell::new(value),
        }
    }

    /// Destroys the OS lock and hands back the protected value.
    pub fn into_inner(self) -> T {
        let Self { raw, data } = self;
        drop(raw);
        data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Blocks until the lock is acquired.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.lock();
        MutexGuard::new(self)
    }

    /// Acquires the lock only if nobody holds it right now.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(MutexGuard::new(self))
        } else {
            None
        }
    }

    /// Exclusive borrow proves no guard is alive, so no locking is needed.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").finish_non_exhaustive()
    }
}

/// Proof of holding a [`Mutex`]; the lock is released when this drops.
#[must_use = "dropping the guard unlocks the mutex immediately"]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    // pthread mutexes must be unlocked by the thread that locked them.
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    fn new(mutex: &'a Mutex<T>) -> Self {
        Self {
            mutex,
            _not_send: PhantomData,
        }
    }

    /// Explicit spelling of the unlock step.
    pub fn unlock(self) {
        drop(self);
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.mutex.raw.0.get()
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.mutex.raw.unlock() }
    }
}

struct RawCondvar(UnsafeCell<libc::pthread_cond_t>);

impl Drop for RawCondvar {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_cond_destroy(self.0.get());
        }
    }
}

/// Condition variable paired with a [`Mutex`] at wait time.
///
/// Only single-waiter wakeup is offered; there is no broadcast.
pub struct Condvar {
    raw: Box<RawCondvar>,
}

unsafe impl Send for Condvar {}
unsafe impl Sync for Condvar {}

impl Condvar {
    pub fn new() -> Self {
        let raw = Box::new(RawCondvar(UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER)));
        let rc = unsafe { libc::pthread_cond_init(raw.0.get(), ptr::null()) };
        debug_assert_eq!(rc, 0, "pthread_cond_init");
        Self { raw }
    }

    /// Atomically releases the guard's mutex, sleeps until signaled, and
    /// reacquires the mutex before returning.
    ///
    /// Wakeups may be spurious; callers re-check their predicate or use
    /// [`Condvar::wait_while`].
    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let rc = unsafe { libc::pthread_cond_wait(self.raw.0.get(), guard.raw()) };
        debug_assert_eq!(rc, 0, "pthread_cond_wait");
        guard
    }

    /// Waits for as long as `condition` returns true.
    pub fn wait_while<'a, T, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut condition: F,
    ) -> MutexGuard<'a, T>
    where
        T: ?Sized,
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *guard) {
            guard = self.wait(guard);
        }
        guard
    }

    /// Wakes at least one waiter, if any.
    pub fn signal(&self) {
        let rc = unsafe { libc::pthread_cond_signal(self.raw.0.get()) };
        debug_assert_eq!(rc, 0, "pthread_cond_signal");
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar").finish_non_exhaustive()
    }
}
