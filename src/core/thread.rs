//! Purpose: Reference-counted handles over spawned OS threads.
//! Exports: `ThreadHandle`.
//! Role: Spawn/join/ref primitives that thread pools and servers build on.
//! Invariants: A fresh handle holds two references: the caller's and the running thread's own.
//! Invariants: The running thread's reference lives in a thread-local slot and drops at thread exit.
//! Invariants: Join is idempotent: one joiner blocks natively, later joiners wait on the handle condvar; an unjoined thread is detached when the last reference drops.
//! Invariants: Reference counting is atomic and never takes the handle lock.
//! Invariants: The handle lock is never held across the blocking native join, and the
//! running thread never takes it.
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::private::PrivateSlot;
use crate::core::sync::{Condvar, Mutex};
use crate::core::thread_name;

// Held by `spawn` while it finishes a handle; the trampoline passes through it first.
static NEW_THREAD: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

static SELF_REF: PrivateSlot<SelfRef> = PrivateSlot::new(release_self_ref);

struct SelfRef(Arc<dyn Any + Send + Sync>);

fn release_self_ref(self_ref: SelfRef) {
    trace!("releasing thread self-reference");
    drop(self_ref);
}

struct JoinState<T> {
    native: Option<JoinHandle<T>>,
    // Some joiner is blocked in the native join with the lock released.
    joining: bool,
    outcome: Option<Result<T, String>>,
}

struct Shared<T> {
    name: Option<String>,
    joinable: AtomicBool,
    finished: Arc<AtomicBool>,
    state: Mutex<JoinState<T>>,
    joined: Condvar,
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Some(native) = self.state.get_mut().native.take() {
            debug!(
                thread = self.name.as_deref().unwrap_or("<unnamed>"),
                "detaching unjoined thread"
            );
            drop(native);
        }
    }
}

// Flags the entry function as done when the trampoline returns or unwinds.
struct MarkFinished(Arc<AtomicBool>);

impl Drop for MarkFinished {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Shared reference to one spawned thread.
///
/// `clone` is the ref operation and dropping a handle is the unref
/// operation. The thread's name and OS handle are released when the last
/// reference goes away, whichever side that is.
pub struct ThreadHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> ThreadHandle<T> {
    /// Starts `entry` on a new OS thread.
    ///
    /// Fails only when the OS refuses to create the thread; there is no retry.
    pub fn spawn<F>(name: Option<&str>, entry: F) -> Result<Self, Error>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let barrier = NEW_THREAD.lock();

        let shared = Arc::new(Shared {
            name: name.map(str::to_owned),
            joinable: AtomicBool::new(true),
            finished: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(JoinState {
                native: None,
                joining: false,
                outcome: None,
            }),
            joined: Condvar::new(),
        });
        let running = Arc::clone(&shared);

        let native = thread::Builder::new()
            .spawn(move || trampoline(running, entry))
            .map_err(|err| {
                warn!(
                    thread = name.unwrap_or("<unnamed>"),
                    error = %err,
                    "thread creation failed"
                );
                Error::new(ErrorKind::Spawn)
                    .with_message("failed to create OS thread")
                    .with_source(err)
            })?;
        shared.state.lock().native = Some(native);

        debug!(thread = name.unwrap_or("<unnamed>"), "spawned thread");
        drop(barrier);
        Ok(Self { shared })
    }

    /// The handle of the calling thread, when it was started by [`ThreadHandle::spawn`]
    /// with the same result type.
    pub fn current() -> Option<Self> {
        SELF_REF.with(|self_ref| {
            let shared = Arc::clone(&self_ref?.0).downcast::<Shared<T>>().ok()?;
            Some(Self { shared })
        })
    }
}

impl<T: Clone> ThreadHandle<T> {
    /// Waits for the thread to finish and returns what its entry function
    /// returned, then releases this reference.
    ///
    /// Joining again through another reference returns the same outcome
    /// without waiting.
    pub fn join(self) -> Result<T, Error> {
        let shared = &self.shared;
        shared.joinable.store(false, Ordering::Release);

        let mut state = shared.joined.wait_while(shared.state.lock(), |state| state.joining);
        if state.outcome.is_none() {
            if let Some(native) = state.native.take() {
                state.joining = true;
                drop(state);
                let outcome = native.join().map_err(panic_message);
                state = shared.state.lock();
                state.outcome = Some(outcome);
                state.joining = false;
            }
        }
        let outcome = state.outcome.clone();
        drop(state);
        // Signal reaches one waiter; each joiner passes the wakeup on.
        shared.joined.signal();

        match outcome {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(Error::new(ErrorKind::Panicked).with_message(message)),
            None => Err(Error::new(ErrorKind::Internal).with_message("thread was never started")),
        }
    }
}

impl<T> ThreadHandle<T> {
    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    /// False once any reference has started joining.
    pub fn is_joinable(&self) -> bool {
        self.shared.joinable.load(Ordering::Acquire)
    }

    /// True once the entry function has returned or unwound.
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    /// Live references, including the running thread's own while it runs.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    #[cfg(test)]
    fn watch(&self) -> std::sync::Weak<Shared<T>> {
        Arc::downgrade(&self.shared)
    }
}

impl<T> Clone for ThreadHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for ThreadHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("name", &self.name())
            .field("refs", &self.ref_count())
            .finish()
    }
}

fn trampoline<T, F>(shared: Arc<Shared<T>>, entry: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T,
{
    drop(NEW_THREAD.lock());

    let name = shared.name.clone();
    let _finished = MarkFinished(Arc::clone(&shared.finished));
    let previous = SELF_REF.set(SelfRef(shared));
    debug_assert!(previous.is_none(), "fresh thread already had a self-reference");

    if let Some(name) = name.as_deref() {
        thread_name::set_current(name);
    }
    entry()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "thread panicked".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Barrier, mpsc};
    use std::time::{Duration, Instant};

    // Only the value the entry function returned counts its drop; join hands out clones.
    struct Counted {
        drops: Arc<AtomicUsize>,
        original: bool,
    }

    impl Clone for Counted {
        fn clone(&self) -> Self {
            Self {
                drops: Arc::clone(&self.drops),
                original: false,
            }
        }
    }

    impl Drop for Counted {
        fn drop(&mut self) {
            if self.original {
                self.drops.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn fresh_handle_holds_two_references() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let handle = ThreadHandle::spawn(None, move || {
            release_rx.recv().expect("release");
            5
        })
        .expect("spawn");

        assert!(wait_until(|| handle.ref_count() == 2));
        let probe = handle.clone();
        assert_eq!(probe.ref_count(), 3);

        release_tx.send(()).expect("send");
        assert_eq!(handle.join().expect("join"), 5);
        // The native join waits for thread exit, so the self-reference is gone too.
        assert_eq!(probe.ref_count(), 1);
        assert!(!probe.is_joinable());
    }

    #[test]
    fn join_frees_handle_exactly_when_last_reference_drops() {
        let handle = ThreadHandle::spawn(Some("jq-free"), || 1u8).expect("spawn");
        let watch = handle.watch();
        let second = handle.clone();

        assert_eq!(handle.join().expect("join"), 1);
        assert!(watch.upgrade().is_some());
        assert_eq!(second.join().expect("second join"), 1);
        assert_eq!(watch.strong_count(), 0);
    }

    #[test]
    fn unref_without_join_detaches_and_frees() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let handle = ThreadHandle::spawn(Some("jq-detach"), move || {
            release_rx.recv().expect("release");
        })
        .expect("spawn");
        let watch = handle.watch();

        drop(handle);
        assert!(watch.upgrade().is_some(), "running thread still holds its reference");

        release_tx.send(()).expect("send");
        assert!(wait_until(|| watch.strong_count() == 0));
    }

    #[test]
    fn current_returns_own_handle() {
        let handle = ThreadHandle::spawn(Some("jq-self"), || {
            let me = ThreadHandle::<Option<String>>::current().expect("own handle");
            me.name().map(str::to_owned)
        })
        .expect("spawn");
        assert_eq!(handle.join().expect("join").as_deref(), Some("jq-self"));
    }

    #[test]
    fn current_is_none_outside_managed_threads() {
        assert!(ThreadHandle::<()>::current().is_none());
        let mismatched = ThreadHandle::spawn(None, || ThreadHandle::<u64>::current().is_none())
            .expect("spawn");
        assert!(mismatched.join().expect("join"));
    }

    #[test]
    fn running_thread_can_inspect_itself_while_being_joined() {
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let (seen_tx, seen_rx) = mpsc::channel();
        let handle = ThreadHandle::spawn(Some("jq-inspect"), move || {
            go_rx.recv().expect("go");
            // Let the joiner block inside join first.
            thread::sleep(Duration::from_millis(50));
            let me = ThreadHandle::<u8>::current().expect("own handle");
            seen_tx
                .send((me.is_joinable(), me.is_finished()))
                .expect("report");
            7u8
        })
        .expect("spawn");

        let target = handle.clone();
        let joiner = thread::spawn(move || {
            go_tx.send(()).expect("go");
            target.join().expect("join")
        });

        let (_, finished) = seen_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("entry read its own handle while a join was pending");
        assert!(!finished);
        assert_eq!(joiner.join().expect("joiner"), 7);
        assert!(handle.is_finished());
        assert!(!handle.is_joinable());
    }

    #[test]
    fn concurrent_joins_share_one_outcome() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let handle = ThreadHandle::spawn(None, move || {
            release_rx.recv().expect("release");
            11u32
        })
        .expect("spawn");

        let joiners: Vec<_> = (0..4)
            .map(|_| {
                let handle = handle.clone();
                thread::spawn(move || handle.join().expect("join"))
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        release_tx.send(()).expect("release");

        for joiner in joiners {
            assert_eq!(joiner.join().expect("joiner"), 11);
        }
        assert_eq!(handle.join().expect("last join"), 11);
    }

    #[test]
    fn concurrent_unrefs_free_the_handle_once() {
        for round in 0..20 {
            let drops = Arc::new(AtomicUsize::new(0));
            let value = Counted {
                drops: Arc::clone(&drops),
                original: true,
            };
            let handle = ThreadHandle::spawn(None, move || value).expect("spawn");
            let watch = handle.watch();

            let barrier = Arc::new(Barrier::new(5));
            let droppers: Vec<_> = (0..4)
                .map(|_| {
                    let handle = handle.clone();
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        drop(handle);
                    })
                })
                .collect();

            barrier.wait();
            // Odd rounds race the last unref against thread exit without any join.
            if round % 2 == 0 {
                let joined = handle.join().expect("join");
                assert!(!joined.original);
            } else {
                drop(handle);
            }
            for dropper in droppers {
                dropper.join().expect("dropper");
            }

            assert!(wait_until(|| watch.strong_count() == 0));
            assert!(wait_until(|| drops.load(Ordering::SeqCst) == 1));
            thread::sleep(Duration::from_millis(2));
            assert_eq!(drops.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn panic_is_reported_on_every_join() {
        let handle = ThreadHandle::<()>::spawn(None, || panic!("entry blew up")).expect("spawn");
        let again = handle.clone();

        let first = handle.join().expect_err("panicked");
        assert_eq!(first.kind(), ErrorKind::Panicked);
        assert_eq!(first.message(), Some("entry blew up"));

        let second = again.join().expect_err("panicked");
        assert_eq!(second.message(), Some("entry blew up"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn os_name_is_truncated_to_platform_limit() {
        let handle = ThreadHandle::spawn(Some("jacques-worker-number-one"), thread_name::current)
            .expect("spawn");
        assert_eq!(
            handle.join().expect("join").as_deref(),
            Some("jacques-worker-")
        );
    }
}
