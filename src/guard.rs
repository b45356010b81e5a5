//! The single lock serialising every read and write of shadow state.

use std::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

use crossbeam::utils::CachePadded;
use linux_futex::{Futex, Private};

use crate::util::hint::cold;

/// This futex represents a lock and is unlocked
const FUTEX_UNLOCKED: u32 = 0;

/// This futex represents a lock and is locked, with nobody asleep on it
const FUTEX_LOCKED: u32 = 1;

/// This futex represents a lock and is locked, and someone might be asleep on
/// it, so the unlocker has to `wake()`
const FUTEX_CONTENDED: u32 = 2;

/// A non-reentrant futex mutex. It never allocates and never touches
/// thread-locals, so it is safe to take from inside `malloc()`.
///
/// Locking twice on one thread deadlocks. Paths that might already hold the
/// guard (error reporting) check [`Guard::is_held_by_current_thread()`].
pub struct Guard<T> {
    lock: CachePadded<Futex<Private>>,
    /// `pthread_self()` of the holder, 0 while unlocked
    owner: AtomicUsize,
    data: UnsafeCell<T>,
}

/// Never 0, and never allocates or touches thread-locals
fn current_thread() -> usize {
    // SAFETY: always safe to call
    unsafe { libc::pthread_self() as usize }
}

// SAFETY: access to `data` is serialised by `lock`
unsafe impl<T> Sync for Guard<T> where T: Send {}
unsafe impl<T> Send for Guard<T> where T: Send {}

impl<T> Guard<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: CachePadded::new(Futex::new(FUTEX_UNLOCKED)),
            owner: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Block until we hold the lock
    pub fn lock(&self) -> GuardHandle<'_, T> {
        // Fast path should stay in userspace!
        if self
            .lock
            .value
            .compare_exchange(FUTEX_UNLOCKED, FUTEX_LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            cold(|| self.lock_contended());
        }
        self.acquired()
    }

    fn acquired(&self) -> GuardHandle<'_, T> {
        self.owner.store(current_thread(), Ordering::Relaxed);
        GuardHandle { guard: self }
    }

    fn lock_contended(&self) {
        // Once we've seen contention we always leave the lock as CONTENDED, so
        // whoever unlocks after us knows to wake somebody
        while self.lock.value.swap(FUTEX_CONTENDED, Ordering::Acquire) != FUTEX_UNLOCKED {
            _ = self.lock.wait(FUTEX_CONTENDED);
        }
    }

    /// Take the lock only if nobody holds it, including this thread
    pub fn try_lock(&self) -> Option<GuardHandle<'_, T>> {
        self.lock
            .value
            .compare_exchange(FUTEX_UNLOCKED, FUTEX_LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| self.acquired())
    }

    pub fn is_locked(&self) -> bool {
        self.lock.value.load(Ordering::Relaxed) != FUTEX_UNLOCKED
    }

    /// Whether this thread holds the lock, somewhere up the stack. Only the
    /// holder writes its own id and clears it before unlocking, so a `true`
    /// here can't be stale.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_thread()
    }

    /// Look at the data without the lock.
    ///
    /// # Safety
    /// - Nobody may be writing through a [`GuardHandle`] while the returned
    ///   reference is used. In practice: this thread holds the lock and the
    ///   handle is not used until the reference is gone.
    pub unsafe fn get_unguarded(&self) -> &T {
        unsafe { &*self.data.get() }
    }

    fn unlock(&self) {
        self.owner.store(0, Ordering::Relaxed);
        if self.lock.value.swap(FUTEX_UNLOCKED, Ordering::Release) == FUTEX_CONTENDED {
            self.lock.wake(1);
        }
    }
}

/// Proof that we hold a [`Guard`]. Unlocks on drop.
pub struct GuardHandle<'a, T> {
    guard: &'a Guard<T>,
}

impl<T> Deref for GuardHandle<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the lock
        unsafe { &*self.guard.data.get() }
    }
}

impl<T> DerefMut for GuardHandle<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the lock, and `&mut self` makes this the only
        // reference through this handle
        unsafe { &mut *self.guard.data.get() }
    }
}

impl<T> Drop for GuardHandle<'_, T> {
    fn drop(&mut self) {
        self.guard.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_lock_fails_while_held() {
        let guard = Guard::new(5);
        let handle = guard.lock();
        assert!(guard.is_locked());
        assert!(guard.try_lock().is_none());
        drop(handle);
        assert!(!guard.is_locked());
        assert_eq!(*guard.try_lock().unwrap(), 5);
    }

    #[test]
    fn only_the_holder_sees_itself_as_owner() {
        let guard = Guard::new(());
        assert!(!guard.is_held_by_current_thread());
        let handle = guard.lock();
        assert!(guard.is_held_by_current_thread());
        crossbeam::scope(|s| {
            s.spawn(|_| {
                assert!(guard.is_locked());
                assert!(!guard.is_held_by_current_thread());
            });
        })
        .unwrap();
        drop(handle);
        assert!(!guard.is_held_by_current_thread());
        let _handle = guard.try_lock().unwrap();
        assert!(guard.is_held_by_current_thread());
    }

    #[test]
    fn contended_increments_are_not_lost() {
        const THREADS: usize = 8;
        const ITERS: usize = 10_000;
        let guard = Guard::new(0usize);
        crossbeam::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|_| {
                    for _ in 0..ITERS {
                        *guard.lock() += 1;
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(*guard.lock(), THREADS * ITERS);
    }
}
