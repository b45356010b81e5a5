use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    ops::Deref,
    sync::{
        atomic::{AtomicU8, Ordering},
        Mutex, PoisonError,
    },
};

use crate::util::hint::cold;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LazyLockState {
    /// Signifies this lock is uninitialized
    Uninit,
    /// Signifies this lock is initialized
    Init,
    /// Signifies this lock is mid initialization. Anything that can run
    /// during the initializer (or on another thread, concurrently with it) can
    /// check for this and back off.
    Initializing,
}

impl LazyLockState {
    const fn from_u8(state: u8) -> Self {
        match state {
            0 => LazyLockState::Uninit,
            1 => LazyLockState::Init,
            _ => LazyLockState::Initializing,
        }
    }
}

/// A LazyLock that lets you poll its initialization state (including
/// mid-init). The initializer runs at most once to completion; threads that
/// arrive while it runs wait for it.
///
/// Initializing from inside the initializer (on the same thread) deadlocks,
/// so callers that might recurse have to check [`LazyLock::state()`] first.
pub struct LazyLock<T, F = fn() -> T> {
    cell: UnsafeCell<MaybeUninit<T>>,
    lock: Mutex<()>,
    state: AtomicU8,
    init: F,
}

// SAFETY: `cell` is written once, under `lock`, before `state` says `Init`,
// and only ever shared immutably after that
unsafe impl<T, F> Sync for LazyLock<T, F>
where
    T: Send + Sync,
    F: Sync,
{
}

impl<T, F> LazyLock<T, F>
where
    F: Fn() -> T,
{
    pub const fn new(init: F) -> Self {
        Self {
            cell: UnsafeCell::new(MaybeUninit::uninit()),
            lock: Mutex::new(()),
            state: AtomicU8::new(LazyLockState::Uninit as u8),
            init,
        }
    }

    pub fn state(lock: &Self) -> LazyLockState {
        LazyLockState::from_u8(lock.state.load(Ordering::Acquire))
    }

    /// # Safety
    /// - [`LazyLock::state()`] must have returned [`LazyLockState::Init`]
    // This borrow is not needless
    #[allow(clippy::needless_borrow)]
    pub unsafe fn assume_init(&self) -> &T {
        unsafe { (&*self.cell.get()).assume_init_ref() }
    }

    pub fn force(lock: &Self) -> &T {
        if LazyLock::state(lock) != LazyLockState::Init {
            cold(|| lock.initialize());
        }
        // SAFETY: either it was `Init` already, or `initialize()` only
        // returns once it is
        unsafe { lock.assume_init() }
    }

    fn initialize(&self) {
        // A panicking initializer leaves the state at `Initializing` and
        // poisons the mutex; the next caller just tries again
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if LazyLock::state(self) == LazyLockState::Init {
            return;
        }
        self.state
            .store(LazyLockState::Initializing as u8, Ordering::Release);
        let value = (self.init)();
        // SAFETY: we hold `lock` and the state isn't `Init`, so nobody else
        // can be reading or writing `cell`
        unsafe { (*self.cell.get()).write(value) };
        self.state.store(LazyLockState::Init as u8, Ordering::Release);
    }
}

impl<T, F> Deref for LazyLock<T, F>
where
    F: Fn() -> T,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        LazyLock::force(self)
    }
}

impl<T, F> Drop for LazyLock<T, F> {
    fn drop(&mut self) {
        if *self.state.get_mut() == LazyLockState::Init as u8 {
            // SAFETY: initialized, and `&mut self` means nobody is looking
            unsafe { self.cell.get_mut().assume_init_drop() };
        }
    }
}
