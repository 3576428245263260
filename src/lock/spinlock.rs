//! Spin locks.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::{this_thread, Lock, RawLock};

/// Mutual exclusion lock that busy waits (spins).
pub struct RawSpinlock {
    /// Name of lock, for panic messages.
    name: &'static str,

    /// If the lock is held, the holder's thread id. Otherwise zero.
    ///
    /// Records info about lock acquisition for holding() and
    /// debugging.
    locked: AtomicUsize,
}

/// Locks that busy wait (spin).
pub type Spinlock<T> = Lock<RawSpinlock, T>;
/// Guards of `Spinlock<T>`.
pub type SpinlockGuard<'s, T> = super::Guard<'s, RawSpinlock, T>;

impl RawSpinlock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicUsize::new(0),
        }
    }
}

impl RawLock for RawSpinlock {
    /// Acquires the lock. Loops (spins) until the lock is acquired.
    ///
    /// An `Acquire` exchange paired with the `Release` store in
    /// `release()` makes all stores of one critical section visible to
    /// the loads of the next.
    fn acquire(&self) {
        assert!(!self.holding(), "acquire {}", self.name);
        while self
            .locked
            .compare_exchange(0, this_thread(), Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
    }

    fn release(&self) {
        assert!(self.holding(), "release {}", self.name);
        self.locked.store(0, Ordering::Release);
    }

    fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) == this_thread()
    }
}

impl<T> Spinlock<T> {
    /// Returns a new `Spinlock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self::from_raw(RawSpinlock::new(name), data)
    }
}
