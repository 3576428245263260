//! The lock module.
//!
//! Two lock flavors, mirroring the kernel split:
//!
//! * [`Spinlock`]: short, non-blocking. Protects reference counts and
//!   table slot assignment. Must not be held across anything that
//!   sleeps.
//! * [`Sleeplock`]: long-term, may yield the CPU. One per in-memory
//!   inode and buffer; legal to hold across disk I/O.
//!
//! [`Sleepablelock`] is a spin-layer lock whose guard can additionally
//! sleep on the lock's condition and be woken, used by the log.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

mod sleepablelock;
mod sleeplock;
mod spinlock;

pub use sleepablelock::{Sleepablelock, SleepablelockGuard};
pub use sleeplock::{RawSleeplock, Sleeplock, SleeplockGuard};
pub use spinlock::{RawSpinlock, Spinlock, SpinlockGuard};

/// Raw mutual exclusion, without data.
pub trait RawLock {
    fn acquire(&self);
    fn release(&self);
    /// Whether this thread is holding the lock.
    fn holding(&self) -> bool;
}

/// A lock that owns its `RawLock` and the data it protects.
pub struct Lock<R: RawLock, T> {
    lock: R,
    data: UnsafeCell<T>,
}

// The lock serializes access to the data.
unsafe impl<R: RawLock + Sync, T: Send> Sync for Lock<R, T> {}

impl<R: RawLock, T> Lock<R, T> {
    const fn from_raw(lock: R, data: T) -> Self {
        Self {
            lock,
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock and returns its guard.
    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard { lock: self }
    }

    /// Returns a mutable reference to the inner data without locking.
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: `&mut self` guarantees exclusive access.
        unsafe { &mut *self.data.get() }
    }

    /// Returns a raw pointer to the inner data.
    ///
    /// The caller must ensure that accessing the pointer does not
    /// incur a race; the usual witness is holding the lock via a
    /// forgotten guard or an equivalent protocol.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    /// Whether this thread is holding the lock.
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }

    /// Acquires the raw lock, without producing a guard.
    ///
    /// # Safety
    ///
    /// Must be paired with [`Lock::unlock`]. Used by lock-witness
    /// types (`InodeGuard`, `Buf`) that outlive a lexical guard.
    pub unsafe fn acquire(&self) {
        self.lock.acquire();
    }

    /// Releases the raw lock.
    ///
    /// # Safety
    ///
    /// The lock must have been acquired by this thread via
    /// [`Lock::acquire`] (or a forgotten guard).
    pub unsafe fn unlock(&self) {
        self.lock.release();
    }
}

/// Guard of a [`Lock`]. Releases on drop.
pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
}

impl<R: RawLock, T> Guard<'_, R, T> {
    /// Temporarily releases the lock, runs `f`, and reacquires.
    ///
    /// This is the drop-lock, finalize, reacquire pattern: expensive
    /// destruction (disk writes, lookups into other tables) runs with
    /// the lock released while the caller still holds the last
    /// reference.
    pub fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        self.lock.lock.release();
        let r = f();
        self.lock.lock.acquire();
        r
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

/// A process-unique id for lock ownership bookkeeping.
///
/// Each thread stands in for a process; the address of a thread-local
/// is unique per live thread and never zero.
pub(crate) fn this_thread() -> usize {
    thread_local!(static ANCHOR: u8 = const { 0 });
    ANCHOR.with(|a| a as *const u8 as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spinlock_serializes_increments() {
        let counter = Spinlock::new("test", 0u64);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        *counter.lock() += 1;
                    }
                });
            }
        });
        assert_eq!(*counter.lock(), 4000);
    }

    #[test]
    fn sleeplock_is_held_across_blocking_sections() {
        let lock = Sleeplock::new("test", Vec::<u32>::new());
        std::thread::scope(|s| {
            for i in 0..4u32 {
                let lock = &lock;
                s.spawn(move || {
                    let mut g = lock.lock();
                    g.push(i);
                    std::thread::yield_now();
                    g.push(i);
                });
            }
        });
        // Each holder's two pushes are adjacent: no interleaving.
        let v = lock.lock();
        for pair in v.chunks(2) {
            assert_eq!(pair[0], pair[1]);
        }
    }

    #[test]
    fn guard_reacquire_after_runs_unlocked() {
        let lock = Spinlock::new("test", 1u32);
        let mut g = lock.lock();
        let seen = g.reacquire_after(|| {
            // The lock is free here; a fresh acquisition must work.
            *lock.lock()
        });
        assert_eq!(seen, 1);
        *g += 1;
        drop(g);
        assert_eq!(*lock.lock(), 2);
    }
}
