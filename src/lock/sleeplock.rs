//! Sleeping locks: long-term locks held across disk I/O.

use std::sync::{Condvar, Mutex};

use super::{this_thread, Lock, RawLock};

/// Long-term lock for in-memory inodes and buffers. Acquirers yield
/// the CPU instead of spinning.
pub struct RawSleeplock {
    /// Name of lock, for panic messages.
    name: &'static str,

    /// Thread holding the lock. Zero means unlocked.
    owner: Mutex<usize>,
    waiters: Condvar,
}

/// Locks that sleep instead of busy wait.
pub type Sleeplock<T> = Lock<RawSleeplock, T>;
pub type SleeplockGuard<'s, T> = super::Guard<'s, RawSleeplock, T>;

impl RawSleeplock {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            owner: Mutex::new(0),
            waiters: Condvar::new(),
        }
    }
}

impl RawLock for RawSleeplock {
    fn acquire(&self) {
        let mut owner = self.owner.lock().unwrap_or_else(|e| e.into_inner());
        assert_ne!(*owner, this_thread(), "acquire {}", self.name);
        while *owner != 0 {
            owner = self
                .waiters
                .wait(owner)
                .unwrap_or_else(|e| e.into_inner());
        }
        *owner = this_thread();
    }

    fn release(&self) {
        let mut owner = self.owner.lock().unwrap_or_else(|e| e.into_inner());
        assert_eq!(*owner, this_thread(), "release {}", self.name);
        *owner = 0;
        self.waiters.notify_all();
    }

    fn holding(&self) -> bool {
        let owner = self.owner.lock().unwrap_or_else(|e| e.into_inner());
        *owner == this_thread()
    }
}

impl<T> Sleeplock<T> {
    /// Returns a new `Sleeplock` with name `name` and data `data`.
    pub fn new(name: &'static str, data: T) -> Self {
        Self::from_raw(RawSleeplock::new(name), data)
    }
}
