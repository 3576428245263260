//! Sleepable locks: guards can sleep on the lock's condition and be
//! woken by another holder. Used by the log for transaction pacing.

use core::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard};

pub struct Sleepablelock<T> {
    /// Name of lock, for panic messages.
    #[allow(dead_code)]
    name: &'static str,

    data: Mutex<T>,
    cond: Condvar,
}

pub struct SleepablelockGuard<'s, T> {
    lock: &'s Sleepablelock<T>,
    // Always `Some` between construction and drop; `Option` lets
    // `sleep` move the std guard through the condvar.
    guard: Option<MutexGuard<'s, T>>,
}

impl<T> Sleepablelock<T> {
    pub fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            data: Mutex::new(data),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> SleepablelockGuard<'_, T> {
        let guard = self.data.lock().unwrap_or_else(|e| e.into_inner());
        SleepablelockGuard {
            lock: self,
            guard: Some(guard),
        }
    }
}

impl<T> SleepablelockGuard<'_, T> {
    /// Atomically releases the lock and sleeps until `wakeup`; holds
    /// the lock again on return.
    pub fn sleep(&mut self) {
        let guard = self.guard.take().unwrap();
        let guard = self
            .lock
            .cond
            .wait(guard)
            .unwrap_or_else(|e| e.into_inner());
        self.guard = Some(guard);
    }

    /// Wakes all sleepers of this lock.
    pub fn wakeup(&self) {
        self.lock.cond.notify_all();
    }

    /// Temporarily releases the lock, runs `f`, and reacquires.
    pub fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        drop(self.guard.take());
        let r = f();
        self.guard = Some(self.lock.data.lock().unwrap_or_else(|e| e.into_inner()));
        r
    }
}

impl<T> Deref for SleepablelockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_deref().unwrap()
    }
}

impl<T> DerefMut for SleepablelockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_deref_mut().unwrap()
    }
}
