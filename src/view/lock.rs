//! A shared-exclusive lock over the current view, with a built-in condition variable.
//!
//! `ViewMutex` is a RwLock with a twist: readers can atomically release their shared
//! hold, sleep until the protected value "changes", and reacquire — the wait-with-
//! predicate discipline the ordered send path needs. The condition is signaled from two
//! places: a writer finishing a view change, and the transport reporting a freed send
//! window slot ([`notify_changed`](ViewMutex::notify_changed)); both can unblock a
//! sender.
//!
//! Senders are readers; view changes are the only writers. The protected value is
//! reachable without holding the state mutex while the reader count is positive, which
//! is sound because writers are excluded for exactly that span.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};

pub(crate) struct ViewMutex<T> {
    cell: SyncUnsafeCell<T>,
    state: Mutex<LockState>,
    /// Signaled when a reader or writer releases the lock.
    released: Condvar,
    /// Signaled when the protected value may have changed meaning: view installation,
    /// or a transport send-window slot freeing up.
    changed: Condvar,
}

struct LockState {
    readers: usize,
    writer_active: bool,
    /// Bumped on every change signal so waiters can tell a wakeup they raced past.
    epoch: u64,
}

impl<T> ViewMutex<T> {
    pub(crate) fn new(value: T) -> ViewMutex<T> {
        ViewMutex {
            cell: SyncUnsafeCell::new(value),
            state: Mutex::new(LockState {
                readers: 0,
                writer_active: false,
                epoch: 0,
            }),
            released: Condvar::new(),
            changed: Condvar::new(),
        }
    }

    /// Acquire the lock in shared mode.
    pub(crate) fn read(&self) -> ViewReadGuard<'_, T> {
        let mut state = self.state.lock().unwrap();
        while state.writer_active {
            state = self.released.wait(state).unwrap();
        }
        state.readers += 1;
        ViewReadGuard { lock: self }
    }

    /// Acquire the lock in exclusive mode. Dropping the guard signals the change
    /// condition, waking every waiting reader.
    pub(crate) fn write(&self) -> ViewWriteGuard<'_, T> {
        let mut state = self.state.lock().unwrap();
        while state.writer_active || state.readers > 0 {
            state = self.released.wait(state).unwrap();
        }
        state.writer_active = true;
        ViewWriteGuard { lock: self }
    }

    /// Evaluate `predicate` under a shared hold, sleeping between attempts until it
    /// produces a value. Returns the value together with the still-held shared guard,
    /// so the caller can finish follow-up work before any view change can begin.
    pub(crate) fn wait_read_until<R>(
        &self,
        mut predicate: impl FnMut(&T) -> Option<R>,
    ) -> (ViewReadGuard<'_, T>, R) {
        let mut state = self.state.lock().unwrap();
        loop {
            while state.writer_active {
                state = self.released.wait(state).unwrap();
            }
            state.readers += 1;
            let epoch_seen = state.epoch;
            drop(state);

            // Readers are counted, so no writer can be mutating the value here.
            if let Some(result) = predicate(unsafe { &*self.cell.get() }) {
                return (ViewReadGuard { lock: self }, result);
            }

            state = self.state.lock().unwrap();
            state.readers -= 1;
            if state.readers == 0 {
                self.released.notify_all();
            }
            while state.epoch == epoch_seen && !state.writer_active {
                state = self.changed.wait(state).unwrap();
            }
        }
    }

    /// Signal the change condition without taking the write lock. Called by the
    /// transport glue when a send-window slot frees up.
    pub(crate) fn notify_changed(&self) {
        let mut state = self.state.lock().unwrap();
        state.epoch += 1;
        drop(state);
        self.changed.notify_all();
    }
}

pub(crate) struct ViewReadGuard<'a, T> {
    lock: &'a ViewMutex<T>,
}

impl<'a, T> Deref for ViewReadGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.cell.get() }
    }
}

impl<'a, T> Drop for ViewReadGuard<'a, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.readers -= 1;
        if state.readers == 0 {
            self.lock.released.notify_all();
        }
    }
}

pub(crate) struct ViewWriteGuard<'a, T> {
    lock: &'a ViewMutex<T>,
}

impl<'a, T> Deref for ViewWriteGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.cell.get() }
    }
}

impl<'a, T> DerefMut for ViewWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.cell.get() }
    }
}

impl<'a, T> Drop for ViewWriteGuard<'a, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.writer_active = false;
        state.epoch += 1;
        drop(state);
        self.lock.released.notify_all();
        self.lock.changed.notify_all();
    }
}

struct SyncUnsafeCell<T>(UnsafeCell<T>);

unsafe impl<T: Send> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    fn new(t: T) -> SyncUnsafeCell<T> {
        SyncUnsafeCell(UnsafeCell::new(t))
    }

    fn get(&self) -> *mut T {
        self.0.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn waiting_reader_wakes_on_change_signal() {
        let lock = Arc::new(ViewMutex::new(0u32));
        let ready = Arc::new(AtomicBool::new(false));

        let waiter = {
            let lock = Arc::clone(&lock);
            let ready = Arc::clone(&ready);
            thread::spawn(move || {
                let (guard, value) =
                    lock.wait_read_until(|value| if ready.load(Ordering::SeqCst) {
                        Some(*value)
                    } else {
                        None
                    });
                drop(guard);
                value
            })
        };

        thread::sleep(Duration::from_millis(50));
        ready.store(true, Ordering::SeqCst);
        lock.notify_changed();
        assert_eq!(waiter.join().unwrap(), 0);
    }

    #[test]
    fn writer_waits_for_readers_and_wakes_waiters() {
        let lock = Arc::new(ViewMutex::new(1u32));

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let (guard, seen) =
                    lock.wait_read_until(|value| if *value == 2 { Some(*value) } else { None });
                drop(guard);
                seen
            })
        };

        thread::sleep(Duration::from_millis(50));
        {
            let mut guard = lock.write();
            *guard = 2;
        }
        assert_eq!(waiter.join().unwrap(), 2);
    }
}
