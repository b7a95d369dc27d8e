//! Reader/writer lock with a priority write mode.
//!
//! Ordinary writers queue behind any waiting priority writer, so a lease
//! renewal close to its deadline is not starved by a backlog of
//! registrations. Readers are unaffected.

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
pub struct PriorityRwLock<T> {
    lock: RwLock<T>,
    /// Priority writers currently waiting for `lock`.
    waiting: Mutex<usize>,
    cleared: Condvar,
}

impl<T> PriorityRwLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            lock: RwLock::new(value),
            waiting: Mutex::new(0),
            cleared: Condvar::new(),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.lock.read()
    }

    /// Ordinary write mode. Waits while any priority writer is queued.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let mut waiting = self.waiting.lock();
        while *waiting > 0 {
            self.cleared.wait(&mut waiting);
        }
        drop(waiting);
        self.lock.write()
    }

    /// Priority write mode. Holds ordinary writers off until acquired.
    pub fn write_priority(&self) -> RwLockWriteGuard<'_, T> {
        let _ticket = PriorityTicket::new(self);
        self.lock.write()
    }
}

/// Counts one waiting priority writer; uncounted on drop.
struct PriorityTicket<'a, T> {
    owner: &'a PriorityRwLock<T>,
}

impl<'a, T> PriorityTicket<'a, T> {
    fn new(owner: &'a PriorityRwLock<T>) -> Self {
        *owner.waiting.lock() += 1;
        Self { owner }
    }
}

impl<T> Drop for PriorityTicket<'_, T> {
    fn drop(&mut self) {
        let mut waiting = self.owner.waiting.lock();
        *waiting -= 1;
        if *waiting == 0 {
            self.owner.cleared.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_priority_writer_goes_before_queued_writers() {
        let lock = Arc::new(PriorityRwLock::new(Vec::<&'static str>::new()));
        let held = lock.write();

        let priority = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.write_priority().push("priority"))
        };
        // Let the priority writer register before the ordinary one arrives.
        while *lock.waiting.lock() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        let ordinary = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.write().push("ordinary"))
        };
        thread::sleep(Duration::from_millis(20));
        drop(held);

        priority.join().unwrap();
        ordinary.join().unwrap();
        assert_eq!(*lock.read(), vec!["priority", "ordinary"]);
    }

    #[test]
    fn test_readers_share() {
        let lock = PriorityRwLock::new(5);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a + *b, 10);
    }
}
