//! Sleeping synchronization primitives not provided by the standard library.

use std::sync::{Condvar, Mutex};

/// A counting semaphore.
///
/// `down` blocks until a permit is available; `up` releases one and wakes a
/// waiter. Used by the wait records: the child `up`s its death semaphore,
/// the parent `down`s it.
pub struct Semaphore {
    permits: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: u32) -> Semaphore {
        Semaphore {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    pub fn down(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.cond.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    /// Takes a permit without blocking. Returns whether one was taken.
    pub fn try_down(&self) -> bool {
        let mut permits = self.permits.lock().unwrap();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    pub fn up(&self) {
        let mut permits = self.permits.lock().unwrap();
        *permits += 1;
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn down_blocks_until_up() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.down())
        };
        sem.up();
        waiter.join().unwrap();
    }

    #[test]
    fn one_permit_admits_exactly_one() {
        let sem = Semaphore::new(1);
        assert!(sem.try_down());
        assert!(!sem.try_down());
        sem.up();
        assert!(sem.try_down());
    }
}
