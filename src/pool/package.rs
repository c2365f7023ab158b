use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Parking primitive a worker thread sleeps on.
///
/// The flag is sticky: a wake delivered before the park is not lost, the next
/// park consumes it and returns immediately.
#[derive(Debug, Default)]
pub(crate) struct ThreadPackage {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl ThreadPackage {
    pub(crate) fn new() -> Arc<ThreadPackage> {
        Arc::new(ThreadPackage::default())
    }

    /// Block until woken, consuming the signal.
    pub(crate) fn park(&self) {
        let mut signalled = self.signalled.lock();
        while !*signalled {
            self.cond.wait(&mut signalled);
        }
        *signalled = false;
    }

    pub(crate) fn wake(&self) {
        let mut signalled = self.signalled.lock();
        *signalled = true;
        self.cond.notify_one();
    }

    /// Peek at a pending signal without consuming it. Used by a worker on
    /// transport-polling duty to notice it has been handed work.
    pub(crate) fn is_signalled(&self) -> bool {
        *self.signalled.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wake_before_park_is_not_lost() {
        let pkg = ThreadPackage::new();
        pkg.wake();
        assert!(pkg.is_signalled());
        pkg.park();
        assert!(!pkg.is_signalled());
    }

    #[test]
    fn park_blocks_until_woken() {
        let pkg = ThreadPackage::new();
        let parked = pkg.clone();
        let t = thread::spawn(move || parked.park());
        thread::sleep(Duration::from_millis(20));
        assert!(!t.is_finished());
        pkg.wake();
        t.join().unwrap();
    }
}
