use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Counting gate for one operation class.
///
/// The count is only touched under `count`; waiters park on `released`
/// and re-check the count after every release.
pub(crate) struct Gate {
    capacity: usize,
    count: Mutex<usize>,
    released: Notify,
}

impl Gate {
    /// Creates a gate. A capacity of 0 is raised to 1.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            count: Mutex::new(0),
            released: Notify::new(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn in_flight(&self) -> usize {
        *self.lock()
    }

    /// Takes a slot if one is free.
    pub(crate) fn try_admit(&self) -> bool {
        let mut count = self.lock();
        if *count < self.capacity {
            *count += 1;
            true
        } else {
            false
        }
    }

    /// Waits for a slot. Returns `false` if `cancel` fires first, in which
    /// case the count is unchanged.
    pub(crate) async fn admit(&self, cancel: &CancellationToken) -> bool {
        loop {
            // Register interest before checking so a release between the
            // check and the await is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_admit() {
                return true;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = &mut notified => {}
            }
        }
    }

    /// Returns a slot. Returns `false` if no slot was held.
    pub(crate) fn release(&self) -> bool {
        {
            let mut count = self.lock();
            if *count == 0 {
                return false;
            }
            *count -= 1;
        }
        self.released.notify_waiters();
        true
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
