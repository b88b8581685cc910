use std::sync::{Mutex, MutexGuard};

/// Marks an encryption pass as in progress for one interceptor instance.
///
/// Delivering a message can loop back into the interceptor (a transport
/// that re-submits through the same pipeline). While a [`GuardToken`] is
/// alive every further [`try_acquire`](Self::try_acquire) returns `None`.
#[derive(Debug, Default)]
pub struct ProcessingGuard {
    active: Mutex<bool>,
}

impl ProcessingGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the guard, `None` if a pass is already running.
    pub fn try_acquire(&self) -> Option<GuardToken<'_>> {
        let mut active = self.lock();
        if *active {
            return None;
        }
        *active = true;
        Some(GuardToken { guard: self })
    }

    pub fn is_active(&self) -> bool {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        // the flag stays meaningful even if a holder panicked
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Clears the guard when dropped.
#[derive(Debug)]
pub struct GuardToken<'a> {
    guard: &'a ProcessingGuard,
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        *self.guard.lock() = false;
    }
}
