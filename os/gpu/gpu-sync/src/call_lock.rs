use crate::Backoff;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Serializes whole calls rather than guarding data.
///
/// Holders may block for a long time (eviction callbacks, scrub waits), so
/// waiters go through [`Backoff`] and end up yielding. The number of
/// acquisitions that had to wait is kept for diagnostics.
pub struct CallLock {
    held: AtomicBool,
    contended: AtomicU64,
}

impl Default for CallLock {
    fn default() -> Self {
        Self::new()
    }
}

impl CallLock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
            contended: AtomicU64::new(0),
        }
    }

    /// Waits until no other call holds the lock.
    #[inline]
    pub fn enter(&self) -> CallGuard<'_> {
        if !self.try_acquire() {
            self.contended.fetch_add(1, Ordering::Relaxed);
            let mut backoff = Backoff::new();
            while !self.try_acquire() {
                while self.held.load(Ordering::Relaxed) {
                    backoff.snooze();
                }
            }
        }
        CallGuard { lock: self }
    }

    #[inline]
    pub fn try_enter(&self) -> Option<CallGuard<'_>> {
        self.try_acquire().then_some(CallGuard { lock: self })
    }

    #[inline]
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }

    /// Acquisitions so far that found the lock taken.
    #[must_use]
    pub fn contended(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        !self.held.swap(true, Ordering::Acquire)
    }
}

impl fmt::Debug for CallLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallLock")
            .field("held", &self.is_held())
            .field("contended", &self.contended())
            .finish()
    }
}

/// Proof of holding a [`CallLock`]; released on drop.
#[must_use = "the call lock is released as soon as the guard is dropped"]
pub struct CallGuard<'a> {
    lock: &'a CallLock,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}
