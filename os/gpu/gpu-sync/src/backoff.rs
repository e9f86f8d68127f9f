use core::hint::spin_loop;

/// Gives the CPU to someone else while waiting on a lock or a flag.
#[inline]
pub fn relax() {
    #[cfg(feature = "std")]
    std::thread::yield_now();
    #[cfg(not(feature = "std"))]
    spin_loop();
}

/// Exponential spin, then [`relax`].
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;

    #[must_use]
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    /// Waits a little longer than the previous call did.
    #[inline]
    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                spin_loop();
            }
            self.step += 1;
        } else {
            relax();
        }
    }

    /// `true` once spinning has given way to [`relax`].
    #[inline]
    #[must_use]
    pub const fn is_yielding(&self) -> bool {
        self.step > Self::SPIN_LIMIT
    }
}
