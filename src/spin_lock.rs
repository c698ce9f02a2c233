// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Test-and-test-and-set spin lock with adaptive backoff.
//
// Guards the buffer registry vector and, in non-thread-safe backend mode,
// the raw rdma_put/rdma_get submission path. Critical sections are a few
// dozen instructions, so spinning beats parking.

use std::sync::atomic::{AtomicU32, Ordering};

/// Adaptive backoff between lock retries.
///
/// - k < 4:  busy spin (do nothing)
/// - k < 16: CPU pause hint
/// - k < 32: thread yield
/// - k >= 32: sleep 1ms
#[inline]
pub(crate) fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(std::time::Duration::from_millis(1));
        return;
    }
    *k += 1;
}

/// A test-and-test-and-set spin lock.
///
/// The fast path reads the word before attempting the exchange so that
/// contending threads spin on a shared cache line instead of bouncing it.
pub struct SpinLock {
    lc: AtomicU32,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            lc: AtomicU32::new(0),
        }
    }

    pub fn lock(&self) {
        let mut k = 0u32;
        loop {
            while self.lc.load(Ordering::Relaxed) != 0 {
                adaptive_yield(&mut k);
            }
            if self.lc.swap(1, Ordering::Acquire) == 0 {
                return;
            }
        }
    }

    /// Single acquisition attempt, no spinning.
    pub fn try_lock(&self) -> bool {
        self.lc.load(Ordering::Relaxed) == 0 && self.lc.swap(1, Ordering::Acquire) == 0
    }

    pub fn unlock(&self) {
        self.lc.store(0, Ordering::Release);
    }

    /// Run `f` with the lock held.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let r = f();
        self.unlock();
        r
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for SpinLock {}
unsafe impl Sync for SpinLock {}
