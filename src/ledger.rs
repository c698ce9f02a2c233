// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Plain RDMA ledger: a fixed-capacity ring of single-word entries living
// inside shared storage, mirrored on the owning peer by RDMA WRITE.
//
// One struct serves both views. For a `remote_*` ledger this process is
// the producer: `claim` accounts a slot on the peer's ring and the entry
// array is the local staging mirror the WRITE is sourced from. For a
// `local_*` ledger this process is the consumer: the peer's WRITEs land
// in the entry array and `head`/`try_advance`/`mark_done` drain it.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::buffer::BufferDesc;
use crate::{Error, Result};

/// Empty-slot sentinel for FIN and EAGER ledgers.
pub const LEDGER_EMPTY: u64 = 0;
/// Empty-slot sentinel for PWC ledgers (0 is a valid user rid there).
pub const LEDGER_EMPTY_PWC: u64 = u64::MAX;

pub struct Ledger {
    entries: *mut AtomicU64,
    num_entries: u32,
    curr: AtomicU64,
    tail: AtomicU64,
    /// Where this ring lives in the peer's address space. Filled by the
    /// ledger exchange at init.
    pub remote: BufferDesc,
}

unsafe impl Send for Ledger {}
unsafe impl Sync for Ledger {}

impl Ledger {
    /// Wrap `num_entries` slots of shared storage at `base`, clearing
    /// them to `empty`. The storage is owned by the shared-storage
    /// allocation, not by the ledger.
    ///
    /// # Safety
    /// `base` must point at `num_entries * 8` bytes of writable memory
    /// that outlives the ledger.
    pub unsafe fn from_raw(base: *mut u8, num_entries: u32, empty: u64) -> Self {
        debug_assert!(num_entries.is_power_of_two());
        let entries = base as *mut AtomicU64;
        for i in 0..num_entries as usize {
            (*entries.add(i)).store(empty, Ordering::Relaxed);
        }
        Self {
            entries,
            num_entries,
            curr: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            remote: BufferDesc::default(),
        }
    }

    pub fn num_entries(&self) -> u32 {
        self.num_entries
    }

    pub fn curr(&self) -> u64 {
        self.curr.load(Ordering::Relaxed)
    }

    pub fn tail(&self) -> u64 {
        self.tail.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn index_of(&self, cursor: u64) -> u32 {
        (cursor & (self.num_entries as u64 - 1)) as u32
    }

    /// Entry slot `index` (0-based ring index).
    pub fn entry(&self, index: u32) -> &AtomicU64 {
        debug_assert!(index < self.num_entries);
        unsafe { &*self.entries.add(index as usize) }
    }

    /// Raw address of slot `index`, for sourcing an RDMA WRITE.
    pub fn entry_addr(&self, index: u32) -> u64 {
        unsafe { self.entries.add(index as usize) as u64 }
    }

    // --- producer side ---

    /// Claim the next slot on the mirrored ring. Fails with `Resource`
    /// when the ring is full; the claim is undone so a later retry can
    /// succeed.
    pub fn claim(&self) -> Result<u32> {
        let curr = self.curr.fetch_add(1, Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        if curr - tail >= self.num_entries as u64 {
            self.curr.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::Resource("ledger ring full"));
        }
        Ok(self.index_of(curr))
    }

    /// Free `n` slots after their entries have been consumed downstream.
    pub fn mark_done(&self, n: u64) {
        self.tail.fetch_add(n, Ordering::Relaxed);
    }

    // --- consumer side ---

    /// Claim the head entry by CAS-advancing `curr`. `seen` must be the
    /// cursor the caller read the head at.
    pub fn try_advance(&self, seen: u64) -> bool {
        self.curr
            .compare_exchange(seen, seen + 1, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(n: u32) -> (Vec<u8>, Ledger) {
        let mut mem = vec![0u8; n as usize * 8];
        let l = unsafe { Ledger::from_raw(mem.as_mut_ptr(), n, LEDGER_EMPTY) };
        (mem, l)
    }

    #[test]
    fn claim_until_full() {
        let (_m, l) = make(4);
        for i in 0..4 {
            assert_eq!(l.claim().unwrap(), i);
        }
        assert!(matches!(l.claim(), Err(Error::Resource(_))));
        // undo leaves the ring recoverable
        l.mark_done(1);
        assert_eq!(l.claim().unwrap(), 0);
    }

    #[test]
    fn tail_never_passes_curr() {
        let (_m, l) = make(8);
        for _ in 0..5 {
            l.claim().unwrap();
        }
        l.mark_done(5);
        assert!(l.tail() <= l.curr());
        assert!(l.curr() - l.tail() <= l.num_entries() as u64);
    }

    #[test]
    fn consumer_cas() {
        let (_m, l) = make(4);
        let seen = l.curr();
        assert!(l.try_advance(seen));
        assert!(!l.try_advance(seen));
    }
}
