// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Request descriptors and the per-peer request table.
//
// The table is a bounded ring of pre-allocated descriptors. `count` is
// total-ever-allocated and `tail` total-ever-freed, both monotonic; the
// live window `count - tail` never exceeds the table size. A slot index
// is `count & (size-1) + 1` so that index 0 stays free for the NULL
// cookie.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use bitflags::bitflags;
use log::{trace, warn};

use crate::buffer::BufferDesc;
use crate::rid::{rid_from_parts, rid_index, rid_proc, Rid};
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// States, ops, flags
// ---------------------------------------------------------------------------

pub const STATE_UNUSED: u16 = 0;
pub const STATE_NEW: u16 = 1;
pub const STATE_PENDING: u16 = 2;
pub const STATE_FAILED: u16 = 3;
pub const STATE_COMPLETED: u16 = 4;
pub const STATE_FREE: u16 = 5;

/// What kind of operation a request tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Op {
    #[default]
    Default,
    SendBuf,
    SendReq,
    SendFin,
    RecvBuf,
    Pwc,
}

/// How a request completes: by CQ event, by ledger (FIN) arrival, or by
/// the UD send/recv path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Completion {
    #[default]
    Evqueue,
    Ledger,
    SendRecv,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestFlags: u16 {
        /// Waiting for a FIN that has already been requested.
        const WFIN   = 1 << 1;
        /// Payload travels through the eager byte ring.
        const EAGER  = 1 << 2;
        /// Eager payload has been copied out locally.
        const EDONE  = 1 << 3;
        /// Local (ledger) side of the handshake is done.
        const LDONE  = 1 << 4;
        /// Suppress the local completion event.
        const NO_LCE = 1 << 5;
        /// Suppress the remote completion event.
        const NO_RCE = 1 << 6;
        /// Remote-initiated operation.
        const ROP    = 1 << 7;
        /// Packed single-put PWC.
        const ONE_PWC = 1 << 8;
        /// Two-put PWC (data + notification).
        const TWO_PWC = 1 << 9;
        /// Command/control operation.
        const CMD    = 1 << 10;
        /// `id` was supplied by the caller, not the table.
        const USERID = 1 << 11;
    }
}

bitflags! {
    /// Caller-supplied modifiers on posting operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpFlags: u32 {
        /// The originating request is already complete; free it on FIN.
        const COMPLETED = 1 << 0;
        /// Two-put PWC: generate one completion instead of two.
        const ONE_CQE = 1 << 1;
        /// Suppress all local completions for this operation.
        const NO_CQE = 1 << 2;
        /// The caller supplies the request id returned at completion.
        const USERID = 1 << 3;
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A buffer reference captured in a request: the descriptor plus the
/// request id the owning side associates with it.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferRef {
    pub desc: BufferDesc,
    pub id: Rid,
}

/// One in-flight operation.
///
/// `state` and `events` are the only fields touched by threads other
/// than the submitting one (the event loop decrements `events` and
/// CASes `state`); everything else is owned by the submission path
/// between `alloc` and the transport call.
pub struct Request {
    /// Id returned to the application. Equals `cookie` unless USERID.
    pub id: Rid,
    /// Transport cookie: always the table identity `(peer << 32) | index`.
    pub cookie: Rid,
    pub proc: u32,
    pub tag: i32,
    pub op: Op,
    pub completion: Completion,
    pub flags: RequestFlags,
    pub size: u64,
    pub local: BufferRef,
    pub remote: BufferRef,
    pub state: AtomicU16,
    /// Transport completions still outstanding.
    pub events: AtomicU16,
}

impl Request {
    fn blank() -> Self {
        Self {
            id: 0,
            cookie: 0,
            proc: 0,
            tag: 0,
            op: Op::Default,
            completion: Completion::Evqueue,
            flags: RequestFlags::empty(),
            size: 0,
            local: BufferRef::default(),
            remote: BufferRef::default(),
            state: AtomicU16::new(STATE_UNUSED),
            events: AtomicU16::new(0),
        }
    }

    pub fn state(&self) -> u16 {
        self.state.load(Ordering::Relaxed)
    }

    pub fn set_state(&self, s: u16) {
        self.state.store(s, Ordering::Relaxed);
    }

    /// CAS a state transition another thread might be racing.
    pub fn transition(&self, from: u16, to: u16) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    pub fn events(&self) -> u16 {
        self.events.load(Ordering::Relaxed)
    }

    pub fn set_events(&self, n: u16) {
        self.events.store(n, Ordering::Relaxed);
    }

    /// Decrement the outstanding-event counter, returning the new value.
    pub fn dec_events(&self) -> u16 {
        self.events.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn is_completed(&self) -> bool {
        self.state() == STATE_COMPLETED
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Bounded ring of request descriptors for one peer.
pub struct RequestTable {
    slots: Box<[UnsafeCell<Request>]>,
    size: u32,
    count: AtomicU64,
    tail: AtomicU64,
}

// Slot bodies are handed out under the ring protocol; state/events are
// atomics.
unsafe impl Sync for RequestTable {}
unsafe impl Send for RequestTable {}

impl RequestTable {
    pub fn new(size: u32) -> Self {
        debug_assert!(size.is_power_of_two());
        let slots = (0..=size as usize)
            .map(|_| UnsafeCell::new(Request::blank()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            size,
            count: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Live descriptors: total-ever-allocated minus total-ever-freed.
    pub fn live(&self) -> u64 {
        self.count.load(Ordering::Relaxed) - self.tail.load(Ordering::Relaxed)
    }

    /// Allocate the next descriptor for an operation targeting `proc`.
    ///
    /// The returned reference is exclusive by ring protocol: the slot was
    /// just claimed and nothing else holds its index until it is freed.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc(&self, proc: u32) -> Result<&mut Request> {
        let curr = self.count.fetch_add(1, Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        debug_assert!(tail <= curr);
        if curr - tail >= self.size as u64 {
            self.count.fetch_sub(1, Ordering::Relaxed);
            warn!("request descriptors exhausted for proc {proc}, max={}", self.size);
            return Err(Error::Resource("request table full"));
        }
        let index = (curr & (self.size as u64 - 1)) as u32 + 1;
        let req = unsafe { &mut *self.slots[index as usize].get() };

        let state = req.state();
        if state != STATE_UNUSED && state != STATE_FREE {
            warn!(
                "overwriting request 0x{:016x} in state {} (curr={curr}, tail={tail})",
                req.id, state
            );
        }

        *req = Request::blank();
        req.cookie = rid_from_parts(proc, index);
        req.id = req.cookie;
        req.proc = proc;
        req.set_state(STATE_NEW);
        trace!("new request 0x{:016x} (index={index}, tail={tail})", req.id);
        Ok(req)
    }

    /// Resolve a request id minted by `alloc`. Warns when the slot has
    /// already been freed; returns `None` only for out-of-range indices.
    pub fn lookup(&self, rid: Rid) -> Option<&Request> {
        let index = rid_index(rid);
        if index == 0 || index > self.size {
            trace!("unknown request index {index} from rid 0x{rid:016x}");
            return None;
        }
        let req = unsafe { &*self.slots[index as usize].get() };
        if req.state() == STATE_FREE {
            warn!(
                "looking up a freed request, op={:?}, id=0x{:016x}",
                req.op, req.id
            );
        }
        Some(req)
    }

    /// Mutable view of a live slot, for paths that fill in fields after
    /// lookup (os_put/os_get re-arm the descriptor they were handed).
    #[allow(clippy::mut_from_ref)]
    pub fn lookup_mut(&self, rid: Rid) -> Option<&mut Request> {
        let index = rid_index(rid);
        if index == 0 || index > self.size {
            return None;
        }
        Some(unsafe { &mut *self.slots[index as usize].get() })
    }

    /// Return a descriptor to the ring. Requires COMPLETED; a second
    /// free (or freeing an incomplete request) is a logged warning.
    pub fn free(&self, req: &Request) -> Result<()> {
        if !req.transition(STATE_COMPLETED, STATE_FREE) {
            trace!(
                "freeing request 0x{:016x} that is not completed (state={})",
                req.id,
                req.state()
            );
            return Err(Error::Invalid(format!(
                "request 0x{:016x} not completed",
                req.id
            )));
        }
        self.tail.fetch_add(1, Ordering::Relaxed);
        trace!("cleared request 0x{:016x}", req.id);
        Ok(())
    }
}

/// Split a rid into (peer, index), bounds-checking the peer against
/// `nproc`.
pub fn split_rid(rid: Rid, nproc: u32) -> Option<(u32, u32)> {
    let proc_id = rid_proc(rid);
    if proc_id >= nproc {
        return None;
    }
    Some((proc_id, rid_index(rid)))
}

// ---------------------------------------------------------------------------
// Queued PWC completions
// ---------------------------------------------------------------------------

/// Ring of PWC requests completed by the event loop but not yet handed
/// to the application through `probe_completion`. Holds table cookies.
pub struct PwcQueue {
    slots: Box<[AtomicU64]>,
    size: u64,
    count: AtomicU64,
    tail: AtomicU64,
}

impl PwcQueue {
    pub fn new(capacity: u64) -> Self {
        let size = capacity.next_power_of_two();
        let slots = (0..size)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            size,
            count: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        }
    }

    pub fn push(&self, cookie: Rid) -> Result<()> {
        let curr = self.count.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        if curr - tail >= self.size {
            warn!("queued-completion ring full (size={})", self.size);
            return Err(Error::Resource("pwc completion queue full"));
        }
        self.slots[(curr & (self.size - 1)) as usize].store(cookie, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn pop(&self) -> Option<Rid> {
        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            let curr = self.count.load(Ordering::Relaxed);
            if tail >= curr {
                return None;
            }
            if self
                .tail
                .compare_exchange(tail, tail + 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                let slot = &self.slots[(tail & (self.size - 1)) as usize];
                return Some(slot.swap(0, Ordering::Relaxed));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_generation_unique_within_window() {
        let rt = RequestTable::new(8);
        let mut ids = Vec::new();
        for _ in 0..8 {
            let r = rt.alloc(3).unwrap();
            r.set_state(STATE_COMPLETED);
            ids.push(r.id);
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert!(matches!(rt.alloc(3), Err(Error::Resource(_))));
    }

    #[test]
    fn double_free_is_reported_once() {
        let rt = RequestTable::new(8);
        let r = rt.alloc(0).unwrap();
        let rid = r.id;
        r.set_state(STATE_COMPLETED);
        let r = rt.lookup(rid).unwrap();
        assert!(rt.free(r).is_ok());
        assert!(rt.free(r).is_err());
        assert_eq!(rt.live(), 0);
    }

    #[test]
    fn pwc_queue_fifo() {
        let q = PwcQueue::new(4);
        q.push(11).unwrap();
        q.push(22).unwrap();
        assert_eq!(q.pop(), Some(11));
        assert_eq!(q.pop(), Some(22));
        assert_eq!(q.pop(), None);
    }
}
