// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// In-process loopback transport.
//
// All "ranks" share one address space, so a PUT is a memcpy to the raw
// remote address and a GET is a memcpy from it; completions are queued
// cookies. Payload bytes are therefore globally visible before the
// cookie can be observed, which is the same ordering a fabric guarantees
// between a landed WRITE and its completion. Used by the test suite and
// by single-node runs.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::buffer::{Buffer, BufferDesc, BufferFlags, BufferPriv};
use crate::config::Config;
use crate::rid::Rid;
use crate::spin_lock::SpinLock;
use crate::{Error, Result};

use super::{EventPoll, InfoKind, RdmaFlags, Transport};

/// Completion queue: a locked deque of cookies.
struct CookieQueue {
    lock: SpinLock,
    q: UnsafeCell<VecDeque<Rid>>,
}

unsafe impl Sync for CookieQueue {}
unsafe impl Send for CookieQueue {}

impl CookieQueue {
    fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            q: UnsafeCell::new(VecDeque::new()),
        }
    }

    fn push(&self, cookie: Rid) {
        self.lock.with(|| unsafe { (*self.q.get()).push_back(cookie) })
    }

    fn pop(&self) -> Option<Rid> {
        self.lock.with(|| unsafe { (*self.q.get()).pop_front() })
    }

    fn len(&self) -> usize {
        self.lock.with(|| unsafe { (*self.q.get()).len() })
    }
}

/// The loopback transport.
pub struct MemTransport {
    cq: CookieQueue,
    key_salt: AtomicU64,
    up: AtomicBool,
}

impl MemTransport {
    pub fn new() -> Self {
        Self {
            cq: CookieQueue::new(),
            key_salt: AtomicU64::new(1),
            up: AtomicBool::new(false),
        }
    }

    fn fabricate_keys(&self, addr: u64) -> BufferPriv {
        BufferPriv {
            key0: addr,
            key1: self.key_salt.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn copy(laddr: u64, raddr: u64, size: u64) {
        // SAFETY: both addresses live in this process; callers hand in
        // ranges validated against registered buffers or shared storage.
        unsafe {
            std::ptr::copy(laddr as *const u8, raddr as *mut u8, size as usize);
        }
    }
}

impl Default for MemTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemTransport {
    fn initialized(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    fn init(&mut self, _cfg: &Config, storage: &mut Buffer) -> Result<()> {
        let keys = self.fabricate_keys(storage.desc().addr);
        storage.attach_mr(keys, Box::new(()));
        self.up.store(true, Ordering::Release);
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.up.store(false, Ordering::Release);
        Ok(())
    }

    fn register_buffer(&self, buf: &mut Buffer, _flags: BufferFlags) -> Result<()> {
        let keys = self.fabricate_keys(buf.desc().addr);
        buf.attach_mr(keys, Box::new(()));
        Ok(())
    }

    fn unregister_buffer(&self, _buf: &Buffer) -> Result<()> {
        Ok(())
    }

    fn rdma_put(
        &self,
        _peer: u32,
        laddr: u64,
        raddr: u64,
        size: u64,
        _lbuf: &BufferDesc,
        _rbuf: &BufferDesc,
        cookie: Rid,
        _imm: u64,
        flags: RdmaFlags,
    ) -> Result<()> {
        if !self.initialized() {
            return Err(Error::NoInit);
        }
        Self::copy(laddr, raddr, size);
        if !flags.contains(RdmaFlags::NO_CQE) {
            self.cq.push(cookie);
        }
        Ok(())
    }

    fn rdma_get(
        &self,
        _peer: u32,
        laddr: u64,
        raddr: u64,
        size: u64,
        _lbuf: &BufferDesc,
        _rbuf: &BufferDesc,
        cookie: Rid,
        flags: RdmaFlags,
    ) -> Result<()> {
        if !self.initialized() {
            return Err(Error::NoInit);
        }
        Self::copy(raddr, laddr, size);
        if !flags.contains(RdmaFlags::NO_CQE) {
            self.cq.push(cookie);
        }
        Ok(())
    }

    fn get_event(&self, _peer: i32, events: &mut [Rid]) -> Result<EventPoll> {
        let mut n = 0;
        while n < events.len() {
            match self.cq.pop() {
                Some(c) => {
                    events[n] = c;
                    n += 1;
                }
                None => break,
            }
        }
        if n == 0 {
            Ok(EventPoll::Empty)
        } else {
            Ok(EventPoll::Events(n))
        }
    }

    fn tx_size_left(&self, _peer: u32) -> i32 {
        // unbounded; report the queue depth as a hint
        i32::MAX - self.cq.len() as i32
    }

    fn get_info(&self, _peer: i32, kind: InfoKind) -> Result<u64> {
        match kind {
            InfoKind::Mtu => Ok(u64::MAX),
            InfoKind::Alignment => Ok(1),
        }
    }

    fn thread_safe(&self) -> bool {
        // CookieQueue serializes internally; memcpy needs no lock.
        true
    }
}
