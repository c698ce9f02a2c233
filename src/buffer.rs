// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Registered memory regions and the buffer registry.
//
// A `Buffer` describes one backend-registered address range together with
// the remote-access key pair the fabric hands back at registration time.
// The registry is a flat vector guarded by a spin lock; lookups are linear
// and tie-break by insertion order.

use std::any::Any;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::spin_lock::SpinLock;
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Wire-visible descriptors
// ---------------------------------------------------------------------------

/// Remote access key pair (rkey / memory handle), exchanged once per
/// registered region and carried in rendezvous-info entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferPriv {
    pub key0: u64,
    pub key1: u64,
}

/// Plain buffer descriptor: everything a peer needs to target the region
/// with a one-sided operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferDesc {
    pub addr: u64,
    pub size: u64,
    pub keys: BufferPriv,
}

impl BufferDesc {
    pub fn new(addr: u64, size: u64) -> Self {
        Self {
            addr,
            size,
            keys: BufferPriv::default(),
        }
    }

    /// Whether `[addr, addr+size)` lies entirely inside this buffer.
    pub fn contains(&self, addr: u64, size: u64) -> bool {
        self.addr <= addr && addr + size <= self.addr + self.size
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferFlags: u16 {
        /// Backend should arm remote-completion notification for writes
        /// into this region.
        const NOTIFY = 1 << 1;
    }
}

/// Opaque backend registration state (e.g. an `ibv_mr`).
pub type MrHandle = Box<dyn Any + Send + Sync>;

// ---------------------------------------------------------------------------
// Registered buffer
// ---------------------------------------------------------------------------

/// One registered region. Created by `register_buffer`, ref-counted per
/// exact `(addr, size)` duplicate, destroyed when the count reaches zero
/// and the backend unregister succeeds.
pub struct Buffer {
    desc: BufferDesc,
    flags: BufferFlags,
    ref_count: AtomicU32,
    mr: Option<MrHandle>,
}

impl Buffer {
    pub fn new(addr: u64, size: u64) -> Self {
        Self {
            desc: BufferDesc::new(addr, size),
            flags: BufferFlags::empty(),
            ref_count: AtomicU32::new(1),
            mr: None,
        }
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    pub fn keys(&self) -> BufferPriv {
        self.desc.keys
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    /// A buffer participates in RDMA iff the backend attached its
    /// registration state.
    pub fn is_registered(&self) -> bool {
        self.mr.is_some()
    }

    /// Called by the backend at registration time.
    pub fn attach_mr(&mut self, keys: BufferPriv, mr: MrHandle) {
        self.desc.keys = keys;
        self.mr = Some(mr);
    }

    pub fn detach_mr(&mut self) -> Option<MrHandle> {
        self.mr.take()
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    pub fn acquire(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drop one reference, returning the remaining count.
    pub fn release(&self) -> u32 {
        self.ref_count.fetch_sub(1, Ordering::Relaxed) - 1
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Flat table of registered buffers.
///
/// A single test-and-test-and-set lock protects the vector; the vector
/// doubles on growth and never shrinks. Lookups walk in insertion order.
pub struct BufferRegistry {
    lock: SpinLock,
    bufs: UnsafeCell<Vec<Arc<Buffer>>>,
}

// The UnsafeCell is only touched with the lock held.
unsafe impl Sync for BufferRegistry {}
unsafe impl Send for BufferRegistry {}

impl BufferRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            lock: SpinLock::new(),
            bufs: UnsafeCell::new(Vec::with_capacity(capacity)),
        }
    }

    fn vec(&self) -> &mut Vec<Arc<Buffer>> {
        unsafe { &mut *self.bufs.get() }
    }

    pub fn insert(&self, buf: Arc<Buffer>) {
        self.lock.with(|| {
            let v = self.vec();
            if v.len() == v.capacity() {
                v.reserve(v.capacity().max(1));
            }
            v.push(buf);
        })
    }

    /// Remove one buffer by identity. Removing a range never disturbs
    /// other, non-overlapping registrations.
    pub fn remove(&self, buf: &Arc<Buffer>) -> Result<()> {
        self.lock.with(|| {
            let v = self.vec();
            match v.iter().position(|b| Arc::ptr_eq(b, buf)) {
                Some(i) => {
                    v.swap_remove(i);
                    Ok(())
                }
                None => Err(Error::Lookup {
                    addr: buf.desc.addr,
                    size: buf.desc.size,
                }),
            }
        })
    }

    /// First registered buffer whose range contains `[addr, addr+size)`.
    pub fn find_containing(&self, addr: u64, size: u64) -> Result<Arc<Buffer>> {
        self.lock.with(|| {
            self.vec()
                .iter()
                .find(|b| b.desc.contains(addr, size))
                .cloned()
                .ok_or(Error::Lookup { addr, size })
        })
    }

    /// Registered buffer with exactly this `(addr, size)`.
    pub fn find_exact(&self, addr: u64, size: u64) -> Result<Arc<Buffer>> {
        self.lock.with(|| {
            self.vec()
                .iter()
                .find(|b| b.desc.addr == addr && b.desc.size == size)
                .cloned()
                .ok_or(Error::Lookup { addr, size })
        })
    }

    pub fn len(&self) -> usize {
        self.lock.with(|| self.vec().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain every entry, handing each to `f` (used by finalize to
    /// unregister in reverse insertion order).
    pub fn drain_reverse(&self, mut f: impl FnMut(Arc<Buffer>)) {
        self.lock.lock();
        let mut v = std::mem::take(self.vec());
        self.lock.unlock();
        while let Some(b) = v.pop() {
            f(b);
        }
    }
}
