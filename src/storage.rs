// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared storage: one page-aligned, backend-registered allocation that
// holds every ledger ring and eager buffer for every peer.
//
// The layout is the single source of truth for all pointer arithmetic
// into peer mirrors. It is identical on every rank, so
// `peer_base[i] + region_offset + my_rank * stride` addresses this
// rank's mirror inside peer i's storage. Region order:
//
// | local_rcv_info | remote_rcv_info | local_snd_info | remote_snd_info |
// | local_fin | remote_fin | local_pwc | remote_pwc |
// | local_eager | remote_eager |
// | local_eager_buf | remote_eager_buf | local_pwc_buf | remote_pwc_buf |
//
// each region being `tproc * stride` bytes.

use std::alloc::{alloc_zeroed, dealloc, Layout};

use crate::buffer::Buffer;
use crate::config::Config;
use crate::info_ledger::RI_ENTRY_SIZE;
use crate::{Error, Result};

/// Size of one plain ledger entry on the wire.
pub const LEDGER_ENTRY_SIZE: usize = 8;

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// All region offsets and per-peer strides, derived once at init.
#[derive(Debug, Clone, Copy)]
pub struct StorageLayout {
    pub tproc: usize,
    pub ledger_entries: u32,
    pub eb_size: u64,

    /// Per-peer stride of a rendezvous-info ring.
    pub info_stride: usize,
    /// Per-peer stride of a plain ring.
    pub ledg_stride: usize,
    /// Per-peer stride of an eager byte ring.
    pub ebuf_stride: usize,

    pub off_local_rcv_info: usize,
    pub off_remote_rcv_info: usize,
    pub off_local_snd_info: usize,
    pub off_remote_snd_info: usize,
    pub off_local_fin: usize,
    pub off_remote_fin: usize,
    pub off_local_pwc: usize,
    pub off_remote_pwc: usize,
    pub off_local_eager: usize,
    pub off_remote_eager: usize,
    pub off_local_eager_buf: usize,
    pub off_remote_eager_buf: usize,
    pub off_local_pwc_buf: usize,
    pub off_remote_pwc_buf: usize,

    pub total: usize,
}

impl StorageLayout {
    pub fn new(cfg: &Config) -> Self {
        let tproc = cfg.total_proc();
        let ledger_entries = cfg.cap.ledger_entries;
        let eb_size = cfg.cap.eager_buf_size as u64;

        let info_stride = RI_ENTRY_SIZE * ledger_entries as usize;
        let ledg_stride = LEDGER_ENTRY_SIZE * ledger_entries as usize;
        let ebuf_stride = eb_size as usize;

        let np_info = tproc * info_stride;
        let np_ledg = tproc * ledg_stride;
        let np_ebuf = tproc * ebuf_stride;

        let off_local_rcv_info = 0;
        let off_remote_rcv_info = np_info;
        let off_local_snd_info = 2 * np_info;
        let off_remote_snd_info = 3 * np_info;
        let off_local_fin = 4 * np_info;
        let off_remote_fin = off_local_fin + np_ledg;
        let off_local_pwc = off_local_fin + 2 * np_ledg;
        let off_remote_pwc = off_local_fin + 3 * np_ledg;
        let off_local_eager = off_local_fin + 4 * np_ledg;
        let off_remote_eager = off_local_fin + 5 * np_ledg;
        let off_local_eager_buf = off_local_fin + 6 * np_ledg;
        let off_remote_eager_buf = off_local_eager_buf + np_ebuf;
        let off_local_pwc_buf = off_local_eager_buf + 2 * np_ebuf;
        let off_remote_pwc_buf = off_local_eager_buf + 3 * np_ebuf;
        let total = off_local_eager_buf + 4 * np_ebuf;

        Self {
            tproc,
            ledger_entries,
            eb_size,
            info_stride,
            ledg_stride,
            ebuf_stride,
            off_local_rcv_info,
            off_remote_rcv_info,
            off_local_snd_info,
            off_remote_snd_info,
            off_local_fin,
            off_remote_fin,
            off_local_pwc,
            off_remote_pwc,
            off_local_eager,
            off_remote_eager,
            off_local_eager_buf,
            off_remote_eager_buf,
            off_local_pwc_buf,
            off_remote_pwc_buf,
            total,
        }
    }
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// The storage allocation plus the `Buffer` the backend registers over it.
pub struct SharedStorage {
    base: *mut u8,
    layout: StorageLayout,
    alloc_layout: Layout,
    /// Registration state for the whole region. Keys are filled by the
    /// backend at init and exchanged with every peer.
    pub buffer: Buffer,
}

unsafe impl Send for SharedStorage {}
unsafe impl Sync for SharedStorage {}

impl SharedStorage {
    pub fn alloc(cfg: &Config) -> Result<Self> {
        let layout = StorageLayout::new(cfg);
        let page = page_size();
        let alloc_layout = Layout::from_size_align(layout.total.max(page), page)
            .map_err(|e| Error::Invalid(format!("storage layout: {e}")))?;
        // Zeroed so no ring observes stale bytes as landed entries.
        let base = unsafe { alloc_zeroed(alloc_layout) };
        if base.is_null() {
            return Err(Error::Resource("shared storage allocation failed"));
        }
        let buffer = Buffer::new(base as u64, layout.total as u64);
        Ok(Self {
            base,
            layout,
            alloc_layout,
            buffer,
        })
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Pointer to peer `i`'s slice of the region starting at `offset`.
    ///
    /// # Safety
    /// `offset` must be one of the layout's region offsets and `stride`
    /// its matching per-peer stride.
    pub unsafe fn peer_slice(&self, offset: usize, stride: usize, i: usize) -> *mut u8 {
        debug_assert!(i < self.layout.tproc);
        self.base.add(offset + stride * i)
    }
}

impl Drop for SharedStorage {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.alloc_layout) };
    }
}

fn page_size() -> usize {
    let v = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if v <= 0 {
        4096
    } else {
        v as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetaExchange;
    use std::sync::Arc;

    fn cfg(nproc: u32) -> Config {
        let mut c = Config::new(
            nproc,
            0,
            MetaExchange::External {
                allgather: Arc::new(|_, _| Ok(())),
                barrier: Arc::new(|| Ok(())),
            },
        );
        c.normalize();
        c
    }

    #[test]
    fn regions_tile_without_overlap() {
        let l = StorageLayout::new(&cfg(3));
        let np_info = l.tproc * l.info_stride;
        let np_ledg = l.tproc * l.ledg_stride;
        let np_ebuf = l.tproc * l.ebuf_stride;
        assert_eq!(l.off_remote_rcv_info - l.off_local_rcv_info, np_info);
        assert_eq!(l.off_local_fin - l.off_remote_snd_info, np_info);
        assert_eq!(l.off_local_pwc - l.off_remote_fin, np_ledg);
        assert_eq!(l.off_local_eager_buf - l.off_remote_eager, np_ledg);
        assert_eq!(l.off_remote_pwc_buf - l.off_local_pwc_buf, np_ebuf);
        assert_eq!(l.total, l.off_remote_pwc_buf + np_ebuf);
    }

    #[test]
    fn layout_identical_across_ranks() {
        let mut a = cfg(4);
        let mut b = cfg(4);
        a.rank = 1;
        b.rank = 3;
        let la = StorageLayout::new(&a);
        let lb = StorageLayout::new(&b);
        assert_eq!(la.total, lb.total);
        assert_eq!(la.off_local_pwc_buf, lb.off_local_pwc_buf);
    }

    #[test]
    fn alloc_is_page_aligned() {
        let ss = SharedStorage::alloc(&cfg(2)).unwrap();
        assert_eq!(ss.base() as usize % page_size(), 0);
        assert_eq!(ss.buffer.desc().size, ss.layout().total as u64);
    }
}
