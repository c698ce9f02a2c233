// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Put-with-completion: one-sided data movement whose remote completion
// is signalled in-band, either by a header/tail flag pair packed around
// the payload in the peer's PWC byte ring (1-PUT) or by a follow-up
// write of the remote id into the peer's PWC ledger (2-PUT).
//
// The local side never blocks: completions surface through
// `probe_completion`, which multiplexes the queued-completion ring, the
// backend CQ, and the local PWC rings.

use log::{trace, warn};

use bitflags::bitflags;

use crate::backend::{EventPoll, RdmaFlags};
use crate::buffer::BufferPriv;
use crate::eager::{eb_msg_size, eb_tail_offset, EbHdr, EB_HDR_SIZE};
use crate::ledger::LEDGER_EMPTY_PWC;
use crate::request::{Completion, Op, OpFlags, RequestFlags, STATE_COMPLETED, STATE_PENDING};
use crate::rid::{cookie_prefix, Rid, COOK_EAGER, COOK_RECV, NULL_COOKIE};
use crate::runtime::Runtime;
use crate::spin_lock::adaptive_yield;
use crate::storage::LEDGER_ENTRY_SIZE;
use crate::{Error, Result};

bitflags! {
    /// Which completion sources `probe_completion` consults.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProbeFlags: u32 {
        /// Pull raw events from the backend completion queue.
        const EVQ = 1 << 0;
        /// Scan the local PWC rings for remote completions.
        const LEDGER = 1 << 1;
    }
}

impl Runtime {
    /// One-sided put of `[ptr, ptr+size)` to `rptr` on `proc`, with the
    /// remote side notified through its PWC rings.
    ///
    /// `local_rid` is handed back here via `probe_completion` once all
    /// local events have drained; `remote_rid` is handed to the peer's
    /// `probe_completion` when the data has landed there.
    #[allow(clippy::too_many_arguments)]
    pub fn put_with_completion(
        &self,
        proc_id: u32,
        ptr: u64,
        size: u64,
        rptr: u64,
        rkeys: BufferPriv,
        local_rid: Rid,
        remote_rid: Rid,
        flags: OpFlags,
    ) -> Result<()> {
        self.check_init()?;
        trace!(
            "put_with_completion({proc_id}, 0x{ptr:016x}, {size}, 0x{rptr:016x}, \
             0x{local_rid:016x}, 0x{remote_rid:016x})"
        );
        let peer = self.peer(proc_id)?;
        let spsize = self.cfg.cap.small_pwc_size as u64;
        let ebsize = self.cfg.cap.eager_buf_size as u64;

        let mut p0 = RdmaFlags::empty();
        let mut p1 = RdmaFlags::empty();
        if flags.intersects(OpFlags::ONE_CQE | OpFlags::NO_CQE) {
            p0 |= RdmaFlags::NO_CQE;
        }
        if flags.contains(OpFlags::NO_CQE) {
            p1 |= RdmaFlags::NO_CQE;
        }

        // one event under the packed-eager limit, two otherwise; flags
        // can reduce further
        let mut nentries: u16 = if size <= spsize { 1 } else { 2 };
        if nentries == 2 && flags.contains(OpFlags::ONE_CQE) {
            nentries = 1;
        }
        if flags.contains(OpFlags::NO_CQE) {
            nentries = 0;
        }

        let (mut req, cookie) = if nentries > 0 {
            let req = peer.requests.alloc(proc_id)?;
            req.set_state(STATE_PENDING);
            req.completion = Completion::Evqueue;
            req.op = Op::Pwc;
            req.set_events(nentries);
            let cookie = req.cookie;
            req.id = local_rid;
            req.flags = RequestFlags::USERID;
            (Some(req), cookie)
        } else {
            (None, NULL_COOKIE)
        };

        if size > 0 && size <= spsize && size <= ebsize {
            // 1-PUT: pack header, payload, and tail flag, then write the
            // whole span
            let eb = &peer.remote_pwc_buf;
            let span = eb_msg_size(size);
            let offset = eb.reserve(span, eb_msg_size(spsize))?;

            unsafe {
                let hdr = eb.at(offset) as *mut EbHdr;
                hdr.write_unaligned(EbHdr {
                    request: remote_rid,
                    addr: rptr,
                    length: size as u16,
                    head: u8::MAX,
                });
                std::ptr::copy_nonoverlapping(
                    ptr as *const u8,
                    eb.at(offset + EB_HDR_SIZE),
                    size as usize,
                );
                *eb.at(offset + eb_tail_offset(size)) = u8::MAX;
            }

            let eager_addr = eb.remote.addr + offset;
            if let Some(r) = req.as_mut() {
                r.remote.desc.addr = eager_addr;
                r.remote.desc.size = span;
                r.remote.desc.keys = eb.remote.keys;
                r.size = span;
                r.flags |= RequestFlags::ONE_PWC;
            }

            let lbuf = self.storage_desc();
            let put = self
                .put(
                    proc_id,
                    eb.addr_of(offset),
                    eager_addr,
                    span,
                    &lbuf,
                    &eb.remote,
                    cookie,
                    p1,
                )
                .map_err(|e| {
                    warn!("packed PWC WRITE failed for 0x{cookie:016x}");
                    e
                });
            match req.as_deref() {
                Some(r) => self.fail_on_err(r, put)?,
                None => put?,
            }
        } else {
            // 2-PUT: payload first, then the notification word
            let l = &peer.remote_pwc;
            let curr = l.claim()?;

            if size > 0 {
                let db = self.registry.find_containing(ptr, size)?;
                let rbuf = crate::buffer::BufferDesc {
                    addr: rptr,
                    size,
                    keys: rkeys,
                };
                if let Some(r) = req.as_mut() {
                    r.remote.desc = rbuf;
                }
                let put = self
                    .put(proc_id, ptr, rptr, size, db.desc(), &rbuf, cookie, p0)
                    .map_err(|e| {
                        warn!("PWC data WRITE failed for 0x{cookie:016x}");
                        e
                    });
                match req.as_deref() {
                    Some(r) => self.fail_on_err(r, put)?,
                    None => put?,
                }
            }

            l.entry(curr)
                .store(remote_rid, std::sync::atomic::Ordering::Relaxed);
            let rmt_addr = l.remote.addr + curr as u64 * LEDGER_ENTRY_SIZE as u64;
            trace!("notify into remote ledger addr 0x{rmt_addr:016x}");

            if let Some(r) = req.as_mut() {
                r.size = size;
                r.flags |= RequestFlags::TWO_PWC;
            }

            let lbuf = self.storage_desc();
            let put = self
                .put(
                    proc_id,
                    l.entry_addr(curr),
                    rmt_addr,
                    LEDGER_ENTRY_SIZE as u64,
                    &lbuf,
                    &l.remote,
                    cookie,
                    p1,
                )
                .map_err(|e| {
                    warn!("PWC notify WRITE failed for 0x{cookie:016x}");
                    e
                });
            match req.as_deref() {
                Some(r) => self.fail_on_err(r, put)?,
                None => put?,
            }
        }

        trace!("posted request {proc_id}/0x{local_rid:016x}/0x{remote_rid:016x}");
        Ok(())
    }

    /// One-sided get with local completion only; the remote side is not
    /// notified.
    #[allow(clippy::too_many_arguments)]
    pub fn get_with_completion(
        &self,
        proc_id: u32,
        ptr: u64,
        size: u64,
        rptr: u64,
        rkeys: BufferPriv,
        local_rid: Rid,
        _flags: OpFlags,
    ) -> Result<()> {
        self.check_init()?;
        trace!("get_with_completion({proc_id}, 0x{ptr:016x}, {size}, 0x{rptr:016x})");

        if size == 0 || ptr == 0 {
            return Err(Error::Invalid(
                "get of zero bytes or into a null buffer".into(),
            ));
        }
        let db = self.registry.find_containing(ptr, size)?;
        let peer = self.peer(proc_id)?;

        let req = peer.requests.alloc(proc_id)?;
        req.set_state(STATE_PENDING);
        req.completion = Completion::Evqueue;
        req.op = Op::Pwc;
        req.set_events(1);
        let cookie = req.cookie;
        req.id = local_rid;
        req.flags = RequestFlags::USERID;
        let rbuf = crate::buffer::BufferDesc {
            addr: rptr,
            size,
            keys: rkeys,
        };
        req.remote.desc = rbuf;

        let get = self.get(
            proc_id,
            ptr,
            rptr,
            size,
            db.desc(),
            &rbuf,
            cookie,
            RdmaFlags::empty(),
        );
        self.fail_on_err(req, get)
    }

    /// Reap one completion. `EVQ` consults the queued-completion ring
    /// and the backend CQ; `LEDGER` scans the local PWC rings of `proc`
    /// (or of every peer). Returns the application-visible rid.
    pub fn probe_completion(
        &self,
        proc_id: Option<u32>,
        flags: ProbeFlags,
    ) -> Result<Option<Rid>> {
        self.check_init()?;

        let (start, end) = match proc_id {
            Some(p) => (p as usize, p as usize + 1),
            None => (0, self.cfg.nproc as usize),
        };

        let mut cookie = NULL_COOKIE;
        if flags.contains(ProbeFlags::EVQ) {
            // completions parked by the event loop first
            if let Some(parked) = self.pwc_q.pop() {
                let req = self.lookup_request(parked)?;
                debug_assert_eq!(req.op, Op::Pwc);
                let rid = req.id;
                trace!("completed queued pwc request 0x{rid:016x}");
                self.free_request(req)?;
                return Ok(Some(rid));
            }

            let mut ev = [NULL_COOKIE];
            match self.backend.get_event(-1, &mut ev)? {
                EventPoll::Events(_) => {
                    cookie = ev[0];
                    trace!("popped CQ event with id 0x{cookie:016x}");
                }
                EventPoll::Empty | EventPoll::NotImpl => {}
            }
        }

        // only scan the rings when no event was popped
        if cookie == NULL_COOKIE && flags.contains(ProbeFlags::LEDGER) {
            for i in start..end {
                if let Some(rid) = self.probe_pwc_rings(i)? {
                    return Ok(Some(rid));
                }
            }
        }

        if cookie != NULL_COOKIE {
            if let Some(prefix) = cookie_prefix(cookie) {
                if prefix != COOK_EAGER && prefix != COOK_RECV {
                    trace!("dropping prefixed completion 0x{cookie:016x}");
                }
                return Ok(None);
            }
            let req = match self.lookup_request(cookie) {
                Ok(r) => r,
                Err(_) => {
                    warn!("CQ event not tracked: 0x{cookie:016x}");
                    return Err(Error::Invalid(format!(
                        "untracked completion 0x{cookie:016x}"
                    )));
                }
            };
            if req.op != Op::Pwc {
                // let handshake requests make progress through here too
                self.handle_cq_event(req, cookie);
                return Ok(None);
            }
            if req.dec_events() == 0 {
                req.transition(STATE_PENDING, STATE_COMPLETED);
                let rid = req.id;
                trace!("completed pwc request 0x{rid:016x}/0x{cookie:016x}");
                self.free_request(req)?;
                return Ok(Some(rid));
            }
        }

        Ok(None)
    }

    /// Scan peer `i`'s local PWC byte ring and plain ledger for one
    /// remote completion.
    fn probe_pwc_rings(&self, i: usize) -> Result<Option<Rid>> {
        let peer = &self.peers[i];
        let spsize = self.cfg.cap.small_pwc_size as u64;

        // packed messages first
        let eb = &peer.local_pwc_buf;
        let seen = eb.curr();
        let (offset, base) = eb.consumer_offset(seen, eb_msg_size(spsize));
        let hdr = unsafe { (eb.at(offset) as *const EbHdr).read_unaligned() };
        if hdr.head == u8::MAX {
            let size = hdr.length as u64;
            let rid = hdr.request;
            let addr = hdr.addr;
            let next = base + eb_msg_size(size);
            if eb.try_advance(seen, next) {
                // the tail flag trails the payload write; once the head
                // flag is visible the tail is already in flight
                let tail = eb.at(offset + eb_tail_offset(size));
                let mut k = 0u32;
                while unsafe { std::ptr::read_volatile(tail) } != u8::MAX {
                    adaptive_yield(&mut k);
                }
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        eb.at(offset + EB_HDR_SIZE),
                        addr as *mut u8,
                        size as usize,
                    );
                    std::ptr::write_bytes(eb.at(offset), 0, eb_msg_size(size) as usize);
                }
                eb.mark_done(next - seen);
                trace!("copied packed message of {size} bytes for 0x{rid:016x}");
                return Ok(Some(rid));
            }
        }

        // then the notification ledger
        let l = &peer.local_pwc;
        let curr = l.curr();
        let idx = l.index_of(curr);
        let word = l.entry(idx).load(std::sync::atomic::Ordering::Acquire);
        if word != LEDGER_EMPTY_PWC && l.try_advance(curr) {
            l.entry(idx)
                .store(LEDGER_EMPTY_PWC, std::sync::atomic::Ordering::Relaxed);
            l.mark_done(1);
            trace!("popped ledger completion 0x{word:016x}");
            return Ok(Some(word));
        }

        Ok(None)
    }
}
