// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The two-sided handshake, built entirely from one-sided WRITEs into the
// peer's info ledgers.
//
// A receiver-initiated transfer starts with `post_recv_buffer`: the
// receiver advertises its landing buffer in the peer's rcv-info ring,
// the sender picks the advertisement up with `wait_recv_buffer`, moves
// the payload with `post_os_put`, and closes with `send_fin`. The
// sender-initiated dual runs through the snd-info ring, with an eager
// fast path that pushes small payloads straight into the peer's byte
// ring.

use log::{trace, warn};

use crate::backend::RdmaFlags;
use crate::eager::EagerBuf;
use crate::info_ledger::RiLedger;
use crate::ledger::Ledger;
use crate::request::{
    Completion, Op, OpFlags, RequestFlags, STATE_COMPLETED, STATE_PENDING,
};
use crate::rid::{
    cookie_with_prefix, rid_from_parts, rid_index, Rid, COOK_EAGER, NULL_COOKIE,
};
use crate::runtime::Runtime;
use crate::spin_lock::adaptive_yield;
use crate::storage::LEDGER_ENTRY_SIZE;
use crate::{Error, Result};

/// Match any message size in `wait_send_buffer`.
pub const ANY_SIZE: Option<u64> = None;

impl Runtime {
    // -----------------------------------------------------------------
    // Receiver-initiated rendezvous
    // -----------------------------------------------------------------

    /// Advertise `[ptr, ptr+size)` to `proc` as a landing buffer for a
    /// tagged transfer. With `proc == None` (any source) the sender is
    /// first resolved through a pending send request.
    ///
    /// Completes (via FIN) once the peer's matching transfer finishes.
    pub fn post_recv_buffer(
        &self,
        proc_id: Option<u32>,
        ptr: u64,
        size: u64,
        tag: i32,
    ) -> Result<Rid> {
        self.check_init()?;
        trace!("post_recv_buffer({proc_id:?}, 0x{ptr:016x}, {size}, {tag})");

        let db = self.registry.find_containing(ptr, size)?;

        // Any-source receives first match a sender's intent entry.
        let proc_id = match proc_id {
            Some(p) => p,
            None => self.wait_send_request(tag)?,
        };
        let peer = self.peer(proc_id)?;

        // claim the ring slot first so a full ledger has no side effects
        let l = &peer.remote_rcv_info;
        let curr = l.claim()?;
        trace!("new rcv-info curr (proc={proc_id}): {curr}");

        let req = peer.requests.alloc(proc_id)?;
        req.set_state(STATE_PENDING);
        req.op = Op::RecvBuf;
        req.completion = Completion::Ledger;
        req.tag = tag;
        req.size = size;
        req.local.desc = *db.desc();
        req.set_events(1);
        let rid = req.id;

        l.entry_mut(curr)
            .fill(rid, tag, ptr, size, db.keys(), 0);

        let put = self.put_info_entry(proc_id, l, curr, req.cookie);
        self.fail_on_err(req, put)?;
        Ok(rid)
    }

    /// Block until a rcv-info advertisement matching `tag` lands, then
    /// claim it and return a request holding the peer's buffer
    /// description. Out-of-order entries are swapped to the ring head so
    /// later waits still find theirs.
    pub fn wait_recv_buffer(&self, proc_id: u32, tag: i32) -> Result<Rid> {
        self.check_init()?;
        trace!("wait_recv_buffer({proc_id}, {tag})");
        let peer = self.peer(proc_id)?;
        self.wait_info_entry(proc_id, &peer.local_rcv_info, tag, None)
    }

    // -----------------------------------------------------------------
    // Sender-initiated handshake
    // -----------------------------------------------------------------

    /// Offer `[ptr, ptr+size)` to `proc`. Payloads at or under the
    /// small-message threshold are pushed eagerly into the peer's byte
    /// ring; larger ones advertise through the snd-info ring and wait
    /// for the peer to pull.
    pub fn post_send_buffer(&self, proc_id: u32, ptr: u64, size: u64, tag: i32) -> Result<Rid> {
        self.check_init()?;
        trace!("post_send_buffer({proc_id}, 0x{ptr:016x}, {size}, {tag})");

        let db = self.registry.find_containing(ptr, size)?;
        match self.try_eager(proc_id, ptr, size, tag, &db) {
            Err(Error::Resource(_)) => self.try_rndv(proc_id, ptr, size, tag, &db),
            other => other,
        }
    }

    fn try_eager(
        &self,
        proc_id: u32,
        ptr: u64,
        size: u64,
        tag: i32,
        db: &crate::buffer::Buffer,
    ) -> Result<Rid> {
        if size > self.cfg.cap.small_msg_size as u64 {
            return Err(Error::Resource("above eager threshold"));
        }
        let peer = self.peer(proc_id)?;

        let eb = &peer.remote_eager_buf;
        let offset = eb.reserve(size, size)?;

        let l = &peer.remote_eager;
        let curr = l.claim()?;

        let req = peer.requests.alloc(proc_id)?;
        req.set_state(STATE_PENDING);
        req.op = Op::SendBuf;
        req.flags = RequestFlags::EAGER;
        req.completion = Completion::Ledger;
        req.tag = tag;
        req.size = size;
        req.set_events(1);
        let rid = req.id;

        let eager_addr = eb.remote.addr + offset;
        let eager_cookie = cookie_with_prefix(COOK_EAGER, rid_index(rid));
        trace!("eager put of {size} bytes to 0x{eager_addr:016x}");

        let put = self.put(
            proc_id,
            ptr,
            eager_addr,
            size,
            db.desc(),
            &eb.remote,
            eager_cookie,
            RdmaFlags::empty(),
        );
        self.fail_on_err(req, put)?;

        // encode the eager size and request id in the ledger word
        l.entry(curr)
            .store((size << 32) | rid_index(rid) as u64, std::sync::atomic::Ordering::Relaxed);
        let put = self.put_plain_entry(proc_id, l, curr, req.cookie);
        self.fail_on_err(req, put)?;
        Ok(rid)
    }

    fn try_rndv(
        &self,
        proc_id: u32,
        ptr: u64,
        size: u64,
        tag: i32,
        db: &crate::buffer::Buffer,
    ) -> Result<Rid> {
        let peer = self.peer(proc_id)?;

        let l = &peer.remote_snd_info;
        let curr = l.claim()?;
        trace!("new snd-info curr: {curr}");

        let req = peer.requests.alloc(proc_id)?;
        req.set_state(STATE_PENDING);
        req.op = Op::SendBuf;
        req.completion = Completion::Ledger;
        req.tag = tag;
        req.size = size;
        req.local.desc = *db.desc();
        req.set_events(1);
        let rid = req.id;

        l.entry_mut(curr)
            .fill(rid, tag, ptr, size, db.keys(), 0);
        let put = self.put_info_entry(proc_id, l, curr, req.cookie);
        self.fail_on_err(req, put)?;
        Ok(rid)
    }

    /// Advertise an intent to send, carrying only size and tag. The
    /// receiver resolves it through an any-source `post_recv_buffer`.
    pub fn post_send_request(&self, proc_id: u32, size: u64, tag: i32) -> Result<Rid> {
        self.check_init()?;
        trace!("post_send_request({proc_id}, {size}, {tag})");
        let peer = self.peer(proc_id)?;

        let l = &peer.remote_snd_info;
        let curr = l.claim()?;

        let req = peer.requests.alloc(proc_id)?;
        req.set_state(STATE_PENDING);
        req.op = Op::SendReq;
        req.completion = Completion::Evqueue;
        req.tag = tag;
        req.size = size;
        req.set_events(1);
        let rid = req.id;

        // intent only: zeroed address and keys mark the entry
        l.entry_mut(curr)
            .fill(rid, tag, 0, size, Default::default(), 0);
        let put = self.put_info_entry(proc_id, l, curr, req.cookie);
        self.fail_on_err(req, put)?;
        Ok(rid)
    }

    /// Block until a snd-info advertisement or an eager arrival from
    /// `proc` matches `tag` (and `size`, unless `ANY_SIZE`). Whichever
    /// ring satisfies the predicate first wins.
    pub fn wait_send_buffer(
        &self,
        proc_id: u32,
        size: Option<u64>,
        tag: i32,
    ) -> Result<Rid> {
        self.check_init()?;
        trace!("wait_send_buffer({proc_id}, {size:?}, {tag})");
        let peer = self.peer(proc_id)?;

        let mut k = 0u32;
        loop {
            // eager ring first: a landed word is a finished payload
            if let Some(rid) = self.try_claim_eager(proc_id, &peer.local_eager, size)? {
                return Ok(rid);
            }
            if let Some(rid) =
                self.try_claim_info(proc_id, &peer.local_snd_info, tag, size)?
            {
                return Ok(rid);
            }
            adaptive_yield(&mut k);
        }
    }

    /// Round-robin scan for a pending send intent matching `tag`;
    /// consumes the intent entry and returns the sender's rank.
    pub fn wait_send_request(&self, tag: i32) -> Result<u32> {
        self.check_init()?;
        trace!("wait_send_request({tag})");

        let mut iproc = 0usize;
        let mut k = 0u32;
        loop {
            let peer = &self.peers[iproc];
            let l = &peer.local_snd_info;
            let curr = l.curr();
            let idx = l.index_of(curr);
            let e = l.entry(idx);
            if e.landed()
                && e.addr == 0
                && e.key0 == 0
                && (tag < 0 || e.tag == tag)
                && l.try_advance(curr)
            {
                trace!("matched send request with tag {tag} from proc {iproc}");
                e.clear();
                l.mark_done(1);
                return Ok(iproc as u32);
            }
            iproc = (iproc + 1) % self.cfg.nproc as usize;
            adaptive_yield(&mut k);
        }
    }

    // -----------------------------------------------------------------
    // Payload movement for an established handshake
    // -----------------------------------------------------------------

    /// Push `[ptr, ptr+size)` into the remote buffer captured in
    /// `rid`, at byte offset `r_offset`.
    pub fn post_os_put(
        &self,
        rid: Rid,
        proc_id: u32,
        ptr: u64,
        size: u64,
        tag: i32,
        r_offset: u64,
    ) -> Result<()> {
        self.check_init()?;
        trace!("post_os_put({proc_id}, 0x{ptr:016x}, {size}, {r_offset}, 0x{rid:016x})");

        let req = self.lookup_request_mut(rid)?;
        if req.id != rid {
            return Err(Error::Invalid(format!("request mismatch for 0x{rid:016x}")));
        }
        if req.proc != proc_id {
            return Err(Error::Invalid(format!(
                "request/proc mismatch: {proc_id}/{}",
                req.proc
            )));
        }

        req.completion = Completion::Evqueue;
        req.tag = tag;
        req.set_state(STATE_PENDING);

        let drb = req.remote.desc;
        let db = self.registry.find_containing(ptr, size)?;
        if drb.size > 0 && size + r_offset > drb.size {
            return Err(Error::Invalid(format!(
                "put of {size} bytes at offset {r_offset} into a {} byte buffer",
                drb.size
            )));
        }

        let put = self.put(
            proc_id,
            ptr,
            drb.addr + r_offset,
            size,
            db.desc(),
            &drb,
            req.cookie,
            RdmaFlags::empty(),
        );
        self.fail_on_err(req, put)
    }

    /// Pull the remote buffer captured in `rid` into `[ptr, ptr+size)`.
    /// Eager requests copy straight out of the local byte ring.
    pub fn post_os_get(
        &self,
        rid: Rid,
        proc_id: u32,
        ptr: u64,
        size: u64,
        tag: i32,
        r_offset: u64,
    ) -> Result<()> {
        self.check_init()?;
        trace!("post_os_get({proc_id}, 0x{ptr:016x}, {size}, {r_offset}, 0x{rid:016x})");

        let req = self.lookup_request_mut(rid)?;
        if req.id != rid {
            return Err(Error::Invalid(format!("request mismatch for 0x{rid:016x}")));
        }
        if req.proc != proc_id {
            return Err(Error::Invalid(format!(
                "request/proc mismatch: {proc_id}/{}",
                req.proc
            )));
        }

        req.completion = Completion::Evqueue;
        req.tag = tag;

        let drb = req.remote.desc;
        let db = self.registry.find_containing(ptr, size)?;
        if drb.size > 0 && size + r_offset > drb.size {
            return Err(Error::Invalid(format!(
                "get of {size} bytes at offset {r_offset} from a {} byte buffer",
                drb.size
            )));
        }

        if req.flags.contains(RequestFlags::EAGER) {
            let peer = self.peer(proc_id)?;
            self.eager_copy_out(&peer.local_eager_buf, ptr, size);
            req.flags |= RequestFlags::EDONE;
            // no fabric round trip: the data is already local
            req.set_events(0);
            req.set_state(STATE_COMPLETED);
            return Ok(());
        }

        req.set_state(STATE_PENDING);
        let get = self.get(
            proc_id,
            ptr,
            drb.addr + r_offset,
            size,
            db.desc(),
            &drb,
            req.cookie,
            RdmaFlags::empty(),
        );
        self.fail_on_err(req, get)
    }

    /// One-sided put against a caller-supplied remote descriptor, no
    /// prior handshake.
    pub fn post_os_put_direct(
        &self,
        proc_id: u32,
        ptr: u64,
        size: u64,
        rbuf: &crate::buffer::BufferDesc,
        flags: OpFlags,
        user_rid: Option<Rid>,
    ) -> Result<Rid> {
        self.check_init()?;
        let db = self.registry.find_containing(ptr, size)?;
        let peer = self.peer(proc_id)?;

        let req = peer.requests.alloc(proc_id)?;
        req.set_state(STATE_PENDING);
        req.completion = Completion::Evqueue;
        req.size = size;
        req.local.desc = *db.desc();
        req.remote.desc = *rbuf;
        req.set_events(1);
        let cookie = req.cookie;

        if flags.contains(OpFlags::USERID) {
            if let Some(u) = user_rid {
                req.id = u;
                req.flags |= RequestFlags::USERID;
            }
        }
        let rid = req.id;

        let put = self.put(
            proc_id,
            ptr,
            rbuf.addr,
            size,
            db.desc(),
            rbuf,
            cookie,
            RdmaFlags::empty(),
        );
        self.fail_on_err(req, put)?;
        trace!("posted proc/request/cookie: {proc_id}/0x{rid:016x}/0x{cookie:016x}");
        Ok(rid)
    }

    /// One-sided get against a caller-supplied remote descriptor.
    pub fn post_os_get_direct(
        &self,
        proc_id: u32,
        ptr: u64,
        size: u64,
        rbuf: &crate::buffer::BufferDesc,
        flags: OpFlags,
        user_rid: Option<Rid>,
    ) -> Result<Rid> {
        self.check_init()?;
        let db = self.registry.find_containing(ptr, size)?;
        let peer = self.peer(proc_id)?;

        let req = peer.requests.alloc(proc_id)?;
        req.set_state(STATE_PENDING);
        req.completion = Completion::Evqueue;
        req.size = size;
        req.local.desc = *db.desc();
        req.remote.desc = *rbuf;
        req.set_events(1);
        let cookie = req.cookie;

        if flags.contains(OpFlags::USERID) {
            if let Some(u) = user_rid {
                req.id = u;
                req.flags |= RequestFlags::USERID;
            }
        }
        let rid = req.id;

        let get = self.get(
            proc_id,
            ptr,
            rbuf.addr,
            size,
            db.desc(),
            rbuf,
            cookie,
            RdmaFlags::empty(),
        );
        self.fail_on_err(req, get)?;
        trace!("posted proc/request/cookie: {proc_id}/0x{rid:016x}/0x{cookie:016x}");
        Ok(rid)
    }

    // -----------------------------------------------------------------
    // FIN
    // -----------------------------------------------------------------

    /// Notify `proc` that the transfer behind `rid` is finished, by
    /// writing the peer's original request id into its FIN ring. Fire
    /// and forget: the WRITE carries the null cookie.
    pub fn send_fin(&self, rid: Rid, proc_id: u32, flags: OpFlags) -> Result<()> {
        self.check_init()?;
        trace!("send_fin({proc_id}, 0x{rid:016x})");

        let req = self.lookup_request_mut(rid)?;
        if req.state() != STATE_COMPLETED && !flags.contains(OpFlags::COMPLETED) {
            trace!("sending FIN for a request that has not yet completed");
        }
        if req.remote.id == NULL_COOKIE {
            return Err(Error::Invalid(
                "FIN for a remote request that was never set".into(),
            ));
        }

        let peer = self.peer(proc_id)?;
        let l = &peer.remote_fin;
        let curr = l.claim()?;

        l.entry(curr)
            .store(req.remote.id, std::sync::atomic::Ordering::Relaxed);
        self.put_plain_entry(proc_id, l, curr, NULL_COOKIE)?;

        if req.state() == STATE_COMPLETED || flags.contains(OpFlags::COMPLETED) {
            if req.state() != STATE_COMPLETED {
                req.set_state(STATE_COMPLETED);
            }
            trace!(
                "removing request 0x{rid:016x} for remote request 0x{:016x}",
                req.remote.id
            );
            self.free_request(req)?;
            trace!(
                "{} requests left in table for proc {proc_id}",
                self.count_requests(Some(proc_id))
            );
        } else {
            req.flags |= RequestFlags::WFIN;
            req.remote.id = NULL_COOKIE;
        }

        l.mark_done(1);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------

    /// WRITE a staged info-ledger entry to its mirror on the peer.
    fn put_info_entry(
        &self,
        proc_id: u32,
        l: &RiLedger,
        curr: u32,
        cookie: Rid,
    ) -> Result<()> {
        let rmt_addr =
            l.remote.addr + curr as u64 * crate::info_ledger::RI_ENTRY_SIZE as u64;
        let lbuf = self.storage_desc();
        self.put(
            proc_id,
            l.entry_addr(curr),
            rmt_addr,
            crate::info_ledger::RI_ENTRY_SIZE as u64,
            &lbuf,
            &l.remote,
            cookie,
            RdmaFlags::empty(),
        )
        .map_err(|e| {
            warn!("info entry WRITE failed for 0x{cookie:016x}");
            e
        })
    }

    /// WRITE a staged plain-ledger entry to its mirror on the peer.
    fn put_plain_entry(
        &self,
        proc_id: u32,
        l: &Ledger,
        curr: u32,
        cookie: Rid,
    ) -> Result<()> {
        let rmt_addr = l.remote.addr + curr as u64 * LEDGER_ENTRY_SIZE as u64;
        let lbuf = self.storage_desc();
        self.put(
            proc_id,
            l.entry_addr(curr),
            rmt_addr,
            LEDGER_ENTRY_SIZE as u64,
            &lbuf,
            &l.remote,
            cookie,
            RdmaFlags::empty(),
        )
        .map_err(|e| {
            warn!("ledger entry WRITE failed for 0x{cookie:016x}");
            e
        })
    }

    /// Blocking claim of an info-ledger entry matching `tag`/`size`.
    fn wait_info_entry(
        &self,
        proc_id: u32,
        l: &RiLedger,
        tag: i32,
        size: Option<u64>,
    ) -> Result<Rid> {
        let mut k = 0u32;
        loop {
            if let Some(rid) = self.try_claim_info(proc_id, l, tag, size)? {
                return Ok(rid);
            }
            adaptive_yield(&mut k);
        }
    }

    /// Scan the landed prefix of `l` for an entry matching `tag` and
    /// `size`; swap it to the head and claim it. `Ok(None)` when nothing
    /// matches yet.
    fn try_claim_info(
        &self,
        proc_id: u32,
        l: &RiLedger,
        tag: i32,
        size: Option<u64>,
    ) -> Result<Option<Rid>> {
        let curr = l.curr();
        let head = l.index_of(curr);

        let mut matched = None;
        for d in 0..l.num_entries() as u64 {
            let idx = l.index_of(curr + d);
            let e = l.entry(idx);
            if !e.landed() {
                break;
            }
            let tag_ok = tag < 0 || e.tag == tag;
            let size_ok = size.map(|s| s == e.size).unwrap_or(true);
            if tag_ok && size_ok {
                matched = Some(idx);
                break;
            }
        }

        let Some(idx) = matched else {
            return Ok(None);
        };
        if idx != head {
            l.swap_entries(head, idx);
        }
        if !l.try_advance(curr) {
            return Ok(None);
        }

        let peer = self.peer(proc_id)?;
        let e = l.entry(head);
        // receive-side descriptor: claims nothing on the peer, so the
        // op stays Default and free releases no ring slots
        let req = peer.requests.alloc(proc_id)?;
        req.completion = Completion::Evqueue;
        req.flags = RequestFlags::from_bits_truncate(e.flags);
        req.tag = e.tag;
        req.size = e.size;
        req.remote.id = e.request;
        req.remote.desc = e.to_desc();
        req.set_events(1);
        let rid = req.id;

        trace!(
            "claimed info entry: remote request 0x{:016x}, addr 0x{:016x}, size {}",
            e.request,
            e.addr,
            e.size
        );

        e.clear();
        l.mark_done(1);
        Ok(Some(rid))
    }

    /// Claim the head of the eager notification ring if its size
    /// predicate holds.
    fn try_claim_eager(
        &self,
        proc_id: u32,
        l: &Ledger,
        size: Option<u64>,
    ) -> Result<Option<Rid>> {
        let curr = l.curr();
        let idx = l.index_of(curr);
        let word = l.entry(idx).load(std::sync::atomic::Ordering::Acquire);
        if word == 0 {
            return Ok(None);
        }
        let msg_size = word >> 32;
        if let Some(s) = size {
            if s != msg_size {
                return Ok(None);
            }
        }
        if !l.try_advance(curr) {
            return Ok(None);
        }

        let peer = self.peer(proc_id)?;
        let req = peer.requests.alloc(proc_id)?;
        req.completion = Completion::Evqueue;
        req.flags = RequestFlags::EAGER;
        req.size = msg_size;
        req.remote.desc.size = msg_size;
        // the peer's request lives in its table slice for this rank
        req.remote.id = rid_from_parts(self.cfg.rank, word as u32);
        req.set_events(1);
        let rid = req.id;

        l.entry(idx).store(0, std::sync::atomic::Ordering::Relaxed);
        l.mark_done(1);
        Ok(Some(rid))
    }

    /// Copy one eager message out of the local byte ring, mirroring the
    /// producer's wrap decision, and release the consumed span.
    fn eager_copy_out(&self, eb: &EagerBuf, ptr: u64, size: u64) {
        let mut k = 0u32;
        loop {
            let seen = eb.curr();
            let (offset, base) = eb.consumer_offset(seen, size);
            let next = base + size;
            if eb.try_advance(seen, next) {
                trace!("eager copy of {size} bytes from ring offset {offset}");
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        eb.at(offset),
                        ptr as *mut u8,
                        size as usize,
                    );
                    std::ptr::write_bytes(eb.at(offset), 0, size as usize);
                }
                eb.mark_done(next - seen);
                return;
            }
            adaptive_yield(&mut k);
        }
    }
}
