// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The event loop: draining raw completions from the backend, dispatching
// them onto requests, and draining FIN arrivals out of the local ledgers.
// `test`/`wait`/`probe*` are thin entry points over the same machinery.

use log::{trace, warn};

use crate::backend::EventPoll;
use crate::request::{
    Completion, Op, Request, STATE_COMPLETED, STATE_FREE, STATE_PENDING, STATE_UNUSED,
};
use crate::rid::{cookie_prefix, rid_proc, Rid, NULL_COOKIE};
use crate::runtime::Runtime;
use crate::spin_lock::adaptive_yield;
use crate::{Error, Result};

/// Completion details reported by `test` and `wait`.
#[derive(Debug, Clone, Copy)]
pub struct Status {
    pub src: u32,
    pub tag: i32,
    pub size: u64,
    pub count: u64,
    pub error: bool,
}

/// Outcome of a non-blocking `test`.
#[derive(Debug, Clone, Copy)]
pub enum TestResult {
    /// The request finished; its descriptor has been released.
    Completed(Status),
    /// Still in flight.
    Pending,
    /// Not in any table. Harmless when `test` is called in an unguarded
    /// loop after completion already reaped the request.
    NotFound,
}

/// Which info ledger `probe_ledger` inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerKind {
    Send,
    Recv,
}

/// A pending-but-unclaimed handshake entry reported by `probe_ledger`.
#[derive(Debug, Clone, Copy)]
pub struct ProbeInfo {
    pub src: u32,
    pub request: Rid,
    pub tag: i32,
    pub size: u64,
}

/// How many cookies one backend poll drains at most.
const EVENT_BATCH: usize = 8;

impl Runtime {
    // -----------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------

    /// Account one CQ event against its request. Completion by event
    /// counter applies to event-completed requests only; ledger-completed
    /// ones wait for their FIN no matter how many CQEs drain.
    pub(crate) fn handle_cq_event(&self, req: &Request, cookie: Rid) {
        let state = req.state();
        if state == STATE_FREE || state == STATE_UNUSED {
            trace!("stale completion 0x{cookie:016x} for a released slot");
            return;
        }
        let remaining = req.dec_events();
        if remaining == 0 && req.completion == Completion::Evqueue {
            trace!("request completed with cookie 0x{cookie:016x}");
            req.transition(STATE_PENDING, STATE_COMPLETED);
            if req.op == Op::Pwc {
                if self.pwc_q.push(req.cookie).is_err() {
                    warn!("dropping queued pwc completion 0x{:016x}", req.cookie);
                }
            }
        }
    }

    /// Drain one backend poll, dispatching every cookie. Returns the
    /// first application-relevant cookie, if any.
    fn poll_events_once(&self) -> Result<Option<Rid>> {
        let mut evs = [NULL_COOKIE; EVENT_BATCH];
        let n = match self.backend.get_event(-1, &mut evs)? {
            EventPoll::Events(n) => n,
            EventPoll::Empty => return Ok(None),
            EventPoll::NotImpl => {
                return Err(Error::Unimplemented("backend event queue"))
            }
        };

        let mut first = None;
        for &cookie in &evs[..n] {
            if cookie == NULL_COOKIE {
                continue;
            }
            if cookie_prefix(cookie).is_some() {
                // transport-internal cookie (eager payload, pre-posted
                // receive); nothing to account
                continue;
            }
            if let Ok(req) = self.lookup_request(cookie) {
                self.handle_cq_event(req, cookie);
                if first.is_none() {
                    first = Some(cookie);
                }
            } else {
                trace!("event for untracked cookie 0x{cookie:016x}");
            }
        }
        Ok(first)
    }

    /// Pop the head FIN entry of peer `i` if one has landed, completing
    /// the request it names. Returns the named rid.
    fn drain_fin_once(&self, i: usize) -> Option<Rid> {
        let l = &self.peers[i].local_fin;
        let curr = l.curr();
        let idx = l.index_of(curr);
        let word = l.entry(idx).load(std::sync::atomic::Ordering::Acquire);
        if word == 0 || !l.try_advance(curr) {
            return None;
        }
        l.entry(idx).store(0, std::sync::atomic::Ordering::Relaxed);
        l.mark_done(1);

        if let Ok(req) = self.lookup_request(word) {
            req.transition(STATE_PENDING, STATE_COMPLETED);
            // FIN also completes requests still counting NEW-side events
            req.transition(crate::request::STATE_NEW, STATE_COMPLETED);
            trace!("FIN for request 0x{word:016x}");
        } else {
            warn!("FIN for unknown request 0x{word:016x}");
        }
        Some(word)
    }

    // -----------------------------------------------------------------
    // Blocking reapers
    // -----------------------------------------------------------------

    /// Block until any backend completion surfaces; returns the source
    /// peer and the cookie. Event-completed requests that finish here
    /// (other than PWC) are released.
    pub fn wait_any(&self) -> Result<(u32, Rid)> {
        self.check_init()?;
        let mut k = 0u32;
        loop {
            let mut evs = [NULL_COOKIE];
            let n = match self.backend.get_event(-1, &mut evs)? {
                EventPoll::Events(n) => n,
                EventPoll::Empty => {
                    adaptive_yield(&mut k);
                    continue;
                }
                EventPoll::NotImpl => {
                    return Err(Error::Unimplemented("backend event queue"))
                }
            };
            debug_assert_eq!(n, 1);
            let cookie = evs[0];

            if cookie == NULL_COOKIE || cookie_prefix(cookie).is_some() {
                continue;
            }

            match self.lookup_request(cookie) {
                Ok(req) => {
                    self.handle_cq_event(req, cookie);
                    if req.completion == Completion::Evqueue
                        && req.is_completed()
                        && req.op != Op::Pwc
                    {
                        trace!("clearing event with cookie 0x{cookie:016x}");
                        self.free_request(req)?;
                    }
                    return Ok((rid_proc(cookie), cookie));
                }
                Err(_) => {
                    // an event nobody owns still wakes the caller
                    return Ok((rid_proc(cookie), u64::MAX));
                }
            }
        }
    }

    /// Block until any peer's FIN ledger delivers a completion; frees
    /// the named request and returns (peer, rid). The scan starts after
    /// the peer it last served.
    pub fn wait_any_ledger(&self) -> Result<(u32, Rid)> {
        self.check_init()?;
        if self.count_requests(None) == 0 {
            warn!("no outstanding requests to wait for");
        }
        let nproc = self.cfg.nproc as usize;
        let mut k = 0u32;
        loop {
            let i = (self.fin_scan.load(std::sync::atomic::Ordering::Relaxed) + 1) % nproc;
            self.fin_scan.store(i, std::sync::atomic::Ordering::Relaxed);

            if let Some(rid) = self.drain_fin_once(i) {
                if let Ok(req) = self.lookup_request(rid) {
                    if req.is_completed() {
                        self.free_request(req)?;
                    }
                    return Ok((i as u32, rid));
                }
            }
            adaptive_yield(&mut k);
        }
    }

    // -----------------------------------------------------------------
    // test / wait
    // -----------------------------------------------------------------

    /// Non-blocking completion check. Completing requests are released
    /// before returning their status.
    pub fn test(&self, rid: Rid) -> Result<TestResult> {
        self.check_init()?;
        trace!("test(0x{rid:016x})");

        let req = match self.lookup_request(rid) {
            Ok(r) => r,
            Err(_) => {
                trace!("request 0x{rid:016x} not pending");
                return Ok(TestResult::NotFound);
            }
        };
        let state = req.state();
        if state == STATE_FREE || state == STATE_UNUSED {
            return Ok(TestResult::NotFound);
        }

        match req.completion {
            Completion::Ledger => self.nbpop_ledger(req),
            Completion::SendRecv => Ok(TestResult::Pending),
            Completion::Evqueue => self.nbpop_event(req),
        }
    }

    /// Block until `rid` completes, then release it.
    pub fn wait(&self, rid: Rid) -> Result<Status> {
        self.check_init()?;
        trace!("wait(0x{rid:016x})");
        let mut k = 0u32;
        loop {
            match self.test(rid)? {
                TestResult::Completed(status) => return Ok(status),
                TestResult::NotFound => {
                    return Err(Error::Invalid(format!(
                        "request 0x{rid:016x} not in table"
                    )))
                }
                TestResult::Pending => adaptive_yield(&mut k),
            }
        }
    }

    fn finish(&self, req: &Request) -> Result<TestResult> {
        let status = Status {
            src: req.proc,
            tag: req.tag,
            size: req.size,
            count: 1,
            error: false,
        };
        self.free_request(req)?;
        Ok(TestResult::Completed(status))
    }

    /// Make progress on an event-completed request without blocking.
    fn nbpop_event(&self, req: &Request) -> Result<TestResult> {
        if req.is_completed() {
            return self.finish(req);
        }
        self.poll_events_once()?;
        if req.is_completed() {
            return self.finish(req);
        }
        Ok(TestResult::Pending)
    }

    /// Make progress on a ledger-completed request without blocking:
    /// drain landed FIN entries for its peer, then re-check.
    fn nbpop_ledger(&self, req: &Request) -> Result<TestResult> {
        while self.drain_fin_once(req.proc as usize).is_some() {}
        if req.is_completed() {
            return self.finish(req);
        }
        Ok(TestResult::Pending)
    }

    // -----------------------------------------------------------------
    // probe
    // -----------------------------------------------------------------

    /// Check for a matched-but-unclaimed inbound message. Only the UD
    /// send/recv path feeds this list; with the shipped transports it
    /// reports not-ready.
    pub fn probe(&self, _proc_id: Option<u32>) -> Result<Option<Status>> {
        self.check_init()?;
        Ok(None)
    }

    /// Peek the head of a peer's snd- or rcv-info ledger (and, for the
    /// send side, the eager notification ring) without consuming.
    pub fn probe_ledger(
        &self,
        proc_id: Option<u32>,
        kind: LedgerKind,
    ) -> Result<Option<ProbeInfo>> {
        self.check_init()?;
        let (start, end) = match proc_id {
            Some(p) => {
                self.peer(p)?;
                (p as usize, p as usize + 1)
            }
            None => (0, self.cfg.nproc as usize),
        };

        for i in start..end {
            let peer = &self.peers[i];

            if kind == LedgerKind::Send {
                let le = &peer.local_eager;
                let word = le
                    .entry(le.index_of(le.curr()))
                    .load(std::sync::atomic::Ordering::Acquire);
                if word != 0 {
                    return Ok(Some(ProbeInfo {
                        src: i as u32,
                        request: word,
                        tag: -1,
                        size: word >> 32,
                    }));
                }
            }

            let l = match kind {
                LedgerKind::Send => &peer.local_snd_info,
                LedgerKind::Recv => &peer.local_rcv_info,
            };
            let e = l.entry(l.index_of(l.curr()));
            if e.landed() {
                return Ok(Some(ProbeInfo {
                    src: i as u32,
                    request: e.request,
                    tag: e.tag,
                    size: e.size,
                }));
            }
        }
        Ok(None)
    }
}
