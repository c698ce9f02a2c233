// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The runtime handle: owns the backend, the buffer registry, shared
// storage, and the peer table. Every public operation is a method on
// `Runtime`; a process-wide `OnceLock` mirror of the old free-function
// surface is provided for embedders that want it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, trace, warn};

use crate::backend::mem::MemTransport;
use crate::backend::{RdmaFlags, Transport};
use crate::buffer::{Buffer, BufferDesc, BufferFlags, BufferPriv};
use crate::config::{BackendKind, Config, DEF_NUM_REQUESTS};
use crate::eager::eb_msg_size;
use crate::exchange::Exchange;
use crate::peer::Peer;
use crate::request::{
    split_rid, Op, PwcQueue, Request, RequestFlags, STATE_FAILED, STATE_NEW, STATE_PENDING,
};
use crate::rid::Rid;
use crate::spin_lock::SpinLock;
use crate::storage::SharedStorage;
use crate::{Error, Result};

pub struct Runtime {
    pub(crate) cfg: Config,
    pub(crate) backend: Box<dyn Transport>,
    pub(crate) registry: crate::buffer::BufferRegistry,
    pub(crate) storage: SharedStorage,
    pub(crate) peers: Box<[Peer]>,
    pub(crate) pwc_q: PwcQueue,
    submit_lock: SpinLock,
    serialize_submit: bool,
    /// Sticky starting peer for FIN-ledger scans, so later peers are not
    /// starved by earlier ones.
    pub(crate) fin_scan: AtomicUsize,
    initialized: AtomicBool,
}

impl Runtime {
    /// Bring the runtime up with the backend named in `cfg`.
    pub fn init(cfg: Config) -> Result<Self> {
        let backend: Box<dyn Transport> = match cfg.backend {
            BackendKind::Mem => Box::new(MemTransport::new()),
            BackendKind::Verbs => return Err(Error::Unimplemented("verbs backend")),
            BackendKind::Ugni => return Err(Error::Unimplemented("ugni backend")),
            BackendKind::Fi => return Err(Error::Unimplemented("fi backend")),
        };
        Self::init_with(cfg, backend)
    }

    /// Bring the runtime up with a caller-supplied fabric driver.
    pub fn init_with(mut cfg: Config, mut backend: Box<dyn Transport>) -> Result<Self> {
        cfg.validate()?;
        cfg.normalize();

        debug!(
            "init: nproc={} rank={} ledger_entries={} eager_buf={} small_msg={} small_pwc={}",
            cfg.nproc,
            cfg.rank,
            cfg.cap.ledger_entries,
            cfg.cap.eager_buf_size,
            cfg.cap.small_msg_size,
            cfg.cap.small_pwc_size
        );

        let registry = crate::buffer::BufferRegistry::new(193);

        let mut storage = SharedStorage::alloc(&cfg)?;
        let tproc = cfg.total_proc();
        let mut peers = (0..tproc)
            .map(|i| Peer::carve(&storage, i, DEF_NUM_REQUESTS))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        backend.init(&cfg, &mut storage.buffer)?;

        let exchange = Exchange::new(&cfg);
        exchange.exchange_ledgers(&mut peers, &storage, cfg.rank as usize)?;

        let pwc_q = PwcQueue::new(cfg.nproc as u64 * cfg.cap.ledger_entries as u64);
        let serialize_submit = !backend.thread_safe();

        let rt = Self {
            cfg,
            backend,
            registry,
            storage,
            peers,
            pwc_q,
            submit_lock: SpinLock::new(),
            serialize_submit,
            fin_scan: AtomicUsize::new(0),
            initialized: AtomicBool::new(true),
        };
        debug!("init complete");
        Ok(rt)
    }

    /// Tear the runtime down. The caller is responsible for quiescing
    /// outstanding operations first.
    pub fn finalize(&mut self) -> Result<()> {
        self.check_init()?;
        self.initialized.store(false, Ordering::Release);
        self.registry.drain_reverse(|buf| {
            if let Err(e) = self.backend.unregister_buffer(&buf) {
                warn!("unregister at finalize failed: {e}");
            }
        });
        self.backend.finalize()
    }

    pub fn rank(&self) -> u32 {
        self.cfg.rank
    }

    pub fn nproc(&self) -> u32 {
        self.cfg.nproc
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub(crate) fn check_init(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NoInit)
        }
    }

    pub(crate) fn peer(&self, proc_id: u32) -> Result<&Peer> {
        self.peers
            .get(proc_id as usize)
            .ok_or_else(|| Error::Invalid(format!("unknown peer {proc_id}")))
    }

    /// Descriptor of the shared-storage region, the source of every
    /// staging WRITE.
    pub(crate) fn storage_desc(&self) -> BufferDesc {
        *self.storage.buffer.desc()
    }

    // -----------------------------------------------------------------
    // Buffer registration
    // -----------------------------------------------------------------

    /// Register `[addr, addr+size)` with the fabric. An exact duplicate
    /// only bumps the existing registration's reference count.
    pub fn register_buffer(&self, addr: u64, size: u64) -> Result<()> {
        self.check_init()?;
        trace!("register (0x{addr:016x}, {size})");

        if let Ok(existing) = self.registry.find_exact(addr, size) {
            existing.acquire();
            trace!("existing buffer, reusing");
            return Ok(());
        }

        let mut buf = Buffer::new(addr, size);
        self.backend.register_buffer(&mut buf, BufferFlags::empty())?;
        self.registry.insert(Arc::new(buf));
        Ok(())
    }

    /// Drop one reference to the `(addr, size)` registration, releasing
    /// it with the fabric when the count reaches zero.
    pub fn unregister_buffer(&self, addr: u64, size: u64) -> Result<()> {
        self.check_init()?;
        let buf = self.registry.find_exact(addr, size)?;
        if buf.release() == 0 {
            self.backend.unregister_buffer(&buf)?;
            self.registry.remove(&buf)?;
        }
        Ok(())
    }

    /// Remote-access keys of an exactly-registered region, for handing
    /// to peers out of band (the PWC path needs them).
    pub fn get_buffer_private(&self, addr: u64, size: u64) -> Result<BufferPriv> {
        self.check_init()?;
        Ok(self.registry.find_exact(addr, size)?.keys())
    }

    /// Remote buffer description captured in a handshake request. Only
    /// meaningful before the request transitions past PENDING.
    pub fn get_buffer_remote(&self, rid: Rid) -> Result<BufferDesc> {
        self.check_init()?;
        let req = self.lookup_request(rid)?;
        let state = req.state();
        if state != STATE_NEW && state != STATE_PENDING {
            return Err(Error::Invalid(format!(
                "request 0x{rid:016x} already transitioned"
            )));
        }
        Ok(req.remote.desc)
    }

    // -----------------------------------------------------------------
    // Request plumbing
    // -----------------------------------------------------------------

    pub(crate) fn lookup_request(&self, rid: Rid) -> Result<&Request> {
        let (proc_id, _) = split_rid(rid, self.cfg.nproc)
            .ok_or_else(|| Error::Invalid(format!("bad rid 0x{rid:016x}")))?;
        self.peers[proc_id as usize]
            .requests
            .lookup(rid)
            .ok_or_else(|| Error::Invalid(format!("unknown request 0x{rid:016x}")))
    }

    pub(crate) fn lookup_request_mut(&self, rid: Rid) -> Result<&mut Request> {
        let (proc_id, _) = split_rid(rid, self.cfg.nproc)
            .ok_or_else(|| Error::Invalid(format!("bad rid 0x{rid:016x}")))?;
        self.peers[proc_id as usize]
            .requests
            .lookup_mut(rid)
            .ok_or_else(|| Error::Invalid(format!("unknown request 0x{rid:016x}")))
    }

    /// Outstanding requests toward `proc`, or across all peers.
    pub fn count_requests(&self, proc_id: Option<u32>) -> u64 {
        match proc_id {
            Some(p) => self
                .peers
                .get(p as usize)
                .map(|peer| peer.requests.live())
                .unwrap_or(0),
            None => self.peers.iter().map(|p| p.requests.live()).sum(),
        }
    }

    /// Return a completed request to its table and release the ring
    /// slots it claimed on the peer.
    pub(crate) fn free_request(&self, req: &Request) -> Result<()> {
        let peer = self.peer(req.proc)?;
        peer.requests.free(req)?;
        match req.op {
            Op::SendBuf => {
                if req.flags.contains(RequestFlags::EAGER) {
                    peer.remote_eager_buf.mark_done(req.size);
                    peer.remote_eager.mark_done(1);
                } else {
                    peer.remote_snd_info.mark_done(1);
                }
            }
            Op::SendReq => peer.remote_snd_info.mark_done(1),
            Op::RecvBuf => peer.remote_rcv_info.mark_done(1),
            Op::Pwc => {
                if req.flags.contains(RequestFlags::ONE_PWC) {
                    // size holds the full packed footprint here
                    peer.remote_pwc_buf.mark_done(req.size);
                } else if req.flags.contains(RequestFlags::TWO_PWC) {
                    peer.remote_pwc.mark_done(1);
                }
            }
            Op::SendFin | Op::Default => {}
        }
        Ok(())
    }

    /// Free a request by id (application-facing).
    pub fn free(&self, rid: Rid) -> Result<()> {
        self.check_init()?;
        let req = self.lookup_request(rid)?;
        self.free_request(req)
    }

    // -----------------------------------------------------------------
    // Serialized submission
    // -----------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn put(
        &self,
        peer: u32,
        laddr: u64,
        raddr: u64,
        size: u64,
        lbuf: &BufferDesc,
        rbuf: &BufferDesc,
        cookie: Rid,
        flags: RdmaFlags,
    ) -> Result<()> {
        if self.serialize_submit {
            self.submit_lock.with(|| {
                self.backend
                    .rdma_put(peer, laddr, raddr, size, lbuf, rbuf, cookie, 0, flags)
            })
        } else {
            self.backend
                .rdma_put(peer, laddr, raddr, size, lbuf, rbuf, cookie, 0, flags)
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn get(
        &self,
        peer: u32,
        laddr: u64,
        raddr: u64,
        size: u64,
        lbuf: &BufferDesc,
        rbuf: &BufferDesc,
        cookie: Rid,
        flags: RdmaFlags,
    ) -> Result<()> {
        if self.serialize_submit {
            self.submit_lock.with(|| {
                self.backend
                    .rdma_get(peer, laddr, raddr, size, lbuf, rbuf, cookie, flags)
            })
        } else {
            self.backend
                .rdma_get(peer, laddr, raddr, size, lbuf, rbuf, cookie, flags)
        }
    }

    /// Mark `req` FAILED when a transport submission error passes
    /// through. The descriptor is left in place for the caller to
    /// inspect and tear down.
    pub(crate) fn fail_on_err<T>(&self, req: &Request, r: Result<T>) -> Result<T> {
        if let Err(e) = &r {
            if !e.is_transient() {
                log::error!("transport failure on request 0x{:016x}: {e}", req.id);
                req.set_state(STATE_FAILED);
            }
        }
        r
    }

    /// Cancellation hook: accepted, no effect.
    pub fn cancel(&self, rid: Rid) -> Result<()> {
        self.check_init()?;
        self.backend.cancel(rid)
    }

    /// Packed footprint of a PWC eager message (exposed for capacity
    /// planning in embedders).
    pub fn pwc_eager_footprint(size: u64) -> u64 {
        eb_msg_size(size)
    }
}

// ---------------------------------------------------------------------------
// Optional process-wide instance
// ---------------------------------------------------------------------------

static GLOBAL: OnceLock<Runtime> = OnceLock::new();
static PENDING_REGS: Mutex<Vec<(u64, u64)>> = Mutex::new(Vec::new());

/// Install a process-wide runtime, replaying any registrations queued
/// before init.
pub fn init_global(cfg: Config) -> Result<&'static Runtime> {
    let rt = Runtime::init(cfg)?;
    let rt = GLOBAL
        .set(rt)
        .map(|_| GLOBAL.get().unwrap())
        .map_err(|_| Error::Invalid("global runtime already initialized".into()))?;
    let pending = std::mem::take(&mut *PENDING_REGS.lock().unwrap());
    for (addr, size) in pending {
        trace!("replaying queued registration (0x{addr:016x}, {size})");
        rt.register_buffer(addr, size)?;
    }
    Ok(rt)
}

pub fn global() -> Result<&'static Runtime> {
    GLOBAL.get().ok_or(Error::NoInit)
}

/// Free-function registration mirror. Before `init_global` the request
/// is queued and replayed once the runtime exists.
pub fn register_buffer(addr: u64, size: u64) -> Result<()> {
    match GLOBAL.get() {
        Some(rt) => rt.register_buffer(addr, size),
        None => {
            trace!("called before init, queueing buffer info");
            PENDING_REGS.lock().unwrap().push((addr, size));
            Ok(())
        }
    }
}
