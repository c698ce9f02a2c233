// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The narrow trait the core drives a fabric through. One implementation
// per fabric (Verbs, uGNI, libfabric) lives outside this crate; the
// in-process `mem` loopback ships here for tests and single-node runs.
//
// The core is a client of this trait only. It never reaches below it.

use bitflags::bitflags;

use crate::buffer::{Buffer, BufferDesc, BufferFlags};
use crate::config::Config;
use crate::rid::Rid;
use crate::Result;

pub mod mem;

bitflags! {
    /// Per-operation modifiers for `rdma_put` / `rdma_get`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RdmaFlags: u32 {
        /// Do not generate a local completion for this operation.
        const NO_CQE = 1 << 0;
        /// Carry immediate data (delivered through `get_revent`).
        const WITH_IMM = 1 << 1;
    }
}

/// Result of polling a completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPoll {
    /// `n` cookies were written to the output slice.
    Events(usize),
    /// Nothing pending.
    Empty,
    /// This backend has no such queue (e.g. remote CQ with
    /// `use_rcq = false`).
    NotImpl,
}

/// Backend properties queried through `get_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoKind {
    /// Maximum transfer unit in bytes.
    Mtu,
    /// Required buffer alignment in bytes.
    Alignment,
}

/// Fabric driver interface.
///
/// All data-movement entry points are `&self`; a backend that is not
/// re-entrant reports `thread_safe() == false` and the core serializes
/// submissions behind its own lock.
pub trait Transport: Send + Sync {
    fn initialized(&self) -> bool;

    /// Bring the fabric up and register the shared-storage region,
    /// filling its key pair.
    fn init(&mut self, cfg: &Config, storage: &mut Buffer) -> Result<()>;

    fn finalize(&mut self) -> Result<()>;

    /// Register `buf` with the fabric, attaching keys and MR state.
    fn register_buffer(&self, buf: &mut Buffer, flags: BufferFlags) -> Result<()>;

    /// Release the fabric-side registration. The MR state itself is
    /// dropped with the buffer.
    fn unregister_buffer(&self, buf: &Buffer) -> Result<()>;

    /// One-sided write of `size` bytes from local `laddr` to `raddr` on
    /// `peer`. `cookie` comes back through `get_event` unless `NO_CQE`.
    #[allow(clippy::too_many_arguments)]
    fn rdma_put(
        &self,
        peer: u32,
        laddr: u64,
        raddr: u64,
        size: u64,
        lbuf: &BufferDesc,
        rbuf: &BufferDesc,
        cookie: Rid,
        imm: u64,
        flags: RdmaFlags,
    ) -> Result<()>;

    /// One-sided read of `size` bytes from `raddr` on `peer` into
    /// `laddr`.
    #[allow(clippy::too_many_arguments)]
    fn rdma_get(
        &self,
        peer: u32,
        laddr: u64,
        raddr: u64,
        size: u64,
        lbuf: &BufferDesc,
        rbuf: &BufferDesc,
        cookie: Rid,
        flags: RdmaFlags,
    ) -> Result<()>;

    /// Two-sided datagram send (UD fabrics only).
    fn rdma_send(
        &self,
        _peer: u32,
        _laddr: u64,
        _size: u64,
        _lbuf: &BufferDesc,
        _cookie: Rid,
        _imm: u64,
        _flags: RdmaFlags,
    ) -> Result<()> {
        Err(crate::Error::Unimplemented("rdma_send"))
    }

    /// Pre-post a datagram receive buffer (UD fabrics only).
    fn rdma_recv(
        &self,
        _peer: u32,
        _laddr: u64,
        _size: u64,
        _lbuf: &BufferDesc,
        _cookie: Rid,
        _flags: RdmaFlags,
    ) -> Result<()> {
        Err(crate::Error::Unimplemented("rdma_recv"))
    }

    /// Drain up to `events.len()` local completions.
    fn get_event(&self, peer: i32, events: &mut [Rid]) -> Result<EventPoll>;

    /// Drain remote completions with their immediate data, if the
    /// fabric exposes a remote CQ.
    fn get_revent(
        &self,
        _peer: i32,
        _events: &mut [Rid],
        _imms: &mut [u64],
    ) -> Result<EventPoll> {
        Ok(EventPoll::NotImpl)
    }

    /// Remaining submission credits toward `peer`; negative when the
    /// backend does not track them.
    fn tx_size_left(&self, _peer: u32) -> i32 {
        -1
    }

    fn rx_size_left(&self, _peer: u32) -> i32 {
        -1
    }

    fn get_info(&self, _peer: i32, _kind: InfoKind) -> Result<u64> {
        Err(crate::Error::Unimplemented("get_info"))
    }

    /// Cancellation hook. Accepted and ignored.
    fn cancel(&self, _cookie: Rid) -> Result<()> {
        Ok(())
    }

    /// Whether the backend's submission paths are re-entrant. When
    /// false the core wraps `rdma_put`/`rdma_get` in its own lock.
    fn thread_safe(&self) -> bool {
        false
    }
}
