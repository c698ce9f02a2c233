// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Bootstrap exchange: the one allgather + barrier performed at init to
// learn every peer's shared-storage base address and key pair, and the
// fan-out that points each `remote_*` ring at this rank's mirror inside
// the peer's storage.

use log::{debug, error};

use crate::buffer::{BufferDesc, BufferPriv};
use crate::config::{Config, MetaExchange};
use crate::peer::Peer;
use crate::storage::SharedStorage;
use crate::{Error, Result};

/// One rank's shared-storage descriptor as it crosses the bootstrap
/// transport: base address, key0, key1.
const DESC_BYTES: usize = 24;

pub struct Exchange {
    meta: MetaExchange,
    nproc: usize,
}

impl Exchange {
    pub fn new(cfg: &Config) -> Self {
        Self {
            meta: cfg.meta_exch.clone(),
            nproc: cfg.nproc as usize,
        }
    }

    /// Gather `src` from every rank, in rank order.
    pub fn allgather(&self, src: &[u8]) -> Result<Vec<u8>> {
        let mut dst = vec![0u8; src.len() * self.nproc];
        match &self.meta {
            MetaExchange::External { allgather, .. } => {
                allgather(src, &mut dst).map_err(|e| {
                    error!("external allgather failed: {e}");
                    Error::Transport(e)
                })?;
            }
            MetaExchange::Mpi => return Err(Error::Unimplemented("MPI exchange")),
            MetaExchange::Pmi => return Err(Error::Unimplemented("PMI exchange")),
            MetaExchange::Xsp => return Err(Error::Unimplemented("XSP exchange")),
        }
        Ok(dst)
    }

    pub fn barrier(&self) -> Result<()> {
        match &self.meta {
            MetaExchange::External { barrier, .. } => barrier().map_err(|e| {
                error!("external barrier failed: {e}");
                Error::Transport(e)
            }),
            MetaExchange::Mpi => Err(Error::Unimplemented("MPI exchange")),
            MetaExchange::Pmi => Err(Error::Unimplemented("PMI exchange")),
            MetaExchange::Xsp => Err(Error::Unimplemented("XSP exchange")),
        }
    }

    /// Gather every rank's storage descriptor and aim all `remote_*`
    /// rings at this rank's mirrors on each peer.
    pub fn exchange_ledgers(
        &self,
        peers: &mut [Peer],
        storage: &SharedStorage,
        my_rank: usize,
    ) -> Result<()> {
        let desc = storage.buffer.desc();
        let mut mine = [0u8; DESC_BYTES];
        mine[0..8].copy_from_slice(&desc.addr.to_ne_bytes());
        mine[8..16].copy_from_slice(&desc.keys.key0.to_ne_bytes());
        mine[16..24].copy_from_slice(&desc.keys.key1.to_ne_bytes());

        let all = self.allgather(&mine)?;

        let l = *storage.layout();
        // forwarder endpoints past nproc are wired by the forwarder
        // subsystem, not the rank exchange
        for (i, peer) in peers.iter_mut().enumerate().take(self.nproc) {
            let d = &all[i * DESC_BYTES..(i + 1) * DESC_BYTES];
            let va = u64::from_ne_bytes(d[0..8].try_into().unwrap());
            let keys = BufferPriv {
                key0: u64::from_ne_bytes(d[8..16].try_into().unwrap()),
                key1: u64::from_ne_bytes(d[16..24].try_into().unwrap()),
            };
            debug!("peer {i} storage at 0x{va:016x}");

            let at = |off: usize, stride: usize| BufferDesc {
                addr: va + (off + stride * my_rank) as u64,
                size: stride as u64,
                keys,
            };

            peer.remote_rcv_info.remote = at(l.off_local_rcv_info, l.info_stride);
            peer.remote_snd_info.remote = at(l.off_local_snd_info, l.info_stride);
            peer.remote_fin.remote = at(l.off_local_fin, l.ledg_stride);
            peer.remote_pwc.remote = at(l.off_local_pwc, l.ledg_stride);
            peer.remote_eager.remote = at(l.off_local_eager, l.ledg_stride);
            peer.remote_eager_buf.remote = at(l.off_local_eager_buf, l.ebuf_stride);
            peer.remote_pwc_buf.remote = at(l.off_local_pwc_buf, l.ebuf_stride);
        }

        self.barrier()
    }
}
