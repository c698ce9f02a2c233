// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-peer state: every ledger and eager ring this process shares with
// one remote rank, plus the request table for operations targeting it.
//
// "local" rings are written by the peer via RDMA and drained here;
// "remote" rings are this process's staging mirror and accounting for
// the matching ring on the peer.

use crate::eager::EagerBuf;
use crate::ledger::{Ledger, LEDGER_EMPTY, LEDGER_EMPTY_PWC};
use crate::info_ledger::RiLedger;
use crate::request::RequestTable;
use crate::storage::SharedStorage;

pub struct Peer {
    pub local_rcv_info: RiLedger,
    pub remote_rcv_info: RiLedger,
    pub local_snd_info: RiLedger,
    pub remote_snd_info: RiLedger,

    pub local_fin: Ledger,
    pub remote_fin: Ledger,
    pub local_pwc: Ledger,
    pub remote_pwc: Ledger,
    pub local_eager: Ledger,
    pub remote_eager: Ledger,

    pub local_eager_buf: EagerBuf,
    pub remote_eager_buf: EagerBuf,
    pub local_pwc_buf: EagerBuf,
    pub remote_pwc_buf: EagerBuf,

    pub requests: RequestTable,
}

impl Peer {
    /// Carve peer `i`'s rings out of shared storage. Remote descriptors
    /// stay empty until the ledger exchange fills them.
    pub fn carve(storage: &SharedStorage, i: usize, num_requests: u32) -> Self {
        let l = *storage.layout();
        let n = l.ledger_entries;
        let eb = l.eb_size;

        // SAFETY: offsets and strides come from the same layout the
        // storage was sized with; each (offset, i) pair is a disjoint
        // slice.
        unsafe {
            let ri = |off| storage.peer_slice(off, l.info_stride, i);
            let pl = |off| storage.peer_slice(off, l.ledg_stride, i);
            let ebp = |off| storage.peer_slice(off, l.ebuf_stride, i);

            Self {
                local_rcv_info: RiLedger::from_raw(ri(l.off_local_rcv_info), n),
                remote_rcv_info: RiLedger::from_raw(ri(l.off_remote_rcv_info), n),
                local_snd_info: RiLedger::from_raw(ri(l.off_local_snd_info), n),
                remote_snd_info: RiLedger::from_raw(ri(l.off_remote_snd_info), n),

                local_fin: Ledger::from_raw(pl(l.off_local_fin), n, LEDGER_EMPTY),
                remote_fin: Ledger::from_raw(pl(l.off_remote_fin), n, LEDGER_EMPTY),
                local_pwc: Ledger::from_raw(pl(l.off_local_pwc), n, LEDGER_EMPTY_PWC),
                remote_pwc: Ledger::from_raw(pl(l.off_remote_pwc), n, LEDGER_EMPTY_PWC),
                local_eager: Ledger::from_raw(pl(l.off_local_eager), n, LEDGER_EMPTY),
                remote_eager: Ledger::from_raw(pl(l.off_remote_eager), n, LEDGER_EMPTY),

                local_eager_buf: EagerBuf::from_raw(ebp(l.off_local_eager_buf), eb),
                remote_eager_buf: EagerBuf::from_raw(ebp(l.off_remote_eager_buf), eb),
                local_pwc_buf: EagerBuf::from_raw(ebp(l.off_local_pwc_buf), eb),
                remote_pwc_buf: EagerBuf::from_raw(ebp(l.off_remote_pwc_buf), eb),

                requests: RequestTable::new(num_requests),
            }
        }
    }
}
