// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Ring back-pressure and tag matching: ledger overflow is transient and
// side-effect free, and out-of-order tag waits swap entries in place.

mod common;

use std::sync::mpsc;

use common::{run_pair, Region};
use librma::{Error, LedgerKind, OpFlags, Rid, Runtime, TestResult};

fn wait_completed(rt: &Runtime, rid: Rid) {
    loop {
        match rt.test(rid).unwrap() {
            TestResult::Completed(_) => return,
            TestResult::Pending => std::thread::yield_now(),
            TestResult::NotFound => panic!("request 0x{rid:016x} vanished"),
        }
    }
}

// --- ledger overflow (transient Resource) ---

#[test]
fn rcv_info_overflow_is_transient() {
    let (full_tx, full_rx) = mpsc::channel::<()>();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    run_pair(
        |cfg| cfg.cap.ledger_entries = 4,
        // rank 0: fills the peer's rcv-info ring, then recovers
        move |rt| {
            let recv = Region::zeroed(4 * 64);
            rt.register_buffer(recv.addr(), recv.len()).unwrap();

            let mut posted = Vec::new();
            for i in 0..4u64 {
                posted.push(
                    rt.post_recv_buffer(Some(1), recv.addr() + i * 64, 64, i as i32)
                        .unwrap(),
                );
            }

            // ring full: the next post fails without side effects
            match rt.post_recv_buffer(Some(1), recv.addr(), 64, 99) {
                Err(Error::Resource(_)) => {}
                other => panic!("expected Resource, got {other:?}"),
            }
            full_tx.send(()).unwrap();

            // one consumer advance plus a FIN round trip frees a slot
            wait_completed(rt, posted.remove(0));
            let again = rt.post_recv_buffer(Some(1), recv.addr(), 64, 99).unwrap();

            done_rx.recv().unwrap();
            let _ = again;
        },
        // rank 1: consumes the first advertisement and FINs it
        move |rt| {
            let send = Region::patterned(64);
            rt.register_buffer(send.addr(), send.len()).unwrap();
            full_rx.recv().unwrap();

            let r = rt.wait_recv_buffer(0, 0).unwrap();
            rt.post_os_put(r, 0, send.addr(), 64, 0, 0).unwrap();
            rt.send_fin(r, 0, OpFlags::empty()).unwrap();
            wait_completed(rt, r);
            done_tx.send(()).unwrap();
        },
    );
}

// --- probe_ledger peeks without consuming ---

#[test]
fn probe_ledger_reports_pending_recv() {
    let (done_tx, done_rx) = mpsc::channel::<()>();

    run_pair(
        |_| {},
        move |rt| {
            let recv = Region::zeroed(128);
            rt.register_buffer(recv.addr(), recv.len()).unwrap();
            let r = rt.post_recv_buffer(Some(1), recv.addr(), 128, 5).unwrap();
            wait_completed(rt, r);
            done_rx.recv().unwrap();
        },
        move |rt| {
            let send = Region::patterned(128);
            rt.register_buffer(send.addr(), send.len()).unwrap();

            // peek until the advertisement lands; the entry stays put
            let info = loop {
                if let Some(info) = rt.probe_ledger(Some(0), LedgerKind::Recv).unwrap() {
                    break info;
                }
                std::thread::yield_now();
            };
            assert_eq!(info.src, 0);
            assert_eq!(info.tag, 5);
            assert_eq!(info.size, 128);

            // a second peek still sees it
            assert!(rt.probe_ledger(Some(0), LedgerKind::Recv).unwrap().is_some());

            // claiming it consumes the entry
            let r = rt.wait_recv_buffer(0, 5).unwrap();
            assert!(rt.probe_ledger(Some(0), LedgerKind::Recv).unwrap().is_none());
            rt.post_os_put(r, 0, send.addr(), 128, 5, 0).unwrap();
            rt.send_fin(r, 0, OpFlags::empty()).unwrap();
            wait_completed(rt, r);
            done_tx.send(()).unwrap();
        },
    );
}

// --- out-of-order tag matching ---

#[test]
fn tag_match_swaps_out_of_order_entries() {
    let (addr_tx, addr_rx) = mpsc::channel::<(u64, u64)>();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    run_pair(
        |_| {},
        // rank 0: two advertisements, tags 1 then 2
        move |rt| {
            let buf1 = Region::zeroed(32);
            let buf2 = Region::zeroed(32);
            rt.register_buffer(buf1.addr(), buf1.len()).unwrap();
            rt.register_buffer(buf2.addr(), buf2.len()).unwrap();
            addr_tx.send((buf1.addr(), buf2.addr())).unwrap();

            let r1 = rt.post_recv_buffer(Some(1), buf1.addr(), 32, 1).unwrap();
            let r2 = rt.post_recv_buffer(Some(1), buf2.addr(), 32, 2).unwrap();
            wait_completed(rt, r2);
            wait_completed(rt, r1);
            done_rx.recv().unwrap();
        },
        // rank 1: waits for tag 2 first; the tag-1 entry must survive at
        // the new head
        move |rt| {
            let send = Region::patterned(32);
            rt.register_buffer(send.addr(), send.len()).unwrap();
            let (addr1, addr2) = addr_rx.recv().unwrap();

            let rb = rt.wait_recv_buffer(0, 2).unwrap();
            assert_eq!(rt.get_buffer_remote(rb).unwrap().addr, addr2);
            rt.post_os_put(rb, 0, send.addr(), 32, 2, 0).unwrap();
            rt.send_fin(rb, 0, OpFlags::empty()).unwrap();
            wait_completed(rt, rb);

            let ra = rt.wait_recv_buffer(0, 1).unwrap();
            assert_eq!(rt.get_buffer_remote(ra).unwrap().addr, addr1);
            rt.post_os_put(ra, 0, send.addr(), 32, 1, 0).unwrap();
            rt.send_fin(ra, 0, OpFlags::empty()).unwrap();
            wait_completed(rt, ra);
            done_tx.send(()).unwrap();
        },
    );
}
