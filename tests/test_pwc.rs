// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Put-with-completion end to end: the packed 1-PUT path under the eager
// limit, the 2-PUT path above it, flag-reduced completion counts, and
// get-with-completion.

mod common;

use std::sync::mpsc;

use common::{run_pair, Region};
use librma::{BufferPriv, OpFlags, ProbeFlags, Rid, Runtime};

fn probe_until(rt: &Runtime, proc_id: Option<u32>, flags: ProbeFlags) -> Rid {
    loop {
        if let Some(rid) = rt.probe_completion(proc_id, flags).unwrap() {
            return rid;
        }
        std::thread::yield_now();
    }
}

/// Destination descriptor shipped out of band, as an application would.
struct DstInfo {
    addr: u64,
    keys: BufferPriv,
}

// --- 1-PUT packed path ---

#[test]
fn pwc_one_put_size_128() {
    let (dst_tx, dst_rx) = mpsc::channel::<DstInfo>();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    run_pair(
        |cfg| cfg.cap.small_pwc_size = 256,
        // rank 0: one packed put, one local completion
        move |rt| {
            let src = Region::patterned(128);
            let dst = dst_rx.recv().unwrap();

            rt.put_with_completion(1, src.addr(), 128, dst.addr, dst.keys, 0xA, 0xB, OpFlags::empty())
                .unwrap();

            assert_eq!(probe_until(rt, None, ProbeFlags::EVQ), 0xA);
            done_rx.recv().unwrap();
        },
        // rank 1: the remote id surfaces from the byte ring, payload
        // already in place
        move |rt| {
            let dst = Region::zeroed(128);
            rt.register_buffer(dst.addr(), dst.len()).unwrap();
            let keys = rt.get_buffer_private(dst.addr(), dst.len()).unwrap();
            dst_tx.send(DstInfo { addr: dst.addr(), keys }).unwrap();

            assert_eq!(probe_until(rt, Some(0), ProbeFlags::LEDGER), 0xB);
            let expected: Vec<u8> = (0..128).map(|i| (i * 7 + 3) as u8).collect();
            assert_eq!(dst.bytes(), &expected[..]);
            done_tx.send(()).unwrap();
        },
    );
}

// --- 2-PUT path ---

#[test]
fn pwc_two_put_size_8192() {
    let (dst_tx, dst_rx) = mpsc::channel::<DstInfo>();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    run_pair(
        |cfg| {
            cfg.cap.small_pwc_size = 256;
            cfg.cap.eager_buf_size = 4096;
        },
        // rank 0: data put + notification put, two local completions
        move |rt| {
            let src = Region::patterned(8192);
            rt.register_buffer(src.addr(), src.len()).unwrap();
            let dst = dst_rx.recv().unwrap();

            rt.put_with_completion(1, src.addr(), 8192, dst.addr, dst.keys, 0xA, 0xB, OpFlags::empty())
                .unwrap();

            // both CQEs must drain before the local id surfaces
            assert_eq!(probe_until(rt, None, ProbeFlags::EVQ), 0xA);
            done_rx.recv().unwrap();
        },
        // rank 1: the notification ledger delivers the remote id
        move |rt| {
            let dst = Region::zeroed(8192);
            rt.register_buffer(dst.addr(), dst.len()).unwrap();
            let keys = rt.get_buffer_private(dst.addr(), dst.len()).unwrap();
            dst_tx.send(DstInfo { addr: dst.addr(), keys }).unwrap();

            assert_eq!(probe_until(rt, Some(0), ProbeFlags::LEDGER), 0xB);
            let expected: Vec<u8> = (0..8192).map(|i| (i * 7 + 3) as u8).collect();
            assert_eq!(dst.bytes(), &expected[..]);
            done_tx.send(()).unwrap();
        },
    );
}

#[test]
fn pwc_two_put_one_cqe_still_completes() {
    let (dst_tx, dst_rx) = mpsc::channel::<DstInfo>();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    run_pair(
        |cfg| cfg.cap.small_pwc_size = 64,
        // rank 0: the data put carries no completion; one CQE finishes
        // the request
        move |rt| {
            let src = Region::patterned(1024);
            rt.register_buffer(src.addr(), src.len()).unwrap();
            let dst = dst_rx.recv().unwrap();

            rt.put_with_completion(
                1,
                src.addr(),
                1024,
                dst.addr,
                dst.keys,
                0x51,
                0x52,
                OpFlags::ONE_CQE,
            )
            .unwrap();

            assert_eq!(probe_until(rt, None, ProbeFlags::EVQ), 0x51);
            done_rx.recv().unwrap();
        },
        move |rt| {
            let dst = Region::zeroed(1024);
            rt.register_buffer(dst.addr(), dst.len()).unwrap();
            let keys = rt.get_buffer_private(dst.addr(), dst.len()).unwrap();
            dst_tx.send(DstInfo { addr: dst.addr(), keys }).unwrap();

            assert_eq!(probe_until(rt, Some(0), ProbeFlags::LEDGER), 0x52);
            done_tx.send(()).unwrap();
        },
    );
}

// --- get with completion ---

#[test]
fn get_with_completion_pulls_remote_bytes() {
    let (src_tx, src_rx) = mpsc::channel::<DstInfo>();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    run_pair(
        |_| {},
        // rank 0: pulls from the peer; only a local completion fires
        move |rt| {
            let dst = Region::zeroed(256);
            rt.register_buffer(dst.addr(), dst.len()).unwrap();
            let src = src_rx.recv().unwrap();

            rt.get_with_completion(1, dst.addr(), 256, src.addr, src.keys, 0x77, OpFlags::empty())
                .unwrap();

            assert_eq!(probe_until(rt, None, ProbeFlags::EVQ), 0x77);
            let expected: Vec<u8> = (0..256).map(|i| (i * 7 + 3) as u8).collect();
            assert_eq!(dst.bytes(), &expected[..]);
            done_tx.send(()).unwrap();
        },
        move |rt| {
            let src = Region::patterned(256);
            rt.register_buffer(src.addr(), src.len()).unwrap();
            let keys = rt.get_buffer_private(src.addr(), src.len()).unwrap();
            src_tx.send(DstInfo { addr: src.addr(), keys }).unwrap();
            done_rx.recv().unwrap();
        },
    );
}

// --- probe_completion over both sources at once ---

#[test]
fn probe_both_sources_in_one_call() {
    let (dst_tx, dst_rx) = mpsc::channel::<DstInfo>();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    run_pair(
        |cfg| cfg.cap.small_pwc_size = 256,
        move |rt| {
            let src = Region::patterned(32);
            let dst = dst_rx.recv().unwrap();
            rt.put_with_completion(1, src.addr(), 32, dst.addr, dst.keys, 0x1, 0x2, OpFlags::empty())
                .unwrap();
            assert_eq!(
                probe_until(rt, None, ProbeFlags::EVQ | ProbeFlags::LEDGER),
                0x1
            );
            done_rx.recv().unwrap();
        },
        move |rt| {
            let dst = Region::zeroed(32);
            rt.register_buffer(dst.addr(), dst.len()).unwrap();
            let keys = rt.get_buffer_private(dst.addr(), dst.len()).unwrap();
            dst_tx.send(DstInfo { addr: dst.addr(), keys }).unwrap();
            assert_eq!(
                probe_until(rt, Some(0), ProbeFlags::EVQ | ProbeFlags::LEDGER),
                0x2
            );
            done_tx.send(()).unwrap();
        },
    );
}
