// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Concurrency stress: several threads hammer put-with-completion toward
// one peer while completions are reaped concurrently. Checks that every
// id comes back exactly once and that ring back-pressure only ever
// surfaces as a transient Resource error.

mod common;

use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::Mutex;

use common::{run_pair, Region};
use librma::{BufferPriv, Error, OpFlags, ProbeFlags, Runtime};

const THREADS: u64 = 4;
const PER_THREAD: u64 = 50;
const TOTAL: u64 = THREADS * PER_THREAD;
const MSG: u64 = 24;

fn drain_one(rt: &Runtime, seen: &Mutex<Vec<u64>>) {
    if let Some(rid) = rt.probe_completion(None, ProbeFlags::EVQ).unwrap() {
        seen.lock().unwrap().push(rid);
    }
}

#[test]
fn concurrent_pwc_ids_come_back_once() {
    let (dst_tx, dst_rx) = mpsc::channel::<(u64, BufferPriv)>();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    run_pair(
        |cfg| cfg.cap.small_pwc_size = 64,
        // rank 0: THREADS producers, completions reaped inline
        move |rt| {
            let src = Region::patterned(MSG as usize);
            let (dst_addr, dst_keys) = dst_rx.recv().unwrap();
            let seen = Mutex::new(Vec::new());

            std::thread::scope(|s| {
                for t in 0..THREADS {
                    let src_addr = src.addr();
                    let seen = &seen;
                    s.spawn(move || {
                        for i in 0..PER_THREAD {
                            let local = 0x1000 + t * PER_THREAD + i;
                            let remote = 0x9000 + t * PER_THREAD + i;
                            loop {
                                match rt.put_with_completion(
                                    1,
                                    src_addr,
                                    MSG,
                                    dst_addr,
                                    dst_keys,
                                    local,
                                    remote,
                                    OpFlags::empty(),
                                ) {
                                    Ok(()) => break,
                                    Err(Error::Resource(_)) => {
                                        // rings full: reap and retry
                                        drain_one(rt, seen);
                                        std::thread::yield_now();
                                    }
                                    Err(e) => panic!("put failed: {e}"),
                                }
                            }
                        }
                    });
                }
            });

            while seen.lock().unwrap().len() < TOTAL as usize {
                drain_one(rt, &seen);
            }

            let got = seen.into_inner().unwrap();
            let unique: HashSet<u64> = got.iter().copied().collect();
            assert_eq!(unique.len(), TOTAL as usize, "duplicate completions");
            for id in unique {
                assert!((0x1000..0x1000 + TOTAL).contains(&id));
            }
            done_rx.recv().unwrap();
        },
        // rank 1: single reaper over the local PWC rings
        move |rt| {
            let dst = Region::zeroed(MSG as usize);
            rt.register_buffer(dst.addr(), dst.len()).unwrap();
            let keys = rt.get_buffer_private(dst.addr(), dst.len()).unwrap();
            dst_tx.send((dst.addr(), keys)).unwrap();

            let mut got = HashSet::new();
            while got.len() < TOTAL as usize {
                if let Some(rid) = rt.probe_completion(Some(0), ProbeFlags::LEDGER).unwrap() {
                    assert!(got.insert(rid), "remote id 0x{rid:x} delivered twice");
                    assert!((0x9000..0x9000 + TOTAL).contains(&rid));
                } else {
                    std::thread::yield_now();
                }
            }
            done_tx.send(()).unwrap();
        },
    );
}
