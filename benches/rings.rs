// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Hot-ring micro-benchmarks.
//
// Run with:
//   cargo bench --bench rings
//
// Groups:
//   ledger_cycle  - claim + mark_done on a plain ledger ring
//   eager_reserve - contiguous-span reservation on the byte ring
//   request_cycle - request table alloc + free round trip

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use librma::eager::EagerBuf;
use librma::ledger::{Ledger, LEDGER_EMPTY};
use librma::request::{RequestTable, STATE_COMPLETED};

fn bench_ledger_cycle(c: &mut Criterion) {
    let mut mem = vec![0u8; 512 * 8];
    let l = unsafe { Ledger::from_raw(mem.as_mut_ptr(), 512, LEDGER_EMPTY) };

    let mut g = c.benchmark_group("ledger_cycle");
    g.throughput(Throughput::Elements(1));
    g.bench_function("claim_release", |b| {
        b.iter(|| {
            let idx = l.claim().unwrap();
            black_box(idx);
            l.mark_done(1);
        })
    });
    g.finish();
}

fn bench_eager_reserve(c: &mut Criterion) {
    let size = 64 * 1024u64;
    let mut mem = vec![0u8; size as usize];
    let eb = unsafe { EagerBuf::from_raw(mem.as_mut_ptr(), size) };

    let mut g = c.benchmark_group("eager_reserve");
    for span in [64u64, 256, 1024] {
        g.throughput(Throughput::Bytes(span));
        g.bench_function(format!("span_{span}"), |b| {
            b.iter(|| {
                let off = eb.reserve(span, span).unwrap();
                black_box(off);
                eb.mark_done(span);
            })
        });
    }
    g.finish();
}

fn bench_request_cycle(c: &mut Criterion) {
    let rt = RequestTable::new(1024);

    let mut g = c.benchmark_group("request_cycle");
    g.throughput(Throughput::Elements(1));
    g.bench_function("alloc_free", |b| {
        b.iter(|| {
            let req = rt.alloc(0).unwrap();
            black_box(req.id);
            req.set_state(STATE_COMPLETED);
            rt.free(req).unwrap();
        })
    });
    g.finish();
}

criterion_group!(
    benches,
    bench_ledger_cycle,
    bench_eager_reserve,
    bench_request_cycle
);
criterion_main!(benches);
