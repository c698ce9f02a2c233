// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared harness: two runtimes in one process, wired through the
// external-exchange callbacks and the loopback transport, each driven on
// its own thread like two ranks of a job.
#![allow(dead_code)]

use std::sync::{Arc, Barrier, Condvar, Mutex};

use librma::{Config, MetaExchange, Runtime};

/// Rendezvous board backing the bootstrap allgather/barrier for an
/// in-process pair of ranks.
pub struct ExchangeBoard {
    n: usize,
    slots: Mutex<Vec<Option<Vec<u8>>>>,
    cv: Condvar,
    barrier: Barrier,
}

impl ExchangeBoard {
    pub fn new(n: usize) -> Arc<Self> {
        Arc::new(Self {
            n,
            slots: Mutex::new(vec![None; n]),
            cv: Condvar::new(),
            barrier: Barrier::new(n),
        })
    }

    fn allgather(&self, rank: usize, src: &[u8], dst: &mut [u8]) {
        let mut slots = self.slots.lock().unwrap();
        slots[rank] = Some(src.to_vec());
        self.cv.notify_all();
        while slots.iter().any(|s| s.is_none()) {
            slots = self.cv.wait(slots).unwrap();
        }
        for (i, s) in slots.iter().enumerate() {
            let s = s.as_ref().unwrap();
            dst[i * s.len()..(i + 1) * s.len()].copy_from_slice(s);
        }
    }

    /// Exchange callbacks for one rank.
    pub fn meta_for(self: &Arc<Self>, rank: usize) -> MetaExchange {
        let ag = Arc::clone(self);
        let bar = Arc::clone(self);
        MetaExchange::External {
            allgather: Arc::new(move |src, dst| {
                ag.allgather(rank, src, dst);
                Ok(())
            }),
            barrier: Arc::new(move || {
                bar.barrier.wait();
                Ok(())
            }),
        }
    }
}

/// Single-rank runtime for registry-level tests.
pub fn solo_runtime(tweak: impl Fn(&mut Config)) -> Runtime {
    let board = ExchangeBoard::new(1);
    let mut cfg = Config::new(1, 0, board.meta_for(0));
    tweak(&mut cfg);
    Runtime::init(cfg).expect("init")
}

/// Run rank closures `fa` (rank 0) and `fb` (rank 1) against a wired
/// pair of runtimes, propagating panics from either.
pub fn run_pair<FA, FB>(tweak: impl Fn(&mut Config) + Send + Sync + 'static, fa: FA, fb: FB)
where
    FA: FnOnce(&Runtime) + Send + 'static,
    FB: FnOnce(&Runtime) + Send + 'static,
{
    let board = ExchangeBoard::new(2);
    let tweak = Arc::new(tweak);

    let mk = |rank: usize, board: &Arc<ExchangeBoard>, tweak: &Arc<dyn Fn(&mut Config) + Send + Sync>| {
        let mut cfg = Config::new(2, rank as u32, board.meta_for(rank));
        cfg.cap.ledger_entries = 16;
        cfg.cap.eager_buf_size = 4096;
        tweak(&mut cfg);
        cfg
    };
    let tweak_dyn: Arc<dyn Fn(&mut Config) + Send + Sync> = tweak;
    let cfg_a = mk(0, &board, &tweak_dyn);
    let cfg_b = mk(1, &board, &tweak_dyn);

    let ta = std::thread::spawn(move || {
        let rt = Runtime::init(cfg_a).expect("rank 0 init");
        fa(&rt);
    });
    let tb = std::thread::spawn(move || {
        let rt = Runtime::init(cfg_b).expect("rank 1 init");
        fb(&rt);
    });

    ta.join().expect("rank 0 thread");
    tb.join().expect("rank 1 thread");
}

/// A registered scratch buffer for test payloads. The backing vector is
/// boxed so its address is stable for the lifetime of the test.
pub struct Region {
    mem: Box<[u8]>,
}

impl Region {
    pub fn zeroed(len: usize) -> Self {
        Self {
            mem: vec![0u8; len].into_boxed_slice(),
        }
    }

    pub fn patterned(len: usize) -> Self {
        Self {
            mem: (0..len).map(|i| (i * 7 + 3) as u8).collect(),
        }
    }

    pub fn addr(&self) -> u64 {
        self.mem.as_ptr() as u64
    }

    pub fn len(&self) -> u64 {
        self.mem.len() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mem
    }
}
